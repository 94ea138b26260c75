//! Shadow descriptors
//!
//! A [`ProjectedShadowInfo`] is the unit of work for one shadow map: its
//! projection, its size and atlas placement, and the primitives drawn into
//! it. Descriptors live in the per-frame arena of a
//! [`ShadowFrame`](crate::renderer::ShadowFrame) and refer to lights, views
//! and primitives by index.

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use void_math::{consts::WORLD_MAX, ConvexVolume, Sphere};

use crate::cascade::CascadeSettings;
use crate::light::{LightId, LightKind};
use crate::scene::PrimitiveId;
use crate::view::ViewId;

/// Index of a descriptor in the frame's shadow arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShadowId(pub u32);

impl ShadowId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which casters a whole-scene shadow map holds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheMode {
    /// Rendered from scratch every frame
    #[default]
    Uncached,
    /// Static casters only, persists across frames
    StaticPrimitivesOnly,
    /// Movable casters only, composited over the static layer every frame
    MovablePrimitivesOnly,
}

/// Opaque handle to a depth target created by a
/// [`RenderTargetProvider`](crate::render_target::RenderTargetProvider)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderTargetHandle(pub u64);

/// A static mesh whose precomputed draw command can be reused
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CachedDrawCommand {
    pub primitive: PrimitiveId,
    pub mesh_index: u16,
}

/// A static mesh that needs a draw command built this frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshBuildRequest {
    pub primitive: PrimitiveId,
    pub mesh_index: u16,
}

/// One shadow map for one frame
#[derive(Clone, Debug)]
pub struct ProjectedShadowInfo {
    pub light: LightId,
    pub light_kind: LightKind,
    /// Set for per-object shadows
    pub parent_primitive: Option<PrimitiveId>,
    /// Set for view-dependent shadows (cascades and reflective maps)
    pub dependent_view: Option<ViewId>,

    pub pre_shadow_translation: Vec3,
    pub subject_and_receiver_matrix: Mat4,
    pub receiver_matrix: Mat4,
    /// Volume a caster must touch to shadow anything, in pre-translated space
    pub caster_frustum: ConvexVolume,
    pub receiver_frustum: ConvexVolume,

    pub min_subject_z: f32,
    pub max_subject_z: f32,
    pub min_pre_subject_z: f32,
    pub inv_max_subject_depth: f32,

    pub resolution_x: u32,
    pub resolution_y: u32,
    pub border_size: u32,
    /// Atlas placement, valid once `allocated`
    pub x: u32,
    pub y: u32,
    pub allocated: bool,
    pub render_target: Option<RenderTargetHandle>,

    pub cache_mode: CacheMode,

    pub directional_light: bool,
    pub one_pass_point_light_shadow: bool,
    pub whole_scene_shadow: bool,
    pub reflective_shadow_map: bool,
    pub translucent_shadow: bool,
    pub pre_shadow: bool,
    pub self_shadow_only: bool,
    pub allocated_in_preshadow_cache: bool,
    /// Depths come from a previous frame, nothing is rendered
    pub depths_cached: bool,
    pub rendered: bool,

    /// Fade per view, indexed by `ViewId`
    pub fade_alphas: Vec<f32>,
    pub shadow_bounds: Sphere,
    pub cascade_settings: Option<CascadeSettings>,

    pub per_object_shadow_fade_start: f32,
    pub inv_per_object_shadow_fade_length: f32,

    pub one_pass_shadow_view_projection_matrices: Vec<Mat4>,
    pub one_pass_shadow_frustums: Vec<ConvexVolume>,

    /// Every primitive accepted as a caster, in no particular order
    pub subject_primitives: Vec<PrimitiveId>,
    pub dynamic_subject_primitives: Vec<PrimitiveId>,
    pub subject_translucent_primitives: Vec<PrimitiveId>,
    pub cached_draw_commands: Vec<CachedDrawCommand>,
    pub mesh_build_requests: Vec<MeshBuildRequest>,
    /// Only preshadows track receivers
    pub receiver_primitives: Vec<PrimitiveId>,

    pub max_screen_percent: f32,
    /// Key of the preshadow cache entry this descriptor came from
    pub preshadow_cache_key: Option<u64>,
    /// Light-view hulls used to cull whole-scene local light subjects
    pub light_view_hulls: SmallVec<[ConvexVolume; 2]>,
}

impl Default for ProjectedShadowInfo {
    fn default() -> Self {
        Self {
            light: LightId(0),
            light_kind: LightKind::Point,
            parent_primitive: None,
            dependent_view: None,
            pre_shadow_translation: Vec3::ZERO,
            subject_and_receiver_matrix: Mat4::IDENTITY,
            receiver_matrix: Mat4::IDENTITY,
            caster_frustum: ConvexVolume::default(),
            receiver_frustum: ConvexVolume::default(),
            min_subject_z: 0.0,
            max_subject_z: 0.0,
            min_pre_subject_z: 0.0,
            inv_max_subject_depth: 0.0,
            resolution_x: 0,
            resolution_y: 0,
            border_size: 0,
            x: 0,
            y: 0,
            allocated: false,
            render_target: None,
            cache_mode: CacheMode::Uncached,
            directional_light: false,
            one_pass_point_light_shadow: false,
            whole_scene_shadow: false,
            reflective_shadow_map: false,
            translucent_shadow: false,
            pre_shadow: false,
            self_shadow_only: false,
            allocated_in_preshadow_cache: false,
            depths_cached: false,
            rendered: false,
            fade_alphas: Vec::new(),
            shadow_bounds: Sphere::new(Vec3::ZERO, 0.0),
            cascade_settings: None,
            per_object_shadow_fade_start: WORLD_MAX,
            inv_per_object_shadow_fade_length: 0.0,
            one_pass_shadow_view_projection_matrices: Vec::new(),
            one_pass_shadow_frustums: Vec::new(),
            subject_primitives: Vec::new(),
            dynamic_subject_primitives: Vec::new(),
            subject_translucent_primitives: Vec::new(),
            cached_draw_commands: Vec::new(),
            mesh_build_requests: Vec::new(),
            receiver_primitives: Vec::new(),
            max_screen_percent: 1.0,
            preshadow_cache_key: None,
            light_view_hulls: SmallVec::new(),
        }
    }
}

impl ProjectedShadowInfo {
    /// Size of the map including its border on both sides
    #[inline]
    pub fn padded_size(&self) -> (u32, u32) {
        (
            self.resolution_x + 2 * self.border_size,
            self.resolution_y + 2 * self.border_size,
        )
    }

    /// Padded rectangle `(x, y, width, height)` inside the atlas
    #[inline]
    pub fn shadow_atlas_rect(&self) -> (u32, u32, u32, u32) {
        let (w, h) = self.padded_size();
        (self.x, self.y, w, h)
    }

    /// Drop every per-frame subject and receiver list
    pub fn clear_transient_arrays(&mut self) {
        self.subject_primitives.clear();
        self.dynamic_subject_primitives.clear();
        self.subject_translucent_primitives.clear();
        self.cached_draw_commands.clear();
        self.mesh_build_requests.clear();
        self.receiver_primitives.clear();
    }

    /// Whether anything would be drawn into the map
    pub fn has_subject_prims(&self) -> bool {
        !self.dynamic_subject_primitives.is_empty()
            || !self.cached_draw_commands.is_empty()
            || !self.mesh_build_requests.is_empty()
            || !self.subject_translucent_primitives.is_empty()
    }

    #[inline]
    pub fn is_whole_scene_directional_shadow(&self) -> bool {
        self.whole_scene_shadow && self.directional_light && self.cascade_settings.is_some()
    }

    /// Whether the map is one of a light's cube or spot whole-scene maps
    #[inline]
    pub fn is_whole_scene_local_shadow(&self) -> bool {
        self.whole_scene_shadow && !self.directional_light
    }

    #[inline]
    pub fn is_per_object(&self) -> bool {
        self.parent_primitive.is_some()
    }

    #[inline]
    pub fn split_index(&self) -> Option<u32> {
        self.cascade_settings.as_ref().map(|c| c.shadow_split_index)
    }

    /// Record `primitive` as an opaque caster with the given draw work
    pub fn add_subject_primitive(
        &mut self,
        primitive: PrimitiveId,
        dynamic: bool,
        cached_meshes: impl IntoIterator<Item = u16>,
        build_meshes: impl IntoIterator<Item = u16>,
    ) {
        self.subject_primitives.push(primitive);
        if dynamic {
            self.dynamic_subject_primitives.push(primitive);
        }
        self.cached_draw_commands.extend(
            cached_meshes
                .into_iter()
                .map(|mesh_index| CachedDrawCommand { primitive, mesh_index }),
        );
        self.mesh_build_requests.extend(
            build_meshes
                .into_iter()
                .map(|mesh_index| MeshBuildRequest { primitive, mesh_index }),
        );
    }

    /// Record `primitive` as a translucent caster
    pub fn add_translucent_subject_primitive(&mut self, primitive: PrimitiveId) {
        self.subject_primitives.push(primitive);
        self.subject_translucent_primitives.push(primitive);
    }

    pub fn add_receiver_primitive(&mut self, primitive: PrimitiveId) {
        self.receiver_primitives.push(primitive);
    }

    /// Largest fade over all views
    pub fn max_fade_alpha(&self) -> f32 {
        self.fade_alphas.iter().copied().fold(0.0, f32::max)
    }
}
