//! Scene primitives and lights consumed by the shadow scheduler
//!
//! The scene is read-only while shadows are gathered. Lights and primitives
//! live in arenas and are referred to by index.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use void_math::BoxSphereBounds;

use crate::light::{LightId, LightSceneInfo};
use crate::spatial::PrimitiveBvh;
use crate::view::ShadowView;

/// Index of a primitive in the scene's primitive arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrimitiveId(pub u32);

impl PrimitiveId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a primitive may change at runtime
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimitiveMobility {
    Static,
    Stationary,
    #[default]
    Movable,
}

/// Shadow-related primitive flags
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimitiveFlags {
    pub cast_dynamic_shadow: bool,
    pub cast_static_shadow: bool,
    /// Uses baked lighting
    pub static_lighting: bool,
    /// Baked shadowing from stationary lights exists for this primitive
    pub static_lit_shadow_mapped: bool,
    /// Wants a dedicated high-resolution per-object shadow
    pub cast_inset_shadow: bool,
    /// Only shadows itself
    pub self_shadow_only: bool,
    pub affects_dynamic_indirect_lighting: bool,
    /// Casts translucent volume shadows
    pub has_translucency: bool,
    pub render_in_main_pass: bool,
}

impl Default for PrimitiveFlags {
    fn default() -> Self {
        Self {
            cast_dynamic_shadow: true,
            cast_static_shadow: true,
            static_lighting: false,
            static_lit_shadow_mapped: false,
            cast_inset_shadow: false,
            self_shadow_only: false,
            affects_dynamic_indirect_lighting: false,
            has_translucency: false,
            render_in_main_pass: true,
        }
    }
}

/// A mesh section with a prebuilt draw command, or one that must be built
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticMeshBatch {
    pub cast_shadow: bool,
    /// A shadow depth draw command was cached when the mesh was added
    pub has_cached_draw_command: bool,
}

impl StaticMeshBatch {
    pub const fn cached() -> Self {
        Self {
            cast_shadow: true,
            has_cached_draw_command: true,
        }
    }

    pub const fn uncached() -> Self {
        Self {
            cast_shadow: true,
            has_cached_draw_command: false,
        }
    }
}

/// A renderable object registered with the scene
#[derive(Clone, Debug)]
pub struct PrimitiveSceneInfo {
    pub id: PrimitiveId,
    pub bounds: BoxSphereBounds,
    pub mobility: PrimitiveMobility,
    pub flags: PrimitiveFlags,
    pub min_draw_distance: f32,
    /// Zero for unlimited
    pub max_draw_distance: f32,
    pub static_meshes: Vec<StaticMeshBatch>,
    /// Produces per-frame geometry, gathered through the dynamic path
    pub has_dynamic_elements: bool,
    /// Scales screen-size culling
    pub lod_scale: f32,
}

impl PrimitiveSceneInfo {
    pub fn new(bounds: BoxSphereBounds) -> Self {
        Self {
            id: PrimitiveId(0),
            bounds,
            mobility: PrimitiveMobility::Movable,
            flags: PrimitiveFlags::default(),
            min_draw_distance: 0.0,
            max_draw_distance: 0.0,
            static_meshes: vec![StaticMeshBatch::cached()],
            has_dynamic_elements: false,
            lod_scale: 1.0,
        }
    }

    pub fn with_mobility(mut self, mobility: PrimitiveMobility) -> Self {
        self.mobility = mobility;
        self
    }

    pub fn with_flags(mut self, flags: PrimitiveFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_static_meshes(mut self, meshes: Vec<StaticMeshBatch>) -> Self {
        self.static_meshes = meshes;
        self
    }

    pub fn with_dynamic_elements(mut self, dynamic: bool) -> Self {
        self.has_dynamic_elements = dynamic;
        self
    }

    pub fn with_draw_distance(mut self, min: f32, max: f32) -> Self {
        self.min_draw_distance = min;
        self.max_draw_distance = max;
        self
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.mobility == PrimitiveMobility::Static
    }

    /// Whether the primitive is drawn at `distance` from a view
    pub fn within_draw_distance(&self, distance_sq: f32, lod_distance_factor: f32) -> bool {
        let factor_sq = lod_distance_factor * lod_distance_factor;
        if distance_sq * factor_sq < self.min_draw_distance * self.min_draw_distance {
            return false;
        }
        self.max_draw_distance <= 0.0
            || distance_sq * factor_sq <= self.max_draw_distance * self.max_draw_distance
    }
}

/// What a view will draw of a primitive
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViewRelevance {
    pub shadow_relevance: bool,
    pub static_relevance: bool,
    pub dynamic_relevance: bool,
    pub translucent_relevance: bool,
}

/// Lazily evaluated per-view relevance.
///
/// Evaluation may be expensive or touch non thread-safe state, so the
/// gather never calls it from worker tasks.
pub trait ComputeViewRelevance: Send + Sync {
    fn compute_view_relevance(&self, primitive: &PrimitiveSceneInfo, view: &ShadowView) -> ViewRelevance;
}

/// Relevance derived from primitive flags alone
#[derive(Clone, Copy, Debug, Default)]
pub struct FlagViewRelevance;

impl ComputeViewRelevance for FlagViewRelevance {
    fn compute_view_relevance(&self, primitive: &PrimitiveSceneInfo, _view: &ShadowView) -> ViewRelevance {
        ViewRelevance {
            shadow_relevance: primitive.flags.cast_dynamic_shadow,
            static_relevance: !primitive.static_meshes.is_empty(),
            dynamic_relevance: primitive.has_dynamic_elements,
            translucent_relevance: primitive.flags.has_translucency,
        }
    }
}

/// Primitives a light reaches, split by mobility
#[derive(Clone, Debug, Default)]
pub struct LightInteractions {
    pub movable: Vec<PrimitiveId>,
    pub static_primitives: Vec<PrimitiveId>,
}

impl LightInteractions {
    pub fn iter(&self) -> impl Iterator<Item = PrimitiveId> + '_ {
        self.movable.iter().chain(self.static_primitives.iter()).copied()
    }
}

/// Primitives, lights and the spatial index over them
pub struct Scene {
    primitives: Vec<PrimitiveSceneInfo>,
    lights: Vec<LightSceneInfo>,
    interactions: Vec<LightInteractions>,
    spatial_index: PrimitiveBvh,
    spatial_index_dirty: bool,
    relevance: Arc<dyn ComputeViewRelevance>,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    pub fn new() -> Self {
        Self {
            primitives: Vec::new(),
            lights: Vec::new(),
            interactions: Vec::new(),
            spatial_index: PrimitiveBvh::default(),
            spatial_index_dirty: false,
            relevance: Arc::new(FlagViewRelevance),
        }
    }

    /// Replace the view relevance evaluator
    pub fn with_view_relevance(mut self, relevance: Arc<dyn ComputeViewRelevance>) -> Self {
        self.relevance = relevance;
        self
    }

    /// Register a primitive, returning its id.
    ///
    /// Bounds containing NaN are replaced with unit bounds.
    pub fn add_primitive(&mut self, mut primitive: PrimitiveSceneInfo) -> PrimitiveId {
        let id = PrimitiveId(self.primitives.len() as u32);
        primitive.id = id;
        primitive.bounds = sanitize_bounds(id, primitive.bounds);
        for (light, interactions) in self.lights.iter().zip(self.interactions.iter_mut()) {
            if light.affects_bounds(&primitive.bounds) {
                push_interaction(interactions, &primitive);
            }
        }
        self.primitives.push(primitive);
        self.spatial_index_dirty = true;
        id
    }

    /// Move a primitive
    pub fn update_primitive_bounds(&mut self, id: PrimitiveId, bounds: BoxSphereBounds) {
        let Some(primitive) = self.primitives.get_mut(id.index()) else {
            return;
        };
        primitive.bounds = sanitize_bounds(id, bounds);
        self.spatial_index_dirty = true;
        self.update_interactions();
    }

    /// Register a light, returning its id
    pub fn add_light(&mut self, mut light: LightSceneInfo) -> LightId {
        let id = LightId(self.lights.len() as u32);
        light.id = id;
        let mut interactions = LightInteractions::default();
        for primitive in &self.primitives {
            if light.affects_bounds(&primitive.bounds) {
                push_interaction(&mut interactions, primitive);
            }
        }
        self.lights.push(light);
        self.interactions.push(interactions);
        id
    }

    pub fn light_mut(&mut self, id: LightId) -> Option<&mut LightSceneInfo> {
        self.lights.get_mut(id.index())
    }

    /// Recompute every light's interaction lists
    pub fn update_interactions(&mut self) {
        for (light, interactions) in self.lights.iter().zip(self.interactions.iter_mut()) {
            *interactions = LightInteractions::default();
            for primitive in &self.primitives {
                if light.affects_bounds(&primitive.bounds) {
                    push_interaction(interactions, primitive);
                }
            }
        }
    }

    /// Rebuild the BVH after primitives were added or moved
    pub fn rebuild_spatial_index(&mut self) {
        let items: Vec<_> = self
            .primitives
            .iter()
            .map(|p| (p.id, p.bounds.get_box()))
            .collect();
        self.spatial_index.build(&items);
        self.spatial_index_dirty = false;
    }

    /// The BVH, if it reflects the current primitive bounds
    pub fn spatial_index(&self) -> Option<&PrimitiveBvh> {
        (!self.spatial_index_dirty && !self.spatial_index.is_empty()).then_some(&self.spatial_index)
    }

    #[inline]
    pub fn primitives(&self) -> &[PrimitiveSceneInfo] {
        &self.primitives
    }

    #[inline]
    pub fn primitive(&self, id: PrimitiveId) -> &PrimitiveSceneInfo {
        &self.primitives[id.index()]
    }

    #[inline]
    pub fn lights(&self) -> &[LightSceneInfo] {
        &self.lights
    }

    #[inline]
    pub fn light(&self, id: LightId) -> Option<&LightSceneInfo> {
        self.lights.get(id.index())
    }

    #[inline]
    pub fn interactions(&self, id: LightId) -> Option<&LightInteractions> {
        self.interactions.get(id.index())
    }

    pub fn compute_view_relevance(&self, primitive: PrimitiveId, view: &ShadowView) -> ViewRelevance {
        self.relevance.compute_view_relevance(self.primitive(primitive), view)
    }
}

fn push_interaction(interactions: &mut LightInteractions, primitive: &PrimitiveSceneInfo) {
    if primitive.is_static() {
        interactions.static_primitives.push(primitive.id);
    } else {
        interactions.movable.push(primitive.id);
    }
}

fn sanitize_bounds(id: PrimitiveId, bounds: BoxSphereBounds) -> BoxSphereBounds {
    if bounds.contains_nan() {
        log::warn!("Primitive {:?} has NaN bounds, substituting unit bounds", id);
        BoxSphereBounds::unit()
    } else {
        bounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::light::LightShape;
    use glam::Vec3;

    fn bounds_at(x: f32) -> BoxSphereBounds {
        BoxSphereBounds::new(Vec3::new(x, 0.0, 0.0), Vec3::splat(10.0), 17.3)
    }

    #[test]
    fn test_nan_bounds_replaced() {
        let mut scene = Scene::new();
        let id = scene.add_primitive(PrimitiveSceneInfo::new(BoxSphereBounds::new(
            Vec3::splat(f32::NAN),
            Vec3::ONE,
            1.0,
        )));
        assert_eq!(scene.primitive(id).bounds, BoxSphereBounds::unit());
    }

    #[test]
    fn test_interactions_split_by_mobility() {
        let mut scene = Scene::new();
        let light = scene.add_light(LightSceneInfo::new(LightId(9), LightShape::Point { radius: 100.0 }, Vec3::ZERO));
        let near_static = scene.add_primitive(
            PrimitiveSceneInfo::new(bounds_at(50.0)).with_mobility(PrimitiveMobility::Static),
        );
        let near_movable = scene.add_primitive(PrimitiveSceneInfo::new(bounds_at(-50.0)));
        scene.add_primitive(PrimitiveSceneInfo::new(bounds_at(500.0)));

        assert_eq!(light, LightId(0));
        let interactions = scene.interactions(light).unwrap();
        assert_eq!(interactions.static_primitives, vec![near_static]);
        assert_eq!(interactions.movable, vec![near_movable]);
    }

    #[test]
    fn test_moving_primitive_updates_interactions() {
        let mut scene = Scene::new();
        let light = scene.add_light(LightSceneInfo::new(LightId(0), LightShape::Point { radius: 100.0 }, Vec3::ZERO));
        let id = scene.add_primitive(PrimitiveSceneInfo::new(bounds_at(500.0)));
        assert!(scene.interactions(light).unwrap().movable.is_empty());

        scene.update_primitive_bounds(id, bounds_at(20.0));
        assert_eq!(scene.interactions(light).unwrap().movable, vec![id]);
    }

    #[test]
    fn test_spatial_index_tracks_dirty_state() {
        let mut scene = Scene::new();
        scene.add_primitive(PrimitiveSceneInfo::new(bounds_at(0.0)));
        assert!(scene.spatial_index().is_none());
        scene.rebuild_spatial_index();
        assert!(scene.spatial_index().is_some());
        scene.add_primitive(PrimitiveSceneInfo::new(bounds_at(10.0)));
        assert!(scene.spatial_index().is_none());
    }

    #[test]
    fn test_draw_distance() {
        let primitive = PrimitiveSceneInfo::new(bounds_at(0.0)).with_draw_distance(100.0, 1000.0);
        assert!(!primitive.within_draw_distance(50.0 * 50.0, 1.0));
        assert!(primitive.within_draw_distance(500.0 * 500.0, 1.0));
        assert!(!primitive.within_draw_distance(1500.0 * 1500.0, 1.0));
    }
}
