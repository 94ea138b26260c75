//! Frame Shadow Scheduling
//!
//! [`ShadowRenderer::init_dynamic_shadows`] runs the whole per-frame
//! pipeline for a scene and its views:
//!
//! 1. release cached whole-scene maps that went idle
//! 2. create whole-scene shadows: cached or uncached maps for local
//!    lights, cascades and reflective shadow maps for directional lights
//! 3. create per-object shadows and preshadows for light interactions
//! 4. bring the preshadow cache in line with this frame's preshadows
//! 5. gather the casters of every shadow that needs them
//! 6. drop static cache layers that turned out empty
//! 7. pack everything visible into atlases
//!
//! Everything runs on the calling thread except the gather's packet
//! fan-out. Cross-frame state lives in the [`SceneShadowCacheState`]
//! passed in, so one renderer can serve several scenes.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::atlas::{allocate_shadow_depth_targets, SortedShadowMaps};
use crate::cache::{CacheUpdateQuota, SceneShadowCacheState};
use crate::config::{FeatureLevel, ShadowConfig};
use crate::error::Result;
use crate::gather::{add_subject_resolved, gather_shadow_primitives, is_primitive_visible, GatherStats, ViewRelevanceCache};
use crate::initializer::PerObjectShadowInitializer;
use crate::light::{LightId, LightKind, LightMobility, LightSceneInfo};
use crate::preshadow::{get_cached_preshadow, is_inside_whole_scene_shadow, should_create_preshadow, update_preshadow_cache};
use crate::projection::{
    build_light_view_convex_hull, setup_per_object_projection, setup_whole_scene_projection, PerObjectSetup,
    WholeSceneSetup,
};
use crate::render_target::RenderTargetProvider;
use crate::resolution::{PerObjectResolution, WholeSceneResolution};
use crate::scene::{PrimitiveSceneInfo, Scene};
use crate::shadow::{CacheMode, ProjectedShadowInfo, ShadowId};
use crate::view::ShadowView;

/// Side of a reflective shadow map
pub const REFLECTIVE_SHADOW_MAP_RESOLUTION: u32 = 256;

/// Shadows created for one light this frame
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LightShadows {
    pub light: LightId,
    /// Every shadow of the light that is projected this frame
    pub projected_shadows: Vec<ShadowId>,
    /// The subset of `projected_shadows` that are preshadows
    pub projected_preshadows: Vec<ShadowId>,
}

/// Counters of one frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameShadowStats {
    pub whole_scene: usize,
    pub cascades: usize,
    pub reflective: usize,
    pub per_object: usize,
    pub translucent: usize,
    pub preshadows: usize,
    /// Preshadows served from the preshadow cache
    pub reused_preshadows: usize,
    /// Shadows not created because they faded out
    pub faded_out: usize,
    /// Shadows not created because their projection was degenerate
    pub degenerate: usize,
    /// Static cache layers dropped for having no casters
    pub empty_static_layers: usize,
    /// Static cache layers re-rendered this frame
    pub cache_updates: u32,
    /// Idle cached maps released this frame
    pub evicted_cache_maps: usize,
    pub gather: GatherStats,
    pub atlases: usize,
    pub atlas_memory_bytes: u64,
}

/// Result of one frame's shadow setup
#[derive(Clone, Debug, Default)]
pub struct ShadowFrame {
    /// Descriptor arena, indexed by `ShadowId`
    pub shadows: Vec<ProjectedShadowInfo>,
    pub sorted: SortedShadowMaps,
    /// Shadows each view projects, indexed like the views slice
    pub visible_per_view: Vec<Vec<ShadowId>>,
    /// Indexed like the scene's lights
    pub lights: Vec<LightShadows>,
    pub stats: FrameShadowStats,
}

impl ShadowFrame {
    fn empty(view_count: usize) -> Self {
        Self {
            visible_per_view: vec![Vec::new(); view_count],
            ..Default::default()
        }
    }

    #[inline]
    pub fn shadow(&self, id: ShadowId) -> Option<&ProjectedShadowInfo> {
        self.shadows.get(id.index())
    }

    /// Shadows projected for `light`
    pub fn shadows_for_light(&self, light: LightId) -> &[ShadowId] {
        self.lights
            .get(light.index())
            .map_or(&[], |shadows| shadows.projected_shadows.as_slice())
    }

    pub fn preshadows_for_light(&self, light: LightId) -> &[ShadowId] {
        self.lights
            .get(light.index())
            .map_or(&[], |shadows| shadows.projected_preshadows.as_slice())
    }

    /// Shadows that received an atlas placement
    pub fn allocated_shadows(&self) -> impl Iterator<Item = (ShadowId, &ProjectedShadowInfo)> {
        self.shadows
            .iter()
            .enumerate()
            .filter(|(_, shadow)| shadow.allocated)
            .map(|(index, shadow)| (ShadowId(index as u32), shadow))
    }

    /// Allocated shadows whose depths must be drawn this frame.
    ///
    /// Cached preshadows and movable layers without casters project from
    /// depths drawn in an earlier frame.
    pub fn shadows_needing_render(&self) -> impl Iterator<Item = (ShadowId, &ProjectedShadowInfo)> {
        self.allocated_shadows().filter(|(_, shadow)| {
            !shadow.depths_cached
                && !(shadow.cache_mode == CacheMode::MovablePrimitivesOnly && !shadow.has_subject_prims())
        })
    }
}

/// Schedules the dynamic shadows of a scene each frame
#[derive(Clone, Debug, Default)]
pub struct ShadowRenderer {
    config: ShadowConfig,
    frame_number: u64,
}

impl ShadowRenderer {
    /// Create a renderer, clamping the configuration into range
    pub fn new(mut config: ShadowConfig) -> Self {
        config.validate();
        Self {
            config,
            frame_number: 0,
        }
    }

    #[inline]
    pub fn config(&self) -> &ShadowConfig {
        &self.config
    }

    /// Replace the configuration, e.g. after a hot-reload
    pub fn set_config(&mut self, mut config: ShadowConfig) {
        config.validate();
        self.config = config;
    }

    /// Frames set up so far
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Decide every shadow map of the frame, its casters and its atlas
    /// placement.
    ///
    /// `real_time` is the frame time in seconds, used for idle cache
    /// eviction. Fails only on an atlas overflow.
    pub fn init_dynamic_shadows(
        &mut self,
        scene: &Scene,
        views: &[ShadowView],
        cache_state: &mut SceneShadowCacheState,
        provider: &dyn RenderTargetProvider,
        real_time: f64,
    ) -> Result<ShadowFrame> {
        self.frame_number += 1;
        let config = &self.config;

        if !config.enabled || views.is_empty() {
            return Ok(ShadowFrame::empty(views.len()));
        }

        let evicted = cache_state.evict_idle(real_time, config.cache_idle_eviction_seconds);

        let mut setup = FrameSetup {
            scene,
            views,
            config,
            relevance: ViewRelevanceCache::for_visible_primitives(scene, views),
            shadows: Vec::new(),
            lights: scene
                .lights()
                .iter()
                .map(|light| LightShadows {
                    light: light.id,
                    ..Default::default()
                })
                .collect(),
            view_dependent: Vec::new(),
            quota: CacheUpdateQuota::default(),
            stats: FrameShadowStats {
                evicted_cache_maps: evicted,
                ..Default::default()
            },
        };

        for light in scene.lights() {
            setup.create_light_shadows(light, cache_state, real_time);
        }

        update_preshadow_cache(cache_state, &mut setup.shadows, config);

        setup.stats.gather =
            gather_shadow_primitives(scene, views, &mut setup.shadows, &mut setup.relevance, config);

        setup.drop_empty_static_layers(cache_state);

        let visible_per_view = setup.compute_view_visibility();
        let visible: Vec<ShadowId> = setup
            .lights
            .iter()
            .flat_map(|light| light.projected_shadows.iter().copied())
            .filter(|id| visible_per_view.iter().any(|view| view.contains(id)))
            .collect();

        let sorted = allocate_shadow_depth_targets(&mut setup.shadows, &visible, cache_state, provider, config)?;

        let mut stats = setup.stats;
        stats.cache_updates = setup.quota.point + setup.quota.spot;
        stats.atlases = sorted.atlas_count();
        stats.atlas_memory_bytes = sorted.memory_size();

        log::debug!(
            "Frame {}: {} shadows ({} whole-scene, {} cascades, {} per-object, {} preshadows) in {} atlases",
            self.frame_number,
            setup.shadows.len(),
            stats.whole_scene,
            stats.cascades,
            stats.per_object,
            stats.preshadows,
            stats.atlases
        );

        Ok(ShadowFrame {
            shadows: setup.shadows,
            sorted,
            visible_per_view,
            lights: setup.lights,
            stats,
        })
    }
}

/// Per-object shadow kinds wanted for one interaction
#[derive(Clone, Copy, Debug)]
struct PerObjectRequest {
    opaque: bool,
    translucent: bool,
}

/// Working state of one `init_dynamic_shadows` call
struct FrameSetup<'a> {
    scene: &'a Scene,
    views: &'a [ShadowView],
    config: &'a ShadowConfig,
    relevance: ViewRelevanceCache,
    shadows: Vec<ProjectedShadowInfo>,
    lights: Vec<LightShadows>,
    /// Cascades created so far, checked before creating preshadows
    view_dependent: Vec<ShadowId>,
    quota: CacheUpdateQuota,
    stats: FrameShadowStats,
}

impl<'a> FrameSetup<'a> {
    #[inline]
    fn mobile(&self) -> bool {
        self.config.feature_level == FeatureLevel::Mobile
    }

    fn push(&mut self, shadow: ProjectedShadowInfo) -> ShadowId {
        let id = ShadowId(self.shadows.len() as u32);
        if let Some(light) = self.lights.get_mut(shadow.light.index()) {
            light.projected_shadows.push(id);
            if shadow.pre_shadow {
                light.projected_preshadows.push(id);
            }
        }
        self.shadows.push(shadow);
        id
    }

    fn create_light_shadows(&mut self, light: &LightSceneInfo, cache_state: &mut SceneShadowCacheState, real_time: f64) {
        let settings = &light.shadow;
        if !settings.casts_dynamic_shadow && !settings.casts_static_shadow {
            return;
        }
        if !self.views.iter().any(|view| light.is_visible_in(view)) {
            return;
        }

        let mobile = self.mobile();
        let point_like = matches!(light.kind(), LightKind::Point | LightKind::Rect);
        let directional = light.is_directional();

        // Lights without baked shadowing, or whose baked shadowing is stale
        let for_movable_light = settings.casts_dynamic_shadow && !light.has_static_shadowing();
        let preview_static_light =
            light.has_static_shadowing() && settings.casts_static_shadow && !light.precomputed_lighting_valid;

        let whole_scene = (for_movable_light || (preview_static_light && (!mobile || directional)))
            && !(point_like && mobile);
        if whole_scene && !directional {
            self.create_whole_scene_shadows(light, cache_state, real_time);
        }

        if (!light.has_static_lighting() && settings.casts_dynamic_shadow) || preview_static_light {
            let use_csm = settings.use_csm_for_dynamic_objects;
            if directional && (!mobile || use_csm || light.mobility == LightMobility::Movable) {
                self.add_view_dependent_shadows(light);
            }
            if !mobile || !use_csm {
                self.setup_interaction_shadows(light, cache_state);
            }
        }
    }

    /// Cached or uncached whole-scene maps of a point, spot or rect light
    fn create_whole_scene_shadows(&mut self, light: &LightSceneInfo, cache_state: &mut SceneShadowCacheState, real_time: f64) {
        if light.shadow.resolution_scale <= 0.0 {
            return;
        }

        for initializer in light.whole_scene_initializers() {
            let one_pass = initializer.one_pass_point_light_shadow;
            let resolution = WholeSceneResolution::compute(light, self.views, one_pass, self.config);
            if !resolution.is_visible() {
                log::debug!("Whole-scene shadow of {:?} faded out", light.id);
                self.stats.faded_out += 1;
                continue;
            }

            let border = resolution.border;
            let (size_x, size_y) = resolution.size(one_pass, self.config);
            let decision = cache_state.compute_whole_scene_cache_modes(
                light,
                &initializer,
                (size_x + 2 * border, size_y + 2 * border),
                (resolution.max_resolution_x, resolution.max_resolution_y),
                resolution.max_desired_resolution,
                &mut self.quota,
                real_time,
                self.config,
            );
            let (map_x, map_y) = decision.shadow_map_size;
            let setup = WholeSceneSetup {
                dependent_view: None,
                resolution_x: map_x.saturating_sub(2 * border),
                resolution_y: map_y.saturating_sub(2 * border),
                border,
                reflective: false,
            };

            for mode in decision.modes.iter().copied() {
                let mut shadow = match setup_whole_scene_projection(light, &decision.initializer, &setup, self.config) {
                    Ok(shadow) => shadow,
                    Err(err) => {
                        log::debug!("Skipping whole-scene shadow of {:?}: {err}", light.id);
                        self.stats.degenerate += 1;
                        continue;
                    }
                };
                shadow.cache_mode = mode;
                shadow.fade_alphas = resolution.fade_alphas.clone();

                // The static layer must hold casters outside the current views too
                if mode != CacheMode::StaticPrimitivesOnly {
                    shadow.light_view_hulls = self
                        .views
                        .iter()
                        .map(|view| build_light_view_convex_hull(light.position, &view.view_frustum_without_near()))
                        .collect::<SmallVec<_>>();
                }

                self.push(shadow);
                self.stats.whole_scene += 1;
            }
        }
    }

    /// Cascades of a directional light per view, plus a reflective shadow
    /// map where the view asks for one
    fn add_view_dependent_shadows(&mut self, light: &LightSceneInfo) {
        let (views, config) = (self.views, self.config);
        let border = config.shadow_border;
        let resolution = config
            .max_shadow_resolution
            .min(config.max_texture_size())
            .saturating_sub(2 * border)
            .max(1);

        for (view_index, view) in views.iter().enumerate() {
            let mut fade_alphas = vec![0.0; views.len()];
            fade_alphas[view_index] = light.shadow.shadow_amount;

            for cascade_index in 0..light.num_cascades(config) {
                let Some(initializer) = light.view_dependent_initializer(view, cascade_index, config) else {
                    continue;
                };
                let setup = WholeSceneSetup {
                    dependent_view: Some(view),
                    resolution_x: resolution,
                    resolution_y: resolution,
                    border,
                    reflective: false,
                };
                match setup_whole_scene_projection(light, &initializer, &setup, config) {
                    Ok(mut shadow) => {
                        shadow.fade_alphas = fade_alphas.clone();
                        let id = self.push(shadow);
                        self.view_dependent.push(id);
                        self.stats.cascades += 1;
                    }
                    Err(err) => {
                        log::debug!("Skipping cascade {cascade_index} of {:?}: {err}", light.id);
                        self.stats.degenerate += 1;
                    }
                }
            }

            if !view.render_reflective_shadow_maps {
                continue;
            }
            let Some(initializer) = light.rsm_initializer(view, config) else {
                continue;
            };
            let setup = WholeSceneSetup {
                dependent_view: Some(view),
                resolution_x: REFLECTIVE_SHADOW_MAP_RESOLUTION,
                resolution_y: REFLECTIVE_SHADOW_MAP_RESOLUTION,
                border: 0,
                reflective: true,
            };
            match setup_whole_scene_projection(light, &initializer, &setup, config) {
                Ok(mut shadow) => {
                    shadow.fade_alphas = fade_alphas;
                    self.push(shadow);
                    self.stats.reflective += 1;
                }
                Err(err) => {
                    log::debug!("Skipping reflective shadow map of {:?}: {err}", light.id);
                    self.stats.degenerate += 1;
                }
            }
        }
    }

    fn setup_interaction_shadows(&mut self, light: &LightSceneInfo, cache_state: &SceneShadowCacheState) {
        let scene = self.scene;
        let Some(interactions) = scene.interactions(light.id) else {
            return;
        };

        for primitive_id in interactions.iter() {
            let primitive = scene.primitive(primitive_id);
            let flags = primitive.flags;
            if !flags.cast_dynamic_shadow {
                continue;
            }

            let request = PerObjectRequest {
                opaque: flags.cast_inset_shadow || light.creates_per_object_shadow_for(primitive),
                translucent: self.config.enable_translucent_per_object_shadows
                    && light.shadow.cast_translucent_shadows
                    && flags.has_translucency,
            };
            if request.opaque || request.translucent {
                self.create_per_object_shadows(light, primitive, request, cache_state);
            }
        }
    }

    /// Opaque and translucent shadows of one primitive, and the preshadow
    /// of the static geometry onto it
    fn create_per_object_shadows(
        &mut self,
        light: &LightSceneInfo,
        primitive: &PrimitiveSceneInfo,
        request: PerObjectRequest,
        cache_state: &SceneShadowCacheState,
    ) {
        let (scene, views, config) = (self.scene, self.views, self.config);

        let mut shadow_relevant = false;
        let mut opaque_relevant = false;
        let mut translucent_relevant = false;
        for view_index in 0..views.len() {
            let relevance = self.relevance.get_or_compute(scene, views, view_index, primitive.id);
            shadow_relevant |= relevance.shadow_relevance;
            opaque_relevant |= relevance.static_relevance || relevance.dynamic_relevance;
            translucent_relevant |= relevance.translucent_relevance;
        }
        if !shadow_relevant {
            return;
        }

        let subject_bounds = primitive.bounds;
        let subject_visible = is_primitive_visible(primitive, views);
        let resolution = PerObjectResolution::compute(light, &subject_bounds, views, config);

        let render_preshadow = should_create_preshadow(light, primitive, subject_visible, config)
            && config.feature_level == FeatureLevel::Desktop;

        // Grown so the cached preshadow survives small movements of the subject
        let bounds = if render_preshadow && config.cache_preshadows {
            subject_bounds.expand_by_fraction(config.preshadow_expand_fraction.max(0.0))
        } else {
            subject_bounds
        };

        if !resolution.is_visible() && !(render_preshadow && resolution.is_preshadow_visible()) {
            log::debug!("Per-object shadow of {:?} from {:?} faded out", primitive.id, light.id);
            self.stats.faded_out += 1;
            return;
        }
        let Some(initializer) = light.per_object_initializer(&bounds) else {
            self.stats.degenerate += 1;
            return;
        };

        let base_setup = PerObjectSetup {
            parent: primitive.id,
            pre_shadow: false,
            translucent: false,
            self_shadow_only: primitive.flags.self_shadow_only,
            resolution_x: resolution.resolution_x(),
            max_resolution_y: resolution.max_resolution_y,
            border: resolution.border,
            max_screen_percent: resolution.max_screen_percent,
        };

        if config.enable_per_object_shadows && resolution.is_visible() {
            if opaque_relevant && request.opaque {
                if let Some(id) = self.add_per_object(light, &initializer, &base_setup, &resolution.fade_alphas) {
                    self.add_parent_subject(id, primitive);
                    self.stats.per_object += 1;
                }
            }

            if translucent_relevant && request.translucent && !self.mobile() {
                let (resolution_x, max_resolution_y) = resolution.translucent_resolution(config);
                let setup = PerObjectSetup {
                    translucent: true,
                    resolution_x,
                    max_resolution_y,
                    ..base_setup
                };
                if let Some(id) = self.add_per_object(light, &initializer, &setup, &resolution.fade_alphas) {
                    self.add_parent_subject(id, primitive);
                    self.stats.translucent += 1;
                }
            }
        }

        if !(render_preshadow && resolution.is_preshadow_visible() && opaque_relevant) {
            return;
        }

        if self.is_inside_cascades(&bounds) {
            return;
        }

        let (resolution_x, max_resolution_y) = resolution.preshadow_resolution(config);
        let cached = get_cached_preshadow(cache_state, primitive.id, light.id, &subject_bounds, resolution_x, config);
        let mut preshadow = match cached {
            Some(cached) => {
                self.stats.reused_preshadows += 1;
                cached
            }
            None => {
                let setup = PerObjectSetup {
                    pre_shadow: true,
                    resolution_x,
                    max_resolution_y,
                    ..base_setup
                };
                match setup_per_object_projection(light, &initializer, &setup, config) {
                    Ok(shadow) => shadow,
                    Err(err) => {
                        log::debug!("Skipping preshadow of {:?} from {:?}: {err}", primitive.id, light.id);
                        self.stats.degenerate += 1;
                        return;
                    }
                }
            }
        };
        preshadow.fade_alphas = resolution.preshadow_fade_alphas.clone();
        if subject_visible {
            preshadow.add_receiver_primitive(primitive.id);
        }
        self.push(preshadow);
        self.stats.preshadows += 1;
    }

    fn add_per_object(
        &mut self,
        light: &LightSceneInfo,
        initializer: &PerObjectShadowInitializer,
        setup: &PerObjectSetup,
        fade_alphas: &[f32],
    ) -> Option<ShadowId> {
        match setup_per_object_projection(light, initializer, setup, self.config) {
            Ok(mut shadow) => {
                shadow.fade_alphas = fade_alphas.to_vec();
                Some(self.push(shadow))
            }
            Err(err) => {
                log::debug!("Skipping per-object shadow of {:?} from {:?}: {err}", setup.parent, light.id);
                self.stats.degenerate += 1;
                None
            }
        }
    }

    fn add_parent_subject(&mut self, id: ShadowId, primitive: &PrimitiveSceneInfo) {
        let shadow = &mut self.shadows[id.index()];
        add_subject_resolved(self.scene, self.views, &mut self.relevance, id, shadow, primitive.id);
    }

    /// Whether the bounds sit well inside a cascade created so far
    fn is_inside_cascades(&self, bounds: &void_math::BoxSphereBounds) -> bool {
        self.view_dependent.iter().any(|id| {
            let cascade = &self.shadows[id.index()];
            let Some(view) = cascade
                .dependent_view
                .and_then(|view_id| self.views.iter().find(|view| view.id == view_id))
            else {
                return false;
            };
            let Some(light) = self.scene.light(cascade.light) else {
                return false;
            };
            is_inside_whole_scene_shadow(cascade, view.origin, light.distance_fade_start(self.config), bounds)
        })
    }

    /// Static cache layers are only projected when they have casters; the
    /// cache remembers the outcome for the following frames
    fn drop_empty_static_layers(&mut self, cache_state: &mut SceneShadowCacheState) {
        let shadows = &self.shadows;
        let mut dropped = 0;

        for light in &mut self.lights {
            light.projected_shadows.retain(|id| {
                let shadow = &shadows[id.index()];
                if shadow.cache_mode != CacheMode::StaticPrimitivesOnly {
                    return true;
                }
                let has_primitives = shadow.has_subject_prims();
                if let Some(data) = cache_state.cached_shadow_map_mut(shadow.light) {
                    data.cached_shadow_map_has_primitives = has_primitives;
                }
                if !has_primitives {
                    log::debug!("Static shadow layer of {:?} has no casters", shadow.light);
                    dropped += 1;
                }
                has_primitives
            });
        }
        self.stats.empty_static_layers += dropped;
    }

    /// Per view, the projected shadows of lights the view sees whose
    /// subject is shadow relevant in it
    fn compute_view_visibility(&mut self) -> Vec<Vec<ShadowId>> {
        let (scene, views) = (self.scene, self.views);
        let mut visible_per_view = vec![Vec::new(); views.len()];

        for (view_index, view) in views.iter().enumerate() {
            for light_shadows in &self.lights {
                let Some(light) = scene.light(light_shadows.light) else {
                    continue;
                };
                if light_shadows.projected_shadows.is_empty() || !light.is_visible_in(view) {
                    continue;
                }

                for &id in &light_shadows.projected_shadows {
                    let shadow = &self.shadows[id.index()];
                    if shadow.dependent_view.is_some_and(|dependent| dependent != view.id) {
                        continue;
                    }
                    let relevant = match shadow.parent_primitive {
                        Some(parent) => {
                            self.relevance
                                .get_or_compute(scene, views, view_index, parent)
                                .shadow_relevance
                        }
                        None => true,
                    };
                    if relevant {
                        visible_per_view[view_index].push(id);
                    }
                }
            }
        }
        visible_per_view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::light::{LightMobility, LightShape, LightShadowSettings};
    use crate::render_target::RenderTargetPool;
    use crate::scene::{PrimitiveFlags, PrimitiveMobility};
    use crate::view::ViewId;
    use glam::Vec3;
    use void_math::{consts::FRAC_PI_4, BoxSphereBounds};

    fn test_view() -> ShadowView {
        ShadowView::perspective(ViewId(0), Vec3::ZERO, Vec3::X, Vec3::Z, FRAC_PI_4, (1280, 720), 10.0, 100_000.0)
    }

    fn bounds_at(position: Vec3, extent: f32) -> BoxSphereBounds {
        BoxSphereBounds::new(position, Vec3::splat(extent), extent * 3.0f32.sqrt())
    }

    fn movable_point_scene(radius: f32) -> (Scene, LightId) {
        let mut scene = Scene::new();
        for i in 0..4 {
            let position = Vec3::new(800.0 + 100.0 * i as f32, 0.0, 0.0);
            scene.add_primitive(PrimitiveSceneInfo::new(bounds_at(position, 20.0)));
        }
        let light = scene.add_light(LightSceneInfo::new(
            LightId(0),
            LightShape::Point { radius },
            Vec3::new(1000.0, 0.0, 150.0),
        ));
        scene.rebuild_spatial_index();
        (scene, light)
    }

    fn run(
        renderer: &mut ShadowRenderer,
        scene: &Scene,
        cache: &mut SceneShadowCacheState,
        time: f64,
    ) -> ShadowFrame {
        let pool = RenderTargetPool::new();
        renderer
            .init_dynamic_shadows(scene, &[test_view()], cache, &pool, time)
            .unwrap()
    }

    #[test]
    fn test_disabled_config_produces_nothing() {
        let (scene, _) = movable_point_scene(1000.0);
        let mut renderer = ShadowRenderer::new(ShadowConfig::disabled());
        let mut cache = SceneShadowCacheState::new();
        let frame = run(&mut renderer, &scene, &mut cache, 0.0);
        assert!(frame.shadows.is_empty());
        assert_eq!(frame.visible_per_view.len(), 1);
    }

    #[test]
    fn test_movable_point_light_caches_static_and_movable_layers() {
        let (scene, light) = movable_point_scene(1000.0);
        let mut renderer = ShadowRenderer::new(ShadowConfig::default());
        let mut cache = SceneShadowCacheState::new();

        let frame = run(&mut renderer, &scene, &mut cache, 0.0);
        let modes: Vec<CacheMode> = frame
            .shadows_for_light(light)
            .iter()
            .map(|id| frame.shadows[id.index()].cache_mode)
            .collect();
        // Every primitive is movable, so the static layer is empty and dropped
        assert_eq!(modes, vec![CacheMode::MovablePrimitivesOnly]);
        assert_eq!(frame.stats.empty_static_layers, 1);
        assert!(!cache.cached_shadow_map(light).unwrap().cached_shadow_map_has_primitives);

        let movable = &frame.shadows[frame.shadows_for_light(light)[0].index()];
        assert!(movable.one_pass_point_light_shadow);
        assert!(movable.allocated);
        assert!(movable.has_subject_prims());
    }

    #[test]
    fn test_static_casters_fill_static_layer() {
        let (mut scene, light) = movable_point_scene(1000.0);
        scene.add_primitive(
            PrimitiveSceneInfo::new(bounds_at(Vec3::new(1000.0, 100.0, 0.0), 30.0)).with_mobility(PrimitiveMobility::Static),
        );
        scene.rebuild_spatial_index();

        let mut renderer = ShadowRenderer::new(ShadowConfig::default());
        let mut cache = SceneShadowCacheState::new();
        let frame = run(&mut renderer, &scene, &mut cache, 0.0);

        let ids = frame.shadows_for_light(light);
        assert_eq!(ids.len(), 2);
        let static_layer = &frame.shadows[ids[0].index()];
        assert_eq!(static_layer.cache_mode, CacheMode::StaticPrimitivesOnly);
        assert_eq!(static_layer.subject_primitives.len(), 1);
        assert!(cache.cached_shadow_map(light).unwrap().shadow_map.is_valid());

        // Next frame only the movable layer is rendered
        let frame = run(&mut renderer, &scene, &mut cache, 0.1);
        let modes: Vec<CacheMode> = frame
            .shadows_for_light(light)
            .iter()
            .map(|id| frame.shadows[id.index()].cache_mode)
            .collect();
        assert_eq!(modes, vec![CacheMode::MovablePrimitivesOnly]);
    }

    #[test]
    fn test_zero_resolution_scale_disables_whole_scene_shadow() {
        let (mut scene, light) = movable_point_scene(1000.0);
        scene.light_mut(light).unwrap().shadow = LightShadowSettings::default().with_resolution_scale(0.0);
        let mut renderer = ShadowRenderer::new(ShadowConfig::default());
        let mut cache = SceneShadowCacheState::new();
        let frame = run(&mut renderer, &scene, &mut cache, 0.0);
        assert!(frame.shadows_for_light(light).is_empty());
    }

    #[test]
    fn test_stationary_light_creates_per_object_shadow_for_dynamic_primitive() {
        let mut scene = Scene::new();
        let receiver = scene.add_primitive(PrimitiveSceneInfo::new(bounds_at(Vec3::new(600.0, 0.0, 0.0), 50.0)));
        let light = scene.add_light(
            LightSceneInfo::new(
                LightId(0),
                LightShape::Spot { direction: Vec3::new(0.0, 0.0, -1.0), radius: 3000.0, outer_cone_angle: 0.8 },
                Vec3::new(600.0, 0.0, 1000.0),
            )
            .with_mobility(LightMobility::Stationary),
        );
        scene.rebuild_spatial_index();

        let mut renderer = ShadowRenderer::new(ShadowConfig::default());
        let mut cache = SceneShadowCacheState::new();
        let frame = run(&mut renderer, &scene, &mut cache, 0.0);

        let per_object: Vec<&ProjectedShadowInfo> = frame
            .shadows_for_light(light)
            .iter()
            .map(|id| &frame.shadows[id.index()])
            .filter(|shadow| shadow.is_per_object() && !shadow.pre_shadow)
            .collect();
        assert_eq!(per_object.len(), 1);
        assert_eq!(per_object[0].parent_primitive, Some(receiver));
        assert_eq!(per_object[0].subject_primitives, vec![receiver]);
        assert!(per_object[0].allocated);

        // Stationary lights have baked shadowing, so no whole-scene map
        assert_eq!(frame.stats.whole_scene, 0);
        assert_eq!(frame.preshadows_for_light(light).len(), 1);
    }

    #[test]
    fn test_translucent_primitive_gets_translucent_shadow() {
        let mut scene = Scene::new();
        let flags = PrimitiveFlags {
            has_translucency: true,
            cast_inset_shadow: true,
            ..Default::default()
        };
        scene.add_primitive(PrimitiveSceneInfo::new(bounds_at(Vec3::new(600.0, 0.0, 0.0), 50.0)).with_flags(flags));
        let sun = scene.add_light(LightSceneInfo::new(
            LightId(0),
            LightShape::Directional { direction: Vec3::new(0.3, 0.2, -1.0) },
            Vec3::ZERO,
        ));
        scene.rebuild_spatial_index();

        let mut renderer = ShadowRenderer::new(ShadowConfig::default());
        let mut cache = SceneShadowCacheState::new();
        let frame = run(&mut renderer, &scene, &mut cache, 0.0);

        assert_eq!(frame.stats.cascades, 3);
        assert_eq!(frame.stats.per_object, 1);
        assert_eq!(frame.stats.translucent, 1);
        let translucent = frame
            .shadows_for_light(sun)
            .iter()
            .map(|id| &frame.shadows[id.index()])
            .find(|shadow| shadow.translucent_shadow)
            .unwrap();
        assert_eq!(translucent.subject_translucent_primitives.len(), 1);
        assert!(!frame.sorted.translucency_shadow_map_atlases.is_empty());
    }

    #[test]
    fn test_frame_stats_serialize() {
        let stats = FrameShadowStats {
            cascades: 3,
            atlases: 2,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        let back: FrameShadowStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
    }
}
