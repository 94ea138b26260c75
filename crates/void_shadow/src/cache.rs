//! Shadow Cache Manager
//!
//! Persistent state that outlives a frame: one cached whole-scene map per
//! local light and the shared preshadow cache. The state is owned by the
//! scene and passed into every frame, so tests can run against a fresh
//! cache.
//!
//! # Whole-scene caching
//!
//! A cached light renders its static casters once into a
//! `StaticPrimitivesOnly` map that persists, and every frame renders its
//! movable casters into a `MovablePrimitivesOnly` map composited on top.
//! The static layer is re-rendered when the light's projection changes or
//! its resolution tier moves far enough. Over the memory budget the light
//! falls back to a single `Uncached` map.

use std::collections::HashMap;

use smallvec::{smallvec, SmallVec};

use crate::config::ShadowConfig;
use crate::initializer::WholeSceneShadowInitializer;
use crate::layout::TextureLayout;
use crate::light::{LightId, LightKind, LightSceneInfo};
use crate::render_target::{DepthFormat, RenderTargetDesc};
use crate::shadow::{CacheMode, ProjectedShadowInfo, RenderTargetHandle};

/// Persisted depth target of a cached whole-scene shadow
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShadowMapRenderTargets {
    /// Padded size
    pub size: (u32, u32),
    pub is_cube: bool,
    pub target: Option<RenderTargetHandle>,
}

impl ShadowMapRenderTargets {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.target.is_some()
    }

    pub fn memory_size(&self) -> u64 {
        if !self.is_valid() {
            return 0;
        }
        let desc = if self.is_cube {
            RenderTargetDesc::cube(self.size.0)
        } else {
            RenderTargetDesc::depth(self.size.0, self.size.1)
        };
        desc.with_format(DepthFormat::ShadowDepth).memory_size()
    }

    pub fn release(&mut self) {
        self.target = None;
    }
}

/// Cached whole-scene shadow of one light
#[derive(Clone, Debug)]
pub struct CachedShadowMapData {
    /// Projection the cached depths were rendered with
    pub initializer: WholeSceneShadowInitializer,
    pub shadow_map: ShadowMapRenderTargets,
    pub last_used_time: f64,
    /// The static layer holds at least one caster
    pub cached_shadow_map_has_primitives: bool,
}

impl CachedShadowMapData {
    pub fn new(initializer: WholeSceneShadowInitializer, real_time: f64) -> Self {
        Self {
            initializer,
            shadow_map: ShadowMapRenderTargets::default(),
            last_used_time: real_time,
            cached_shadow_map_has_primitives: true,
        }
    }
}

/// Static-layer refreshes spent this frame, per light shape
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheUpdateQuota {
    pub point: u32,
    pub spot: u32,
}

impl CacheUpdateQuota {
    fn counter_and_limit(&mut self, kind: LightKind, config: &ShadowConfig) -> Option<(&mut u32, i32)> {
        match kind {
            LightKind::Point | LightKind::Rect => Some((&mut self.point, config.max_cache_updates_per_frame_point)),
            LightKind::Spot => Some((&mut self.spot, config.max_cache_updates_per_frame_spot)),
            LightKind::Directional => None,
        }
    }
}

/// Maps to render for one whole-scene shadow this frame
#[derive(Clone, Debug, PartialEq)]
pub struct CacheModeDecision {
    /// Static layer first so the movable layer has a base to composite on
    pub modes: SmallVec<[CacheMode; 2]>,
    /// Projection to render with; the cached one on fallback
    pub initializer: WholeSceneShadowInitializer,
    /// Padded map size; the cached size on fallback
    pub shadow_map_size: (u32, u32),
}

impl CacheModeDecision {
    fn uncached(initializer: &WholeSceneShadowInitializer, shadow_map_size: (u32, u32)) -> Self {
        Self {
            modes: smallvec![CacheMode::Uncached],
            initializer: initializer.clone(),
            shadow_map_size,
        }
    }

    /// The one mode whose map is occlusion tested for the light
    pub fn occlusion_mode(&self) -> CacheMode {
        self.modes
            .iter()
            .copied()
            .find(|mode| *mode != CacheMode::StaticPrimitivesOnly)
            .unwrap_or(CacheMode::Uncached)
    }
}

/// Shadow state that persists across frames
#[derive(Debug, Default)]
pub struct SceneShadowCacheState {
    pub cached_shadow_maps: HashMap<LightId, CachedShadowMapData>,
    /// Preshadows whose depths live in the preshadow cache texture
    pub cached_preshadows: Vec<ProjectedShadowInfo>,
    pub preshadow_layout: TextureLayout,
    pub preshadow_cache_target: Option<RenderTargetHandle>,
    pub next_preshadow_key: u64,
}

impl SceneShadowCacheState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_shadow_map(&self, light: LightId) -> Option<&CachedShadowMapData> {
        self.cached_shadow_maps.get(&light)
    }

    pub fn cached_shadow_map_mut(&mut self, light: LightId) -> Option<&mut CachedShadowMapData> {
        self.cached_shadow_maps.get_mut(&light)
    }

    /// Bytes held by every valid cached whole-scene map
    pub fn cached_whole_scene_shadow_maps_size(&self) -> u64 {
        self.cached_shadow_maps
            .values()
            .map(|data| data.shadow_map.memory_size())
            .sum()
    }

    #[inline]
    pub fn is_under_budget(&self, config: &ShadowConfig) -> bool {
        self.cached_whole_scene_shadow_maps_size() < config.cache_budget_bytes()
    }

    /// Release maps unused for longer than `idle_seconds`; the entries stay
    pub fn evict_idle(&mut self, real_time: f64, idle_seconds: f64) -> usize {
        let mut evicted = 0;
        for (light, data) in &mut self.cached_shadow_maps {
            if data.shadow_map.is_valid() && real_time - data.last_used_time > idle_seconds {
                log::debug!("Releasing idle cached shadow map of {light:?}");
                data.shadow_map.release();
                evicted += 1;
            }
        }
        evicted
    }

    /// Drop everything cached for a light that left the scene
    pub fn remove_light(&mut self, light: LightId) {
        self.cached_shadow_maps.remove(&light);
        let layout = &mut self.preshadow_layout;
        self.cached_preshadows.retain(|preshadow| {
            if preshadow.light != light {
                return true;
            }
            let (x, y, w, h) = preshadow.shadow_atlas_rect();
            if !layout.remove_element(x, y, w, h) {
                log::warn!("Cached preshadow of {light:?} was missing from the preshadow layout");
            }
            false
        });
    }

    /// Record the target the static layer of `light` was rendered into
    pub fn store_cached_shadow_map(&mut self, light: LightId, target: RenderTargetHandle, size: (u32, u32), is_cube: bool) {
        if let Some(data) = self.cached_shadow_maps.get_mut(&light) {
            data.shadow_map = ShadowMapRenderTargets {
                size,
                is_cube,
                target: Some(target),
            };
        }
    }

    /// Decide which maps a local light's whole-scene shadow renders this
    /// frame.
    ///
    /// `shadow_map_size` is the padded size wanted this frame and
    /// `max_shadow_resolution` the unpadded platform limit.
    /// `actual_desired_resolution` is the resolution before rounding, used
    /// by the resize guard band.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_whole_scene_cache_modes(
        &mut self,
        light: &LightSceneInfo,
        initializer: &WholeSceneShadowInitializer,
        shadow_map_size: (u32, u32),
        max_shadow_resolution: (u32, u32),
        actual_desired_resolution: f32,
        quota: &mut CacheUpdateQuota,
        real_time: f64,
        config: &ShadowConfig,
    ) -> CacheModeDecision {
        let Some((updates, max_updates)) = quota.counter_and_limit(light.kind(), config) else {
            return CacheModeDecision::uncached(initializer, shadow_map_size);
        };

        if !config.cache_whole_scene_shadows {
            self.cached_shadow_maps.remove(&light.id);
            return CacheModeDecision::uncached(initializer, shadow_map_size);
        }

        let cached_size = self.cached_whole_scene_shadow_maps_size();
        let under_budget = cached_size < config.cache_budget_bytes();
        let over_quota = |count: u32| max_updates >= 0 && count > max_updates as u32;
        let both_layers = || smallvec![CacheMode::StaticPrimitivesOnly, CacheMode::MovablePrimitivesOnly];

        let Some(data) = self.cached_shadow_maps.get_mut(&light.id) else {
            if !under_budget {
                log::debug!("Whole-scene shadow cache over budget, {:?} renders uncached", light.id);
                return CacheModeDecision::uncached(initializer, shadow_map_size);
            }
            *updates += 1;
            self.cached_shadow_maps
                .insert(light.id, CachedShadowMapData::new(initializer.clone(), real_time));
            return CacheModeDecision {
                modes: both_layers(),
                initializer: initializer.clone(),
                shadow_map_size,
            };
        };

        let mut decision = CacheModeDecision {
            modes: both_layers(),
            initializer: initializer.clone(),
            shadow_map_size,
        };

        if !initializer.is_cached_shadow_valid(&data.initializer) {
            decision.modes = smallvec![CacheMode::Uncached];
            data.shadow_map.release();
        } else if data.shadow_map.is_valid() && data.shadow_map.size == shadow_map_size {
            decision.modes = smallvec![CacheMode::MovablePrimitivesOnly];
        } else if under_budget {
            *updates += 1;

            let existing = data.shadow_map.size;
            let can_fall_back = data.shadow_map.is_valid()
                && existing.0 <= max_shadow_resolution.0
                && existing.1 <= max_shadow_resolution.1;

            if can_fall_back {
                let over_budget = over_quota(*updates);
                let rejected_by_guard_band = !over_budget
                    && guard_band_rejects(
                        existing,
                        shadow_map_size,
                        actual_desired_resolution,
                        config.cache_resize_guard_band,
                    );

                if over_budget || rejected_by_guard_band {
                    log::debug!(
                        "Keeping cached {}x{} shadow map of {:?} (over quota: {over_budget})",
                        existing.0,
                        existing.1,
                        light.id
                    );
                    decision.shadow_map_size = existing;
                    decision.initializer = data.initializer.clone();
                    decision.modes = smallvec![CacheMode::MovablePrimitivesOnly];
                    *updates -= 1;
                }
            }
        } else {
            decision.modes = smallvec![CacheMode::Uncached];
            data.shadow_map.release();
        }

        data.initializer = decision.initializer.clone();
        data.last_used_time = real_time;
        decision
    }
}

/// Whether a shrink is too small to justify re-rendering the static layer.
///
/// The desired resolution has to cover at least `guard_band` of the gap
/// between the existing and the new size on some shrinking axis.
fn guard_band_rejects(existing: (u32, u32), new: (u32, u32), desired: f32, guard_band: f32) -> bool {
    let shrinks_x = new.0 < existing.0;
    let shrinks_y = new.1 < existing.1;
    if !shrinks_x && !shrinks_y {
        return false;
    }

    let drop_ratio = |existing: u32, new: u32| (existing as f32 - desired) / (existing as f32 - new as f32);
    let max_drop_ratio = f32::max(
        if shrinks_x { drop_ratio(existing.0, new.0) } else { 0.0 },
        if shrinks_y { drop_ratio(existing.1, new.1) } else { 0.0 },
    );

    // A non-positive ratio means the platform limit dropped; let it resize
    max_drop_ratio > 0.0 && max_drop_ratio < guard_band
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::light::{LightShadowSettings, LightShape};
    use glam::Vec3;

    const MAX_RESOLUTION: (u32, u32) = (2040, 2040);

    fn spot_light() -> LightSceneInfo {
        LightSceneInfo::new(
            LightId(3),
            LightShape::Spot {
                direction: Vec3::X,
                radius: 1000.0,
                outer_cone_angle: 0.5,
            },
            Vec3::ZERO,
        )
    }

    fn initializer(light: &LightSceneInfo) -> WholeSceneShadowInitializer {
        light.whole_scene_initializers().remove(0)
    }

    fn decide(
        state: &mut SceneShadowCacheState,
        light: &LightSceneInfo,
        size: u32,
        desired: f32,
        quota: &mut CacheUpdateQuota,
        config: &ShadowConfig,
    ) -> CacheModeDecision {
        state.compute_whole_scene_cache_modes(
            light,
            &initializer(light),
            (size, size),
            MAX_RESOLUTION,
            desired,
            quota,
            1.0,
            config,
        )
    }

    #[test]
    fn test_new_entry_renders_both_layers() {
        let mut state = SceneShadowCacheState::new();
        let light = spot_light();
        let mut quota = CacheUpdateQuota::default();

        let decision = decide(&mut state, &light, 512, 512.0, &mut quota, &ShadowConfig::default());

        assert_eq!(
            decision.modes.as_slice(),
            &[CacheMode::StaticPrimitivesOnly, CacheMode::MovablePrimitivesOnly]
        );
        assert_eq!(decision.occlusion_mode(), CacheMode::MovablePrimitivesOnly);
        assert_eq!(quota.spot, 1);
        assert!(state.cached_shadow_map(light.id).is_some());
    }

    #[test]
    fn test_zero_budget_is_uncached() {
        let mut state = SceneShadowCacheState::new();
        let light = spot_light();
        let config = ShadowConfig {
            whole_scene_shadow_cache_budget_mb: 0.0,
            ..Default::default()
        };

        for _ in 0..3 {
            let decision = decide(&mut state, &light, 512, 512.0, &mut CacheUpdateQuota::default(), &config);
            assert_eq!(decision.modes.as_slice(), &[CacheMode::Uncached]);
            assert_eq!(decision.occlusion_mode(), CacheMode::Uncached);
        }
        assert!(state.cached_shadow_maps.is_empty());
    }

    #[test]
    fn test_valid_cache_renders_movable_only() {
        let mut state = SceneShadowCacheState::new();
        let light = spot_light();
        let config = ShadowConfig::default();
        decide(&mut state, &light, 512, 512.0, &mut CacheUpdateQuota::default(), &config);
        state.store_cached_shadow_map(light.id, RenderTargetHandle(7), (512, 512), false);

        let mut quota = CacheUpdateQuota::default();
        let decision = decide(&mut state, &light, 512, 512.0, &mut quota, &config);

        assert_eq!(decision.modes.as_slice(), &[CacheMode::MovablePrimitivesOnly]);
        assert_eq!(quota.spot, 0);
    }

    #[test]
    fn test_guard_band_keeps_existing_size() {
        let mut state = SceneShadowCacheState::new();
        let light = spot_light();
        let config = ShadowConfig::default();
        decide(&mut state, &light, 512, 512.0, &mut CacheUpdateQuota::default(), &config);
        state.store_cached_shadow_map(light.id, RenderTargetHandle(7), (512, 512), false);

        // 480 rounds down to a 256 map, but only 12.5% of the gap is wanted
        let mut quota = CacheUpdateQuota::default();
        let decision = decide(&mut state, &light, 256, 480.0, &mut quota, &config);

        assert_eq!(decision.shadow_map_size, (512, 512));
        assert_eq!(decision.modes.as_slice(), &[CacheMode::MovablePrimitivesOnly]);
        assert_eq!(quota.spot, 0);
    }

    #[test]
    fn test_large_drop_resizes() {
        let mut state = SceneShadowCacheState::new();
        let light = spot_light();
        let config = ShadowConfig::default();
        decide(&mut state, &light, 512, 512.0, &mut CacheUpdateQuota::default(), &config);
        state.store_cached_shadow_map(light.id, RenderTargetHandle(7), (512, 512), false);

        let mut quota = CacheUpdateQuota::default();
        let decision = decide(&mut state, &light, 256, 300.0, &mut quota, &config);

        assert_eq!(decision.shadow_map_size, (256, 256));
        assert_eq!(decision.modes.len(), 2);
        assert_eq!(quota.spot, 1);
    }

    #[test]
    fn test_over_quota_falls_back() {
        let mut state = SceneShadowCacheState::new();
        let light = spot_light();
        let config = ShadowConfig {
            max_cache_updates_per_frame_spot: 0,
            ..Default::default()
        };
        decide(&mut state, &light, 512, 512.0, &mut CacheUpdateQuota::default(), &config);
        state.store_cached_shadow_map(light.id, RenderTargetHandle(7), (512, 512), false);

        let mut quota = CacheUpdateQuota::default();
        let decision = decide(&mut state, &light, 1024, 1024.0, &mut quota, &config);

        assert_eq!(decision.shadow_map_size, (512, 512));
        assert_eq!(decision.modes.as_slice(), &[CacheMode::MovablePrimitivesOnly]);
        assert_eq!(quota.spot, 0);
    }

    #[test]
    fn test_moved_light_invalidates_cache() {
        let mut state = SceneShadowCacheState::new();
        let mut light = spot_light();
        let config = ShadowConfig::default();
        decide(&mut state, &light, 512, 512.0, &mut CacheUpdateQuota::default(), &config);
        state.store_cached_shadow_map(light.id, RenderTargetHandle(7), (512, 512), false);

        light.position.x += 10.0;
        let decision = decide(&mut state, &light, 512, 512.0, &mut CacheUpdateQuota::default(), &config);

        assert_eq!(decision.modes.as_slice(), &[CacheMode::Uncached]);
        assert!(!state.cached_shadow_map(light.id).unwrap().shadow_map.is_valid());

        // The stored projection now matches, so caching resumes
        let decision = decide(&mut state, &light, 512, 512.0, &mut CacheUpdateQuota::default(), &config);
        assert_eq!(decision.modes.len(), 2);
    }

    #[test]
    fn test_disabled_caching_removes_entry() {
        let mut state = SceneShadowCacheState::new();
        let light = spot_light();
        decide(&mut state, &light, 512, 512.0, &mut CacheUpdateQuota::default(), &ShadowConfig::default());

        let config = ShadowConfig {
            cache_whole_scene_shadows: false,
            ..Default::default()
        };
        let decision = decide(&mut state, &light, 512, 512.0, &mut CacheUpdateQuota::default(), &config);

        assert_eq!(decision.modes.as_slice(), &[CacheMode::Uncached]);
        assert!(state.cached_shadow_maps.is_empty());
    }

    #[test]
    fn test_decision_is_idempotent() {
        let mut state = SceneShadowCacheState::new();
        let light = spot_light();
        let config = ShadowConfig::default();

        let first = decide(&mut state, &light, 512, 512.0, &mut CacheUpdateQuota::default(), &config);
        let second = decide(&mut state, &light, 512, 512.0, &mut CacheUpdateQuota::default(), &config);
        assert_eq!(first, second);

        state.store_cached_shadow_map(light.id, RenderTargetHandle(1), (512, 512), false);
        let third = decide(&mut state, &light, 512, 512.0, &mut CacheUpdateQuota::default(), &config);
        let fourth = decide(&mut state, &light, 512, 512.0, &mut CacheUpdateQuota::default(), &config);
        assert_eq!(third, fourth);
    }

    #[test]
    fn test_directional_light_is_never_cached() {
        let mut state = SceneShadowCacheState::new();
        let sun = LightSceneInfo::new(LightId(0), LightShape::Directional { direction: -Vec3::Z }, Vec3::ZERO);
        let decision = state.compute_whole_scene_cache_modes(
            &sun,
            &WholeSceneShadowInitializer::default(),
            (512, 512),
            MAX_RESOLUTION,
            512.0,
            &mut CacheUpdateQuota::default(),
            0.0,
            &ShadowConfig::default(),
        );
        assert_eq!(decision.modes.as_slice(), &[CacheMode::Uncached]);
        assert!(state.cached_shadow_maps.is_empty());
    }

    #[test]
    fn test_cached_size_and_idle_eviction() {
        let mut state = SceneShadowCacheState::new();
        let point = LightSceneInfo::new(LightId(1), LightShape::Point { radius: 300.0 }, Vec3::ZERO)
            .with_shadow_settings(LightShadowSettings::default());
        let spot = spot_light();
        let config = ShadowConfig::default();

        decide(&mut state, &point, 256, 256.0, &mut CacheUpdateQuota::default(), &config);
        decide(&mut state, &spot, 512, 512.0, &mut CacheUpdateQuota::default(), &config);
        state.store_cached_shadow_map(point.id, RenderTargetHandle(1), (256, 256), true);
        state.store_cached_shadow_map(spot.id, RenderTargetHandle(2), (512, 512), false);

        assert_eq!(state.cached_whole_scene_shadow_maps_size(), 256 * 256 * 4 * 6 + 512 * 512 * 4);
        assert!(state.is_under_budget(&config));

        assert_eq!(state.evict_idle(2.5, 2.0), 0);
        assert_eq!(state.evict_idle(3.5, 2.0), 2);
        assert_eq!(state.cached_whole_scene_shadow_maps_size(), 0);
        assert_eq!(state.cached_shadow_maps.len(), 2);

        state.remove_light(point.id);
        assert!(state.cached_shadow_map(point.id).is_none());
    }

    #[test]
    fn test_guard_band_rejects() {
        assert!(guard_band_rejects((512, 512), (256, 256), 480.0, 0.5));
        assert!(!guard_band_rejects((512, 512), (256, 256), 300.0, 0.5));
        assert!(!guard_band_rejects((512, 512), (1024, 1024), 1000.0, 0.5));
        // Desired above the existing size: the platform limit dropped
        assert!(!guard_band_rejects((512, 512), (256, 256), 600.0, 0.5));
    }
}
