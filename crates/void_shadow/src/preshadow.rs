//! Preshadow cache
//!
//! Preshadows are per-object shadows cast by statically lit geometry onto
//! a dynamic subject. Their casters rarely change, so rendered preshadows
//! are kept in a shared texture and reused while the subject stays inside
//! the cached bounds.

use glam::Vec3;
use void_math::BoxSphereBounds;

use crate::cache::SceneShadowCacheState;
use crate::config::ShadowConfig;
use crate::layout::TextureLayout;
use crate::light::{LightId, LightSceneInfo};
use crate::scene::{PrimitiveId, PrimitiveSceneInfo};
use crate::shadow::ProjectedShadowInfo;

/// Extra distance a subject must stay inside the cascade fade range before
/// its preshadow is left to the whole-scene shadow
pub const WHOLE_SCENE_FADE_MARGIN: f32 = 200.0;

/// Find a cached preshadow of `parent` from `light` that covers
/// `query_bounds` at exactly `resolution_x`.
///
/// The returned copy has its per-frame lists cleared and its depths marked
/// as cached, so it needs no gather and no render.
pub fn get_cached_preshadow(
    state: &SceneShadowCacheState,
    parent: PrimitiveId,
    light: LightId,
    query_bounds: &BoxSphereBounds,
    resolution_x: u32,
    config: &ShadowConfig,
) -> Option<ProjectedShadowInfo> {
    if !config.cache_preshadows {
        return None;
    }

    let query = query_bounds.sphere();
    let cached = state.cached_preshadows.iter().find(|cached| {
        cached.parent_primitive == Some(parent)
            && cached.light == light
            && query.is_inside(&cached.shadow_bounds, config.preshadow_bounds_tolerance)
            && cached.resolution_x == resolution_x
            && cached.allocated
    })?;

    let mut shadow = cached.clone();
    shadow.clear_transient_arrays();
    shadow.depths_cached = true;
    Some(shadow)
}

/// Bring the preshadow cache in line with the preshadows requested this
/// frame.
///
/// Cached preshadows nobody requested leave the layout. Requested ones not
/// cached yet are packed largest first; those that fit are flagged as
/// living in the cache texture and a copy is kept for later frames.
pub fn update_preshadow_cache(state: &mut SceneShadowCacheState, shadows: &mut [ProjectedShadowInfo], config: &ShadowConfig) {
    if !config.cache_preshadows {
        return;
    }

    if !state.preshadow_layout.is_initialized() {
        let size = config.preshadow_cache_resolution;
        state.preshadow_layout = TextureLayout::new(1, 1, size, size, false);
    }

    let requested: Vec<u64> = shadows
        .iter()
        .filter(|shadow| shadow.pre_shadow)
        .filter_map(|shadow| shadow.preshadow_cache_key)
        .collect();

    let layout = &mut state.preshadow_layout;
    state.cached_preshadows.retain(|cached| {
        let key = cached.preshadow_cache_key;
        if key.is_some_and(|key| requested.contains(&key)) {
            return true;
        }
        let (x, y, w, h) = cached.shadow_atlas_rect();
        if !layout.remove_element(x, y, w, h) {
            log::warn!("Evicted preshadow {key:?} was not in the preshadow layout at ({x}, {y}) {w}x{h}");
        }
        false
    });

    let mut uncached: Vec<&mut ProjectedShadowInfo> = shadows
        .iter_mut()
        .filter(|shadow| shadow.pre_shadow && !shadow.allocated_in_preshadow_cache)
        .collect();
    uncached.sort_by_key(|shadow| std::cmp::Reverse(shadow.resolution_x as u64 * shadow.resolution_y as u64));

    for shadow in uncached {
        let (width, height) = shadow.padded_size();
        let Some((x, y)) = state.preshadow_layout.add_element(width, height) else {
            log::debug!("Preshadow cache full, {width}x{height} preshadow renders uncached");
            continue;
        };

        shadow.x = x;
        shadow.y = y;
        shadow.allocated_in_preshadow_cache = true;
        shadow.allocated = true;
        shadow.preshadow_cache_key = Some(state.next_preshadow_key);
        state.next_preshadow_key += 1;

        let mut cached = shadow.clone();
        cached.clear_transient_arrays();
        cached.depths_cached = true;
        state.cached_preshadows.push(cached);
    }
}

/// Whether a per-object shadow of `primitive` should come with a preshadow
pub fn should_create_preshadow(
    light: &LightSceneInfo,
    primitive: &PrimitiveSceneInfo,
    subject_visible: bool,
    config: &ShadowConfig,
) -> bool {
    config.enable_preshadows
        && light.has_static_shadowing()
        && subject_visible
        && (!primitive.flags.static_lighting || !primitive.flags.static_lit_shadow_mapped)
}

/// Whether `bounds` sits well inside a cascade of a directional light, where
/// the cascade already provides the static shadowing a preshadow would.
pub fn is_inside_whole_scene_shadow(
    whole_scene: &ProjectedShadowInfo,
    view_origin: Vec3,
    fade_start: f32,
    bounds: &BoxSphereBounds,
) -> bool {
    let radius = bounds.sphere_radius;
    let distance_from_center_sq = whole_scene.shadow_bounds.center.distance_squared(bounds.origin);
    let distance_from_view_sq = view_origin.distance_squared(bounds.origin);

    let inner_radius = (whole_scene.shadow_bounds.radius - radius).max(0.0);
    let inner_fade = (fade_start - WHOLE_SCENE_FADE_MARGIN - radius).max(0.0);

    distance_from_center_sq < inner_radius * inner_radius && distance_from_view_sq < inner_fade * inner_fade
}
