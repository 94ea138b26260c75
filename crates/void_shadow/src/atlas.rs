//! Shadow Atlas Allocation
//!
//! Packs the frame's visible shadow maps into shared depth targets. Each
//! shadow category has its own atlases:
//!
//! - cascades of one directional light share a layout at the maximum
//!   texture size, in split order
//! - per-object and uncached spot shadows pack into atlases of the shadow
//!   buffer size, largest first
//! - translucent shadows pack the same way into their own atlases
//! - one-pass point shadows and cached static spot layers get dedicated
//!   targets
//! - reflective shadow maps share one layout without borders
//! - on mobile, cascades and spot shadows share one combined atlas
//!
//! The allocator only decides placements and requests targets through a
//! [`RenderTargetProvider`]. A shadow that does not fit an empty atlas
//! means upstream sizing failed; it panics in debug builds and aborts the
//! frame with [`ShadowError::AtlasOverflow`] otherwise.

use std::cmp::Reverse;

use crate::cache::SceneShadowCacheState;
use crate::config::{FeatureLevel, ShadowConfig};
use crate::error::{Result, ShadowError};
use crate::layout::TextureLayout;
use crate::light::LightId;
use crate::render_target::{DepthFormat, RenderTargetDesc, RenderTargetProvider};
use crate::shadow::{CacheMode, ProjectedShadowInfo, RenderTargetHandle, ShadowId};

/// What an atlas holds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AtlasCategory {
    Cascades,
    PerObject,
    Translucency,
    PointCube,
    ReflectiveShadowMap,
    PreshadowCache,
    /// Persistent static layer of a cached spot light
    CachedWholeScene,
    /// Mobile cascades and spot shadows
    MobileCombined,
}

/// A depth target and the shadows rendered into it
#[derive(Clone, Debug, PartialEq)]
pub struct ShadowMapAtlas {
    pub category: AtlasCategory,
    pub target: RenderTargetHandle,
    pub desc: RenderTargetDesc,
    pub shadows: Vec<ShadowId>,
}

impl ShadowMapAtlas {
    #[inline]
    pub fn size(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    #[inline]
    pub fn memory_size(&self) -> u64 {
        self.desc.memory_size()
    }
}

/// The frame's shadow targets, grouped by depth pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SortedShadowMaps {
    pub shadow_map_atlases: Vec<ShadowMapAtlas>,
    pub shadow_map_cubemaps: Vec<ShadowMapAtlas>,
    pub preshadow_cache: Option<ShadowMapAtlas>,
    pub translucency_shadow_map_atlases: Vec<ShadowMapAtlas>,
    pub reflective_shadow_map_atlases: Vec<ShadowMapAtlas>,
    /// Dedicated targets persisted by the whole-scene cache
    pub complete_shadow_map_atlases: Vec<ShadowMapAtlas>,
}

impl SortedShadowMaps {
    /// Every atlas, in depth pass order
    pub fn iter(&self) -> impl Iterator<Item = &ShadowMapAtlas> {
        self.shadow_map_atlases
            .iter()
            .chain(&self.shadow_map_cubemaps)
            .chain(&self.preshadow_cache)
            .chain(&self.translucency_shadow_map_atlases)
            .chain(&self.reflective_shadow_map_atlases)
            .chain(&self.complete_shadow_map_atlases)
    }

    pub fn atlas_count(&self) -> usize {
        self.iter().count()
    }

    /// Bytes of every target in use this frame
    pub fn memory_size(&self) -> u64 {
        self.iter().map(ShadowMapAtlas::memory_size).sum()
    }

    /// The atlas `shadow` is rendered into
    pub fn atlas_of(&self, shadow: ShadowId) -> Option<&ShadowMapAtlas> {
        self.iter().find(|atlas| atlas.shadows.contains(&shadow))
    }
}

/// Visible shadows split by how they are allocated
#[derive(Debug, Default)]
struct ShadowBins {
    /// Per light, in first-seen order
    cascades: Vec<(LightId, Vec<ShadowId>)>,
    per_object: Vec<ShadowId>,
    cached_spot: Vec<ShadowId>,
    translucent: Vec<ShadowId>,
    cached_preshadows: Vec<ShadowId>,
    reflective: Vec<ShadowId>,
    cubes: Vec<ShadowId>,
    mobile_spots: Vec<ShadowId>,
}

impl ShadowBins {
    fn add_cascade(&mut self, light: LightId, id: ShadowId) {
        match self.cascades.iter_mut().find(|(owner, _)| *owner == light) {
            Some((_, cascades)) => cascades.push(id),
            None => self.cascades.push((light, vec![id])),
        }
    }
}

/// A layout and the shadows placed in it
struct LayoutAndAssignedShadows {
    layout: TextureLayout,
    shadows: Vec<ShadowId>,
}

impl LayoutAndAssignedShadows {
    fn new(size: u32) -> Self {
        Self {
            layout: TextureLayout::new(1, 1, size, size, false),
            shadows: Vec::new(),
        }
    }
}

/// Assign every visible shadow an atlas placement and a target.
///
/// `visible` lists the shadows to render this frame, grouped by light.
/// Shadows left out keep `allocated == false`.
pub fn allocate_shadow_depth_targets(
    shadows: &mut [ProjectedShadowInfo],
    visible: &[ShadowId],
    cache_state: &mut SceneShadowCacheState,
    provider: &dyn RenderTargetProvider,
    config: &ShadowConfig,
) -> Result<SortedShadowMaps> {
    let mobile = config.feature_level == FeatureLevel::Mobile;
    let mut bins = sort_visible_shadows(shadows, visible, cache_state, mobile);
    let mut sorted = SortedShadowMaps::default();

    // Cascade blending relies on split order
    for (_, cascades) in &mut bins.cascades {
        cascades.sort_by_key(|id| shadows[id.index()].split_index());
    }

    if mobile {
        allocate_mobile_csm_and_spot(shadows, &mut bins, provider, config, &mut sorted)?;
    } else {
        for (_, cascades) in &bins.cascades {
            allocate_csm(shadows, cascades, provider, config, &mut sorted)?;
        }
    }

    allocate_cached_preshadows(shadows, &bins.cached_preshadows, cache_state, provider, config, &mut sorted);

    if mobile {
        let skipped = bins.cubes.len() + bins.reflective.len() + bins.translucent.len();
        if skipped > 0 {
            log::debug!("Mobile feature level skips {skipped} cube, reflective and translucent shadows");
        }
    } else {
        allocate_cubes(shadows, &bins.cubes, cache_state, provider, &mut sorted);
        allocate_reflective(shadows, &bins.reflective, provider, config, &mut sorted)?;
    }

    allocate_cached_spot(shadows, &bins.cached_spot, cache_state, provider, &mut sorted);
    allocate_per_object(shadows, &mut bins.per_object, cache_state, provider, config, &mut sorted)?;

    if !mobile {
        allocate_translucent(shadows, &mut bins.translucent, provider, config, &mut sorted)?;
    }

    log::debug!(
        "Allocated {} shadow targets ({} bytes)",
        sorted.atlas_count(),
        sorted.memory_size()
    );
    Ok(sorted)
}

fn sort_visible_shadows(
    shadows: &[ProjectedShadowInfo],
    visible: &[ShadowId],
    cache_state: &SceneShadowCacheState,
    mobile: bool,
) -> ShadowBins {
    let mut bins = ShadowBins::default();

    for &id in visible {
        let shadow = &shadows[id.index()];

        if shadow.cache_mode == CacheMode::MovablePrimitivesOnly && !shadow.has_subject_prims() {
            let static_layer_has_primitives = cache_state
                .cached_shadow_map(shadow.light)
                .is_some_and(|data| data.cached_shadow_map_has_primitives);
            // Nothing to composite and nothing cached to project from
            if !static_layer_has_primitives {
                log::debug!("Skipping empty movable shadow layer of {:?}", shadow.light);
                continue;
            }
        }

        if shadow.reflective_shadow_map {
            bins.reflective.push(id);
        } else if shadow.pre_shadow && shadow.allocated_in_preshadow_cache {
            bins.cached_preshadows.push(id);
        } else if shadow.directional_light && shadow.whole_scene_shadow {
            bins.add_cascade(shadow.light, id);
        } else if shadow.one_pass_point_light_shadow {
            bins.cubes.push(id);
        } else if shadow.translucent_shadow {
            bins.translucent.push(id);
        } else if shadow.cache_mode == CacheMode::StaticPrimitivesOnly {
            bins.cached_spot.push(id);
        } else if mobile && shadow.whole_scene_shadow {
            bins.mobile_spots.push(id);
        } else {
            bins.per_object.push(id);
        }
    }
    bins
}

fn atlas_overflow(width: u32, height: u32, atlas_size: u32) -> ShadowError {
    log::error!("Shadow of {width}x{height} does not fit an empty {atlas_size}x{atlas_size} atlas");
    if cfg!(debug_assertions) {
        panic!("shadow atlas overflow: {width}x{height} in {atlas_size}x{atlas_size}");
    }
    ShadowError::AtlasOverflow {
        width,
        height,
        atlas_size,
    }
}

/// Largest first, stable among equal areas
fn sort_by_resolution(shadows: &[ProjectedShadowInfo], ids: &mut [ShadowId]) {
    ids.sort_by_key(|id| {
        let shadow = &shadows[id.index()];
        Reverse(shadow.resolution_x as u64 * shadow.resolution_y as u64)
    });
}

/// Place `id` in the last layout, opening a fresh one when it is full
fn pack_into_layouts(
    layouts: &mut Vec<LayoutAndAssignedShadows>,
    shadow: &mut ProjectedShadowInfo,
    id: ShadowId,
    (width, height): (u32, u32),
    atlas_size: u32,
) -> Result<()> {
    debug_assert!(!shadow.allocated);

    let placed = layouts
        .last_mut()
        .and_then(|current| current.layout.add_element(width, height));
    let (x, y) = match placed {
        Some(position) => position,
        None => {
            let mut fresh = LayoutAndAssignedShadows::new(atlas_size);
            let position = fresh
                .layout
                .add_element(width, height)
                .ok_or_else(|| atlas_overflow(width, height, atlas_size))?;
            layouts.push(fresh);
            position
        }
    };

    shadow.x = x;
    shadow.y = y;
    shadow.allocated = true;
    if let Some(current) = layouts.last_mut() {
        current.shadows.push(id);
    }
    Ok(())
}

/// Request a target per non-empty layout and point its shadows at it
fn finish_layouts(
    shadows: &mut [ProjectedShadowInfo],
    layouts: Vec<LayoutAndAssignedShadows>,
    category: AtlasCategory,
    provider: &dyn RenderTargetProvider,
    desc_for: impl Fn(&TextureLayout) -> RenderTargetDesc,
    name_for: impl Fn(usize) -> String,
) -> Vec<ShadowMapAtlas> {
    layouts
        .into_iter()
        .filter(|layout| !layout.shadows.is_empty())
        .enumerate()
        .map(|(index, layout)| {
            let desc = desc_for(&layout.layout);
            let target = provider.allocate(&desc, &name_for(index));
            for id in &layout.shadows {
                shadows[id.index()].render_target = Some(target);
            }
            ShadowMapAtlas {
                category,
                target,
                desc,
                shadows: layout.shadows,
            }
        })
        .collect()
}

fn used_extent(layout: &TextureLayout) -> RenderTargetDesc {
    RenderTargetDesc::depth(layout.size_x(), layout.size_y())
}

fn csm_target_name(index: usize) -> String {
    if index == 0 {
        "WholeSceneShadowmap".to_owned()
    } else {
        format!("WholeSceneShadowmap{index}")
    }
}

/// Pack the cascades of one light, sharing one layout unless atlasing
/// cascades is disabled
fn allocate_csm(
    shadows: &mut [ProjectedShadowInfo],
    cascades: &[ShadowId],
    provider: &dyn RenderTargetProvider,
    config: &ShadowConfig,
    sorted: &mut SortedShadowMaps,
) -> Result<()> {
    let max_texture_size = config.max_texture_size();
    let mut layouts = vec![LayoutAndAssignedShadows::new(max_texture_size)];

    for (index, &id) in cascades.iter().enumerate() {
        if !config.allow_atlasing_cascades && index > 0 {
            layouts.push(LayoutAndAssignedShadows::new(max_texture_size));
        }
        let shadow = &mut shadows[id.index()];
        let padded = shadow.padded_size();
        pack_into_layouts(&mut layouts, shadow, id, padded, max_texture_size)?;
    }

    let first = sorted.shadow_map_atlases.len();
    let atlases = finish_layouts(shadows, layouts, AtlasCategory::Cascades, provider, used_extent, |index| {
        csm_target_name(first + index)
    });
    sorted.shadow_map_atlases.extend(atlases);
    Ok(())
}

/// One shared layout for every cascade and up to `mobile_max_spot_shadows`
/// spot shadows. Spot shadows that no longer fit are dropped.
fn allocate_mobile_csm_and_spot(
    shadows: &mut [ProjectedShadowInfo],
    bins: &mut ShadowBins,
    provider: &dyn RenderTargetProvider,
    config: &ShadowConfig,
    sorted: &mut SortedShadowMaps,
) -> Result<()> {
    sort_by_resolution(shadows, &mut bins.mobile_spots);
    let spot_limit = config.mobile_max_spot_shadows as usize;
    if bins.mobile_spots.len() > spot_limit {
        log::debug!(
            "Dropping {} spot shadows over the mobile limit of {spot_limit}",
            bins.mobile_spots.len() - spot_limit
        );
        bins.mobile_spots.truncate(spot_limit);
    }

    let max_texture_size = config.max_texture_size();
    let mut combined = LayoutAndAssignedShadows::new(max_texture_size);

    let cascades = bins.cascades.iter().flat_map(|(_, cascades)| cascades.iter().copied());
    for id in cascades {
        let shadow = &mut shadows[id.index()];
        let (width, height) = shadow.padded_size();
        let (x, y) = combined
            .layout
            .add_element(width, height)
            .ok_or_else(|| atlas_overflow(width, height, max_texture_size))?;
        place(shadow, x, y);
        combined.shadows.push(id);
    }
    for &id in &bins.mobile_spots {
        let shadow = &mut shadows[id.index()];
        let (width, height) = shadow.padded_size();
        match combined.layout.add_element(width, height) {
            Some((x, y)) => {
                place(shadow, x, y);
                combined.shadows.push(id);
            }
            None => log::debug!("Spot shadow {width}x{height} does not fit the mobile shadow atlas"),
        }
    }

    let round_up = config.mobile_round_up_atlas_pow2;
    let atlases = finish_layouts(
        shadows,
        vec![combined],
        AtlasCategory::MobileCombined,
        provider,
        |layout| {
            let (mut width, mut height) = (layout.size_x(), layout.size_y());
            if round_up {
                width = width.next_power_of_two();
                height = height.next_power_of_two();
            }
            RenderTargetDesc::depth(width, height)
        },
        |_| "MobileCSMAndSpotLightShadowmap".to_owned(),
    );
    sorted.shadow_map_atlases.extend(atlases);
    Ok(())
}

fn place(shadow: &mut ProjectedShadowInfo, x: u32, y: u32) {
    shadow.x = x;
    shadow.y = y;
    shadow.allocated = true;
}

/// Cached preshadows keep their cache placement and render into the
/// persistent cache target
fn allocate_cached_preshadows(
    shadows: &mut [ProjectedShadowInfo],
    preshadows: &[ShadowId],
    cache_state: &mut SceneShadowCacheState,
    provider: &dyn RenderTargetProvider,
    config: &ShadowConfig,
    sorted: &mut SortedShadowMaps,
) {
    if preshadows.is_empty() {
        return;
    }

    let size = config.preshadow_cache_resolution;
    let desc = RenderTargetDesc::depth(size, size);
    let target = *cache_state
        .preshadow_cache_target
        .get_or_insert_with(|| provider.allocate(&desc, "PreShadowCacheDepthZ"));

    for id in preshadows {
        shadows[id.index()].render_target = Some(target);
    }
    sorted.preshadow_cache = Some(ShadowMapAtlas {
        category: AtlasCategory::PreshadowCache,
        target,
        desc,
        shadows: preshadows.to_vec(),
    });
}

/// Point the shadow at its light's cached static layer when it has no
/// movable casters of its own
fn reuse_cached_static_layer(shadow: &mut ProjectedShadowInfo, cache_state: &SceneShadowCacheState) -> bool {
    if shadow.cache_mode != CacheMode::MovablePrimitivesOnly || shadow.has_subject_prims() {
        return false;
    }
    let Some(target) = cache_state
        .cached_shadow_map(shadow.light)
        .and_then(|data| data.shadow_map.target)
    else {
        log::warn!("Movable shadow layer of {:?} has no cached static layer", shadow.light);
        return false;
    };
    place(shadow, 0, 0);
    shadow.render_target = Some(target);
    true
}

fn allocate_cubes(
    shadows: &mut [ProjectedShadowInfo],
    cubes: &[ShadowId],
    cache_state: &mut SceneShadowCacheState,
    provider: &dyn RenderTargetProvider,
    sorted: &mut SortedShadowMaps,
) {
    for &id in cubes {
        let shadow = &mut shadows[id.index()];
        debug_assert_eq!(shadow.border_size, 0);
        if reuse_cached_static_layer(shadow, cache_state) {
            continue;
        }

        let desc = RenderTargetDesc::cube(shadow.resolution_x);
        let target = provider.allocate(&desc, "CubeShadowDepthZ");
        if shadow.cache_mode == CacheMode::StaticPrimitivesOnly {
            let size = (shadow.resolution_x, shadow.resolution_x);
            cache_state.store_cached_shadow_map(shadow.light, target, size, true);
        }

        place(shadow, 0, 0);
        shadow.render_target = Some(target);
        sorted.shadow_map_cubemaps.push(ShadowMapAtlas {
            category: AtlasCategory::PointCube,
            target,
            desc,
            shadows: vec![id],
        });
    }
}

fn allocate_reflective(
    shadows: &mut [ProjectedShadowInfo],
    reflective: &[ShadowId],
    provider: &dyn RenderTargetProvider,
    config: &ShadowConfig,
    sorted: &mut SortedShadowMaps,
) -> Result<()> {
    if reflective.is_empty() {
        return Ok(());
    }

    let max_texture_size = config.max_texture_size();
    let mut layouts = vec![LayoutAndAssignedShadows::new(max_texture_size)];
    for &id in reflective {
        let shadow = &mut shadows[id.index()];
        debug_assert_eq!(shadow.border_size, 0);
        let size = (shadow.resolution_x, shadow.resolution_y);
        pack_into_layouts(&mut layouts, shadow, id, size, max_texture_size)?;
    }

    let atlases = finish_layouts(
        shadows,
        layouts,
        AtlasCategory::ReflectiveShadowMap,
        provider,
        |layout| used_extent(layout).with_format(DepthFormat::ReflectiveShadowMap),
        |_| "RSMDepth".to_owned(),
    );
    sorted.reflective_shadow_map_atlases.extend(atlases);
    Ok(())
}

/// Static layers of cached spot lights persist, so each gets a dedicated
/// target remembered by the cache
fn allocate_cached_spot(
    shadows: &mut [ProjectedShadowInfo],
    cached: &[ShadowId],
    cache_state: &mut SceneShadowCacheState,
    provider: &dyn RenderTargetProvider,
    sorted: &mut SortedShadowMaps,
) {
    for &id in cached {
        let shadow = &mut shadows[id.index()];
        let (width, height) = shadow.padded_size();
        let desc = RenderTargetDesc::depth(width, height);
        let target = provider.allocate(&desc, "CachedShadowDepthMap");
        cache_state.store_cached_shadow_map(shadow.light, target, (width, height), false);

        place(shadow, 0, 0);
        shadow.render_target = Some(target);
        sorted.complete_shadow_map_atlases.push(ShadowMapAtlas {
            category: AtlasCategory::CachedWholeScene,
            target,
            desc,
            shadows: vec![id],
        });
    }
}

fn allocate_per_object(
    shadows: &mut [ProjectedShadowInfo],
    per_object: &mut [ShadowId],
    cache_state: &SceneShadowCacheState,
    provider: &dyn RenderTargetProvider,
    config: &ShadowConfig,
    sorted: &mut SortedShadowMaps,
) -> Result<()> {
    sort_by_resolution(shadows, per_object);
    let buffer_size = config.shadow_buffer_size;
    let mut layouts = Vec::new();

    for &id in per_object.iter() {
        let shadow = &mut shadows[id.index()];
        debug_assert_ne!(shadow.border_size, 0);
        if reuse_cached_static_layer(shadow, cache_state) {
            continue;
        }
        let padded = shadow.padded_size();
        pack_into_layouts(&mut layouts, shadow, id, padded, buffer_size)?;
    }

    let atlases = finish_layouts(
        shadows,
        layouts,
        AtlasCategory::PerObject,
        provider,
        |_| RenderTargetDesc::depth(buffer_size, buffer_size),
        |_| "ShadowDepthAtlas".to_owned(),
    );
    sorted.shadow_map_atlases.extend(atlases);
    Ok(())
}

fn allocate_translucent(
    shadows: &mut [ProjectedShadowInfo],
    translucent: &mut [ShadowId],
    provider: &dyn RenderTargetProvider,
    config: &ShadowConfig,
    sorted: &mut SortedShadowMaps,
) -> Result<()> {
    sort_by_resolution(shadows, translucent);
    let buffer_size = config.translucent_shadow_buffer_size;
    let mut layouts = Vec::new();

    for &id in translucent.iter() {
        let shadow = &mut shadows[id.index()];
        let padded = shadow.padded_size();
        pack_into_layouts(&mut layouts, shadow, id, padded, buffer_size)?;
    }

    let atlases = finish_layouts(
        shadows,
        layouts,
        AtlasCategory::Translucency,
        provider,
        |_| RenderTargetDesc::depth(buffer_size, buffer_size).with_format(DepthFormat::TranslucencyVolume),
        |_| "TranslucencyShadowTransmission".to_owned(),
    );
    sorted.translucency_shadow_map_atlases.extend(atlases);
    Ok(())
}
