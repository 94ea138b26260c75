//! Shadow Configuration
//!
//! Global shadow scheduling settings with serde support for hot-reload.
//! Every tunable the scheduler reads lives here so that tests can run
//! against an isolated configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShadowError};

/// Rendering feature level, selects the atlas packing strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureLevel {
    /// Separate atlases per shadow category
    #[default]
    Desktop,
    /// Cascades and spot lights share one combined atlas
    Mobile,
}

/// Global shadow configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Enable dynamic shadows globally
    pub enabled: bool,

    /// Atlas packing strategy
    pub feature_level: FeatureLevel,

    // --- Resolution ---
    /// Largest shadow map dimension, before border padding
    pub max_shadow_resolution: u32,
    /// Largest shadow map height, before border padding
    pub max_shadow_resolution_y: u32,
    /// Resolution below which a shadow is faded out entirely
    pub min_shadow_resolution: u32,
    /// Resolution at which fading starts
    pub shadow_fade_resolution: u32,
    /// Preshadow equivalents of the two thresholds above
    pub min_preshadow_resolution: u32,
    pub preshadow_fade_resolution: u32,
    /// Preshadow resolution relative to the per-object shadow
    pub preshadow_resolution_factor: f32,
    /// Fraction by which preshadow bounds are grown so they can be reused
    pub preshadow_expand_fraction: f32,
    /// Side of a shadow depth buffer
    pub shadow_buffer_size: u32,
    /// Side of a translucency shadow buffer
    pub translucent_shadow_buffer_size: u32,
    /// Divider applied to translucent per-object shadow resolution
    pub translucency_downsample_factor: u32,
    /// Cube map sizes available for one-pass point shadows, ascending
    pub cube_resolutions: Vec<u32>,
    /// Largest cube face size
    pub max_cube_resolution: u32,

    // --- Screen coverage to texels ---
    pub texels_per_pixel_directional: f32,
    pub texels_per_pixel_point: f32,
    pub texels_per_pixel_spot: f32,
    pub texels_per_pixel_rect: f32,
    /// Exponent of the fade-out curve
    pub shadow_fade_exponent: f32,

    // --- Whole-scene caching ---
    pub cache_whole_scene_shadows: bool,
    pub cached_shadows_cast_from_movable_primitives: bool,
    /// Memory budget for all persistent whole-scene maps
    pub whole_scene_shadow_cache_budget_mb: f32,
    /// Cache refreshes allowed per frame, -1 for unlimited
    pub max_cache_updates_per_frame_point: i32,
    pub max_cache_updates_per_frame_spot: i32,
    /// Seconds a cached map may go unused before its memory is released
    pub cache_idle_eviction_seconds: f64,
    /// Fraction of the shrink a new resolution must reach before a cached
    /// map is reallocated
    pub cache_resize_guard_band: f32,

    // --- Preshadow cache ---
    pub cache_preshadows: bool,
    pub preshadow_cache_resolution: u32,
    /// Fraction of the cached radius by which reused bounds may poke out
    pub preshadow_bounds_tolerance: f32,

    // --- Culling ---
    pub min_screen_radius_for_shadow_caster: f32,
    pub min_screen_radius_for_rsm_caster: f32,
    /// Radius around the view covered by a reflective shadow map
    pub reflective_shadow_map_radius: f32,
    /// Largest filter downsample applied when sampling, sets the snap grid
    pub max_kernel_downsample: u32,
    /// Texels of padding around each packed shadow map
    pub shadow_border: u32,
    /// Size per-object projections symmetrically around the light axis
    pub conservative_shadow_bounds: bool,

    // --- Cascades ---
    pub allow_atlasing_cascades: bool,
    pub max_cascades: u32,
    /// Split scheme blend (0 = linear, 1 = logarithmic)
    pub cascade_distribution_lambda: f32,
    /// View distance covered by cascades
    pub whole_scene_shadow_distance: f32,

    // --- Gather ---
    pub parallel_gather: bool,
    pub primitives_per_packet: usize,
    pub use_spatial_index: bool,

    // --- Per-object shadows ---
    pub enable_per_object_shadows: bool,
    pub enable_translucent_per_object_shadows: bool,
    pub enable_preshadows: bool,

    // --- Mobile / platform ---
    pub mobile_max_spot_shadows: u32,
    pub mobile_round_up_atlas_pow2: bool,
    /// Mip count of the largest supported texture
    pub max_texture_mip_count: u32,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            feature_level: FeatureLevel::Desktop,
            max_shadow_resolution: 2048,
            max_shadow_resolution_y: 2048,
            min_shadow_resolution: 32,
            shadow_fade_resolution: 64,
            min_preshadow_resolution: 8,
            preshadow_fade_resolution: 16,
            preshadow_resolution_factor: 0.5,
            preshadow_expand_fraction: 0.15,
            shadow_buffer_size: 2048,
            translucent_shadow_buffer_size: 1024,
            translucency_downsample_factor: 2,
            cube_resolutions: vec![32, 64, 128, 256, 512, 1024, 2048],
            max_cube_resolution: 512,
            texels_per_pixel_directional: 1.27324,
            texels_per_pixel_point: 1.27324,
            texels_per_pixel_spot: 2.0 * 1.27324,
            texels_per_pixel_rect: 1.27324,
            shadow_fade_exponent: 0.25,
            cache_whole_scene_shadows: true,
            cached_shadows_cast_from_movable_primitives: true,
            whole_scene_shadow_cache_budget_mb: 150.0,
            max_cache_updates_per_frame_point: -1,
            max_cache_updates_per_frame_spot: -1,
            cache_idle_eviction_seconds: 2.0,
            cache_resize_guard_band: 0.5,
            cache_preshadows: true,
            preshadow_cache_resolution: 1024,
            preshadow_bounds_tolerance: 0.04,
            min_screen_radius_for_shadow_caster: 0.01,
            min_screen_radius_for_rsm_caster: 0.06,
            reflective_shadow_map_radius: 5000.0,
            max_kernel_downsample: 4,
            shadow_border: 4,
            conservative_shadow_bounds: false,
            allow_atlasing_cascades: true,
            max_cascades: 4,
            cascade_distribution_lambda: 0.8,
            whole_scene_shadow_distance: 20000.0,
            parallel_gather: true,
            primitives_per_packet: 256,
            use_spatial_index: true,
            enable_per_object_shadows: true,
            enable_translucent_per_object_shadows: true,
            enable_preshadows: true,
            mobile_max_spot_shadows: 4,
            mobile_round_up_atlas_pow2: false,
            max_texture_mip_count: 14,
        }
    }
}

impl ShadowConfig {
    /// Create a high-quality shadow configuration
    pub fn high_quality() -> Self {
        Self {
            max_shadow_resolution: 4096,
            max_shadow_resolution_y: 4096,
            shadow_buffer_size: 4096,
            max_cube_resolution: 1024,
            whole_scene_shadow_cache_budget_mb: 300.0,
            cascade_distribution_lambda: 0.9,
            ..Default::default()
        }
    }

    /// Create a low-quality shadow configuration for performance
    pub fn low_quality() -> Self {
        Self {
            max_shadow_resolution: 1024,
            max_shadow_resolution_y: 1024,
            shadow_buffer_size: 1024,
            max_cube_resolution: 256,
            max_cascades: 2,
            whole_scene_shadow_cache_budget_mb: 50.0,
            enable_translucent_per_object_shadows: false,
            ..Default::default()
        }
    }

    /// Configuration for constrained devices using the combined atlas
    pub fn mobile() -> Self {
        Self {
            feature_level: FeatureLevel::Mobile,
            max_shadow_resolution: 1024,
            max_shadow_resolution_y: 1024,
            shadow_buffer_size: 1024,
            max_cascades: 2,
            cache_whole_scene_shadows: false,
            enable_translucent_per_object_shadows: false,
            mobile_round_up_atlas_pow2: true,
            max_texture_mip_count: 12,
            ..Default::default()
        }
    }

    /// Create a configuration with shadows disabled
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Largest texture side the platform supports
    #[inline]
    pub fn max_texture_size(&self) -> u32 {
        1 << self.max_texture_mip_count.saturating_sub(1).min(31)
    }

    /// Memory budget of the whole-scene cache in bytes
    #[inline]
    pub fn cache_budget_bytes(&self) -> u64 {
        (self.whole_scene_shadow_cache_budget_mb.max(0.0) as f64 * 1024.0 * 1024.0) as u64
    }

    /// Validate configuration and clamp values to valid ranges
    pub fn validate(&mut self) {
        self.max_texture_mip_count = self.max_texture_mip_count.clamp(1, 15);
        let max_texture = self.max_texture_size();
        self.shadow_buffer_size = self.shadow_buffer_size.clamp(64, max_texture);
        self.translucent_shadow_buffer_size = self.translucent_shadow_buffer_size.clamp(64, max_texture);
        self.max_shadow_resolution = self.max_shadow_resolution.clamp(16, max_texture);
        self.max_shadow_resolution_y = self.max_shadow_resolution_y.clamp(16, max_texture);
        self.min_shadow_resolution = self.min_shadow_resolution.min(self.max_shadow_resolution);
        self.shadow_fade_resolution = self.shadow_fade_resolution.max(self.min_shadow_resolution);
        self.preshadow_fade_resolution = self.preshadow_fade_resolution.max(self.min_preshadow_resolution);
        self.preshadow_resolution_factor = self.preshadow_resolution_factor.clamp(0.01, 1.0);
        self.preshadow_expand_fraction = self.preshadow_expand_fraction.max(0.0);
        self.translucency_downsample_factor = self.translucency_downsample_factor.max(1);
        self.cube_resolutions.retain(|&size| size > 0);
        self.cube_resolutions.sort_unstable();
        self.cube_resolutions.dedup();
        self.max_cube_resolution = self.max_cube_resolution.clamp(1, max_texture);
        self.shadow_fade_exponent = self.shadow_fade_exponent.max(0.01);
        self.whole_scene_shadow_cache_budget_mb = self.whole_scene_shadow_cache_budget_mb.max(0.0);
        self.max_cache_updates_per_frame_point = self.max_cache_updates_per_frame_point.max(-1);
        self.max_cache_updates_per_frame_spot = self.max_cache_updates_per_frame_spot.max(-1);
        self.cache_idle_eviction_seconds = self.cache_idle_eviction_seconds.max(0.0);
        self.cache_resize_guard_band = self.cache_resize_guard_band.clamp(0.0, 1.0);
        self.preshadow_cache_resolution = self.preshadow_cache_resolution.clamp(64, max_texture);
        self.preshadow_bounds_tolerance = self.preshadow_bounds_tolerance.clamp(0.0, 1.0);
        self.reflective_shadow_map_radius = self.reflective_shadow_map_radius.max(1.0);
        self.max_kernel_downsample = self.max_kernel_downsample.max(1);
        self.max_cascades = self.max_cascades.clamp(1, crate::cascade::MAX_CASCADES as u32);
        self.cascade_distribution_lambda = self.cascade_distribution_lambda.clamp(0.0, 1.0);
        self.whole_scene_shadow_distance = self.whole_scene_shadow_distance.max(1.0);
        self.primitives_per_packet = self.primitives_per_packet.max(1);
    }

    /// Validate, then reject what clamping cannot repair
    pub fn try_validated(mut self) -> Result<Self> {
        if self.cube_resolutions.iter().all(|&size| size == 0) {
            return Err(ShadowError::InvalidConfig(
                "cube_resolutions must contain a positive size".into(),
            ));
        }
        if !self.texels_per_pixel_directional.is_finite()
            || !self.texels_per_pixel_point.is_finite()
            || !self.texels_per_pixel_spot.is_finite()
            || !self.texels_per_pixel_rect.is_finite()
        {
            return Err(ShadowError::InvalidConfig(
                "texels per pixel must be finite".into(),
            ));
        }
        self.validate();
        if 2 * self.shadow_border >= self.shadow_buffer_size {
            return Err(ShadowError::InvalidConfig(format!(
                "shadow border {} leaves no room in a {} buffer",
                self.shadow_border, self.shadow_buffer_size
            )));
        }
        Ok(self)
    }
}

/// Shadow quality preset
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShadowQuality {
    /// No shadows
    Off,
    /// Small atlases, two cascades
    Low,
    /// Balanced quality and performance
    Medium,
    /// Large atlases and cache budget
    High,
}

impl ShadowQuality {
    /// Convert to a ShadowConfig
    pub fn to_config(self) -> ShadowConfig {
        match self {
            Self::Off => ShadowConfig::disabled(),
            Self::Low => ShadowConfig::low_quality(),
            Self::Medium => ShadowConfig::default(),
            Self::High => ShadowConfig::high_quality(),
        }
    }
}
