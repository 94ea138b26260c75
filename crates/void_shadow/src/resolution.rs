//! Shadow Resolution and Fade
//!
//! Converts screen coverage into a shadow map size and a fade alpha.
//! Sizes are rounded down to powers of two so that a subject moving
//! toward or away from the camera only ever doubles or halves its map.
//!
//! The fade alpha is computed from the unclamped resolution, before the
//! light's resolution scale is applied, so that scaling a light changes the
//! softness of its shadow but not the distance at which it fades out.

use void_math::{ceil_log_two, BoxSphereBounds};

use crate::config::ShadowConfig;
use crate::light::LightSceneInfo;
use crate::view::ShadowView;

/// Fade alpha below which a shadow is not worth creating
pub const MIN_FADE_ALPHA: f32 = 1.0 / 256.0;

/// Fade alpha of a shadow whose best view wants `max_unclamped_resolution`
/// texels.
///
/// Zero at or below `min_resolution`, one above `fade_resolution`, and an
/// ease-in curve of the given exponent in between. The curve is rescaled so
/// it starts at exactly zero one texel above `min_resolution`.
pub fn calculate_fade_alpha(
    max_unclamped_resolution: f32,
    fade_resolution: u32,
    min_resolution: u32,
    exponent: f32,
) -> f32 {
    let (fade, min) = (fade_resolution as f32, min_resolution as f32);

    if max_unclamped_resolution > fade {
        return 1.0;
    }
    if max_unclamped_resolution <= min {
        return 0.0;
    }

    let inverse_range = 1.0 / (fade - min);
    let first_fade_value = inverse_range.powf(exponent);
    if first_fade_value >= 1.0 {
        // A single texel of fade range
        return if max_unclamped_resolution >= fade { 1.0 } else { 0.0 };
    }

    let size_ratio = (max_unclamped_resolution - min) * inverse_range;
    ((size_ratio.powf(exponent) - first_fade_value) / (1.0 - first_fade_value)).clamp(0.0, 1.0)
}

/// Apply a light's resolution scale around the platform clamp.
///
/// Raising the resolution happens before the clamp, lowering it after.
pub fn scale_and_clamp_resolution(unclamped: f32, resolution_scale: f32, max_resolution: u32) -> f32 {
    let mut clamped = unclamped;
    if resolution_scale > 1.0 {
        clamped *= resolution_scale;
    }
    clamped = clamped.min(max_resolution as f32);
    if resolution_scale <= 1.0 {
        clamped *= resolution_scale;
    }
    clamped
}

/// `1 << (ceil_log2(value) - 1)`: the power of two strictly below the next
/// power of two at or above `value`.
#[inline]
pub fn round_down_to_power_of_two(value: u32) -> u32 {
    1 << ceil_log_two(value).saturating_sub(1)
}

/// Largest unpadded shadow size in X and Y that fits the depth buffer
pub fn max_shadow_resolution(config: &ShadowConfig, border: u32) -> (u32, u32) {
    let buffer = config.shadow_buffer_size;
    (
        config.max_shadow_resolution.min(buffer).saturating_sub(2 * border),
        config.max_shadow_resolution_y.min(buffer).saturating_sub(2 * border),
    )
}

/// Lower bound applied to every view's desired resolution
#[inline]
fn min_desired_resolution(config: &ShadowConfig, border: u32) -> u32 {
    config
        .min_shadow_resolution
        .min(config.shadow_buffer_size.saturating_sub(2 * border))
}

/// Unpadded size of a whole-scene map for a desired resolution.
///
/// One is added before rounding so a desired size just above a power of
/// two is not truncated down a tier.
pub fn whole_scene_resolution(max_desired_resolution: f32, max_resolution: u32, border: u32) -> u32 {
    if max_desired_resolution >= max_resolution as f32 {
        return max_resolution;
    }
    let rounded = round_down_to_power_of_two((max_desired_resolution + 1.0) as u32);
    rounded.saturating_sub(2 * border).max(1)
}

/// Face size of a one-pass cube map: the largest supported size not above
/// `desired`, or the smallest supported size.
pub fn cube_resolution(desired: f32, config: &ShadowConfig) -> u32 {
    let mut supported = config
        .cube_resolutions
        .iter()
        .copied()
        .filter(|&size| size > 0 && size <= config.max_cube_resolution)
        .peekable();

    let Some(&smallest) = supported.peek() else {
        return config.max_cube_resolution.max(1);
    };
    supported
        .filter(|&size| size as f32 <= desired)
        .max()
        .unwrap_or(smallest)
}

/// Resolution and fade of a per-object shadow across all views
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PerObjectResolution {
    /// Fade per view, scaled by the light's shadow amount
    pub fade_alphas: Vec<f32>,
    pub preshadow_fade_alphas: Vec<f32>,
    pub max_fade_alpha: f32,
    pub max_preshadow_fade_alpha: f32,
    /// Largest clamped resolution wanted by any view
    pub max_desired_resolution: u32,
    /// Largest fraction of the screen the subject covers
    pub max_screen_percent: f32,
    pub max_resolution_x: u32,
    pub max_resolution_y: u32,
    pub border: u32,
}

impl PerObjectResolution {
    /// Evaluate `bounds` shadowed by `light` in every view
    pub fn compute(
        light: &LightSceneInfo,
        bounds: &BoxSphereBounds,
        views: &[ShadowView],
        config: &ShadowConfig,
    ) -> Self {
        let border = config.shadow_border;
        let (max_resolution_x, max_resolution_y) = max_shadow_resolution(config, border);
        let floor = min_desired_resolution(config, border);
        let exponent = config.shadow_fade_exponent;

        let mut result = Self {
            fade_alphas: Vec::with_capacity(views.len()),
            preshadow_fade_alphas: Vec::with_capacity(views.len()),
            max_resolution_x,
            max_resolution_y,
            border,
            ..Default::default()
        };

        for view in views {
            let distance = bounds.origin.distance(view.origin).max(1.0);
            let screen_radius = view.screen_scale() * bounds.sphere_radius / distance;
            let projection_scale = (0.5 * view.projection_matrix.x_axis.x).max(0.5 * view.projection_matrix.y_axis.y);
            result.max_screen_percent = result
                .max_screen_percent
                .max(projection_scale * bounds.sphere_radius / distance);

            // Per-object shadows use one texel density for every light shape
            let unclamped = screen_radius * config.texels_per_pixel_directional;

            let fade = calculate_fade_alpha(
                unclamped,
                config.shadow_fade_resolution,
                config.min_shadow_resolution,
                exponent,
            ) * light.shadow.shadow_amount;
            result.max_fade_alpha = result.max_fade_alpha.max(fade);
            result.fade_alphas.push(fade);

            let preshadow_fade = calculate_fade_alpha(
                unclamped * config.preshadow_resolution_factor,
                config.preshadow_fade_resolution,
                config.min_preshadow_resolution,
                exponent,
            ) * light.shadow.shadow_amount;
            result.max_preshadow_fade_alpha = result.max_preshadow_fade_alpha.max(preshadow_fade);
            result.preshadow_fade_alphas.push(preshadow_fade);

            let clamped = scale_and_clamp_resolution(unclamped, light.shadow.resolution_scale, max_resolution_x);
            result.max_desired_resolution = result.max_desired_resolution.max((clamped as u32).max(floor));
        }

        result
    }

    /// Whether the opaque or translucent shadow survives fading
    #[inline]
    pub fn is_visible(&self) -> bool {
        self.max_fade_alpha > MIN_FADE_ALPHA
    }

    #[inline]
    pub fn is_preshadow_visible(&self) -> bool {
        self.max_preshadow_fade_alpha > MIN_FADE_ALPHA
    }

    /// Unpadded X size of the opaque shadow
    pub fn resolution_x(&self) -> u32 {
        if self.max_desired_resolution >= self.max_resolution_x {
            self.max_resolution_x
        } else {
            round_down_to_power_of_two(self.max_desired_resolution)
        }
    }

    /// Size and Y limit of the translucent shadow, which lives in the
    /// smaller translucency buffer
    pub fn translucent_resolution(&self, config: &ShadowConfig) -> (u32, u32) {
        let downsample = config.translucency_downsample_factor.max(1);
        let limit = config
            .translucent_shadow_buffer_size
            .saturating_sub(2 * self.border)
            .max(1);
        (
            (self.resolution_x() / downsample).clamp(1, limit),
            (self.max_resolution_y / downsample).clamp(1, limit),
        )
    }

    /// Size and Y limit of the preshadow
    pub fn preshadow_resolution(&self, config: &ShadowConfig) -> (u32, u32) {
        let factor = config.preshadow_resolution_factor;
        (
            round_down_to_power_of_two((self.max_desired_resolution as f32 * factor) as u32),
            ((self.max_resolution_y as f32 * factor) as u32).max(1),
        )
    }
}

/// Resolution and fade of a local light's whole-scene shadow
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WholeSceneResolution {
    pub fade_alphas: Vec<f32>,
    pub max_fade_alpha: f32,
    /// Largest clamped resolution wanted by any view, before rounding
    pub max_desired_resolution: f32,
    pub max_resolution_x: u32,
    pub max_resolution_y: u32,
    pub border: u32,
}

impl WholeSceneResolution {
    /// Evaluate a local light in every view. One-pass cube maps carry no
    /// border.
    pub fn compute(light: &LightSceneInfo, views: &[ShadowView], one_pass: bool, config: &ShadowConfig) -> Self {
        let border = if one_pass { 0 } else { config.shadow_border };
        let (max_resolution_x, max_resolution_y) = max_shadow_resolution(config, border);
        let floor = min_desired_resolution(config, border) as f32;
        let texels_per_pixel = light.texels_per_pixel(config);

        let mut result = Self {
            fade_alphas: Vec::with_capacity(views.len()),
            max_resolution_x,
            max_resolution_y,
            border,
            ..Default::default()
        };

        for view in views {
            let unclamped = light
                .effective_screen_radius(view)
                .map_or(1.0, |radius| radius * texels_per_pixel);

            let fade = calculate_fade_alpha(
                unclamped,
                config.shadow_fade_resolution,
                config.min_shadow_resolution,
                config.shadow_fade_exponent,
            ) * light.shadow.shadow_amount;
            result.max_fade_alpha = result.max_fade_alpha.max(fade);
            result.fade_alphas.push(fade);

            let clamped = scale_and_clamp_resolution(unclamped, light.shadow.resolution_scale, max_resolution_x);
            result.max_desired_resolution = result.max_desired_resolution.max(clamped.max(floor));
        }

        result
    }

    #[inline]
    pub fn is_visible(&self) -> bool {
        self.max_fade_alpha > MIN_FADE_ALPHA
    }

    /// Unpadded map size
    pub fn size(&self, one_pass: bool, config: &ShadowConfig) -> (u32, u32) {
        if one_pass {
            let face = cube_resolution(self.max_desired_resolution, config);
            return (face, face);
        }
        (
            whole_scene_resolution(self.max_desired_resolution, self.max_resolution_x, self.border),
            whole_scene_resolution(self.max_desired_resolution, self.max_resolution_y, self.border),
        )
    }
}
