//! Raw projection parameters produced by lights for shadow setup

use glam::{Mat4, Vec3, Vec4};
use void_math::BoxSphereBounds;

use crate::cascade::CascadeSettings;

/// Geometry shared by every kind of projected shadow
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectedShadowInitializer {
    /// Added to world positions before projecting, keeps shadow math near
    /// the origin
    pub pre_shadow_translation: Vec3,
    /// Rotation into light space, +X along the light
    pub world_to_light: Mat4,
    /// Non-uniform scale applied after `world_to_light`
    pub scales: Vec3,
    /// Light-space axis that becomes shadow depth
    pub face_direction: Vec3,
    /// Subject bounds, already moved by `pre_shadow_translation`
    pub subject_bounds: BoxSphereBounds,
    /// Selects orthographic `(0, 0, 0, 1)` or perspective `(0, 0, 1, 0)`
    pub w_axis: Vec4,
    pub min_light_w: f32,
    pub max_distance_to_cast_in_light_w: f32,
}

impl ProjectedShadowInitializer {
    /// `world_to_light` followed by `scales`
    #[inline]
    pub fn world_to_light_scaled(&self) -> Mat4 {
        Mat4::from_scale(self.scales) * self.world_to_light
    }

    /// Light-space W of a projected point
    #[inline]
    pub fn light_w(&self, light_space_point: Vec3) -> f32 {
        Vec4::new(0.0, 0.0, light_space_point.dot(self.face_direction), 1.0).dot(self.w_axis)
    }

    #[inline]
    pub fn is_perspective(&self) -> bool {
        self.w_axis.w == 0.0
    }
}

impl Default for ProjectedShadowInitializer {
    fn default() -> Self {
        Self {
            pre_shadow_translation: Vec3::ZERO,
            world_to_light: Mat4::IDENTITY,
            scales: Vec3::ONE,
            face_direction: Vec3::X,
            subject_bounds: BoxSphereBounds::default(),
            w_axis: Vec4::new(0.0, 0.0, 0.0, 1.0),
            min_light_w: 0.0,
            max_distance_to_cast_in_light_w: 0.0,
        }
    }
}

/// Initializer for a shadow cast by one primitive
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PerObjectShadowInitializer {
    pub base: ProjectedShadowInitializer,
}

/// Initializer for a shadow covering everything a light reaches
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WholeSceneShadowInitializer {
    pub base: ProjectedShadowInitializer,
    /// Render all six cube faces in one pass
    pub one_pass_point_light_shadow: bool,
    /// Present for directional cascades
    pub cascade_settings: Option<CascadeSettings>,
    /// Reflective shadow map for indirect lighting
    pub reflective: bool,
}

impl WholeSceneShadowInitializer {
    /// Whether a map rendered with `self` can stand in for `other`.
    ///
    /// Any difference in projection invalidates cached depths, so the
    /// comparison is exact.
    pub fn is_cached_shadow_valid(&self, other: &WholeSceneShadowInitializer) -> bool {
        let (a, b) = (&self.base, &other.base);
        a.pre_shadow_translation == b.pre_shadow_translation
            && a.world_to_light == b.world_to_light
            && a.scales == b.scales
            && a.face_direction == b.face_direction
            && a.subject_bounds.origin == b.subject_bounds.origin
            && a.subject_bounds.box_extent == b.subject_bounds.box_extent
            && a.subject_bounds.sphere_radius == b.subject_bounds.sphere_radius
            && a.w_axis == b.w_axis
            && a.min_light_w == b.min_light_w
            && a.max_distance_to_cast_in_light_w == b.max_distance_to_cast_in_light_w
            && self.one_pass_point_light_shadow == other.one_pass_point_light_shadow
    }

    #[inline]
    pub fn split_index(&self) -> Option<u32> {
        self.cascade_settings.as_ref().map(|c| c.shadow_split_index)
    }
}
