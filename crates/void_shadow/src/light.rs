//! Light sources as seen by the shadow scheduler
//!
//! Light shapes are a closed set, so shape-specific behaviour is a `match`
//! on [`LightShape`] rather than a trait object. Lights produce the raw
//! initializers that `projection` turns into shadow descriptors.

use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};
use void_math::{
    consts::{FRAC_PI_4, HALF_WORLD_MAX, WORLD_MAX},
    rotation_to_x_axis, BoxSphereBounds, Sphere,
};

use crate::cascade::{calculate_splits, split_bounds, CascadeSettings};
use crate::config::ShadowConfig;
use crate::initializer::{
    PerObjectShadowInitializer, ProjectedShadowInitializer, WholeSceneShadowInitializer,
};
use crate::scene::PrimitiveSceneInfo;
use crate::view::ShadowView;

/// Widest spot cone that still fits one perspective projection
const MAX_SPOT_CONE_ANGLE: f32 = 89.0 * std::f32::consts::PI / 180.0;

/// Per-object projections of lights closer than this multiple of the
/// subject radius are pulled back to fit one frustum
const SHADOW_RADIUS_MULTIPLIER: f32 = 1.1;

/// Index of a light in the scene's light arena
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LightId(pub u32);

impl LightId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How much of a light's shadowing can be precomputed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LightMobility {
    /// Lighting and shadowing fully baked
    Static,
    /// Static shadowing baked, dynamic objects shadowed at runtime
    Stationary,
    /// Everything computed at runtime
    #[default]
    Movable,
}

/// Geometric shape of a light
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum LightShape {
    Directional { direction: Vec3 },
    Point { radius: f32 },
    Spot { direction: Vec3, radius: f32, outer_cone_angle: f32 },
    Rect { direction: Vec3, radius: f32 },
}

/// Shape tag used for per-kind counters and texel densities
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LightKind {
    Directional,
    Point,
    Spot,
    Rect,
}

impl LightShape {
    pub fn kind(&self) -> LightKind {
        match self {
            Self::Directional { .. } => LightKind::Directional,
            Self::Point { .. } => LightKind::Point,
            Self::Spot { .. } => LightKind::Spot,
            Self::Rect { .. } => LightKind::Rect,
        }
    }
}

/// Per-light shadow settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LightShadowSettings {
    pub casts_dynamic_shadow: bool,
    pub casts_static_shadow: bool,
    pub cast_translucent_shadows: bool,
    /// Artist multiplier on the computed resolution, 0 disables
    /// whole-scene shadows
    pub resolution_scale: f32,
    /// Shadow strength (0 = no shadow, 1 = full shadow)
    pub shadow_amount: f32,
    /// Stationary directional lights shadow dynamic objects with cascades
    /// instead of per-object shadows
    pub use_csm_for_dynamic_objects: bool,
    /// Request a reflective shadow map for dynamic indirect lighting
    pub affects_dynamic_indirect_lighting: bool,
    /// Cascade count for directional lights (clamped by the config)
    pub num_cascades: u32,
    /// Override of the configured cascade distance
    pub whole_scene_shadow_distance: Option<f32>,
    /// Distance beyond which the light is culled, 0 for unlimited
    pub max_draw_distance: f32,
}

impl Default for LightShadowSettings {
    fn default() -> Self {
        Self {
            casts_dynamic_shadow: true,
            casts_static_shadow: true,
            cast_translucent_shadows: true,
            resolution_scale: 1.0,
            shadow_amount: 1.0,
            use_csm_for_dynamic_objects: false,
            affects_dynamic_indirect_lighting: false,
            num_cascades: 3,
            whole_scene_shadow_distance: None,
            max_draw_distance: 0.0,
        }
    }
}

impl LightShadowSettings {
    /// Set shadow strength
    pub fn with_shadow_amount(mut self, amount: f32) -> Self {
        self.shadow_amount = amount.clamp(0.0, 1.0);
        self
    }

    pub fn with_resolution_scale(mut self, scale: f32) -> Self {
        self.resolution_scale = scale;
        self
    }

    pub fn with_cascades(mut self, count: u32) -> Self {
        self.num_cascades = count;
        self
    }
}

/// A light registered with the scene
#[derive(Clone, Debug)]
pub struct LightSceneInfo {
    pub id: LightId,
    pub shape: LightShape,
    pub position: Vec3,
    pub mobility: LightMobility,
    pub shadow: LightShadowSettings,
    /// Baked lighting for this light matches the current scene
    pub precomputed_lighting_valid: bool,
}

impl LightSceneInfo {
    pub fn new(id: LightId, shape: LightShape, position: Vec3) -> Self {
        Self {
            id,
            shape,
            position,
            mobility: LightMobility::Movable,
            shadow: LightShadowSettings::default(),
            precomputed_lighting_valid: false,
        }
    }

    pub fn with_mobility(mut self, mobility: LightMobility) -> Self {
        self.mobility = mobility;
        if mobility != LightMobility::Movable {
            self.precomputed_lighting_valid = true;
        }
        self
    }

    pub fn with_shadow_settings(mut self, shadow: LightShadowSettings) -> Self {
        self.shadow = shadow;
        self
    }

    #[inline]
    pub fn kind(&self) -> LightKind {
        self.shape.kind()
    }

    #[inline]
    pub fn is_directional(&self) -> bool {
        matches!(self.shape, LightShape::Directional { .. })
    }

    #[inline]
    pub fn has_static_lighting(&self) -> bool {
        self.mobility == LightMobility::Static
    }

    #[inline]
    pub fn has_static_shadowing(&self) -> bool {
        self.mobility != LightMobility::Movable
    }

    /// Direction light travels in; local lights without one use +X
    pub fn direction(&self) -> Vec3 {
        match self.shape {
            LightShape::Directional { direction }
            | LightShape::Spot { direction, .. }
            | LightShape::Rect { direction, .. } => direction.normalize_or_zero(),
            LightShape::Point { .. } => Vec3::X,
        }
    }

    /// Influence radius; unbounded for directional lights
    pub fn radius(&self) -> f32 {
        match self.shape {
            LightShape::Directional { .. } => WORLD_MAX,
            LightShape::Point { radius }
            | LightShape::Spot { radius, .. }
            | LightShape::Rect { radius, .. } => radius,
        }
    }

    /// Sphere enclosing everything the light can reach
    pub fn bounding_sphere(&self) -> Sphere {
        match self.shape {
            LightShape::Directional { .. } => Sphere::new(Vec3::ZERO, WORLD_MAX),
            LightShape::Point { radius } | LightShape::Rect { radius, .. } => {
                Sphere::new(self.position, radius)
            }
            LightShape::Spot { direction, radius, outer_cone_angle } => cone_bounding_sphere(
                self.position,
                direction.normalize_or_zero(),
                radius,
                outer_cone_angle.clamp(0.0, MAX_SPOT_CONE_ANGLE),
            ),
        }
    }

    /// Shadow texels wanted per pixel of screen radius
    pub fn texels_per_pixel(&self, config: &ShadowConfig) -> f32 {
        match self.kind() {
            LightKind::Directional => config.texels_per_pixel_directional,
            LightKind::Point => config.texels_per_pixel_point,
            LightKind::Spot => config.texels_per_pixel_spot,
            LightKind::Rect => config.texels_per_pixel_rect,
        }
    }

    /// Screen radius of a local light, approximated from its distance to
    /// the view so it stays finite when the view is inside the light.
    pub fn effective_screen_radius(&self, view: &ShadowView) -> Option<f32> {
        if self.is_directional() {
            return None;
        }
        let distance = self.position.distance(view.origin);
        Some(view.screen_scale() * self.radius() / distance.max(1.0))
    }

    /// Whether the light's influence reaches the bounds
    pub fn affects_bounds(&self, bounds: &BoxSphereBounds) -> bool {
        if self.is_directional() {
            return true;
        }
        let sphere = self.bounding_sphere();
        let closest = bounds.origin + (sphere.center - bounds.origin).clamp(-bounds.box_extent, bounds.box_extent);
        closest.distance_squared(sphere.center) <= sphere.radius * sphere.radius
    }

    /// Whether any of the light's influence can be seen from `view`
    pub fn is_visible_in(&self, view: &ShadowView) -> bool {
        if self.is_directional() {
            return true;
        }
        let sphere = self.bounding_sphere();
        if self.shadow.max_draw_distance > 0.0
            && sphere.center.distance(view.origin) - sphere.radius > self.shadow.max_draw_distance
        {
            return false;
        }
        view.view_frustum().intersect_sphere(sphere.center, sphere.radius)
    }

    /// Whether a dynamic primitive gets its own per-object shadow to blend
    /// with the light's baked shadowing
    pub fn creates_per_object_shadow_for(&self, primitive: &PrimitiveSceneInfo) -> bool {
        self.has_static_shadowing()
            && !self.has_static_lighting()
            && !self.shadow.use_csm_for_dynamic_objects
            && self.precomputed_lighting_valid
            && (!primitive.flags.static_lighting || !primitive.flags.static_lit_shadow_mapped)
    }

    /// Whether baked lighting already covers `primitive`
    pub fn statically_lights(&self, primitive: &PrimitiveSceneInfo) -> bool {
        self.has_static_lighting() && self.precomputed_lighting_valid && primitive.flags.static_lighting
    }

    /// Projection parameters for a shadow cast by a single subject.
    ///
    /// Returns `None` when no projection can frame the subject.
    pub fn per_object_initializer(&self, subject: &BoxSphereBounds) -> Option<PerObjectShadowInitializer> {
        if subject.sphere_radius <= 0.0 {
            return None;
        }
        let base = match self.shape {
            LightShape::Directional { direction } => ProjectedShadowInitializer {
                pre_shadow_translation: -subject.origin,
                world_to_light: rotation_to_x_axis(direction),
                scales: Vec3::new(1.0, 1.0 / subject.sphere_radius, 1.0 / subject.sphere_radius),
                face_direction: Vec3::X,
                subject_bounds: BoxSphereBounds::new(Vec3::ZERO, subject.box_extent, subject.sphere_radius),
                w_axis: Vec4::new(0.0, 0.0, 0.0, 1.0),
                min_light_w: -HALF_WORLD_MAX,
                max_distance_to_cast_in_light_w: HALF_WORLD_MAX / 32.0,
            },
            LightShape::Point { .. } | LightShape::Spot { .. } | LightShape::Rect { .. } => {
                let mut light_position = self.position;
                let mut light_vector = subject.origin - light_position;
                let mut light_distance = light_vector.length();
                let subject_radius = subject.sphere_radius;

                // tan of the half angle the subject subtends
                let mut silhouette_radius = 1.0f32;
                if light_distance > subject_radius {
                    let tangent_sq = (light_distance - subject_radius) * (light_distance + subject_radius);
                    silhouette_radius = (subject_radius / tangent_sq.sqrt()).min(1.0);
                }

                if light_distance <= subject_radius * SHADOW_RADIUS_MULTIPLIER {
                    // Back the projection origin off so the subject fits a 90 degree frustum
                    let towards = light_vector.try_normalize().unwrap_or(Vec3::X);
                    light_vector = towards * subject_radius * SHADOW_RADIUS_MULTIPLIER;
                    light_position = subject.origin - light_vector;
                    light_distance = subject_radius * SHADOW_RADIUS_MULTIPLIER;
                    silhouette_radius = 1.0;
                }

                ProjectedShadowInitializer {
                    pre_shadow_translation: -light_position,
                    world_to_light: rotation_to_x_axis(light_vector / light_distance),
                    scales: Vec3::new(1.0, 1.0 / silhouette_radius, 1.0 / silhouette_radius),
                    face_direction: Vec3::X,
                    subject_bounds: BoxSphereBounds::new(
                        subject.origin - light_position,
                        subject.box_extent,
                        subject.sphere_radius,
                    ),
                    w_axis: Vec4::new(0.0, 0.0, 1.0, 0.0),
                    min_light_w: 0.1,
                    max_distance_to_cast_in_light_w: self.radius(),
                }
            }
        };
        Some(PerObjectShadowInitializer { base })
    }

    /// Initializers for the view-independent whole-scene shadow of a local
    /// light. Directional lights use cascades instead and return nothing.
    pub fn whole_scene_initializers(&self) -> Vec<WholeSceneShadowInitializer> {
        match self.shape {
            LightShape::Directional { .. } => Vec::new(),
            LightShape::Point { radius } | LightShape::Rect { radius, .. } => {
                vec![WholeSceneShadowInitializer {
                    base: ProjectedShadowInitializer {
                        pre_shadow_translation: -self.position,
                        world_to_light: Mat4::IDENTITY,
                        scales: Vec3::ONE,
                        face_direction: Vec3::X,
                        subject_bounds: BoxSphereBounds::new(Vec3::ZERO, Vec3::splat(radius), radius),
                        w_axis: Vec4::new(0.0, 0.0, 1.0, 0.0),
                        min_light_w: 0.1,
                        max_distance_to_cast_in_light_w: radius,
                    },
                    one_pass_point_light_shadow: true,
                    cascade_settings: None,
                    reflective: false,
                }]
            }
            LightShape::Spot { direction, radius, outer_cone_angle } => {
                let cone = outer_cone_angle.clamp(1e-3, MAX_SPOT_CONE_ANGLE);
                let inv_tan = 1.0 / cone.tan();
                let bounds = self.bounding_sphere();
                vec![WholeSceneShadowInitializer {
                    base: ProjectedShadowInitializer {
                        pre_shadow_translation: -self.position,
                        world_to_light: rotation_to_x_axis(direction),
                        scales: Vec3::new(1.0, inv_tan, inv_tan),
                        face_direction: Vec3::X,
                        subject_bounds: BoxSphereBounds::new(
                            bounds.center - self.position,
                            Vec3::splat(bounds.radius),
                            bounds.radius,
                        ),
                        w_axis: Vec4::new(0.0, 0.0, 1.0, 0.0),
                        min_light_w: 0.1,
                        max_distance_to_cast_in_light_w: radius,
                    },
                    one_pass_point_light_shadow: false,
                    cascade_settings: None,
                    reflective: false,
                }]
            }
        }
    }

    /// Number of cascades rendered for `view`
    pub fn num_cascades(&self, config: &ShadowConfig) -> u32 {
        if self.is_directional() {
            self.shadow.num_cascades.min(config.max_cascades)
        } else {
            0
        }
    }

    /// View depth covered by cascades
    pub fn cascade_distance(&self, config: &ShadowConfig) -> f32 {
        self.shadow
            .whole_scene_shadow_distance
            .unwrap_or(config.whole_scene_shadow_distance)
            .max(1.0)
    }

    /// View distance at which cascaded shadowing starts fading out
    pub fn distance_fade_start(&self, config: &ShadowConfig) -> f32 {
        self.cascade_distance(config) * (1.0 - crate::cascade::CASCADE_FADE_FRACTION)
    }

    /// Initializer for cascade `cascade_index` of a directional light
    pub fn view_dependent_initializer(
        &self,
        view: &ShadowView,
        cascade_index: u32,
        config: &ShadowConfig,
    ) -> Option<WholeSceneShadowInitializer> {
        let count = self.num_cascades(config);
        if cascade_index >= count {
            return None;
        }
        let far = self.cascade_distance(config).max(view.near_plane + 1.0);
        let splits = calculate_splits(view.near_plane, far, count, config.cascade_distribution_lambda);
        let (split_near, split_far) = (splits[cascade_index as usize], splits[cascade_index as usize + 1]);

        let bounds = split_bounds(view, split_near, split_far);
        let settings = CascadeSettings::new(view, cascade_index, split_near, split_far, self.direction());
        Some(self.directional_whole_scene_initializer(bounds, Some(settings), false))
    }

    /// Reflective shadow map covering the neighbourhood of `view`
    pub fn rsm_initializer(&self, view: &ShadowView, config: &ShadowConfig) -> Option<WholeSceneShadowInitializer> {
        if !self.is_directional() || !self.shadow.affects_dynamic_indirect_lighting {
            return None;
        }
        let bounds = Sphere::new(view.origin, config.reflective_shadow_map_radius);
        Some(self.directional_whole_scene_initializer(bounds, None, true))
    }

    fn directional_whole_scene_initializer(
        &self,
        bounds: Sphere,
        cascade_settings: Option<CascadeSettings>,
        reflective: bool,
    ) -> WholeSceneShadowInitializer {
        let radius = bounds.radius.max(1.0);
        let extent = radius / 3.0f32.sqrt();
        let min_light_w = (-HALF_WORLD_MAX).min(-radius);
        WholeSceneShadowInitializer {
            base: ProjectedShadowInitializer {
                pre_shadow_translation: -bounds.center,
                world_to_light: rotation_to_x_axis(self.direction()),
                scales: Vec3::new(1.0, 1.0 / radius, 1.0 / radius),
                face_direction: Vec3::X,
                subject_bounds: BoxSphereBounds::new(Vec3::ZERO, Vec3::splat(extent), radius),
                w_axis: Vec4::new(0.0, 0.0, 0.0, 1.0),
                min_light_w,
                max_distance_to_cast_in_light_w: radius - min_light_w,
            },
            one_pass_point_light_shadow: false,
            cascade_settings,
            reflective,
        }
    }
}

/// Bounding sphere of a cone with slant length `length`
fn cone_bounding_sphere(apex: Vec3, direction: Vec3, length: f32, half_angle: f32) -> Sphere {
    if half_angle > FRAC_PI_4 {
        Sphere::new(apex + direction * length * half_angle.cos(), length * half_angle.sin())
    } else {
        let radius = length / (2.0 * half_angle.cos());
        Sphere::new(apex + direction * radius, radius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::ViewId;
    use approx::assert_relative_eq;

    fn spot(angle: f32) -> LightSceneInfo {
        LightSceneInfo::new(
            LightId(0),
            LightShape::Spot { direction: Vec3::X, radius: 1000.0, outer_cone_angle: angle },
            Vec3::ZERO,
        )
    }

    fn test_view(origin: Vec3) -> ShadowView {
        ShadowView::perspective(ViewId(0), origin, Vec3::X, Vec3::Z, FRAC_PI_4, (1024, 1024), 10.0, 50_000.0)
    }

    #[test]
    fn test_cone_bounding_sphere_contains_cone() {
        for angle in [0.3f32, 0.7, 1.2] {
            let light = spot(angle);
            let sphere = light.bounding_sphere();
            let rim = Vec3::new(1000.0 * angle.cos(), 1000.0 * angle.sin(), 0.0);
            assert!(sphere.center.distance(Vec3::ZERO) <= sphere.radius + 1e-2);
            assert!(sphere.center.distance(rim) <= sphere.radius + 1e-2);
        }
    }

    #[test]
    fn test_texels_per_pixel_by_shape() {
        let config = ShadowConfig::default();
        assert_relative_eq!(spot(0.5).texels_per_pixel(&config), 2.54648);
        let point = LightSceneInfo::new(LightId(1), LightShape::Point { radius: 10.0 }, Vec3::ZERO);
        assert_relative_eq!(point.texels_per_pixel(&config), 1.27324);
    }

    #[test]
    fn test_effective_screen_radius() {
        let point = LightSceneInfo::new(LightId(0), LightShape::Point { radius: 100.0 }, Vec3::new(1000.0, 0.0, 0.0));
        let view = test_view(Vec3::ZERO);
        let radius = point.effective_screen_radius(&view).unwrap();
        assert_relative_eq!(radius, view.screen_scale() * 0.1, epsilon = 1e-3);

        let sun = LightSceneInfo::new(LightId(1), LightShape::Directional { direction: -Vec3::Z }, Vec3::ZERO);
        assert!(sun.effective_screen_radius(&view).is_none());
    }

    #[test]
    fn test_per_object_initializer_local_light() {
        let point = LightSceneInfo::new(LightId(0), LightShape::Point { radius: 5000.0 }, Vec3::ZERO);
        let subject = BoxSphereBounds::new(Vec3::new(1000.0, 0.0, 0.0), Vec3::splat(50.0), 86.6);
        let init = point.per_object_initializer(&subject).unwrap().base;

        assert_eq!(init.pre_shadow_translation, Vec3::ZERO);
        assert_eq!(init.w_axis, Vec4::new(0.0, 0.0, 1.0, 0.0));
        assert_relative_eq!(init.subject_bounds.origin.x, 1000.0);
        let expected = 86.6 / ((1000.0f32 - 86.6) * (1000.0 + 86.6)).sqrt();
        assert_relative_eq!(init.scales.y, 1.0 / expected, epsilon = 1e-3);
    }

    #[test]
    fn test_per_object_initializer_inside_subject_backs_off() {
        let point = LightSceneInfo::new(LightId(0), LightShape::Point { radius: 5000.0 }, Vec3::new(10.0, 0.0, 0.0));
        let subject = BoxSphereBounds::new(Vec3::ZERO, Vec3::splat(50.0), 86.6);
        let init = point.per_object_initializer(&subject).unwrap().base;
        assert_relative_eq!(init.subject_bounds.origin.length(), 86.6 * 1.1, epsilon = 1e-2);
        assert_eq!(init.scales, Vec3::ONE);
    }

    #[test]
    fn test_whole_scene_initializers_by_shape() {
        let point = LightSceneInfo::new(LightId(0), LightShape::Point { radius: 500.0 }, Vec3::new(1.0, 2.0, 3.0));
        let inits = point.whole_scene_initializers();
        assert_eq!(inits.len(), 1);
        assert!(inits[0].one_pass_point_light_shadow);
        assert_eq!(inits[0].base.pre_shadow_translation, Vec3::new(-1.0, -2.0, -3.0));

        let inits = spot(0.5).whole_scene_initializers();
        assert_eq!(inits.len(), 1);
        assert!(!inits[0].one_pass_point_light_shadow);

        let sun = LightSceneInfo::new(LightId(1), LightShape::Directional { direction: -Vec3::Z }, Vec3::ZERO);
        assert!(sun.whole_scene_initializers().is_empty());
    }

    #[test]
    fn test_view_dependent_initializer_cascades() {
        let config = ShadowConfig::default();
        let sun = LightSceneInfo::new(LightId(0), LightShape::Directional { direction: -Vec3::Z }, Vec3::ZERO)
            .with_shadow_settings(LightShadowSettings::default().with_cascades(3));
        let view = test_view(Vec3::ZERO);

        let first = sun.view_dependent_initializer(&view, 0, &config).unwrap();
        let last = sun.view_dependent_initializer(&view, 2, &config).unwrap();
        assert!(sun.view_dependent_initializer(&view, 3, &config).is_none());

        assert_eq!(first.split_index(), Some(0));
        assert_eq!(last.split_index(), Some(2));
        assert!(last.base.subject_bounds.sphere_radius > first.base.subject_bounds.sphere_radius);
        assert_eq!(first.base.w_axis, Vec4::new(0.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn test_affects_bounds() {
        let point = LightSceneInfo::new(LightId(0), LightShape::Point { radius: 100.0 }, Vec3::ZERO);
        assert!(point.affects_bounds(&BoxSphereBounds::new(Vec3::new(120.0, 0.0, 0.0), Vec3::splat(30.0), 52.0)));
        assert!(!point.affects_bounds(&BoxSphereBounds::new(Vec3::new(200.0, 0.0, 0.0), Vec3::splat(30.0), 52.0)));
    }
}
