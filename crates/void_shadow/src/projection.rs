//! Shadow Projection Setup
//!
//! Turns light initializers into shadow descriptors: the subject and
//! receiver matrices, the caster and receiver frustums and the depth range
//! of each shadow map.
//!
//! # Coordinate spaces
//!
//! - *Translated world*: world space moved by the shadow's
//!   `pre_shadow_translation`. All shadow matrices and frustums start here.
//! - *Light space*: `world_to_light` followed by the initializer scales.
//! - *Shadow space*: light space re-based onto the best shadow axes. Z is
//!   depth along the light, X and Y cover `[-1, 1]` over the subject.

use glam::{Mat4, Vec2, Vec3, Vec4};
use void_math::{
    basis_vectors,
    consts::{DELTA, FRAC_PI_4, HALF_WORLD_MAX},
    find_best_axis_vectors, look_from, perspective, shadow_projection, transform_position, BoxSphereBounds,
    ConvexVolume, Plane, Sphere,
};

use crate::cascade::split_bounds;
use crate::config::ShadowConfig;
use crate::error::{Result, ShadowError};
use crate::initializer::{PerObjectShadowInitializer, WholeSceneShadowInitializer};
use crate::light::LightSceneInfo;
use crate::scene::PrimitiveId;
use crate::shadow::ProjectedShadowInfo;
use crate::view::ShadowView;

/// Edges of a box, by `BoxSphereBounds::corner` index
pub const BOX_EDGES: [(usize, usize); 12] = [
    (0, 1),
    (1, 3),
    (3, 2),
    (2, 0),
    (4, 5),
    (5, 7),
    (7, 6),
    (6, 4),
    (0, 4),
    (1, 5),
    (2, 6),
    (3, 7),
];

/// Edges of a left, right, top, bottom, far view frustum
const VIEW_FRUSTUM_EDGES: [(usize, usize); 8] = [
    (ConvexVolume::FAR, ConvexVolume::LEFT),
    (ConvexVolume::FAR, ConvexVolume::RIGHT),
    (ConvexVolume::FAR, ConvexVolume::TOP),
    (ConvexVolume::FAR, ConvexVolume::BOTTOM),
    (ConvexVolume::LEFT, ConvexVolume::TOP),
    (ConvexVolume::LEFT, ConvexVolume::BOTTOM),
    (ConvexVolume::RIGHT, ConvexVolume::TOP),
    (ConvexVolume::RIGHT, ConvexVolume::BOTTOM),
];

/// Improvement in projected area a later edge needs to replace the best one
const AREA_IMPROVEMENT: f32 = 0.05;

/// Smallest depth range given to directional whole-scene shadows
const DIRECTIONAL_DEPTH_RANGE_CLAMP: f32 = 5000.0;

const CUBE_FACE_DIRECTIONS: [Vec3; 6] = [
    Vec3::NEG_X,
    Vec3::X,
    Vec3::NEG_Y,
    Vec3::Y,
    Vec3::NEG_Z,
    Vec3::Z,
];

const CUBE_FACE_UPS: [Vec3; 6] = [Vec3::Y, Vec3::Y, Vec3::NEG_Z, Vec3::Z, Vec3::Y, Vec3::Y];

/// Shadow axes that frame a set of light-space points with the least area
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BestShadowTransform {
    /// Scaled so the points span `[-1, 1]`; always the longer axis
    pub x_axis: Vec3,
    pub y_axis: Vec3,
    pub z_axis: Vec3,
    /// Offset that centres the points, in scaled units
    pub translation: Vec2,
    /// Width over height of the projected rectangle, at least 1
    pub aspect: f32,
    /// Unscaled area of the projected rectangle
    pub projected_area: f32,
}

impl BestShadowTransform {
    /// Light space to shadow space.
    ///
    /// The centring offset is scaled by the projected W so that it survives
    /// the perspective divide of a perspective shadow.
    pub fn light_to_shadow(&self, w_axis: Vec4) -> Mat4 {
        let (t, z) = (self.translation, self.z_axis);
        let row_x = (self.x_axis + z * (t.x * w_axis.z)).extend(t.x * w_axis.w);
        let row_y = (self.y_axis + z * (t.y * w_axis.z)).extend(t.y * w_axis.w);
        Mat4::from_cols(row_x, row_y, z.extend(0.0), Vec4::W).transpose()
    }
}

#[derive(Clone, Copy, Debug)]
struct EdgeCandidate {
    x_axis: Vec3,
    y_axis: Vec3,
    min: Vec2,
    max: Vec2,
    extent: Vec2,
}

fn edge_candidate(z_axis: Vec3, points: &[Vec3], edge: (usize, usize), conservative: bool) -> EdgeCandidate {
    let delta = points[edge.1] - points[edge.0];
    let x_axis = (delta - z_axis * delta.dot(z_axis)).normalize_or_zero();
    let y_axis = z_axis.cross(x_axis).normalize_or_zero();

    let mut min = Vec2::splat(f32::MAX);
    let mut max = Vec2::splat(f32::MIN);
    for point in points {
        let projected = Vec2::new(point.dot(x_axis), point.dot(y_axis));
        min = min.min(projected);
        max = max.max(projected);
    }

    let extent = if conservative {
        min.abs().max(max.abs()) * 2.0
    } else {
        max - min
    };
    EdgeCandidate { x_axis, y_axis, min, max, extent }
}

/// Area of the rectangle framing `points` when the shadow X axis follows `edge`
pub fn candidate_area(z_axis: Vec3, points: &[Vec3], edge: (usize, usize), conservative: bool) -> f32 {
    let candidate = edge_candidate(z_axis, points, edge, conservative);
    candidate.extent.x * candidate.extent.y
}

/// Pick the shadow X axis, among directions parallel to the given edges,
/// that frames `points` with the smallest projected area.
///
/// Returns `None` when every candidate projects to a degenerate rectangle.
pub fn best_shadow_transform(
    z_axis: Vec3,
    points: &[Vec3],
    edges: &[(usize, usize)],
    conservative: bool,
) -> Option<BestShadowTransform> {
    let mut best: Option<BestShadowTransform> = None;
    let mut best_area = f32::MAX;

    for &edge in edges {
        let candidate = edge_candidate(z_axis, points, edge, conservative);
        let area = candidate.extent.x * candidate.extent.y;
        if !(area < best_area - AREA_IMPROVEMENT && area > DELTA) {
            continue;
        }
        best_area = area;

        let mut x_axis = candidate.x_axis * 2.0 / candidate.extent.x;
        let mut y_axis = candidate.y_axis * 2.0 / candidate.extent.y;
        let mut translation = if conservative {
            Vec2::ZERO
        } else {
            let center = (candidate.min + candidate.max) * 0.5;
            -center * 2.0 / candidate.extent
        };

        let aspect = if candidate.extent.y > candidate.extent.x {
            // Keep X as the long axis
            std::mem::swap(&mut x_axis, &mut y_axis);
            translation = Vec2::new(-translation.y, translation.x);
            x_axis = -x_axis;
            candidate.extent.y / candidate.extent.x
        } else {
            candidate.extent.x / candidate.extent.y
        };

        best = Some(BestShadowTransform {
            x_axis,
            y_axis,
            z_axis,
            translation,
            aspect,
            projected_area: area,
        });
    }

    best
}

/// Per-object descriptor parameters that do not come from the initializer
#[derive(Clone, Copy, Debug)]
pub struct PerObjectSetup {
    pub parent: PrimitiveId,
    pub pre_shadow: bool,
    pub translucent: bool,
    pub self_shadow_only: bool,
    pub resolution_x: u32,
    pub max_resolution_y: u32,
    pub border: u32,
    pub max_screen_percent: f32,
}

/// Build the descriptor of a shadow cast by one primitive.
///
/// Fails when a subject corner projects behind the light or when no
/// candidate axis frames the subject with a non-zero area.
pub fn setup_per_object_projection(
    light: &LightSceneInfo,
    initializer: &PerObjectShadowInitializer,
    setup: &PerObjectSetup,
    config: &ShadowConfig,
) -> Result<ProjectedShadowInfo> {
    let init = &initializer.base;
    let directional = light.is_directional();
    let world_to_light_scaled = init.world_to_light_scaled();
    let subject_box = init.subject_bounds.get_box();

    let mut projected = [Vec3::ZERO; 8];
    for (out, corner) in projected.iter_mut().zip(init.subject_bounds.corners()) {
        let light_point = transform_position(&world_to_light_scaled, corner);
        let w = init.light_w(light_point);
        if w < DELTA {
            return Err(ShadowError::BehindLight);
        }
        *out = light_point / w;
    }

    let best = best_shadow_transform(
        init.face_direction.normalize_or_zero(),
        &projected,
        &BOX_EDGES,
        config.conservative_shadow_bounds,
    )
    .ok_or(ShadowError::DegenerateProjection)?;

    let world_to_shadow = best.light_to_shadow(init.w_axis) * world_to_light_scaled;
    let shadow_subject_box = subject_box.transform_by(&world_to_shadow);

    let min_subject_z = init.min_light_w.max(shadow_subject_box.min.z);
    let max_receiver_z = (min_subject_z + init.max_distance_to_cast_in_light_w)
        .min(HALF_WORLD_MAX)
        .max(min_subject_z + 1.0);
    let max_subject_z = shadow_subject_box.max.z.max(min_subject_z + 1.0);

    let subject_matrix = shadow_projection(min_subject_z, max_subject_z, init.w_axis) * world_to_shadow;
    let max_subject_and_receiver_depth = subject_box.transform_by(&subject_matrix).max.z;

    let mut shadow = ProjectedShadowInfo {
        light: light.id,
        light_kind: light.kind(),
        parent_primitive: Some(setup.parent),
        pre_shadow_translation: init.pre_shadow_translation,
        shadow_bounds: Sphere::new(
            init.subject_bounds.origin - init.pre_shadow_translation,
            init.subject_bounds.sphere_radius,
        ),
        resolution_x: setup.resolution_x,
        border_size: setup.border,
        max_screen_percent: setup.max_screen_percent,
        directional_light: directional,
        translucent_shadow: setup.translucent,
        pre_shadow: setup.pre_shadow,
        self_shadow_only: setup.self_shadow_only,
        min_subject_z,
        max_subject_z,
        min_pre_subject_z: init.min_light_w,
        ..Default::default()
    };

    let max_subject_depth = if setup.pre_shadow {
        // From the light up to the far side of the subject
        let pre_subject_matrix = shadow_projection(init.min_light_w, max_subject_z, init.w_axis) * world_to_shadow;
        shadow.subject_and_receiver_matrix = pre_subject_matrix;
        shadow.receiver_matrix = subject_matrix;
        if directional {
            max_subject_and_receiver_depth
        } else {
            subject_box.transform_by(&pre_subject_matrix).max.z
        }
    } else {
        shadow.subject_and_receiver_matrix = subject_matrix;
        shadow.receiver_matrix =
            shadow_projection(min_subject_z, max_receiver_z, init.w_axis) * world_to_shadow;

        // No room to fade when the receiver range ends inside the subject
        if directional && max_subject_z < max_receiver_z {
            let subject_range = max_subject_z - min_subject_z;
            let fade_length = subject_range.min(max_receiver_z - max_subject_z);
            shadow.per_object_shadow_fade_start = (max_receiver_z - min_subject_z - fade_length) / subject_range;
            shadow.inv_per_object_shadow_fade_length = subject_range / fade_length.max(1e-6);
        }
        max_subject_and_receiver_depth
    };
    shadow.inv_max_subject_depth = inverse_or_zero(max_subject_depth);

    shadow.resolution_y = ((setup.resolution_x as f32 / best.aspect) as u32).clamp(1, setup.max_resolution_y.max(1));
    if shadow.resolution_x == 0 || shadow.resolution_y == 0 {
        return Err(ShadowError::ZeroResolution);
    }

    shadow.caster_frustum = ConvexVolume::from_view_projection(&shadow.subject_and_receiver_matrix, true);
    shadow.receiver_frustum = ConvexVolume::from_view_projection(&shadow.receiver_matrix, true);
    Ok(shadow)
}

/// Whole-scene descriptor parameters that do not come from the initializer
#[derive(Clone, Copy, Debug)]
pub struct WholeSceneSetup<'a> {
    /// Required for cascades, whose bounds follow the view
    pub dependent_view: Option<&'a ShadowView>,
    pub resolution_x: u32,
    pub resolution_y: u32,
    pub border: u32,
    pub reflective: bool,
}

/// Light space to shadow face space of a whole-scene shadow
pub fn whole_scene_world_to_face(initializer: &WholeSceneShadowInitializer) -> Mat4 {
    let face = initializer.base.face_direction.normalize_or_zero();
    let (x_axis, y_axis) = find_best_axis_vectors(face);
    basis_vectors(-x_axis, y_axis, face, Vec3::ZERO) * initializer.base.world_to_light_scaled()
}

/// Build the descriptor of a shadow covering everything the light reaches
/// within the initializer's bounds.
pub fn setup_whole_scene_projection(
    light: &LightSceneInfo,
    initializer: &WholeSceneShadowInitializer,
    setup: &WholeSceneSetup<'_>,
    config: &ShadowConfig,
) -> Result<ProjectedShadowInfo> {
    if setup.resolution_x == 0 || setup.resolution_y == 0 {
        return Err(ShadowError::ZeroResolution);
    }

    let init = &initializer.base;
    let directional = light.is_directional();
    let radius = init.subject_bounds.sphere_radius;
    let world_to_face = whole_scene_world_to_face(initializer);

    let mut max_subject_z = transform_position(&world_to_face, init.subject_bounds.origin).z + radius;
    let mut min_subject_z = (max_subject_z - radius * 2.0).max(init.min_light_w);
    let mut pre_shadow_translation = init.pre_shadow_translation;

    if directional && !setup.reflective {
        // Keep depth available outside small cascades
        max_subject_z = max_subject_z.max(DIRECTIONAL_DEPTH_RANGE_CLAMP);
        min_subject_z = min_subject_z.min(-DIRECTIONAL_DEPTH_RANGE_CLAMP);
    }

    if directional || setup.reflective {
        pre_shadow_translation = snap_to_texel_grid(
            &world_to_face,
            pre_shadow_translation,
            setup.resolution_x,
            setup.resolution_y,
            config.max_kernel_downsample,
        );
    }

    if max_subject_z <= min_subject_z {
        return Err(ShadowError::DegenerateProjection);
    }

    let subject_and_receiver_matrix = shadow_projection(min_subject_z, max_subject_z, init.w_axis) * world_to_face;

    let (shadow_bounds, mut caster_frustum) = if setup.reflective {
        (
            Sphere::new(-pre_shadow_translation, radius),
            ConvexVolume::from_view_projection(&subject_and_receiver_matrix, true),
        )
    } else {
        let bounds = match (&initializer.cascade_settings, setup.dependent_view) {
            (Some(cascade), Some(view)) if directional => split_bounds(view, cascade.split_near, cascade.split_far),
            _ => Sphere::new(-init.pre_shadow_translation, radius),
        };
        // Anything between the light and the subject range can cast
        let caster_matrix = shadow_projection(init.min_light_w, max_subject_z, init.w_axis) * world_to_face;
        (bounds, ConvexVolume::from_view_projection(&caster_matrix, true))
    };

    let max_subject_depth = if initializer.one_pass_point_light_shadow {
        radius
    } else {
        let face_in_world = init
            .world_to_light_scaled()
            .inverse()
            .transform_vector3(init.face_direction);
        transform_position(
            &subject_and_receiver_matrix,
            init.subject_bounds.origin + face_in_world * radius,
        )
        .z
    };

    let mut shadow = ProjectedShadowInfo {
        light: light.id,
        light_kind: light.kind(),
        dependent_view: setup.dependent_view.map(|view| view.id),
        pre_shadow_translation,
        subject_and_receiver_matrix,
        receiver_matrix: subject_and_receiver_matrix,
        receiver_frustum: ConvexVolume::from_view_projection(&subject_and_receiver_matrix, true),
        min_subject_z,
        max_subject_z,
        min_pre_subject_z: init.min_light_w,
        inv_max_subject_depth: inverse_or_zero(max_subject_depth),
        resolution_x: setup.resolution_x,
        resolution_y: setup.resolution_y,
        border_size: setup.border,
        directional_light: directional,
        one_pass_point_light_shadow: initializer.one_pass_point_light_shadow,
        whole_scene_shadow: true,
        reflective_shadow_map: setup.reflective,
        shadow_bounds,
        cascade_settings: initializer.cascade_settings.clone(),
        ..Default::default()
    };

    if initializer.one_pass_point_light_shadow {
        let radius = light.radius();
        let face_projection = perspective(FRAC_PI_4, 1.0, 1.0, 1.0, radius);
        let flip_y = Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0));
        let mut planes = Vec::with_capacity(6);
        for (direction, up) in CUBE_FACE_DIRECTIONS.into_iter().zip(CUBE_FACE_UPS) {
            let face_view_projection = face_projection * flip_y * look_from(Vec3::ZERO, direction, up);
            shadow.one_pass_shadow_view_projection_matrices.push(face_view_projection);
            shadow
                .one_pass_shadow_frustums
                .push(ConvexVolume::from_view_projection(&face_view_projection, false));
            planes.push(Plane::new(direction, radius));
        }
        caster_frustum = ConvexVolume::new(planes);
        shadow.border_size = 0;
    }

    shadow.caster_frustum = caster_frustum;
    Ok(shadow)
}

/// Move the shadow origin onto the texel grid of the shadow map so that
/// sub-texel camera motion does not make the shadow shimmer.
fn snap_to_texel_grid(
    world_to_face: &Mat4,
    pre_shadow_translation: Vec3,
    resolution_x: u32,
    resolution_y: u32,
    max_kernel_downsample: u32,
) -> Vec3 {
    let downsample = max_kernel_downsample as f32;
    let face_position = transform_position(world_to_face, -pre_shadow_translation);
    let snap = Vec3::new(
        face_position.x % (2.0 * downsample / resolution_x as f32),
        face_position.y % (2.0 * downsample / resolution_y as f32),
        0.0,
    );
    -transform_position(&world_to_face.inverse(), face_position - snap)
}

#[inline]
fn inverse_or_zero(value: f32) -> f32 {
    if value.abs() > f32::EPSILON {
        1.0 / value
    } else {
        0.0
    }
}

/// Hull of a convex plane set extruded toward a point or direction.
///
/// `distances[i]` is the signed distance of the extrusion source from plane
/// `i`. Planes the source is on the inside of are kept, and every edge
/// between a kept and a dropped plane contributes a plane through the
/// source.
pub fn silhouette_hull(planes: &[Plane], distances: &[f32], edges: &[(usize, usize)]) -> ConvexVolume {
    let visible: Vec<bool> = distances.iter().map(|&d| d <= 0.0).collect();

    let mut hull: Vec<Plane> = planes
        .iter()
        .zip(&visible)
        .filter(|(_, visible)| **visible)
        .map(|(plane, _)| *plane)
        .collect();

    for &(i1, i2) in edges {
        if visible[i1] == visible[i2] {
            continue;
        }
        let mut plane = planes[i1] * distances[i2] - planes[i2] * distances[i1];
        if visible[i2] {
            plane = plane.flip();
        }
        if let Some(plane) = plane.normalized() {
            hull.push(plane);
        }
    }

    ConvexVolume::new(hull)
}

/// Convex hull of a light position and a view frustum.
///
/// Shadow casters outside it cannot shadow anything the view sees. The
/// frustum must have the five left, right, top, bottom and far planes;
/// anything else yields an unbounded volume.
pub fn build_light_view_convex_hull(light_origin: Vec3, view_frustum: &ConvexVolume) -> ConvexVolume {
    if view_frustum.planes.len() != 5 {
        return ConvexVolume::default();
    }
    let distances: Vec<f32> = view_frustum
        .planes
        .iter()
        .map(|plane| plane.plane_dot(light_origin))
        .collect();
    silhouette_hull(&view_frustum.planes, &distances, &VIEW_FRUSTUM_EDGES)
}

/// Whether `bounds` touches any of the hulls; no hulls means no culling
pub fn intersects_convex_hulls(hulls: &[ConvexVolume], bounds: &BoxSphereBounds) -> bool {
    hulls.is_empty()
        || hulls
            .iter()
            .any(|hull| hull.intersect_box(bounds.origin, bounds.box_extent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initializer::ProjectedShadowInitializer;
    use crate::light::{LightId, LightShape};
    use crate::view::ViewId;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use void_math::project_position;

    fn directional_light() -> LightSceneInfo {
        LightSceneInfo::new(
            LightId(0),
            LightShape::Directional { direction: Vec3::new(0.3, 0.2, -1.0) },
            Vec3::ZERO,
        )
    }

    fn per_object_setup(pre_shadow: bool) -> PerObjectSetup {
        PerObjectSetup {
            parent: PrimitiveId(7),
            pre_shadow,
            translucent: false,
            self_shadow_only: false,
            resolution_x: 512,
            max_resolution_y: 2048,
            border: 4,
            max_screen_percent: 1.0,
        }
    }

    fn subject() -> BoxSphereBounds {
        BoxSphereBounds::new(Vec3::new(200.0, -50.0, 30.0), Vec3::new(100.0, 40.0, 20.0), 110.0)
    }

    #[test]
    fn test_best_transform_is_minimum_over_edges() {
        let bounds = BoxSphereBounds::new(Vec3::new(5.0, 1.0, -2.0), Vec3::new(8.0, 2.0, 1.0), 8.4);
        let rotation = Mat4::from_rotation_z(0.4) * Mat4::from_rotation_x(0.3);
        let points: Vec<Vec3> = bounds.corners().iter().map(|&p| transform_position(&rotation, p)).collect();
        let z_axis = Vec3::new(0.2, 0.1, 1.0).normalize();

        let best = best_shadow_transform(z_axis, &points, &BOX_EDGES, false).unwrap();
        for &edge in &BOX_EDGES {
            let area = candidate_area(z_axis, &points, edge, false);
            if area > DELTA {
                assert!(best.projected_area <= area + AREA_IMPROVEMENT, "{} > {}", best.projected_area, area);
            }
        }
        assert!(best.aspect >= 1.0);
    }

    #[test]
    fn test_best_transform_frames_points() {
        let bounds = BoxSphereBounds::new(Vec3::new(0.0, 3.0, 0.0), Vec3::new(6.0, 1.0, 2.0), 6.4);
        let points = bounds.corners();
        let best = best_shadow_transform(Vec3::Z, &points, &BOX_EDGES, false).unwrap();
        let m = best.light_to_shadow(Vec4::new(0.0, 0.0, 0.0, 1.0));
        for p in points {
            let s = transform_position(&m, p);
            assert!(s.x.abs() <= 1.0 + 1e-4 && s.y.abs() <= 1.0 + 1e-4, "{s:?}");
        }
        assert_relative_eq!(best.aspect, 6.0, epsilon = 1e-4);
    }

    #[test]
    fn test_best_transform_rejects_degenerate_points() {
        let points = [Vec3::ONE; 8];
        assert!(best_shadow_transform(Vec3::Z, &points, &BOX_EDGES, false).is_none());
    }

    #[test]
    fn test_per_object_directional_frustums() {
        let light = directional_light();
        let initializer = light.per_object_initializer(&subject()).unwrap();
        let shadow = setup_per_object_projection(&light, &initializer, &per_object_setup(false), &ShadowConfig::default()).unwrap();

        assert_eq!(shadow.parent_primitive, Some(PrimitiveId(7)));
        assert!(shadow.directional_light);
        assert!(shadow.resolution_y >= 1 && shadow.resolution_y <= 512);
        assert!(shadow.max_subject_z > shadow.min_subject_z);

        // Frustums live in translated space
        let translated_origin = subject().origin + shadow.pre_shadow_translation;
        assert!(shadow.caster_frustum.intersect_point(translated_origin));
        assert!(shadow.receiver_frustum.intersect_point(translated_origin));
        assert!(!shadow.caster_frustum.intersect_point(translated_origin + Vec3::new(0.0, 2000.0, 0.0)));

        // Subject corners land inside the unit square
        for corner in initializer.base.subject_bounds.corners() {
            let clip = project_position(&shadow.subject_and_receiver_matrix, corner);
            assert!(clip.x.abs() <= 1.0 + 1e-3 && clip.y.abs() <= 1.0 + 1e-3);
        }
    }

    #[test]
    fn test_per_object_directional_fade() {
        let light = directional_light();
        let initializer = light.per_object_initializer(&subject()).unwrap();
        let shadow = setup_per_object_projection(&light, &initializer, &per_object_setup(false), &ShadowConfig::default()).unwrap();

        let range = shadow.max_subject_z - shadow.min_subject_z;
        assert_relative_eq!(shadow.inv_per_object_shadow_fade_length, 1.0, epsilon = 1e-4);
        assert_relative_eq!(
            shadow.per_object_shadow_fade_start,
            (HALF_WORLD_MAX / 32.0 - range) / range,
            max_relative = 1e-3
        );
    }

    #[test]
    fn test_preshadow_reaches_toward_light() {
        let light = directional_light();
        let initializer = light.per_object_initializer(&subject()).unwrap();
        let config = ShadowConfig::default();
        let regular = setup_per_object_projection(&light, &initializer, &per_object_setup(false), &config).unwrap();
        let pre = setup_per_object_projection(&light, &initializer, &per_object_setup(true), &config).unwrap();

        assert!(pre.pre_shadow);
        assert_eq!(pre.min_pre_subject_z, -HALF_WORLD_MAX);
        let toward_light = -light.direction() * 1000.0;
        assert!(pre.caster_frustum.intersect_point(toward_light));
        assert!(!regular.caster_frustum.intersect_point(toward_light));
        // Preshadows never fade per object
        assert_eq!(pre.per_object_shadow_fade_start, void_math::consts::WORLD_MAX);
    }

    #[test]
    fn test_per_object_behind_light() {
        let light = LightSceneInfo::new(LightId(0), LightShape::Point { radius: 1000.0 }, Vec3::ZERO);
        let initializer = PerObjectShadowInitializer {
            base: ProjectedShadowInitializer {
                subject_bounds: BoxSphereBounds::new(Vec3::new(-100.0, 0.0, 0.0), Vec3::splat(10.0), 17.0),
                w_axis: Vec4::new(0.0, 0.0, 1.0, 0.0),
                min_light_w: 0.1,
                max_distance_to_cast_in_light_w: 1000.0,
                ..Default::default()
            },
        };
        let result = setup_per_object_projection(&light, &initializer, &per_object_setup(false), &ShadowConfig::default());
        assert_eq!(result.unwrap_err(), ShadowError::BehindLight);
    }

    #[test]
    fn test_per_object_zero_resolution() {
        let light = directional_light();
        let initializer = light.per_object_initializer(&subject()).unwrap();
        let mut setup = per_object_setup(false);
        setup.resolution_x = 0;
        let result = setup_per_object_projection(&light, &initializer, &setup, &ShadowConfig::default());
        assert_eq!(result.unwrap_err(), ShadowError::ZeroResolution);
    }

    #[test]
    fn test_per_object_point_light() {
        let light = LightSceneInfo::new(LightId(1), LightShape::Point { radius: 2000.0 }, Vec3::new(0.0, 0.0, 500.0));
        let initializer = light.per_object_initializer(&subject()).unwrap();
        let shadow = setup_per_object_projection(&light, &initializer, &per_object_setup(false), &ShadowConfig::default()).unwrap();
        assert!(!shadow.directional_light);
        assert_eq!(shadow.per_object_shadow_fade_start, void_math::consts::WORLD_MAX);
        assert!(shadow.caster_frustum.intersect_point(subject().origin + shadow.pre_shadow_translation));
    }

    #[test]
    fn test_one_pass_point_light_faces() {
        let light = LightSceneInfo::new(LightId(2), LightShape::Point { radius: 500.0 }, Vec3::new(100.0, 0.0, 0.0));
        let initializer = light.whole_scene_initializers().remove(0);
        let setup = WholeSceneSetup {
            dependent_view: None,
            resolution_x: 512,
            resolution_y: 512,
            border: 4,
            reflective: false,
        };
        let shadow = setup_whole_scene_projection(&light, &initializer, &setup, &ShadowConfig::default()).unwrap();

        assert!(shadow.one_pass_point_light_shadow);
        assert_eq!(shadow.border_size, 0);
        assert_eq!(shadow.one_pass_shadow_view_projection_matrices.len(), 6);
        assert_eq!(shadow.one_pass_shadow_frustums.len(), 6);
        assert_eq!(shadow.caster_frustum.planes.len(), 6);
        assert_abs_diff_eq!(shadow.inv_max_subject_depth, 1.0 / 500.0);

        // Caster frustum is the light's cube in light-relative space
        assert!(shadow.caster_frustum.intersect_point(Vec3::new(400.0, 0.0, 0.0) + shadow.pre_shadow_translation));
        assert!(!shadow.caster_frustum.intersect_point(Vec3::new(700.0, 0.0, 0.0) + shadow.pre_shadow_translation));

        // Each face looks along its direction
        let inside = project_position(&shadow.one_pass_shadow_view_projection_matrices[1], Vec3::new(100.0, 10.0, 5.0));
        assert!(inside.x.abs() <= 1.0 && inside.y.abs() <= 1.0 && inside.z > 0.0 && inside.z < 1.0);
    }

    #[test]
    fn test_spot_whole_scene_projection() {
        let light = LightSceneInfo::new(
            LightId(3),
            LightShape::Spot { direction: Vec3::NEG_Z, radius: 1000.0, outer_cone_angle: 0.6 },
            Vec3::new(0.0, 0.0, 800.0),
        );
        let initializer = light.whole_scene_initializers().remove(0);
        let setup = WholeSceneSetup {
            dependent_view: None,
            resolution_x: 256,
            resolution_y: 256,
            border: 4,
            reflective: false,
        };
        let shadow = setup_whole_scene_projection(&light, &initializer, &setup, &ShadowConfig::default()).unwrap();
        assert!(shadow.whole_scene_shadow && !shadow.directional_light);
        assert!(shadow.caster_frustum.intersect_point(Vec3::new(0.0, 0.0, 300.0) + shadow.pre_shadow_translation));
        assert!(!shadow.caster_frustum.intersect_point(Vec3::new(0.0, 0.0, 1200.0) + shadow.pre_shadow_translation));
    }

    #[test]
    fn test_directional_snap_lands_on_grid() {
        let light = directional_light();
        let view = ShadowView::perspective(
            ViewId(0),
            Vec3::new(13.7, -4.2, 100.0),
            Vec3::X,
            Vec3::Z,
            FRAC_PI_4,
            (1280, 720),
            10.0,
            50_000.0,
        );
        let config = ShadowConfig::default();
        let initializer = light.view_dependent_initializer(&view, 0, &config).unwrap();
        let setup = WholeSceneSetup {
            dependent_view: Some(&view),
            resolution_x: 1024,
            resolution_y: 1024,
            border: 4,
            reflective: false,
        };
        let shadow = setup_whole_scene_projection(&light, &initializer, &setup, &config).unwrap();

        assert_eq!(shadow.dependent_view, Some(ViewId(0)));
        assert!(shadow.max_subject_z >= DIRECTIONAL_DEPTH_RANGE_CLAMP);
        assert!(shadow.min_subject_z <= -DIRECTIONAL_DEPTH_RANGE_CLAMP);

        let grid = 2.0 * config.max_kernel_downsample as f32 / 1024.0;
        let face = transform_position(&whole_scene_world_to_face(&initializer), -shadow.pre_shadow_translation);
        for value in [face.x, face.y] {
            let remainder = (value % grid).abs();
            assert!(remainder < 1e-3 * grid.max(1.0) || (grid - remainder) < 1e-3, "{value} {remainder}");
        }
    }

    #[test]
    fn test_light_view_hull_contains_shadow_path() {
        let view = ShadowView::perspective(ViewId(0), Vec3::ZERO, Vec3::X, Vec3::Z, FRAC_PI_4, (800, 800), 10.0, 5000.0);
        let hull = build_light_view_convex_hull(Vec3::new(500.0, 0.0, 5000.0), &view.view_frustum_without_near());
        assert!(!hull.is_empty());
        assert!(hull.intersect_point(Vec3::new(1000.0, 0.0, 0.0)));
        assert!(hull.intersect_point(Vec3::new(1000.0, 0.0, 2500.0)));
        assert!(!hull.intersect_point(Vec3::new(-2000.0, 0.0, -2000.0)));
    }

    #[test]
    fn test_intersects_convex_hulls() {
        let bounds = BoxSphereBounds::new(Vec3::new(50.0, 0.0, 0.0), Vec3::ONE, 1.8);
        assert!(intersects_convex_hulls(&[], &bounds));

        let hull = ConvexVolume::new(vec![Plane::new(Vec3::X, 10.0)]);
        assert!(!intersects_convex_hulls(&[hull.clone()], &bounds));
        assert!(intersects_convex_hulls(&[hull], &BoxSphereBounds::new(Vec3::ZERO, Vec3::ONE, 1.8)));
    }
}
