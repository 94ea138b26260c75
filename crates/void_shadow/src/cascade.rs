//! Cascaded Shadow Map Calculations
//!
//! Cascade split distances and per-cascade culling bounds for directional
//! light shadows.
//!
//! # Cascade Shadow Maps (CSM)
//!
//! CSM divides the view frustum into multiple depth slices (cascades) and
//! renders a separate shadow map for each. Near cascades get more texels per
//! unit of screen space, which keeps shadows sharp near the camera.

use glam::Vec3;
use void_math::{ConvexVolume, Plane, Sphere};

use crate::projection::silhouette_hull;
use crate::view::ShadowView;

/// Maximum supported cascade count
pub const MAX_CASCADES: usize = 4;

/// Fraction of each slice over which a cascade fades into the next one
pub const CASCADE_FADE_FRACTION: f32 = 0.1;

/// Edges of a six-plane slice frustum, by `ConvexVolume` plane index
const SLICE_EDGES: [(usize, usize); 12] = [
    (ConvexVolume::NEAR, ConvexVolume::LEFT),
    (ConvexVolume::NEAR, ConvexVolume::RIGHT),
    (ConvexVolume::NEAR, ConvexVolume::TOP),
    (ConvexVolume::NEAR, ConvexVolume::BOTTOM),
    (ConvexVolume::FAR, ConvexVolume::LEFT),
    (ConvexVolume::FAR, ConvexVolume::RIGHT),
    (ConvexVolume::FAR, ConvexVolume::TOP),
    (ConvexVolume::FAR, ConvexVolume::BOTTOM),
    (ConvexVolume::LEFT, ConvexVolume::TOP),
    (ConvexVolume::LEFT, ConvexVolume::BOTTOM),
    (ConvexVolume::RIGHT, ConvexVolume::TOP),
    (ConvexVolume::RIGHT, ConvexVolume::BOTTOM),
];

/// Per-cascade data carried by a view-dependent whole-scene shadow
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CascadeSettings {
    /// Cascade index within the light, increasing with distance
    pub shadow_split_index: u32,
    /// View-space depth where the cascade starts
    pub split_near: f32,
    /// View-space depth where the cascade ends
    pub split_far: f32,
    /// Depth where fading into the next cascade starts
    pub fade_plane_offset: f32,
    /// Depth range of that fade
    pub fade_plane_length: f32,
    /// The slice frustum extruded toward the light; anything outside it
    /// cannot cast into the cascade
    pub shadow_bounds_accurate: ConvexVolume,
}

impl CascadeSettings {
    /// Settings for cascade `index` of a light shining along `light_direction`
    pub fn new(view: &ShadowView, index: u32, split_near: f32, split_far: f32, light_direction: Vec3) -> Self {
        let fade_plane_length = (split_far - split_near) * CASCADE_FADE_FRACTION;
        Self {
            shadow_split_index: index,
            split_near,
            split_far,
            fade_plane_offset: split_far - fade_plane_length,
            fade_plane_length,
            shadow_bounds_accurate: extruded_slice_volume(view, split_near, split_far, light_direction),
        }
    }
}

/// Calculate cascade splits using the practical split scheme
///
/// This blends between logarithmic and linear splits based on lambda:
/// - lambda = 0: Linear splits (uniform in view space)
/// - lambda = 1: Logarithmic splits (uniform in screen space)
///
/// Returns `count + 1` distances from `near` to `far`.
pub fn calculate_splits(near: f32, far: f32, cascade_count: u32, lambda: f32) -> Vec<f32> {
    let count = cascade_count.clamp(1, MAX_CASCADES as u32) as usize;
    let lambda = lambda.clamp(0.0, 1.0);
    let near = near.max(1e-3);

    (0..=count)
        .map(|i| {
            let p = i as f32 / count as f32;
            let log_split = near * (far / near).powf(p);
            let lin_split = near + (far - near) * p;
            lambda * log_split + (1.0 - lambda) * lin_split
        })
        .collect()
}

/// Bounding sphere of the view frustum slice between two depths
pub fn split_bounds(view: &ShadowView, split_near: f32, split_far: f32) -> Sphere {
    Sphere::from_points(&view.slice_corners(split_near, split_far))
}

/// The slice frustum between two depths, extended backwards along the light
/// direction so that it contains every point able to shadow the slice.
pub fn extruded_slice_volume(
    view: &ShadowView,
    split_near: f32,
    split_far: f32,
    light_direction: Vec3,
) -> ConvexVolume {
    let sides = view.view_frustum_without_near();
    if sides.planes.len() < 4 {
        return ConvexVolume::default();
    }

    let mut planes = sides.planes[..4].to_vec();
    let forward = view.forward;
    planes.push(Plane::from_point_normal(view.origin + forward * split_far, forward));
    planes.push(Plane::from_point_normal(view.origin + forward * split_near, -forward));

    // A direction is a point at infinity: its plane distance is -n.dir
    let direction = light_direction.normalize_or_zero();
    let distances: Vec<f32> = planes.iter().map(|plane| -plane.normal.dot(direction)).collect();
    silhouette_hull(&planes, &distances, &SLICE_EDGES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::ViewId;
    use approx::assert_relative_eq;

    fn test_view() -> ShadowView {
        ShadowView::perspective(
            ViewId(0),
            Vec3::ZERO,
            Vec3::X,
            Vec3::Z,
            std::f32::consts::FRAC_PI_4,
            (1280, 720),
            10.0,
            100_000.0,
        )
    }

    #[test]
    fn test_cascade_splits_linear() {
        let splits = calculate_splits(0.1, 100.0, 4, 0.0);

        assert_eq!(splits.len(), 5);
        assert_relative_eq!(splits[0], 0.1, epsilon = 1e-3);
        assert_relative_eq!(splits[1], 25.075, epsilon = 0.1);
        assert_relative_eq!(splits[2], 50.05, epsilon = 0.1);
        assert_relative_eq!(splits[4], 100.0, epsilon = 1e-3);
    }

    #[test]
    fn test_cascade_splits_logarithmic() {
        let splits = calculate_splits(0.1, 100.0, 4, 1.0);

        let r1 = splits[1] / splits[0];
        let r2 = splits[2] / splits[1];
        assert_relative_eq!(r1, r2, epsilon = 0.1);
    }

    #[test]
    fn test_cascade_splits_ordered() {
        let splits = calculate_splits(10.0, 20000.0, 3, 0.8);
        assert_eq!(splits.len(), 4);
        for pair in splits.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_split_bounds_contains_slice() {
        let view = test_view();
        let bounds = split_bounds(&view, 100.0, 500.0);
        for corner in view.slice_corners(100.0, 500.0) {
            assert!(bounds.contains_point(corner) || corner.distance(bounds.center) - bounds.radius < 1e-2);
        }
    }

    #[test]
    fn test_extruded_volume_reaches_toward_light() {
        let view = test_view();
        // Light shining straight down
        let volume = extruded_slice_volume(&view, 100.0, 500.0, -Vec3::Z);

        // Inside the slice
        assert!(volume.intersect_point(Vec3::new(300.0, 0.0, 0.0)));
        // High above the slice, between it and the light
        assert!(volume.intersect_point(Vec3::new(300.0, 0.0, 5000.0)));
        // Below the slice, on the far side from the light
        assert!(!volume.intersect_point(Vec3::new(300.0, 0.0, -5000.0)));
        // Beyond the far split
        assert!(!volume.intersect_point(Vec3::new(900.0, 0.0, 0.0)));
        // Behind the camera
        assert!(!volume.intersect_point(Vec3::new(-50.0, 0.0, 0.0)));
    }

    #[test]
    fn test_cascade_settings_fade_region() {
        let view = test_view();
        let settings = CascadeSettings::new(&view, 1, 100.0, 600.0, -Vec3::Z);
        assert_eq!(settings.shadow_split_index, 1);
        assert_relative_eq!(settings.fade_plane_length, 50.0);
        assert_relative_eq!(settings.fade_plane_offset, 550.0);
        assert!(!settings.shadow_bounds_accurate.is_empty());
    }
}
