//! Convex volumes for shadow caster and receiver culling
//!
//! Planes face outward: a point is outside the volume as soon as its
//! `plane_dot` against any plane is positive.

use std::ops::{Add, Mul, Neg, Sub};

use glam::{Mat4, Vec3, Vec4};

use crate::bounds::{BoxSphereBounds, Sphere};

/// Plane `normal . p = w`
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Plane {
    pub normal: Vec3,
    pub w: f32,
}

impl Plane {
    #[inline]
    pub const fn new(normal: Vec3, w: f32) -> Self {
        Self { normal, w }
    }

    /// Plane from `a*x + b*y + c*z + d <= 0` inside-coefficients, normalized.
    ///
    /// Returns `None` when the coefficients have no usable normal.
    pub fn from_coefficients(coefficients: Vec4) -> Option<Self> {
        Self::new(coefficients.truncate(), -coefficients.w).normalized()
    }

    /// Plane through `point` facing along `normal`
    pub fn from_point_normal(point: Vec3, normal: Vec3) -> Self {
        let normal = normal.normalize_or_zero();
        Self {
            normal,
            w: normal.dot(point),
        }
    }

    /// Signed distance, positive on the outside
    #[inline]
    pub fn plane_dot(&self, point: Vec3) -> f32 {
        self.normal.dot(point) - self.w
    }

    /// Scale to a unit normal
    pub fn normalized(&self) -> Option<Self> {
        let len = self.normal.length();
        if len > 1e-8 {
            Some(Self {
                normal: self.normal / len,
                w: self.w / len,
            })
        } else {
            None
        }
    }

    /// Plane flipped to face the other way
    #[inline]
    pub fn flip(&self) -> Self {
        -*self
    }
}

impl Default for Plane {
    fn default() -> Self {
        Self {
            normal: Vec3::Z,
            w: 0.0,
        }
    }
}

impl Add for Plane {
    type Output = Plane;

    fn add(self, rhs: Plane) -> Plane {
        Plane::new(self.normal + rhs.normal, self.w + rhs.w)
    }
}

impl Sub for Plane {
    type Output = Plane;

    fn sub(self, rhs: Plane) -> Plane {
        Plane::new(self.normal - rhs.normal, self.w - rhs.w)
    }
}

impl Mul<f32> for Plane {
    type Output = Plane;

    fn mul(self, rhs: f32) -> Plane {
        Plane::new(self.normal * rhs, self.w * rhs)
    }
}

impl Neg for Plane {
    type Output = Plane;

    fn neg(self) -> Plane {
        Plane::new(-self.normal, -self.w)
    }
}

/// Result of frustum containment test
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrustumTestResult {
    /// Object is completely inside the volume
    Inside,
    /// Object is completely outside the volume
    Outside,
    /// Object intersects the volume boundary
    Intersecting,
}

impl FrustumTestResult {
    /// Check if the object is at least partially visible
    #[inline]
    pub fn is_visible(&self) -> bool {
        *self != FrustumTestResult::Outside
    }
}

/// Intersection of half-spaces.
///
/// An empty plane set is unbounded and intersects everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConvexVolume {
    pub planes: Vec<Plane>,
}

impl ConvexVolume {
    /// Plane order produced by `from_view_projection`
    pub const LEFT: usize = 0;
    pub const RIGHT: usize = 1;
    pub const TOP: usize = 2;
    pub const BOTTOM: usize = 3;
    pub const FAR: usize = 4;
    pub const NEAR: usize = 5;

    pub fn new(planes: Vec<Plane>) -> Self {
        Self { planes }
    }

    /// Extract the bounding planes of `clip = m * p`, for clip space
    /// `-w <= x, y <= w` and `0 <= z <= w`.
    ///
    /// Planes come out as left, right, top, bottom, far and, if requested,
    /// near. Degenerate rows (such as the far plane of an infinite
    /// projection) are skipped.
    pub fn from_view_projection(m: &Mat4, use_near_plane: bool) -> Self {
        let (r0, r1, r2, r3) = (m.row(0), m.row(1), m.row(2), m.row(3));

        let mut coefficients = vec![-(r0 + r3), r0 - r3, r1 - r3, -(r1 + r3), r2 - r3];
        if use_near_plane {
            coefficients.push(-r2);
        }

        Self {
            planes: coefficients
                .into_iter()
                .filter_map(Plane::from_coefficients)
                .collect(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    #[inline]
    pub fn intersect_point(&self, point: Vec3) -> bool {
        self.planes.iter().all(|plane| plane.plane_dot(point) <= 0.0)
    }

    #[inline]
    pub fn intersect_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes.iter().all(|plane| plane.plane_dot(center) <= radius)
    }

    /// Conservative box test: rejects only boxes fully outside one plane
    #[inline]
    pub fn intersect_box(&self, origin: Vec3, extent: Vec3) -> bool {
        self.planes.iter().all(|plane| {
            let push_out = plane.normal.abs().dot(extent);
            plane.plane_dot(origin) <= push_out
        })
    }

    /// Box test with the box moved by `translation` first, used for volumes
    /// built in pre-translated shadow space.
    #[inline]
    pub fn intersect_box_translated(&self, origin: Vec3, translation: Vec3, extent: Vec3) -> bool {
        self.intersect_box(origin + translation, extent)
    }

    #[inline]
    pub fn intersect_bounds(&self, bounds: &BoxSphereBounds) -> bool {
        self.intersect_box(bounds.origin, bounds.box_extent)
    }

    /// Classify a sphere against the volume
    pub fn classify_sphere(&self, sphere: &Sphere) -> FrustumTestResult {
        let mut result = FrustumTestResult::Inside;
        for plane in &self.planes {
            let distance = plane.plane_dot(sphere.center);
            if distance > sphere.radius {
                return FrustumTestResult::Outside;
            }
            if distance > -sphere.radius {
                result = FrustumTestResult::Intersecting;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{perspective, shadow_projection};

    fn unit_box_volume() -> ConvexVolume {
        ConvexVolume::new(vec![
            Plane::new(Vec3::X, 1.0),
            Plane::new(-Vec3::X, 1.0),
            Plane::new(Vec3::Y, 1.0),
            Plane::new(-Vec3::Y, 1.0),
            Plane::new(Vec3::Z, 1.0),
            Plane::new(-Vec3::Z, 1.0),
        ])
    }

    #[test]
    fn test_empty_volume_intersects_everything() {
        let volume = ConvexVolume::default();
        assert!(volume.intersect_box(Vec3::splat(1e6), Vec3::ONE));
        assert!(volume.intersect_sphere(Vec3::splat(-1e6), 0.0));
    }

    #[test]
    fn test_intersect_box() {
        let volume = unit_box_volume();
        assert!(volume.intersect_box(Vec3::ZERO, Vec3::splat(0.5)));
        assert!(volume.intersect_box(Vec3::new(1.4, 0.0, 0.0), Vec3::splat(0.5)));
        assert!(!volume.intersect_box(Vec3::new(1.6, 0.0, 0.0), Vec3::splat(0.5)));
    }

    #[test]
    fn test_intersect_box_translated() {
        let volume = unit_box_volume();
        let origin = Vec3::new(100.0, 0.0, 0.0);
        assert!(!volume.intersect_box(origin, Vec3::splat(0.5)));
        assert!(volume.intersect_box_translated(origin, Vec3::new(-100.0, 0.0, 0.0), Vec3::splat(0.5)));
    }

    #[test]
    fn test_classify_sphere() {
        let volume = unit_box_volume();
        assert_eq!(volume.classify_sphere(&Sphere::new(Vec3::ZERO, 0.5)), FrustumTestResult::Inside);
        assert_eq!(
            volume.classify_sphere(&Sphere::new(Vec3::new(1.0, 0.0, 0.0), 0.5)),
            FrustumTestResult::Intersecting
        );
        assert!(!volume.classify_sphere(&Sphere::new(Vec3::new(3.0, 0.0, 0.0), 0.5)).is_visible());
    }

    #[test]
    fn test_from_orthographic_shadow_projection() {
        let m = shadow_projection(0.0, 10.0, Vec4::new(0.0, 0.0, 0.0, 1.0));
        let volume = ConvexVolume::from_view_projection(&m, true);
        assert_eq!(volume.planes.len(), 6);
        assert!(volume.intersect_point(Vec3::new(0.5, -0.5, 5.0)));
        assert!(!volume.intersect_point(Vec3::new(1.5, 0.0, 5.0)));
        assert!(!volume.intersect_point(Vec3::new(0.0, 0.0, 11.0)));
        assert!(!volume.intersect_point(Vec3::new(0.0, 0.0, -1.0)));
    }

    #[test]
    fn test_from_perspective_without_near_plane() {
        let m = perspective(std::f32::consts::FRAC_PI_4, 1.0, 1.0, 1.0, 100.0);
        let volume = ConvexVolume::from_view_projection(&m, false);
        assert_eq!(volume.planes.len(), 5);
        assert!(volume.intersect_point(Vec3::new(0.0, 0.0, 50.0)));
        // Behind the near plane but inside the side planes' apex region.
        assert!(volume.intersect_point(Vec3::new(0.0, 0.0, 0.5)));
        assert!(!volume.intersect_point(Vec3::new(60.0, 0.0, 50.0)));
        assert!(!volume.intersect_point(Vec3::new(0.0, 0.0, 150.0)));
    }

    #[test]
    fn test_plane_combination() {
        let a = Plane::new(Vec3::X, 1.0);
        let b = Plane::new(Vec3::Y, 2.0);
        let c = a * 2.0 - b;
        assert_eq!(c.normal, Vec3::new(2.0, -1.0, 0.0));
        assert_eq!(c.w, 0.0);
        assert_eq!(c.flip().normal, Vec3::new(-2.0, 1.0, 0.0));
    }
}
