//! Bounding volumes for spatial queries and shadow culling

use glam::{Mat4, Vec3};

use crate::matrix::transform_position;

/// Axis-Aligned Bounding Box
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AABB {
    pub min: Vec3,
    pub max: Vec3,
}

impl AABB {
    /// Create an empty (inverted) AABB
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(f32::MIN),
    };

    /// Create from min and max points
    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create from center and half-extents
    #[inline]
    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    /// Create from a set of points
    pub fn from_points(points: &[Vec3]) -> Self {
        points
            .iter()
            .fold(Self::EMPTY, |aabb, &point| aabb.expand_to_include(point))
    }

    /// Get the center point
    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the half-extents
    #[inline]
    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Check if the AABB is empty (inverted)
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Expand to include a point
    #[inline]
    pub fn expand_to_include(self, point: Vec3) -> Self {
        Self {
            min: self.min.min(point),
            max: self.max.max(point),
        }
    }

    /// Union of two AABBs
    #[inline]
    pub fn union(&self, other: &AABB) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Check if a point is inside
    #[inline]
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    /// Check if two AABBs intersect
    #[inline]
    pub fn intersects(&self, other: &AABB) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// Transform the box by the affine part of a matrix.
    ///
    /// Projective matrices are applied without the w divide, which is what
    /// depth range extraction from shadow matrices expects.
    pub fn transform_by(&self, matrix: &Mat4) -> Self {
        self.corners()
            .iter()
            .fold(Self::EMPTY, |aabb, &corner| {
                aabb.expand_to_include(transform_position(matrix, corner))
            })
    }

    /// Get the 8 corners of the AABB
    pub fn corners(&self) -> [Vec3; 8] {
        [
            Vec3::new(self.min.x, self.min.y, self.min.z),
            Vec3::new(self.max.x, self.min.y, self.min.z),
            Vec3::new(self.min.x, self.max.y, self.min.z),
            Vec3::new(self.max.x, self.max.y, self.min.z),
            Vec3::new(self.min.x, self.min.y, self.max.z),
            Vec3::new(self.max.x, self.min.y, self.max.z),
            Vec3::new(self.min.x, self.max.y, self.max.z),
            Vec3::new(self.max.x, self.max.y, self.max.z),
        ]
    }
}

impl Default for AABB {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Bounding sphere
#[derive(Clone, Copy, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

impl Sphere {
    #[inline]
    pub const fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    /// Smallest sphere around the centroid of `points` that encloses them all
    pub fn from_points(points: &[Vec3]) -> Self {
        if points.is_empty() {
            return Self::default();
        }
        let center = points.iter().fold(Vec3::ZERO, |acc, &p| acc + p) / points.len() as f32;
        let radius = points
            .iter()
            .map(|p| p.distance(center))
            .fold(0.0f32, f32::max);
        Self { center, radius }
    }

    /// Whether this sphere lies inside `other`, allowing `other` to grow by
    /// `tolerance` as a fraction of its radius.
    #[inline]
    pub fn is_inside(&self, other: &Sphere, tolerance: f32) -> bool {
        let allowed = other.radius * (1.0 + tolerance) - self.radius;
        allowed >= 0.0 && self.center.distance_squared(other.center) <= allowed * allowed
    }

    #[inline]
    pub fn intersects(&self, other: &Sphere) -> bool {
        let radii = self.radius + other.radius;
        self.center.distance_squared(other.center) <= radii * radii
    }

    #[inline]
    pub fn contains_point(&self, point: Vec3) -> bool {
        self.center.distance_squared(point) <= self.radius * self.radius
    }
}

/// Combined box and sphere bounds sharing one origin.
///
/// Primitive bounds are stored this way so that culling can pick the
/// cheaper or the tighter test per query.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoxSphereBounds {
    pub origin: Vec3,
    pub box_extent: Vec3,
    pub sphere_radius: f32,
}

impl BoxSphereBounds {
    #[inline]
    pub const fn new(origin: Vec3, box_extent: Vec3, sphere_radius: f32) -> Self {
        Self {
            origin,
            box_extent,
            sphere_radius,
        }
    }

    /// Bounds of an axis-aligned box, with the sphere enclosing the box
    pub fn from_box(aabb: &AABB) -> Self {
        let extent = aabb.half_extents();
        Self {
            origin: aabb.center(),
            box_extent: extent,
            sphere_radius: extent.length(),
        }
    }

    /// Bounds of a sphere, with the box enclosing the sphere
    pub fn from_sphere(sphere: &Sphere) -> Self {
        Self {
            origin: sphere.center,
            box_extent: Vec3::splat(sphere.radius),
            sphere_radius: sphere.radius,
        }
    }

    /// Unit bounds at the world origin, used as a stand-in for corrupt data
    pub const fn unit() -> Self {
        Self::new(Vec3::ZERO, Vec3::ONE, 1.0)
    }

    pub fn contains_nan(&self) -> bool {
        self.origin.is_nan() || self.box_extent.is_nan() || self.sphere_radius.is_nan()
    }

    #[inline]
    pub fn min(&self) -> Vec3 {
        self.origin - self.box_extent
    }

    #[inline]
    pub fn max(&self) -> Vec3 {
        self.origin + self.box_extent
    }

    #[inline]
    pub fn get_box(&self) -> AABB {
        AABB::new(self.min(), self.max())
    }

    #[inline]
    pub fn sphere(&self) -> Sphere {
        Sphere::new(self.origin, self.sphere_radius)
    }

    /// Box corner by index `x * 4 + y * 2 + z`; a set bit selects the min
    /// side of that axis, a clear bit the max side.
    pub fn corner(&self, index: usize) -> Vec3 {
        let pick = |bit: usize, axis: usize| {
            if index & bit != 0 {
                self.origin[axis] - self.box_extent[axis]
            } else {
                self.origin[axis] + self.box_extent[axis]
            }
        };
        Vec3::new(pick(4, 0), pick(2, 1), pick(1, 2))
    }

    /// All 8 corners in `corner` index order
    pub fn corners(&self) -> [Vec3; 8] {
        std::array::from_fn(|i| self.corner(i))
    }

    /// Grow the box by `fraction` of its extent and the sphere by the
    /// length of that growth.
    pub fn expand_by_fraction(&self, fraction: f32) -> Self {
        let growth = self.box_extent * fraction;
        Self {
            origin: self.origin,
            box_extent: self.box_extent + growth,
            sphere_radius: self.sphere_radius + growth.length(),
        }
    }

    /// Bounds enclosing both inputs
    pub fn union(&self, other: &BoxSphereBounds) -> Self {
        let aabb = self.get_box().union(&other.get_box());
        let origin = aabb.center();
        let radius = (origin.distance(self.origin) + self.sphere_radius)
            .max(origin.distance(other.origin) + other.sphere_radius);
        Self {
            origin,
            box_extent: aabb.half_extents(),
            sphere_radius: radius.min(aabb.half_extents().length()),
        }
    }
}

impl Default for BoxSphereBounds {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Vec3::ZERO, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_aabb_contains_point() {
        let aabb = AABB::new(Vec3::ZERO, Vec3::ONE);
        assert!(aabb.contains_point(Vec3::splat(0.5)));
        assert!(!aabb.contains_point(Vec3::splat(1.5)));
    }

    #[test]
    fn test_aabb_transform_translation() {
        let aabb = AABB::new(Vec3::ZERO, Vec3::ONE);
        let moved = aabb.transform_by(&Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)));
        assert_relative_eq!(moved.min.x, 10.0);
        assert_relative_eq!(moved.max.x, 11.0);
        assert_relative_eq!(moved.max.y, 1.0);
    }

    #[test]
    fn test_corner_index_selects_min_on_set_bits() {
        let bounds = BoxSphereBounds::new(Vec3::ZERO, Vec3::new(1.0, 2.0, 3.0), 4.0);
        assert_eq!(bounds.corner(0), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(bounds.corner(7), Vec3::new(-1.0, -2.0, -3.0));
        assert_eq!(bounds.corner(4), Vec3::new(-1.0, 2.0, 3.0));
        assert_eq!(bounds.corner(1), Vec3::new(1.0, 2.0, -3.0));
    }

    #[test]
    fn test_sphere_inside_with_tolerance() {
        let cached = Sphere::new(Vec3::ZERO, 100.0);
        let query = Sphere::new(Vec3::new(3.0, 0.0, 0.0), 100.0);
        assert!(!query.is_inside(&cached, 0.0));
        assert!(query.is_inside(&cached, 0.04));
        assert!(!Sphere::new(Vec3::new(10.0, 0.0, 0.0), 100.0).is_inside(&cached, 0.04));
    }

    #[test]
    fn test_expand_by_fraction() {
        let bounds = BoxSphereBounds::new(Vec3::ZERO, Vec3::new(10.0, 0.0, 0.0), 10.0);
        let expanded = bounds.expand_by_fraction(0.15);
        assert_relative_eq!(expanded.box_extent.x, 11.5);
        assert_relative_eq!(expanded.sphere_radius, 11.5);
    }

    #[test]
    fn test_contains_nan() {
        let bad = BoxSphereBounds::new(Vec3::new(f32::NAN, 0.0, 0.0), Vec3::ONE, 1.0);
        assert!(bad.contains_nan());
        assert!(!BoxSphereBounds::unit().contains_nan());
    }

    #[test]
    fn test_bounding_sphere_of_cube() {
        let aabb = AABB::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let sphere = Sphere::from_points(&aabb.corners());
        assert_relative_eq!(sphere.center.length(), 0.0);
        assert_relative_eq!(sphere.radius, 3.0f32.sqrt(), epsilon = 1e-5);
    }
}
