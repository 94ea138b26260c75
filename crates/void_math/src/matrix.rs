//! Projection and basis matrices used by shadow setup
//!
//! All matrices follow glam's column-vector convention: a point is
//! transformed as `m * p`, and "apply `a`, then `b`" composes as `b * a`.

use glam::{Mat4, Vec3, Vec4};

/// Transform a position by the affine part of `m`, ignoring the output w.
#[inline]
pub fn transform_position(m: &Mat4, p: Vec3) -> Vec3 {
    (*m * p.extend(1.0)).truncate()
}

/// Transform a position and divide by the output w.
#[inline]
pub fn project_position(m: &Mat4, p: Vec3) -> Vec3 {
    let v = *m * p.extend(1.0);
    v.truncate() / v.w
}

/// Depth-range projection used by every shadow map.
///
/// X and Y pass through untouched, W is `w_axis . (x, y, z, 1)` and Z is
/// remapped so that `min_z` lands on 0 and `max_z` on W. An orthographic
/// shadow uses `w_axis = (0, 0, 0, 1)`, a perspective one `(0, 0, 1, 0)`.
pub fn shadow_projection(min_z: f32, max_z: f32, w_axis: Vec4) -> Mat4 {
    let z_scale = (w_axis.z * max_z + w_axis.w) / (max_z - min_z);
    Mat4::from_cols(
        Vec4::new(1.0, 0.0, 0.0, w_axis.x),
        Vec4::new(0.0, 1.0, 0.0, w_axis.y),
        Vec4::new(0.0, 0.0, z_scale, w_axis.z),
        Vec4::new(0.0, 0.0, -min_z * z_scale, w_axis.w),
    )
}

/// Change of basis: `p -> ((p - origin) . x, (p - origin) . y, (p - origin) . z)`.
pub fn basis_vectors(x: Vec3, y: Vec3, z: Vec3, origin: Vec3) -> Mat4 {
    Mat4::from_cols(
        Vec4::new(x.x, y.x, z.x, 0.0),
        Vec4::new(x.y, y.y, z.y, 0.0),
        Vec4::new(x.z, y.z, z.z, 0.0),
        Vec4::new(-origin.dot(x), -origin.dot(y), -origin.dot(z), 1.0),
    )
}

/// Two unit axes perpendicular to `dir` and to each other.
pub fn find_best_axis_vectors(dir: Vec3) -> (Vec3, Vec3) {
    let n = dir.abs();
    let seed = if n.z > n.x && n.z > n.y { Vec3::X } else { Vec3::Z };
    let axis1 = (seed - dir * seed.dot(dir)).normalize_or_zero();
    let axis2 = axis1.cross(dir);
    (axis1, axis2)
}

/// Rotation taking `dir` onto +X.
pub fn rotation_to_x_axis(dir: Vec3) -> Mat4 {
    let x = dir.normalize_or_zero();
    let (y, z) = find_best_axis_vectors(x);
    basis_vectors(x, y, z, Vec3::ZERO)
}

/// View matrix placed at `eye` looking along `dir`, with +Z forward.
pub fn look_from(eye: Vec3, dir: Vec3, up: Vec3) -> Mat4 {
    let z = dir.normalize_or_zero();
    let x = up.cross(z).normalize_or_zero();
    let y = z.cross(x);
    basis_vectors(x, y, z, eye)
}

/// Left-handed perspective with depth in `[0, w]`.
pub fn perspective(half_fov: f32, width: f32, height: f32, min_z: f32, max_z: f32) -> Mat4 {
    let inv_tan = 1.0 / half_fov.tan();
    let depth = max_z / (max_z - min_z);
    Mat4::from_cols(
        Vec4::new(inv_tan, 0.0, 0.0, 0.0),
        Vec4::new(0.0, inv_tan * width / height, 0.0, 0.0),
        Vec4::new(0.0, 0.0, depth, 1.0),
        Vec4::new(0.0, 0.0, -min_z * depth, 0.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn test_shadow_projection_orthographic_depth_range() {
        let m = shadow_projection(10.0, 30.0, Vec4::new(0.0, 0.0, 0.0, 1.0));
        assert_abs_diff_eq!(project_position(&m, Vec3::new(0.0, 0.0, 10.0)).z, 0.0);
        assert_abs_diff_eq!(project_position(&m, Vec3::new(0.0, 0.0, 30.0)).z, 1.0);
        assert_abs_diff_eq!(project_position(&m, Vec3::new(0.0, 0.0, 20.0)).z, 0.5);
        assert_relative_eq!(project_position(&m, Vec3::new(3.0, -2.0, 20.0)).x, 3.0);
    }

    #[test]
    fn test_shadow_projection_perspective_depth_range() {
        let m = shadow_projection(1.0, 100.0, Vec4::new(0.0, 0.0, 1.0, 0.0));
        assert_abs_diff_eq!(project_position(&m, Vec3::new(0.0, 0.0, 1.0)).z, 0.0);
        assert_abs_diff_eq!(project_position(&m, Vec3::new(0.0, 0.0, 100.0)).z, 1.0, epsilon = 1e-5);
        assert_relative_eq!(project_position(&m, Vec3::new(4.0, 0.0, 2.0)).x, 2.0);
    }

    #[test]
    fn test_basis_vectors_maps_origin() {
        let m = basis_vectors(Vec3::Y, Vec3::Z, Vec3::X, Vec3::new(1.0, 2.0, 3.0));
        let p = transform_position(&m, Vec3::new(2.0, 2.0, 3.0));
        assert_abs_diff_eq!(p.x, 0.0);
        assert_abs_diff_eq!(p.y, 0.0);
        assert_abs_diff_eq!(p.z, 1.0);
    }

    #[test]
    fn test_best_axis_vectors_are_orthonormal() {
        for dir in [Vec3::X, Vec3::Z, Vec3::new(1.0, 2.0, -3.0).normalize()] {
            let (a, b) = find_best_axis_vectors(dir);
            assert_abs_diff_eq!(a.dot(dir), 0.0, epsilon = 1e-5);
            assert_abs_diff_eq!(b.dot(dir), 0.0, epsilon = 1e-5);
            assert_abs_diff_eq!(a.dot(b), 0.0, epsilon = 1e-5);
            assert_relative_eq!(a.length(), 1.0, epsilon = 1e-5);
            assert_relative_eq!(b.length(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_rotation_to_x_axis() {
        let dir = Vec3::new(0.0, -1.0, 1.0).normalize();
        let p = transform_position(&rotation_to_x_axis(dir), dir * 5.0);
        assert_relative_eq!(p.x, 5.0, epsilon = 1e-5);
        assert_abs_diff_eq!(p.y, 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(p.z, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_look_from_perspective_centers_forward_axis() {
        let view = look_from(Vec3::ZERO, Vec3::X, Vec3::Y);
        let proj = perspective(std::f32::consts::FRAC_PI_4, 1.0, 1.0, 1.0, 50.0);
        let p = project_position(&(proj * view), Vec3::new(25.0, 0.0, 0.0));
        assert_abs_diff_eq!(p.x, 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(p.y, 0.0, epsilon = 1e-5);
        assert!(p.z > 0.0 && p.z < 1.0);
    }
}
