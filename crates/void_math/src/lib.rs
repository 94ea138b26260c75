//! # void_math - Shadow Geometry Math
//!
//! Bounds, convex volumes and projection helpers shared by the shadow
//! scheduler. Vector and matrix storage comes from `glam`.

pub mod bounds;
pub mod frustum;
pub mod matrix;

pub use bounds::*;
pub use frustum::*;
pub use matrix::*;

pub use glam::{Mat4, Vec2, Vec3, Vec4};

/// Common math constants
pub mod consts {
    pub const PI: f32 = core::f32::consts::PI;
    pub const FRAC_PI_2: f32 = PI / 2.0;
    pub const FRAC_PI_4: f32 = PI / 4.0;
    /// Threshold below which a projected extent or W is treated as zero
    pub const DELTA: f32 = 1e-5;
    /// Largest coordinate the world is expected to use
    pub const WORLD_MAX: f32 = 2_097_152.0;
    pub const HALF_WORLD_MAX: f32 = WORLD_MAX * 0.5;
}

/// Linear interpolation
#[inline]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Smallest `n` with `2^n >= value`; zero for zero
#[inline]
pub fn ceil_log_two(value: u32) -> u32 {
    if value <= 1 {
        0
    } else {
        32 - (value - 1).leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil_log_two() {
        assert_eq!(ceil_log_two(0), 0);
        assert_eq!(ceil_log_two(1), 0);
        assert_eq!(ceil_log_two(2), 1);
        assert_eq!(ceil_log_two(3), 2);
        assert_eq!(ceil_log_two(512), 9);
        assert_eq!(ceil_log_two(513), 10);
    }

    #[test]
    fn test_lerp() {
        assert_eq!(lerp(0.0, 10.0, 0.25), 2.5);
    }
}
