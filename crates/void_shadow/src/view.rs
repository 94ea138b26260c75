//! Views that shadows are scheduled for
//!
//! A view is owned by the frame; shadows refer back to it by `ViewId`.

use glam::{Mat4, Vec3};
use void_math::{
    look_from, perspective, transform_position, BoxSphereBounds, ConvexVolume,
};

/// Index of a view in the frame's view list
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u32);

impl ViewId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Camera state the scheduler needs from a view
#[derive(Clone, Debug)]
pub struct ShadowView {
    pub id: ViewId,
    pub origin: Vec3,
    pub forward: Vec3,
    /// World to view, +Z forward
    pub view_matrix: Mat4,
    pub projection_matrix: Mat4,
    /// Horizontal half field of view in radians
    pub half_fov: f32,
    /// Width over height
    pub aspect: f32,
    pub near_plane: f32,
    pub far_plane: f32,
    pub viewport_size: (u32, u32),
    /// Scales distance-based LOD and screen-size culling
    pub lod_distance_factor: f32,
    pub is_perspective: bool,
    /// Request reflective shadow maps for indirect lighting
    pub render_reflective_shadow_maps: bool,
    view_frustum: ConvexVolume,
}

impl ShadowView {
    /// Perspective view at `origin` looking along `forward`
    pub fn perspective(
        id: ViewId,
        origin: Vec3,
        forward: Vec3,
        up: Vec3,
        half_fov: f32,
        viewport_size: (u32, u32),
        near_plane: f32,
        far_plane: f32,
    ) -> Self {
        let (width, height) = (viewport_size.0.max(1) as f32, viewport_size.1.max(1) as f32);
        let forward = forward.normalize_or_zero();
        let view_matrix = look_from(origin, forward, up);
        let projection_matrix = perspective(half_fov, width, height, near_plane, far_plane);
        let view_frustum = ConvexVolume::from_view_projection(&(projection_matrix * view_matrix), true);

        Self {
            id,
            origin,
            forward,
            view_matrix,
            projection_matrix,
            half_fov,
            aspect: width / height,
            near_plane,
            far_plane,
            viewport_size,
            lod_distance_factor: 1.0,
            is_perspective: true,
            render_reflective_shadow_maps: false,
            view_frustum,
        }
    }

    pub fn with_lod_distance_factor(mut self, factor: f32) -> Self {
        self.lod_distance_factor = factor.max(0.0);
        self
    }

    pub fn with_reflective_shadow_maps(mut self, enabled: bool) -> Self {
        self.render_reflective_shadow_maps = enabled;
        self
    }

    #[inline]
    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix * self.view_matrix
    }

    /// Full view frustum including the near plane
    #[inline]
    pub fn view_frustum(&self) -> &ConvexVolume {
        &self.view_frustum
    }

    /// Frustum without the near plane, in left, right, top, bottom, far order
    pub fn view_frustum_without_near(&self) -> ConvexVolume {
        ConvexVolume::from_view_projection(&self.view_projection(), false)
    }

    /// Pixels per unit of projected radius at distance 1
    pub fn screen_scale(&self) -> f32 {
        let (width, height) = self.viewport_size;
        (0.5 * width as f32 * self.projection_matrix.x_axis.x)
            .max(0.5 * height as f32 * self.projection_matrix.y_axis.y)
    }

    /// Projected screen radius of a sphere, approximated by distance
    pub fn screen_radius(&self, center: Vec3, radius: f32) -> f32 {
        self.screen_scale() * radius / center.distance(self.origin).max(1.0)
    }

    /// Whether bounds are inside the view frustum
    #[inline]
    pub fn is_visible(&self, bounds: &BoxSphereBounds) -> bool {
        self.view_frustum.intersect_box(bounds.origin, bounds.box_extent)
    }

    /// World-space corners of the frustum slice between two view depths,
    /// near corners first.
    pub fn slice_corners(&self, near: f32, far: f32) -> [Vec3; 8] {
        let tan_x = self.half_fov.tan();
        let tan_y = tan_x / self.aspect.max(1e-4);
        let view_to_world = self.view_matrix.inverse();
        let mut corners = [Vec3::ZERO; 8];
        for (slice, depth) in [near, far].into_iter().enumerate() {
            for (i, (sx, sy)) in [(-1.0, -1.0), (1.0, -1.0), (-1.0, 1.0), (1.0, 1.0)]
                .into_iter()
                .enumerate()
            {
                let view_point = Vec3::new(sx * depth * tan_x, sy * depth * tan_y, depth);
                corners[slice * 4 + i] = transform_position(&view_to_world, view_point);
            }
        }
        corners
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_view() -> ShadowView {
        ShadowView::perspective(
            ViewId(0),
            Vec3::ZERO,
            Vec3::X,
            Vec3::Z,
            std::f32::consts::FRAC_PI_4,
            (1920, 1080),
            10.0,
            10000.0,
        )
    }

    #[test]
    fn test_screen_scale() {
        let view = test_view();
        // 90 degree horizontal FOV: half the viewport width per unit
        assert_relative_eq!(view.screen_scale(), 960.0, epsilon = 1e-2);
    }

    #[test]
    fn test_visibility() {
        let view = test_view();
        assert!(view.is_visible(&BoxSphereBounds::new(Vec3::new(500.0, 0.0, 0.0), Vec3::ONE, 1.7)));
        assert!(!view.is_visible(&BoxSphereBounds::new(Vec3::new(-500.0, 0.0, 0.0), Vec3::ONE, 1.7)));
    }

    #[test]
    fn test_slice_corners_lie_at_depth() {
        let view = test_view();
        let corners = view.slice_corners(100.0, 200.0);
        for corner in &corners[..4] {
            assert_relative_eq!(corner.x, 100.0, epsilon = 1e-3);
        }
        for corner in &corners[4..] {
            assert_relative_eq!(corner.x, 200.0, epsilon = 1e-3);
        }
        for corner in &corners {
            assert!(view.view_frustum().intersect_sphere(*corner, 1e-2));
        }
    }
}
