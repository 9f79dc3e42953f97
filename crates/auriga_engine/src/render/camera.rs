//! 3D camera
//!
//! Position/target/up camera producing the view and projection matrices the
//! frame uniforms are built from. View space is right-handed Y-up looking
//! down -Z; the Vulkan NDC Y-flip is handled by the render passes, not here.

use crate::foundation::math::{Mat4, Mat4Ext, Vec3};

/// Perspective camera for the renderer's main view.
#[derive(Debug, Clone)]
pub struct Camera {
    /// Camera position in world space
    pub position: Vec3,
    /// Point the camera is looking at in world space
    pub target: Vec3,
    /// Up vector for camera orientation
    pub up: Vec3,
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Distance to the near clipping plane
    pub near: f32,
    /// Distance to the far clipping plane
    pub far: f32,
}

impl Camera {
    /// Create a perspective camera looking at the origin with Y-up.
    ///
    /// `fov_degrees` is converted to radians internally.
    #[must_use]
    pub fn perspective(position: Vec3, fov_degrees: f32, near: f32, far: f32) -> Self {
        Self {
            position,
            target: Vec3::zeros(),
            up: Vec3::y(),
            fov_y: fov_degrees.to_radians(),
            near,
            far,
        }
    }

    /// Point the camera at `target` with the given up vector.
    pub fn look_at(&mut self, target: Vec3, up: Vec3) {
        self.target = target;
        self.up = up;
    }

    /// View matrix for the current position/target/up.
    #[must_use]
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at(self.position, self.target, self.up)
    }

    /// Projection matrix for the given viewport aspect ratio.
    ///
    /// The aspect ratio is passed per call because it follows the swapchain
    /// extent, which changes on resize while the camera itself does not.
    #[must_use]
    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        Mat4::perspective(self.fov_y, aspect, self.near, self.far)
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::perspective(Vec3::new(0.0, 2.0, 10.0), 45.0, 0.1, 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec4;
    use approx::assert_relative_eq;

    #[test]
    fn test_view_matrix_centers_target_on_axis() {
        let mut camera = Camera::perspective(Vec3::new(0.0, 0.0, 5.0), 45.0, 0.1, 100.0);
        camera.look_at(Vec3::zeros(), Vec3::y());

        let view = camera.view_matrix();
        let target = view * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(target.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(target.y, 0.0, epsilon = 1e-5);
        assert_relative_eq!(target.z, -5.0, epsilon = 1e-5);
    }

    #[test]
    fn test_projection_uses_camera_planes() {
        let camera = Camera::perspective(Vec3::zeros(), 60.0, 0.5, 50.0);
        let proj = camera.projection_matrix(1.0);
        let near_pt = proj * Vec4::new(0.0, 0.0, -0.5, 1.0);
        assert_relative_eq!(near_pt.z / near_pt.w, 0.0, epsilon = 1e-5);
    }
}
