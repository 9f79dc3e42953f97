//! Math utilities and types
//!
//! Provides fundamental math types for 3D rendering. All projection helpers
//! target Vulkan conventions: right-handed view space looking down -Z, with
//! clip-space depth in [0, 1].

pub use nalgebra::{Matrix3, Matrix4, Point3, Unit, Vector2, Vector3, Vector4};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 3x3 matrix type
pub type Mat3 = Matrix3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Extension trait adding Vulkan-convention projection and view constructors
/// to [`Mat4`].
pub trait Mat4Ext {
    /// Right-handed perspective projection with depth mapped to [0, 1].
    ///
    /// `fov_y` is the vertical field of view in radians.
    fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4;

    /// Right-handed orthographic projection with depth mapped to [0, 1].
    fn orthographic(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Mat4;

    /// Right-handed look-at view matrix.
    fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4;
}

impl Mat4Ext for Mat4 {
    fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
        let tan_half_fovy = (fov_y * 0.5).tan();

        // Camera looks down -Z; depth lands in [0, 1] (no separate GL-style
        // [-1, 1] remap). Y is *not* flipped here — the main pass flips via a
        // negative-height viewport, the shadow pass flips its projection
        // explicitly before texel snapping.
        let mut m = Mat4::zeros();
        m[(0, 0)] = 1.0 / (aspect * tan_half_fovy);
        m[(1, 1)] = 1.0 / tan_half_fovy;
        m[(2, 2)] = far / (near - far);
        m[(2, 3)] = -(far * near) / (far - near);
        m[(3, 2)] = -1.0;
        m
    }

    fn orthographic(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Mat4 {
        let mut m = Mat4::identity();
        m[(0, 0)] = 2.0 / (right - left);
        m[(1, 1)] = 2.0 / (top - bottom);
        m[(2, 2)] = -1.0 / (far - near);
        m[(0, 3)] = -(right + left) / (right - left);
        m[(1, 3)] = -(top + bottom) / (top - bottom);
        m[(2, 3)] = -near / (far - near);
        m
    }

    fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4 {
        Mat4::look_at_rh(&Point3::from(eye), &Point3::from(target), &up)
    }
}

/// Convert a column-major [`Mat4`] into the `[[f32; 4]; 4]` form used in
/// GPU-visible structs.
#[must_use]
pub fn mat4_to_array(m: &Mat4) -> [[f32; 4]; 4] {
    (*m).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_perspective_depth_range_is_zero_to_one() {
        let proj = Mat4::perspective(std::f32::consts::FRAC_PI_4, 16.0 / 9.0, 0.1, 100.0);

        // A point on the near plane projects to depth 0, far plane to depth 1.
        let near_pt = proj * Vec4::new(0.0, 0.0, -0.1, 1.0);
        let far_pt = proj * Vec4::new(0.0, 0.0, -100.0, 1.0);
        assert_relative_eq!(near_pt.z / near_pt.w, 0.0, epsilon = 1e-5);
        assert_relative_eq!(far_pt.z / far_pt.w, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_orthographic_maps_box_to_ndc() {
        let proj = Mat4::orthographic(-10.0, 10.0, -5.0, 5.0, 0.0, 20.0);

        let min_pt = proj * Vec4::new(-10.0, -5.0, 0.0, 1.0);
        assert_relative_eq!(min_pt.x, -1.0, epsilon = 1e-6);
        assert_relative_eq!(min_pt.y, -1.0, epsilon = 1e-6);
        assert_relative_eq!(min_pt.z, 0.0, epsilon = 1e-6);

        let max_pt = proj * Vec4::new(10.0, 5.0, -20.0, 1.0);
        assert_relative_eq!(max_pt.x, 1.0, epsilon = 1e-6);
        assert_relative_eq!(max_pt.y, 1.0, epsilon = 1e-6);
        assert_relative_eq!(max_pt.z, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_look_at_places_eye_at_origin() {
        let eye = Vec3::new(3.0, 4.0, 5.0);
        let view = Mat4::look_at(eye, Vec3::zeros(), Vec3::y());
        let transformed = view * Vec4::new(eye.x, eye.y, eye.z, 1.0);
        assert_relative_eq!(transformed.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(transformed.y, 0.0, epsilon = 1e-5);
        assert_relative_eq!(transformed.z, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_look_at_forward_maps_to_negative_z() {
        let view = Mat4::look_at(Vec3::new(0.0, 0.0, 10.0), Vec3::zeros(), Vec3::y());
        // The look target is in front of the camera: -Z in view space.
        let target = view * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!(target.z < 0.0);
    }
}
