//! GPU-visible data layouts
//!
//! Every struct here is shader ABI: field order, size, and 16-byte alignment
//! are a binary contract with the compiled SPIR-V. Matrices are column-major
//! `[[f32; 4]; 4]`, positions and directions are vec4 to avoid padding
//! ambiguity.

use bytemuck::{Pod, Zeroable};

use crate::foundation::math::{mat4_to_array, Mat4, Vec3};
use crate::render::camera::Camera;
use crate::render::vulkan::shadow::{self, CascadeParams};
use crate::render::vulkan::SHADOW_CASCADE_COUNT;

/// Per-frame uniform payload (set 0, binding 0).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct FrameUniforms {
    /// Camera view matrix
    pub view: [[f32; 4]; 4],
    /// Camera projection matrix
    pub proj: [[f32; 4]; 4],
    /// Camera world position (w = 1)
    pub camera_pos: [f32; 4],
    /// Normalized light direction (w = 0)
    pub light_dir: [f32; 4],
    /// Inverse view matrix (ray generation reconstructs rays from it)
    pub view_inverse: [[f32; 4]; 4],
    /// Inverse projection matrix
    pub proj_inverse: [[f32; 4]; 4],
    /// Far-plane depth of each shadow cascade, view space
    pub cascade_splits: [f32; 4],
    /// Light view-projection matrix per cascade
    pub cascade_view_proj: [[[f32; 4]; 4]; SHADOW_CASCADE_COUNT],
}

impl FrameUniforms {
    /// Build the frame payload from the camera and light state.
    #[must_use]
    pub fn compute(camera: &Camera, aspect: f32, light_direction: Vec3) -> Self {
        let view = camera.view_matrix();
        let proj = camera.projection_matrix(aspect);

        let view_inverse = view
            .try_inverse()
            .expect("view matrix is invertible");
        let proj_inverse = proj
            .try_inverse()
            .expect("projection matrix is invertible");

        let cascade_params = CascadeParams {
            fov_y: camera.fov_y,
            aspect,
            near: camera.near,
            ..CascadeParams::default()
        };
        let cascades = shadow::compute_cascades(&view, light_direction, &cascade_params);

        let light = light_direction.normalize();
        let mut cascade_view_proj = [[[0.0f32; 4]; 4]; SHADOW_CASCADE_COUNT];
        for (dst, src) in cascade_view_proj.iter_mut().zip(cascades.view_proj.iter()) {
            *dst = mat4_to_array(src);
        }

        Self {
            view: mat4_to_array(&view),
            proj: mat4_to_array(&proj),
            camera_pos: [camera.position.x, camera.position.y, camera.position.z, 1.0],
            light_dir: [light.x, light.y, light.z, 0.0],
            view_inverse: mat4_to_array(&view_inverse),
            proj_inverse: mat4_to_array(&proj_inverse),
            cascade_splits: cascades.splits,
            cascade_view_proj,
        }
    }
}

/// Push-constant block shared by the raster, shadow, compute, and
/// ray-tracing pipeline layouts.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct ScenePushConstants {
    /// Model (world) matrix of the instance being drawn
    pub model: [[f32; 4]; 4],
    /// Index into the model's per-primitive material buffer
    pub material_index: i32,
    /// Cascade being rendered in the shadow pass; unused elsewhere
    pub cascade_index: i32,
    /// Reserved padding to keep `sky_data` 16-byte aligned
    pub _pad: [i32; 2],
    /// Procedural background parameters: xyz = color, w = threshold
    pub sky_data: [f32; 4],
}

impl ScenePushConstants {
    /// Push constants for a scene draw.
    #[must_use]
    pub fn for_draw(model: &Mat4, material_index: i32, cascade_index: i32) -> Self {
        Self {
            model: mat4_to_array(model),
            material_index,
            cascade_index,
            _pad: [0; 2],
            sky_data: [0.0; 4],
        }
    }

    /// Push constants for the background compute dispatch.
    #[must_use]
    pub fn for_background(sky_data: [f32; 4]) -> Self {
        Self {
            model: mat4_to_array(&Mat4::identity()),
            material_index: 0,
            cascade_index: 0,
            _pad: [0; 2],
            sky_data,
        }
    }
}

/// Per-primitive material record in a model's material buffer
/// (material set binding 0, RT set binding 4).
///
/// Texture indices are -1 when the slot is unused; non-negative values index
/// the model's own texture list, and `global_texture_offset` rebases them
/// into the global bindless texture array for the ray-tracing path.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct MaterialData {
    /// Base color texture index, -1 if none
    pub base_color_index: i32,
    /// Metallic-roughness texture index, -1 if none
    pub metallic_roughness_index: i32,
    /// Normal map index, -1 if none
    pub normal_index: i32,
    /// Occlusion texture index, -1 if none
    pub occlusion_index: i32,
    /// Emissive texture index, -1 if none
    pub emissive_index: i32,
    /// Specular texture index, -1 if none
    pub specular_index: i32,
    /// First index of the primitive in the model index buffer
    pub first_index: u32,
    /// Vertex offset of the primitive in the model vertex buffer
    pub vertex_offset: u32,
    /// Offset of this model's textures in the global texture array
    pub global_texture_offset: i32,
    /// Reserved padding
    pub _pad0: [i32; 3],
    /// Base color factor (RGBA)
    pub base_color_factor: [f32; 4],
    /// Metallic factor
    pub metallic_factor: f32,
    /// Roughness factor
    pub roughness_factor: f32,
    /// Normal map scale
    pub normal_scale: f32,
    /// Occlusion strength
    pub occlusion_strength: f32,
    /// Emissive color factor
    pub emissive_factor: [f32; 3],
    /// Specular factor
    pub specular_factor: f32,
    /// Alpha cutoff for masked materials
    pub alpha_cutoff: f32,
    /// Reserved padding
    pub _pad1: [f32; 3],
}

impl Default for MaterialData {
    fn default() -> Self {
        Self {
            base_color_index: -1,
            metallic_roughness_index: -1,
            normal_index: -1,
            occlusion_index: -1,
            emissive_index: -1,
            specular_index: -1,
            first_index: 0,
            vertex_offset: 0,
            global_texture_offset: 0,
            _pad0: [0; 3],
            base_color_factor: [1.0; 4],
            metallic_factor: 1.0,
            roughness_factor: 1.0,
            normal_scale: 1.0,
            occlusion_strength: 1.0,
            emissive_factor: [0.0; 3],
            specular_factor: 1.0,
            alpha_cutoff: 0.5,
            _pad1: [0.0; 3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec4;
    use approx::assert_relative_eq;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn test_frame_uniforms_binary_layout() {
        // Shader-side: mat4 + mat4 + vec4 + vec4 + mat4 + mat4 + vec4 + mat4[4]
        assert_eq!(size_of::<FrameUniforms>(), 64 * 4 + 16 * 3 + 64 * 4);
        assert_eq!(align_of::<FrameUniforms>() % 4, 0);

        assert_eq!(offset_of!(FrameUniforms, view), 0);
        assert_eq!(offset_of!(FrameUniforms, proj), 64);
        assert_eq!(offset_of!(FrameUniforms, camera_pos), 128);
        assert_eq!(offset_of!(FrameUniforms, light_dir), 144);
        assert_eq!(offset_of!(FrameUniforms, view_inverse), 160);
        assert_eq!(offset_of!(FrameUniforms, proj_inverse), 224);
        assert_eq!(offset_of!(FrameUniforms, cascade_splits), 288);
        assert_eq!(offset_of!(FrameUniforms, cascade_view_proj), 304);
    }

    #[test]
    fn test_push_constants_layout_fits_common_limit() {
        assert_eq!(size_of::<ScenePushConstants>(), 96);
        assert_eq!(offset_of!(ScenePushConstants, material_index), 64);
        assert_eq!(offset_of!(ScenePushConstants, cascade_index), 68);
        assert_eq!(offset_of!(ScenePushConstants, sky_data), 80);
        // Must fit within the 128-byte push constant minimum guarantee.
        assert!(size_of::<ScenePushConstants>() <= 128);
    }

    #[test]
    fn test_material_data_layout() {
        assert_eq!(size_of::<MaterialData>(), 112);
        assert_eq!(offset_of!(MaterialData, base_color_factor), 48);
        assert_eq!(offset_of!(MaterialData, emissive_factor), 80);
        assert_eq!(offset_of!(MaterialData, alpha_cutoff), 96);
    }

    #[test]
    fn test_compute_normalizes_light_direction() {
        let camera = Camera::default();
        let uniforms = FrameUniforms::compute(&camera, 16.0 / 9.0, Vec3::new(0.0, -10.0, 0.0));
        assert_relative_eq!(uniforms.light_dir[1], -1.0, epsilon = 1e-6);
        assert_eq!(uniforms.light_dir[3], 0.0);
    }

    #[test]
    fn test_compute_inverse_matrices_round_trip() {
        let camera = Camera::default();
        let uniforms = FrameUniforms::compute(&camera, 1.5, Vec3::new(-0.3, -1.0, -0.2));

        let view = Mat4::from(uniforms.view);
        let view_inverse = Mat4::from(uniforms.view_inverse);
        let product = view * view_inverse;
        let p = product * Vec4::new(1.0, 2.0, 3.0, 1.0);
        assert_relative_eq!(p.x, 1.0, epsilon = 1e-4);
        assert_relative_eq!(p.y, 2.0, epsilon = 1e-4);
        assert_relative_eq!(p.z, 3.0, epsilon = 1e-4);
    }

    #[test]
    fn test_cascade_splits_forwarded_in_order() {
        let camera = Camera::default();
        let uniforms = FrameUniforms::compute(&camera, 1.0, Vec3::new(0.2, -1.0, 0.1));
        let s = uniforms.cascade_splits;
        assert!(s[0] < s[1] && s[1] < s[2] && s[2] < s[3]);
    }
}
