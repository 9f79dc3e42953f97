//! Cascaded shadow map computation
//!
//! Pure matrix math, re-derived every frame from the camera and light
//! direction. The camera frustum is split into four depth ranges with a
//! log/linear blend; each cascade gets a light-space orthographic projection
//! fitted to the bounding sphere of its sub-frustum and snapped to the
//! shadow-map texel grid so shadow edges do not shimmer as the camera moves.

use crate::foundation::math::{Mat4, Mat4Ext, Vec3, Vec4};
use crate::render::vulkan::{SHADOW_CASCADE_COUNT, SHADOW_MAP_DIM};

/// Parameters for cascade computation. The defaults match the engine's
/// shader-side constants.
#[derive(Debug, Clone, Copy)]
pub struct CascadeParams {
    /// Vertical field of view of the camera, radians
    pub fov_y: f32,
    /// Viewport aspect ratio (width / height)
    pub aspect: f32,
    /// Camera near plane
    pub near: f32,
    /// Far edge of the last cascade. Deliberately much smaller than the
    /// camera far plane; shadow resolution is spent where it is visible.
    pub shadow_max_distance: f32,
    /// Blend between logarithmic (1.0) and linear (0.0) split placement
    pub lambda: f32,
    /// Extra distance the light camera is pulled back behind the cascade
    /// sphere so casters outside the view frustum still land in the map
    pub pullback: f32,
    /// Shadow map resolution used for texel snapping
    pub shadow_map_dim: u32,
}

impl Default for CascadeParams {
    fn default() -> Self {
        Self {
            fov_y: 45f32.to_radians(),
            aspect: 16.0 / 9.0,
            near: 0.1,
            shadow_max_distance: 200.0,
            lambda: 0.95,
            pullback: 50.0,
            shadow_map_dim: SHADOW_MAP_DIM,
        }
    }
}

/// Split depths and view-projection matrices for all cascades.
#[derive(Debug, Clone, Copy)]
pub struct Cascades {
    /// Far-plane depth of each cascade in view space (positive, camera units)
    pub splits: [f32; SHADOW_CASCADE_COUNT],
    /// Light-space view-projection matrix per cascade
    pub view_proj: [Mat4; SHADOW_CASCADE_COUNT],
}

/// Compute the cascade split depths.
///
/// Practical split scheme: `split(i) = λ·log(i) + (1−λ)·linear(i)` over
/// `[near, shadow_max_distance]`. The result is strictly increasing and ends
/// exactly at `shadow_max_distance`.
#[must_use]
pub fn compute_cascade_splits(params: &CascadeParams) -> [f32; SHADOW_CASCADE_COUNT] {
    let near = params.near;
    let far = params.shadow_max_distance;
    let mut splits = [0.0f32; SHADOW_CASCADE_COUNT];
    for (i, split) in splits.iter_mut().enumerate() {
        let p = (i + 1) as f32 / SHADOW_CASCADE_COUNT as f32;
        let log_split = near * (far / near).powf(p);
        let linear_split = near + (far - near) * p;
        *split = params.lambda * log_split + (1.0 - params.lambda) * linear_split;
    }
    splits
}

/// Compute split depths and stabilized light matrices for every cascade.
#[must_use]
pub fn compute_cascades(view: &Mat4, light_direction: Vec3, params: &CascadeParams) -> Cascades {
    let splits = compute_cascade_splits(params);

    let light_dir = light_direction.normalize();
    // Swap the up vector when the light is nearly vertical to keep look_at
    // well conditioned.
    let light_up = if light_dir.y.abs() > 0.99 {
        Vec3::z()
    } else {
        Vec3::y()
    };

    let mut view_proj = [Mat4::identity(); SHADOW_CASCADE_COUNT];
    for (i, out) in view_proj.iter_mut().enumerate() {
        let prev_split = if i == 0 { params.near } else { splits[i - 1] };
        let curr_split = splits[i];
        *out = cascade_matrix(
            view,
            light_dir,
            light_up,
            prev_split,
            curr_split,
            params,
        );
    }

    Cascades { splits, view_proj }
}

fn cascade_matrix(
    view: &Mat4,
    light_dir: Vec3,
    light_up: Vec3,
    near_split: f32,
    far_split: f32,
    params: &CascadeParams,
) -> Mat4 {
    // World-space corners of the sub-frustum covering [near_split, far_split].
    let sub_proj = Mat4::perspective(params.fov_y, params.aspect, near_split, far_split);
    let inv_proj_view = (sub_proj * view)
        .try_inverse()
        .expect("projection-view matrix is invertible");

    let ndc = [-1.0f32, 1.0];
    let ndc_z = [0.0f32, 1.0];
    let mut corners = [Vec3::zeros(); 8];
    let mut center = Vec3::zeros();
    let mut idx = 0;
    for &x in &ndc {
        for &y in &ndc {
            for &z in &ndc_z {
                let clip = inv_proj_view * Vec4::new(x, y, z, 1.0);
                let world = Vec3::new(clip.x, clip.y, clip.z) / clip.w;
                corners[idx] = world;
                center += world;
                idx += 1;
            }
        }
    }
    center /= 8.0;

    // Bounding sphere of the sub-frustum. The radius is rounded up to a fixed
    // 1/16 granularity so the orthographic extent does not pulse as the
    // camera rotates (a changing extent re-scales texels every frame).
    let mut radius = 0.0f32;
    for corner in &corners {
        radius = radius.max((corner - center).norm());
    }
    let radius = (radius * 16.0).ceil() / 16.0;

    // Light camera placed behind the sphere; light_dir points from sky to
    // ground, so subtracting moves the camera up-light.
    let light_pos = center - light_dir * (radius + params.pullback);
    let light_view = Mat4::look_at(light_pos, center, light_up);

    let mut light_proj = Mat4::orthographic(
        -radius,
        radius,
        -radius,
        radius,
        0.001,
        radius * 2.0 + params.pullback,
    );

    // The main pass flips Y with a negative-height viewport but the shadow
    // pass uses a standard viewport, so the projection flips Y itself. Must
    // happen before snapping so the rounding offsets are in final NDC space.
    light_proj[(1, 1)] *= -1.0;

    // Snap the shadow-space origin to whole texels: project the world origin,
    // scale into texel units, round, and bake the rounding delta back into
    // the projection as an NDC offset.
    let dim = params.shadow_map_dim as f32;
    let shadow_matrix = light_proj * light_view;
    let origin = shadow_matrix * Vec4::new(0.0, 0.0, 0.0, 1.0) * (dim / 2.0);
    let rounded = Vec4::new(
        origin.x.round(),
        origin.y.round(),
        origin.z.round(),
        origin.w.round(),
    );
    let offset = (rounded - origin) * (2.0 / dim);
    light_proj[(0, 3)] += offset.x;
    light_proj[(1, 3)] += offset.y;

    light_proj * light_view
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn test_splits_strictly_increasing_and_bounded() {
        for &(near, far, lambda) in &[
            (0.1f32, 200.0f32, 0.95f32),
            (0.01, 50.0, 0.5),
            (1.0, 1000.0, 0.0),
            (0.5, 123.0, 1.0),
        ] {
            let params = CascadeParams {
                near,
                shadow_max_distance: far,
                lambda,
                ..CascadeParams::default()
            };
            let splits = compute_cascade_splits(&params);
            assert!(near <= splits[0], "near {near} > split0 {}", splits[0]);
            for w in splits.windows(2) {
                assert!(w[0] < w[1], "splits not increasing: {splits:?}");
            }
            assert_relative_eq!(splits[3], far, epsilon = far * 1e-5);
        }
    }

    #[test]
    fn test_pure_linear_splits_are_even() {
        // near must stay positive: the log term is computed even at λ = 0.
        let params = CascadeParams {
            near: 1e-3,
            shadow_max_distance: 100.0,
            lambda: 0.0,
            ..CascadeParams::default()
        };
        let splits = compute_cascade_splits(&params);
        assert_abs_diff_eq!(splits[0], 25.0, epsilon = 0.1);
        assert_abs_diff_eq!(splits[1], 50.0, epsilon = 0.1);
        assert_abs_diff_eq!(splits[2], 75.0, epsilon = 0.1);
        assert_abs_diff_eq!(splits[3], 100.0, epsilon = 0.1);
    }

    fn test_view() -> Mat4 {
        Mat4::look_at(
            Vec3::new(3.0, 5.0, 10.0),
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::y(),
        )
    }

    #[test]
    fn test_cascades_produced_for_every_layer() {
        let cascades = compute_cascades(
            &test_view(),
            Vec3::new(-0.5, -1.0, -0.3),
            &CascadeParams::default(),
        );
        for m in &cascades.view_proj {
            assert!(*m != Mat4::identity());
            assert!(m.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_world_origin_lands_on_texel_grid() {
        let params = CascadeParams::default();
        let cascades = compute_cascades(&test_view(), Vec3::new(-0.4, -1.0, -0.2), &params);

        // The snapping guarantee: the world origin, projected into shadow
        // space and scaled into texel units, sits on an integer boundary.
        let dim = params.shadow_map_dim as f32;
        for m in &cascades.view_proj {
            let origin = m * Vec4::new(0.0, 0.0, 0.0, 1.0) * (dim / 2.0);
            assert_abs_diff_eq!(origin.x, origin.x.round(), epsilon = 1e-2);
            assert_abs_diff_eq!(origin.y, origin.y.round(), epsilon = 1e-2);
        }
    }

    #[test]
    fn test_vertical_light_does_not_degenerate() {
        let cascades = compute_cascades(
            &test_view(),
            Vec3::new(0.0, -1.0, 0.0),
            &CascadeParams::default(),
        );
        for m in &cascades.view_proj {
            assert!(m.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_radius_granularity_stabilizes_extent() {
        // Two slightly different camera orientations must produce identical
        // orthographic scale for the same cascade (radius rounds to 1/16).
        let params = CascadeParams::default();
        let view_a = Mat4::look_at(Vec3::new(0.0, 2.0, 10.0), Vec3::zeros(), Vec3::y());
        let view_b = Mat4::look_at(
            Vec3::new(0.0, 2.0, 10.0),
            Vec3::new(1e-4, 0.0, 0.0),
            Vec3::y(),
        );
        let light = Vec3::new(-0.4, -1.0, -0.2);
        let a = compute_cascades(&view_a, light, &params);
        let b = compute_cascades(&view_b, light, &params);
        // Scale terms live on the diagonal of the projection part; compare
        // the X column norms of the combined matrices.
        for (ma, mb) in a.view_proj.iter().zip(b.view_proj.iter()) {
            let sa = ma.fixed_view::<3, 1>(0, 0).norm();
            let sb = mb.fixed_view::<3, 1>(0, 0).norm();
            assert_relative_eq!(sa, sb, epsilon = 1e-4);
        }
    }
}
