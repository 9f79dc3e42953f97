//! Scene collaborator interface
//!
//! The renderer does not own a scene graph. Each frame it asks a
//! [`SceneSource`] for the instances visible inside a culling volume and
//! consumes them to build ray-tracing instances and raster draw calls.

use crate::foundation::math::{Mat4, Vec3};
use crate::render::assets::ModelId;

/// Axis-aligned bounding box used as the culling volume handed to the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Aabb {
    /// Box centered on `center` extending `half_extent` along each axis.
    #[must_use]
    pub fn around(center: Vec3, half_extent: f32) -> Self {
        let h = Vec3::new(half_extent, half_extent, half_extent);
        Self {
            min: center - h,
            max: center + h,
        }
    }

    /// Whether `point` lies inside the box (inclusive).
    #[must_use]
    pub fn contains(&self, point: Vec3) -> bool {
        point.x >= self.min.x
            && point.y >= self.min.y
            && point.z >= self.min.z
            && point.x <= self.max.x
            && point.y <= self.max.y
            && point.z <= self.max.z
    }
}

/// One visible (transform, model, mesh) triple produced by the scene for the
/// current frame. Not owned by the renderer; regenerated every frame.
#[derive(Debug, Clone, Copy)]
pub struct SceneInstance {
    /// World transform of the scene node
    pub transform: Mat4,
    /// Stable id of the loaded model this instance draws
    pub model_id: ModelId,
    /// Index into the model's mesh list
    pub mesh_index: u32,
}

/// Source of visible scene instances, implemented by the scene collaborator.
///
/// The returned instances must already be culled to `cull`; the renderer
/// performs no further visibility tests.
pub trait SceneSource {
    /// Visible instances for this frame, culled to the given volume.
    fn visible_instances(&self, cull: &Aabb) -> Vec<SceneInstance>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aabb_around_is_symmetric() {
        let b = Aabb::around(Vec3::new(1.0, 2.0, 3.0), 10.0);
        assert_eq!(b.min, Vec3::new(-9.0, -8.0, -7.0));
        assert_eq!(b.max, Vec3::new(11.0, 12.0, 13.0));
    }

    #[test]
    fn test_aabb_contains_boundary() {
        let b = Aabb::around(Vec3::zeros(), 1.0);
        assert!(b.contains(Vec3::new(1.0, 1.0, 1.0)));
        assert!(b.contains(Vec3::zeros()));
        assert!(!b.contains(Vec3::new(1.1, 0.0, 0.0)));
    }
}
