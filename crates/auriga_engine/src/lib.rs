//! # Auriga Engine
//!
//! A Vulkan renderer core built around a multi-buffered frame pipeline.
//!
//! ## Features
//!
//! - **Two render paths**: rasterized forward shading and hardware ray tracing,
//!   switchable per frame
//! - **Frames in flight**: CPU records frame N+1 while the GPU executes frame N,
//!   bounded by per-slot fences
//! - **Bindless resources**: variable-count descriptor arrays indexed by stable
//!   model ids
//! - **Cascaded shadow maps**: four stabilized cascades with texel snapping
//! - **Acceleration structures**: per-model BLAS built once at load, per-frame
//!   TLAS rebuilt from the live scene
//!
//! The engine does not own asset decoding, the scene graph, physics internals,
//! or UI; those collaborate through the traits in [`render::scene`] and the
//! registry in [`render::assets`].

#![warn(missing_docs)]

pub mod foundation;
pub mod render;

/// Common imports for engine users
pub mod prelude {
    pub use crate::foundation::math::{Mat4, Mat4Ext, Vec2, Vec3, Vec4};
    pub use crate::render::assets::{ModelGeometry, ModelId, ModelRegistry, SubMesh};
    pub use crate::render::camera::Camera;
    pub use crate::render::config::RendererConfig;
    pub use crate::render::scene::{Aabb, SceneInstance, SceneSource};
    pub use crate::render::vulkan::{FrameInputs, Renderer};
}
