//! Vulkan backend
//!
//! Drives the GPU through a multi-buffered frame pipeline. Module layering,
//! leaves first: [`resources`] (buffers/images), [`shader`] (SPIR-V),
//! [`context`] (instance/device/queue), [`swapchain`] (presentable images),
//! [`uniforms`]/[`shadow`] (frame payload math), [`accel`] (acceleration
//! structures), [`frame`] (frame-slot resources), [`registry`]
//! (descriptors/pipelines), [`orchestrator`] (the per-frame driver).

use ash::vk;
use thiserror::Error;

pub mod accel;
pub mod context;
pub mod frame;
pub mod orchestrator;
pub mod registry;
pub mod resources;
pub mod shader;
pub mod shadow;
pub mod swapchain;
pub mod uniforms;
pub mod window;

pub use orchestrator::{FrameInputs, FrameTimings, Renderer};
pub use window::Window;

/// Number of frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Number of shadow map cascades.
pub const SHADOW_CASCADE_COUNT: usize = 4;

/// Shadow map resolution (square, per cascade layer).
pub const SHADOW_MAP_DIM: u32 = 2048;

/// Capacity of every variable-length (bindless) descriptor array.
pub const BINDLESS_CAPACITY: u32 = 1000;

/// Maximum number of loadable models. Bounded by the 10 bits of model id in
/// the packed ray-tracing custom index.
pub const MAX_MODELS: u32 = 1024;

/// Maximum instances in the per-frame top-level acceleration structure.
pub const MAX_TLAS_INSTANCES: u32 = 10_000;

/// Vulkan backend errors
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Backend initialization failed
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// No memory type satisfies an allocation request
    #[error("no suitable memory type found")]
    NoSuitableMemoryType,

    /// Shader bytecode violated the SPIR-V word-size contract
    #[error("invalid shader bytecode: {0}")]
    InvalidShader(String),

    /// A model registration was rejected
    #[error("model registration rejected: {0}")]
    ModelRejected(String),

    /// Window subsystem error
    #[error("window error: {0}")]
    Window(#[from] window::WindowError),
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        Self::Api(result)
    }
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;
