//! Rendering system
//!
//! The renderer is split into collaborator-facing modules ([`assets`],
//! [`scene`], [`camera`], [`config`]) and the Vulkan backend ([`vulkan`])
//! that drives the GPU frame pipeline.

pub mod assets;
pub mod camera;
pub mod config;
pub mod scene;
pub mod vulkan;

pub use camera::Camera;
pub use config::RendererConfig;
pub use vulkan::{FrameInputs, FrameTimings, Renderer};
