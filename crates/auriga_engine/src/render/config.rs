//! Renderer configuration
//!
//! Serializable configuration for the renderer: window size, shader
//! locations, and presentation preferences. Loaded from TOML with sensible
//! defaults so applications can run without a config file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed to open
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The config file could not be parsed as TOML
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A config value failed validation
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Paths to the compiled SPIR-V shaders the pipeline registry loads at
/// startup. All paths are resolved relative to `shader_dir` unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderPaths {
    /// Forward pass vertex shader
    pub forward_vert: String,
    /// Forward pass fragment shader
    pub forward_frag: String,
    /// Shadow pass vertex shader
    pub shadow_vert: String,
    /// Shadow pass fragment shader
    pub shadow_frag: String,
    /// Procedural background compute shader
    pub background_comp: String,
    /// Physics compute shader
    pub physics_comp: String,
    /// Ray generation shader
    pub raygen: String,
    /// Ray miss shader
    pub miss: String,
    /// Triangle closest-hit shader
    pub closest_hit: String,
}

impl Default for ShaderPaths {
    fn default() -> Self {
        Self {
            forward_vert: "forward.vert.spv".to_string(),
            forward_frag: "forward.frag.spv".to_string(),
            shadow_vert: "shadow.vert.spv".to_string(),
            shadow_frag: "shadow.frag.spv".to_string(),
            background_comp: "background.comp.spv".to_string(),
            physics_comp: "physics.comp.spv".to_string(),
            raygen: "ray.rgen.spv".to_string(),
            miss: "ray.rmiss.spv".to_string(),
            closest_hit: "ray.rchit.spv".to_string(),
        }
    }
}

/// Renderer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Initial window width in pixels
    pub window_width: u32,
    /// Initial window height in pixels
    pub window_height: u32,
    /// Window title
    pub window_title: String,
    /// Directory containing compiled SPIR-V shaders
    pub shader_dir: String,
    /// Shader file names within `shader_dir`
    pub shaders: ShaderPaths,
    /// Prefer MAILBOX presentation (low latency) over FIFO (vsync) when the
    /// driver offers it
    pub prefer_mailbox: bool,
    /// Enable Vulkan validation layers (defaults to debug builds only)
    pub enable_validation: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            window_width: 1920,
            window_height: 1080,
            window_title: "Auriga".to_string(),
            shader_dir: "shaders".to_string(),
            shaders: ShaderPaths::default(),
            prefer_mailbox: true,
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl RendererConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path` if it exists, otherwise defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            log::info!(
                "Config file {} not found, using defaults",
                path.as_ref().display()
            );
            Ok(Self::default())
        }
    }

    /// Validate value ranges. Shader file existence is checked at pipeline
    /// creation, where a missing file is already fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_width == 0 || self.window_height == 0 {
            return Err(ConfigError::Invalid(format!(
                "window size must be non-zero, got {}x{}",
                self.window_width, self.window_height
            )));
        }
        Ok(())
    }

    /// Resolve a shader file name against `shader_dir`.
    #[must_use]
    pub fn shader_path(&self, name: &str) -> PathBuf {
        let p = Path::new(name);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            Path::new(&self.shader_dir).join(p)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RendererConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_window_size_rejected() {
        let config = RendererConfig {
            window_width: 0,
            ..RendererConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_partial_toml_fills_defaults() {
        let config: RendererConfig =
            toml::from_str("window_width = 800\nwindow_height = 600\n").unwrap();
        assert_eq!(config.window_width, 800);
        assert_eq!(config.window_height, 600);
        assert_eq!(config.shaders.raygen, "ray.rgen.spv");
        assert!(config.prefer_mailbox);
    }

    #[test]
    fn test_shader_path_resolution() {
        let config = RendererConfig {
            shader_dir: "assets/shaders".to_string(),
            ..RendererConfig::default()
        };
        assert_eq!(
            config.shader_path("forward.vert.spv"),
            Path::new("assets/shaders/forward.vert.spv")
        );
        assert_eq!(
            config.shader_path("/abs/x.spv"),
            Path::new("/abs/x.spv")
        );
    }
}
