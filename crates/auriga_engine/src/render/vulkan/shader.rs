//! SPIR-V shader loading
//!
//! Compiled shader bytecode is loaded from disk at startup. A file that is
//! missing, empty, or not a whole number of 32-bit SPIR-V words is fatal.

use ash::{vk, Device};
use std::path::Path;

use crate::render::vulkan::{VulkanError, VulkanResult};

/// Validate the SPIR-V word-size contract: non-empty and a multiple of 4
/// bytes.
pub fn validate_spirv_bytes(bytes: &[u8]) -> VulkanResult<()> {
    if bytes.is_empty() {
        return Err(VulkanError::InvalidShader(
            "bytecode is empty".to_string(),
        ));
    }
    if bytes.len() % 4 != 0 {
        return Err(VulkanError::InvalidShader(format!(
            "bytecode length {} is not a multiple of 4 bytes",
            bytes.len()
        )));
    }
    Ok(())
}

/// A compiled shader module.
pub struct ShaderModule {
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create a shader module from SPIR-V bytecode.
    pub fn from_bytes(device: &Device, bytes: &[u8]) -> VulkanResult<Self> {
        validate_spirv_bytes(bytes)?;

        // SPIR-V is a stream of u32 words; the file bytes may not be
        // 4-aligned in memory, so copy into an aligned vector.
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module = unsafe {
            device
                .create_shader_module(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        Ok(Self { module })
    }

    /// Load a shader module from a SPIR-V file.
    pub fn from_file(device: &Device, path: impl AsRef<Path>) -> VulkanResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            VulkanError::InitializationFailed(format!(
                "failed to read shader file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_bytes(device, &bytes).map_err(|e| match e {
            VulkanError::InvalidShader(msg) => {
                VulkanError::InvalidShader(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Shader module handle
    #[must_use]
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Build a pipeline stage description for this module.
    #[must_use]
    pub fn stage_info(
        &self,
        stage: vk::ShaderStageFlags,
        entry_point: &std::ffi::CStr,
    ) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.module)
            .name(entry_point)
            .build()
    }

    /// Destroy the module. Safe once all pipelines using it are compiled.
    pub fn destroy(&mut self, device: &Device) {
        unsafe {
            device.destroy_shader_module(self.module, None);
        }
        self.module = vk::ShaderModule::null();
    }
}

/// The shader entry point name shared by all pipeline stages.
#[must_use]
pub fn entry_point() -> &'static std::ffi::CStr {
    std::ffi::CStr::from_bytes_with_nul(b"main\0").expect("static entry point is nul-terminated")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_bytecode_rejected() {
        assert!(matches!(
            validate_spirv_bytes(&[]),
            Err(VulkanError::InvalidShader(_))
        ));
    }

    #[test]
    fn test_truncated_bytecode_rejected() {
        // 7 bytes: not a whole number of SPIR-V words.
        assert!(matches!(
            validate_spirv_bytes(&[0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x00]),
            Err(VulkanError::InvalidShader(_))
        ));
    }

    #[test]
    fn test_word_aligned_bytecode_accepted() {
        // The SPIR-V magic word alone is enough to pass the size contract.
        assert!(validate_spirv_bytes(&0x0723_0203u32.to_le_bytes()).is_ok());
    }
}
