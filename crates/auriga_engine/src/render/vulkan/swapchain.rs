//! Swapchain management
//!
//! Owns the presentable images and their views, chooses surface format,
//! present mode, image count, and extent, and recreates itself on resize.
//! The selection rules are pure functions over capability data so they stay
//! testable without a device.

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device};

use crate::render::vulkan::context::VulkanContext;
use crate::render::vulkan::{VulkanError, VulkanResult};

/// Prefer B8G8R8A8_SRGB with sRGB non-linear color space: gamma-correct
/// output without a manual transfer step. Fall back to the first format.
#[must_use]
pub fn choose_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    if available.is_empty() {
        return None;
    }
    Some(
        available
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .copied()
            .unwrap_or(available[0]),
    )
}

/// MAILBOX (no tearing, low latency) when offered and preferred; FIFO
/// otherwise. Vulkan requires every driver to support FIFO, so its absence
/// is a driver bug surfaced as `None`.
#[must_use]
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    prefer_mailbox: bool,
) -> Option<vk::PresentModeKHR> {
    if !available.contains(&vk::PresentModeKHR::FIFO) {
        return None;
    }
    if prefer_mailbox && available.contains(&vk::PresentModeKHR::MAILBOX) {
        Some(vk::PresentModeKHR::MAILBOX)
    } else {
        Some(vk::PresentModeKHR::FIFO)
    }
}

/// Request triple buffering, clamped to the driver's limits
/// (`max_image_count` of 0 means unlimited).
#[must_use]
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = capabilities.min_image_count.max(3);
    if capabilities.max_image_count > 0 {
        count = count.min(capabilities.max_image_count);
    }
    count
}

/// Surface extent: the platform's `current_extent` when fixed, otherwise the
/// framebuffer size clamped to the supported range (0xFFFFFFFF marks a
/// platform that lets the application choose, e.g. Wayland).
#[must_use]
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    framebuffer: (u32, u32),
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: framebuffer.0.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: framebuffer.1.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// The swapchain and its presentable images.
pub struct Swapchain {
    /// Swapchain handle
    pub handle: vk::SwapchainKHR,
    /// Presentable images, owned by the swapchain
    pub images: Vec<vk::Image>,
    /// One color view per image
    pub image_views: Vec<vk::ImageView>,
    /// Chosen surface format
    pub format: vk::SurfaceFormatKHR,
    /// Current extent
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain sized to the window's framebuffer.
    pub fn new(
        ctx: &VulkanContext,
        framebuffer: (u32, u32),
        prefer_mailbox: bool,
    ) -> VulkanResult<Self> {
        Self::create(ctx, framebuffer, prefer_mailbox, vk::SwapchainKHR::null())
    }

    /// Recreate after a resize, retiring the previous swapchain handle.
    pub fn recreate(
        &mut self,
        ctx: &VulkanContext,
        framebuffer: (u32, u32),
        prefer_mailbox: bool,
    ) -> VulkanResult<()> {
        let old_handle = self.handle;
        let new = Self::create(ctx, framebuffer, prefer_mailbox, old_handle)?;

        // The old views and handle are only destroyed after the replacement
        // exists; the driver can reuse resources through old_swapchain.
        self.destroy_views(&ctx.device);
        unsafe {
            ctx.swapchain_loader.destroy_swapchain(old_handle, None);
        }
        *self = new;
        Ok(())
    }

    fn create(
        ctx: &VulkanContext,
        framebuffer: (u32, u32),
        prefer_mailbox: bool,
        old_swapchain: vk::SwapchainKHR,
    ) -> VulkanResult<Self> {
        let physical = ctx.physical_device.device;
        let capabilities = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_capabilities(physical, ctx.surface)
                .map_err(VulkanError::Api)?
        };
        let formats = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_formats(physical, ctx.surface)
                .map_err(VulkanError::Api)?
        };
        let present_modes = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_present_modes(physical, ctx.surface)
                .map_err(VulkanError::Api)?
        };

        let format = choose_surface_format(&formats).ok_or_else(|| {
            VulkanError::InitializationFailed("no surface formats available".to_string())
        })?;
        let present_mode = choose_present_mode(&present_modes, prefer_mailbox).ok_or_else(|| {
            VulkanError::InitializationFailed(
                "driver is missing the mandatory FIFO present mode".to_string(),
            )
        })?;
        let extent = choose_extent(&capabilities, framebuffer);
        let image_count = choose_image_count(&capabilities);

        // TRANSFER_DST: the HDR intermediate (compute or ray output) is
        // blitted into the presentable image before the main pass draws on
        // top of it.
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(ctx.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let handle = unsafe {
            ctx.swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let images = unsafe {
            ctx.swapchain_loader
                .get_swapchain_images(handle)
                .map_err(VulkanError::Api)?
        };

        let image_views = images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                unsafe {
                    ctx.device
                        .create_image_view(&view_info, None)
                        .map_err(VulkanError::Api)
                }
            })
            .collect::<VulkanResult<Vec<_>>>()?;

        log::info!(
            "Swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            images.len(),
            format.format,
            present_mode
        );

        Ok(Self {
            handle,
            images,
            image_views,
            format,
            extent,
        })
    }

    /// Number of presentable images.
    #[must_use]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    fn destroy_views(&mut self, device: &Device) {
        for view in self.image_views.drain(..) {
            unsafe {
                device.destroy_image_view(view, None);
            }
        }
    }

    /// Destroy views, then the swapchain.
    pub fn destroy(&mut self, device: &Device, loader: &SwapchainLoader) {
        self.destroy_views(device);
        unsafe {
            loader.destroy_swapchain(self.handle, None);
        }
        self.handle = vk::SwapchainKHR::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_format_prefers_srgb_bgra() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );
    }

    #[test]
    fn test_surface_format_falls_back_to_first() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn test_present_mode_selection() {
        let with_mailbox = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&with_mailbox, true),
            Some(vk::PresentModeKHR::MAILBOX)
        );
        assert_eq!(
            choose_present_mode(&with_mailbox, false),
            Some(vk::PresentModeKHR::FIFO)
        );

        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&fifo_only, true),
            Some(vk::PresentModeKHR::FIFO)
        );

        // A driver without FIFO violates the Vulkan requirements.
        let broken = [vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&broken, true), None);
    }

    #[test]
    fn test_image_count_requests_triple_buffering() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&caps), 3);

        let capped = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capped), 2);

        let high_min = vk::SurfaceCapabilitiesKHR {
            min_image_count: 4,
            max_image_count: 8,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&high_min), 4);
    }

    #[test]
    fn test_extent_uses_current_when_fixed() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            ..Default::default()
        };
        let extent = choose_extent(&caps, (1920, 1080));
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn test_extent_clamps_framebuffer_when_free() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            max_image_extent: vk::Extent2D {
                width: 1600,
                height: 900,
            },
            ..Default::default()
        };
        let extent = choose_extent(&caps, (1920, 32));
        assert_eq!((extent.width, extent.height), (1600, 64));
    }
}
