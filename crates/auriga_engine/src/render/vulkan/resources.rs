//! GPU resource handles and upload helpers
//!
//! Buffers and images are owned (handle + memory) pairs with explicit
//! `destroy` teardown; views and samplers are derived, non-owning handles.
//! Every handle has exactly one owning component, and destruction order is
//! spelled out by the owner rather than inferred from scope exit.

use ash::{vk, Device};
use std::ffi::c_void;

use crate::render::vulkan::{VulkanError, VulkanResult};

/// Round `size` up to the next multiple of `alignment` (a power of two).
#[must_use]
pub fn align_up(size: u32, alignment: u32) -> u32 {
    (size + alignment - 1) & !(alignment - 1)
}

/// Find a memory type index satisfying `type_filter` and `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    for i in 0..memory_properties.memory_type_count {
        if type_filter & (1 << i) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
        {
            return Ok(i);
        }
    }
    Err(VulkanError::NoSuitableMemoryType)
}

/// An owned buffer + device memory pair.
pub struct GpuBuffer {
    /// Buffer handle
    pub buffer: vk::Buffer,
    /// Backing memory
    pub memory: vk::DeviceMemory,
    /// Allocation size in bytes
    pub size: vk::DeviceSize,
}

impl GpuBuffer {
    /// Allocate a buffer with dedicated memory.
    pub fn new(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .map_err(VulkanError::Api)?
        };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory_type =
            find_memory_type(memory_properties, requirements.memory_type_bits, properties)?;

        // SHADER_DEVICE_ADDRESS usage requires the DEVICE_ADDRESS allocate flag.
        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }

        let memory = unsafe {
            device.allocate_memory(&alloc_info, None).map_err(|e| {
                device.destroy_buffer(buffer, None);
                VulkanError::Api(e)
            })?
        };

        unsafe {
            device
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(VulkanError::Api)?;
        }

        Ok(Self {
            buffer,
            memory,
            size,
        })
    }

    /// Map the whole buffer. The memory must be host-visible.
    pub fn map(&self, device: &Device) -> VulkanResult<*mut c_void> {
        unsafe {
            device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .map_err(VulkanError::Api)
        }
    }

    /// Device address of the buffer. Requires SHADER_DEVICE_ADDRESS usage.
    #[must_use]
    pub fn device_address(&self, device: &Device) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(self.buffer);
        unsafe { device.get_buffer_device_address(&info) }
    }

    /// Destroy the buffer, then its memory.
    pub fn destroy(&mut self, device: &Device) {
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
    }
}

/// An owned image + device memory pair.
pub struct GpuImage {
    /// Image handle
    pub image: vk::Image,
    /// Backing memory
    pub memory: vk::DeviceMemory,
    /// Image format
    pub format: vk::Format,
    /// Image extent
    pub extent: vk::Extent2D,
}

impl GpuImage {
    /// Allocate a 2D image (optionally an array) with dedicated memory.
    pub fn new(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        array_layers: u32,
    ) -> VulkanResult<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(array_layers)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe {
            device
                .create_image(&image_info, None)
                .map_err(VulkanError::Api)?
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type = find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);

        let memory = unsafe {
            device.allocate_memory(&alloc_info, None).map_err(|e| {
                device.destroy_image(image, None);
                VulkanError::Api(e)
            })?
        };

        unsafe {
            device
                .bind_image_memory(image, memory, 0)
                .map_err(VulkanError::Api)?;
        }

        Ok(Self {
            image,
            memory,
            format,
            extent,
        })
    }

    /// Destroy the image, then its memory. Views derived from this image
    /// must already be destroyed by their owner.
    pub fn destroy(&mut self, device: &Device) {
        unsafe {
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
        self.image = vk::Image::null();
        self.memory = vk::DeviceMemory::null();
    }
}

/// Create a 2D view over a single layer of an image.
pub fn create_image_view(
    device: &Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    base_layer: u32,
) -> VulkanResult<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: base_layer,
            layer_count: 1,
        });
    unsafe { device.create_image_view(&info, None).map_err(VulkanError::Api) }
}

/// Create a 2D-array view spanning `layer_count` layers of an image.
pub fn create_image_array_view(
    device: &Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    layer_count: u32,
) -> VulkanResult<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D_ARRAY)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count,
        });
    unsafe { device.create_image_view(&info, None).map_err(VulkanError::Api) }
}

/// Allocate a one-shot command buffer and begin recording.
///
/// Pair with [`end_single_time_commands`], which submits and blocks until the
/// queue drains. Load-time only; never on the per-frame hot path.
pub fn begin_single_time_commands(
    device: &Device,
    command_pool: vk::CommandPool,
) -> VulkanResult<vk::CommandBuffer> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let command_buffer = unsafe {
        device
            .allocate_command_buffers(&alloc_info)
            .map_err(VulkanError::Api)?[0]
    };

    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe {
        device
            .begin_command_buffer(command_buffer, &begin_info)
            .map_err(VulkanError::Api)?;
    }
    Ok(command_buffer)
}

/// Submit a one-shot command buffer and stall until the queue is idle.
pub fn end_single_time_commands(
    device: &Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
) -> VulkanResult<()> {
    unsafe {
        device
            .end_command_buffer(command_buffer)
            .map_err(VulkanError::Api)?;

        let buffers = [command_buffer];
        let submit = vk::SubmitInfo::builder().command_buffers(&buffers);
        device
            .queue_submit(queue, &[submit.build()], vk::Fence::null())
            .map_err(VulkanError::Api)?;
        device.queue_wait_idle(queue).map_err(VulkanError::Api)?;

        device.free_command_buffers(command_pool, &buffers);
    }
    Ok(())
}

/// Upload `data` into a new device-local buffer via a staging buffer.
///
/// The staging buffer lives only for the duration of the call; the copy uses
/// one-shot commands and therefore stalls the queue (load-time only).
pub fn create_device_local_buffer(
    device: &Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    data: &[u8],
    usage: vk::BufferUsageFlags,
) -> VulkanResult<GpuBuffer> {
    let size = data.len() as vk::DeviceSize;

    let mut staging = GpuBuffer::new(
        device,
        memory_properties,
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;

    unsafe {
        let mapped = staging.map(device)?;
        std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.cast::<u8>(), data.len());
        device.unmap_memory(staging.memory);
    }

    let buffer = GpuBuffer::new(
        device,
        memory_properties,
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    let cmd = begin_single_time_commands(device, command_pool)?;
    unsafe {
        let region = vk::BufferCopy::builder().size(size).build();
        device.cmd_copy_buffer(cmd, staging.buffer, buffer.buffer, &[region]);
    }
    end_single_time_commands(device, queue, command_pool, cmd)?;

    staging.destroy(device);
    Ok(buffer)
}

/// Upload RGBA8 pixel data into a new device-local sampled image.
///
/// Transitions UNDEFINED → TRANSFER_DST → SHADER_READ_ONLY via one-shot
/// commands; load-time only.
pub fn upload_texture_rgba8(
    device: &Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    pixels: &[u8],
    width: u32,
    height: u32,
) -> VulkanResult<GpuImage> {
    let size = vk::DeviceSize::from(width) * vk::DeviceSize::from(height) * 4;

    let mut staging = GpuBuffer::new(
        device,
        memory_properties,
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    unsafe {
        let mapped = staging.map(device)?;
        std::ptr::copy_nonoverlapping(pixels.as_ptr(), mapped.cast::<u8>(), size as usize);
        device.unmap_memory(staging.memory);
    }

    let image = GpuImage::new(
        device,
        memory_properties,
        vk::Extent2D { width, height },
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        1,
    )?;

    let cmd = begin_single_time_commands(device, command_pool)?;
    unsafe {
        let to_transfer = vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
            .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();
        let dep = vk::DependencyInfo::builder()
            .image_memory_barriers(std::slice::from_ref(&to_transfer));
        device.cmd_pipeline_barrier2(cmd, &dep);

        let region = vk::BufferImageCopy::builder()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .build();
        device.cmd_copy_buffer_to_image(
            cmd,
            staging.buffer,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );

        let to_sampled = vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
            .dst_access_mask(vk::AccessFlags2::SHADER_READ)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();
        let dep = vk::DependencyInfo::builder()
            .image_memory_barriers(std::slice::from_ref(&to_sampled));
        device.cmd_pipeline_barrier2(cmd, &dep);
    }
    end_single_time_commands(device, queue, command_pool, cmd)?;

    staging.destroy(device);
    Ok(image)
}

/// Create the standard trilinear repeat sampler used for model textures.
pub fn create_texture_sampler(
    device: &Device,
    max_anisotropy: f32,
) -> VulkanResult<vk::Sampler> {
    let info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(true)
        .max_anisotropy(max_anisotropy);
    unsafe { device.create_sampler(&info, None).map_err(VulkanError::Api) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(32, 32), 32);
    }

    fn synthetic_memory_properties() -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags =
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE;
        props
    }

    #[test]
    fn test_find_memory_type_matches_properties() {
        let props = synthetic_memory_properties();
        let idx = find_memory_type(
            &props,
            0b111,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn test_find_memory_type_respects_filter() {
        let props = synthetic_memory_properties();
        // Type 0 is device-local but excluded by the filter; type 2 qualifies.
        let idx =
            find_memory_type(&props, 0b100, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(idx, 2);
    }

    #[test]
    fn test_find_memory_type_fails_when_unsatisfiable() {
        let props = synthetic_memory_properties();
        let result = find_memory_type(&props, 0b001, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert!(matches!(result, Err(VulkanError::NoSuitableMemoryType)));
    }
}
