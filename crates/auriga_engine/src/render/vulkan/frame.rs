//! Frame-keyed GPU resources
//!
//! Everything indexed by frame slot or presentable image lives here.
//! Indexing discipline, after the reference sync model:
//!
//! - fences, acquire semaphores, command buffers, uniform buffers, storage /
//!   ray-output / shadow images, and TLAS resources are indexed by *frame
//!   slot* (`0..slot_count`);
//! - render-finished semaphores and depth images are indexed by *presentable
//!   image*, because acquisition order and slot order can diverge.
//!
//! A slot's command buffer and uniform buffer must not be touched by the CPU
//! until its fence has signalled. Fences are created pre-signalled so the
//! very first wait never blocks.
//!
//! Extent-dependent images (depth, storage, ray output) are destroyed and
//! reallocated on resize; the shadow cascade arrays and TLAS buffers are
//! extent-independent and live for the renderer's whole lifetime.

use ash::{vk, Device};

use crate::foundation::math::Vec3;
use crate::render::camera::Camera;
use crate::render::vulkan::context::VulkanContext;
use crate::render::vulkan::resources::{
    create_image_array_view, create_image_view, GpuBuffer, GpuImage,
};
use crate::render::vulkan::swapchain::Swapchain;
use crate::render::vulkan::uniforms::FrameUniforms;
use crate::render::vulkan::{
    VulkanError, VulkanResult, MAX_TLAS_INSTANCES, SHADOW_CASCADE_COUNT, SHADOW_MAP_DIM,
};

/// HDR intermediate format shared by the compute background and ray-tracing
/// output images; blitted into the sRGB presentable image each frame.
pub const HDR_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

/// Shadow cascade depth format.
pub const SHADOW_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// All frame-keyed and image-keyed GPU resources.
pub struct FrameResources {
    slot_count: usize,
    /// Current frame slot, cycling `0..slot_count`
    pub frame_index: usize,

    /// Pool for the per-slot command buffers
    pub command_pool: vk::CommandPool,
    /// One primary command buffer per slot
    pub command_buffers: Vec<vk::CommandBuffer>,

    /// Per-slot fence; signalled when the slot's submission retires
    pub in_flight_fences: Vec<vk::Fence>,
    /// Per-slot semaphore signalled by image acquisition
    pub image_acquired_semaphores: Vec<vk::Semaphore>,
    /// Per-image semaphore signalled at submit, waited on by present
    pub render_finished_semaphores: Vec<vk::Semaphore>,

    /// Per-slot uniform buffer, host-coherent
    pub uniform_buffers: Vec<GpuBuffer>,
    uniform_mapped: Vec<*mut u8>,

    /// Depth format chosen at startup
    pub depth_format: vk::Format,
    /// Per-image depth buffers
    pub depth_images: Vec<GpuImage>,
    /// Views over the depth buffers
    pub depth_views: Vec<vk::ImageView>,

    /// Per-slot HDR storage images written by the background compute pass
    pub storage_images: Vec<GpuImage>,
    /// Views over the storage images
    pub storage_views: Vec<vk::ImageView>,

    /// Per-slot HDR images written by the ray-tracing path
    pub ray_output_images: Vec<GpuImage>,
    /// Views over the ray output images
    pub ray_output_views: Vec<vk::ImageView>,

    /// Per-slot shadow cascade array images (extent-independent)
    pub shadow_images: Vec<GpuImage>,
    /// Per-layer attachment views: `slot * SHADOW_CASCADE_COUNT + cascade`
    pub shadow_layer_views: Vec<vk::ImageView>,
    /// Per-slot full-array views sampled by the main pass
    pub shadow_array_views: Vec<vk::ImageView>,
    /// Comparison sampler shared by all cascades
    pub shadow_sampler: vk::Sampler,

    /// Per-slot top-level acceleration structures
    pub tlas: Vec<vk::AccelerationStructureKHR>,
    /// Buffers backing the TLAS
    pub tlas_buffers: Vec<GpuBuffer>,
    /// Per-slot TLAS build scratch buffers
    pub tlas_scratch_buffers: Vec<GpuBuffer>,
    /// Device addresses of the scratch buffers
    pub tlas_scratch_addresses: Vec<vk::DeviceAddress>,
    /// Per-slot host-coherent instance buffers
    pub tlas_instance_buffers: Vec<GpuBuffer>,
    tlas_instance_mapped: Vec<*mut u8>,
    /// Device addresses of the instance buffers
    pub tlas_instance_addresses: Vec<vk::DeviceAddress>,
}

impl FrameResources {
    /// Allocate everything for `slot_count` frames in flight against the
    /// given swapchain. Any failure is fatal to initialization.
    pub fn new(
        ctx: &VulkanContext,
        swapchain: &Swapchain,
        slot_count: usize,
        depth_format: vk::Format,
    ) -> VulkanResult<Self> {
        let device = &ctx.device;

        // RESET_COMMAND_BUFFER: slots reset their own buffer each frame
        // without resetting the whole pool.
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(ctx.physical_device.queue_family);
        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(VulkanError::Api)?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(slot_count as u32);
        let command_buffers = unsafe {
            device
                .allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)?
        };

        let mut this = Self {
            slot_count,
            frame_index: 0,
            command_pool,
            command_buffers,
            in_flight_fences: Vec::new(),
            image_acquired_semaphores: Vec::new(),
            render_finished_semaphores: Vec::new(),
            uniform_buffers: Vec::new(),
            uniform_mapped: Vec::new(),
            depth_format,
            depth_images: Vec::new(),
            depth_views: Vec::new(),
            storage_images: Vec::new(),
            storage_views: Vec::new(),
            ray_output_images: Vec::new(),
            ray_output_views: Vec::new(),
            shadow_images: Vec::new(),
            shadow_layer_views: Vec::new(),
            shadow_array_views: Vec::new(),
            shadow_sampler: vk::Sampler::null(),
            tlas: Vec::new(),
            tlas_buffers: Vec::new(),
            tlas_scratch_buffers: Vec::new(),
            tlas_scratch_addresses: Vec::new(),
            tlas_instance_buffers: Vec::new(),
            tlas_instance_mapped: Vec::new(),
            tlas_instance_addresses: Vec::new(),
        };

        this.create_sync_objects(ctx, swapchain.image_count())?;
        this.create_uniform_buffers(ctx)?;
        this.create_depth_resources(ctx, swapchain)?;
        this.create_hdr_images(ctx, swapchain.extent)?;
        this.create_shadow_resources(ctx)?;
        this.create_tlas_resources(ctx)?;

        Ok(this)
    }

    /// Number of frame slots.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Cycle to the next frame slot.
    pub fn advance(&mut self) {
        self.frame_index = next_slot(self.frame_index, self.slot_count);
    }

    /// Index of the attachment view for one cascade of one slot's shadow
    /// array.
    #[must_use]
    pub fn shadow_layer_view(&self, slot: usize, cascade: usize) -> vk::ImageView {
        self.shadow_layer_views[shadow_layer_index(slot, cascade)]
    }

    /// Write the frame uniform payload into a slot's mapped buffer.
    ///
    /// Pure computation plus a memcpy: the buffer is host-coherent, and the
    /// caller has already waited on the slot's fence, so the GPU is not
    /// reading it.
    pub fn update_frame_uniforms(
        &self,
        slot: usize,
        camera: &Camera,
        light_direction: Vec3,
        extent: vk::Extent2D,
    ) {
        let aspect = extent.width as f32 / extent.height as f32;
        let uniforms = FrameUniforms::compute(camera, aspect, light_direction);
        let bytes = bytemuck::bytes_of(&uniforms);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.uniform_mapped[slot], bytes.len());
        }
    }

    /// Mapped pointer to a slot's TLAS instance buffer.
    #[must_use]
    pub fn tlas_instance_ptr(&self, slot: usize) -> *mut u8 {
        self.tlas_instance_mapped[slot]
    }

    /// Destroy and reallocate only the extent-dependent images (depth,
    /// storage, ray output). The device must be fully idle.
    pub fn recreate_for_resize(
        &mut self,
        ctx: &VulkanContext,
        swapchain: &Swapchain,
    ) -> VulkanResult<()> {
        self.destroy_extent_dependent(&ctx.device);
        self.create_depth_resources(ctx, swapchain)?;
        self.create_hdr_images(ctx, swapchain.extent)?;
        Ok(())
    }

    fn create_sync_objects(&mut self, ctx: &VulkanContext, image_count: usize) -> VulkanResult<()> {
        let device = &ctx.device;

        // Render-finished semaphores are indexed by image so present waits on
        // the right signal regardless of which slot rendered the image.
        for _ in 0..image_count {
            let semaphore = unsafe {
                device
                    .create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)
                    .map_err(VulkanError::Api)?
            };
            self.render_finished_semaphores.push(semaphore);
        }

        // Pre-signalled fences: the first WaitFree on each slot returns
        // immediately.
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        for _ in 0..self.slot_count {
            let semaphore = unsafe {
                device
                    .create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)
                    .map_err(VulkanError::Api)?
            };
            self.image_acquired_semaphores.push(semaphore);

            let fence = unsafe {
                device
                    .create_fence(&fence_info, None)
                    .map_err(VulkanError::Api)?
            };
            self.in_flight_fences.push(fence);
        }
        Ok(())
    }

    fn create_uniform_buffers(&mut self, ctx: &VulkanContext) -> VulkanResult<()> {
        let size = std::mem::size_of::<FrameUniforms>() as vk::DeviceSize;
        for _ in 0..self.slot_count {
            let buffer = GpuBuffer::new(
                &ctx.device,
                &ctx.physical_device.memory_properties,
                size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            // Persistently mapped for the renderer's lifetime.
            let mapped = buffer.map(&ctx.device)?.cast::<u8>();
            self.uniform_buffers.push(buffer);
            self.uniform_mapped.push(mapped);
        }
        Ok(())
    }

    fn create_depth_resources(
        &mut self,
        ctx: &VulkanContext,
        swapchain: &Swapchain,
    ) -> VulkanResult<()> {
        for _ in 0..swapchain.image_count() {
            let image = GpuImage::new(
                &ctx.device,
                &ctx.physical_device.memory_properties,
                swapchain.extent,
                self.depth_format,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                1,
            )?;
            let view = create_image_view(
                &ctx.device,
                image.image,
                self.depth_format,
                vk::ImageAspectFlags::DEPTH,
                0,
            )?;
            self.depth_images.push(image);
            self.depth_views.push(view);
        }
        Ok(())
    }

    fn create_hdr_images(&mut self, ctx: &VulkanContext, extent: vk::Extent2D) -> VulkanResult<()> {
        // STORAGE: written by compute / raygen in GENERAL layout.
        // TRANSFER_SRC: blitted into the presentable image afterwards.
        let usage = vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC;
        for _ in 0..self.slot_count {
            let image = GpuImage::new(
                &ctx.device,
                &ctx.physical_device.memory_properties,
                extent,
                HDR_FORMAT,
                usage,
                1,
            )?;
            let view = create_image_view(
                &ctx.device,
                image.image,
                HDR_FORMAT,
                vk::ImageAspectFlags::COLOR,
                0,
            )?;
            self.storage_images.push(image);
            self.storage_views.push(view);

            let image = GpuImage::new(
                &ctx.device,
                &ctx.physical_device.memory_properties,
                extent,
                HDR_FORMAT,
                usage,
                1,
            )?;
            let view = create_image_view(
                &ctx.device,
                image.image,
                HDR_FORMAT,
                vk::ImageAspectFlags::COLOR,
                0,
            )?;
            self.ray_output_images.push(image);
            self.ray_output_views.push(view);
        }
        Ok(())
    }

    fn create_shadow_resources(&mut self, ctx: &VulkanContext) -> VulkanResult<()> {
        let extent = vk::Extent2D {
            width: SHADOW_MAP_DIM,
            height: SHADOW_MAP_DIM,
        };
        for _ in 0..self.slot_count {
            let image = GpuImage::new(
                &ctx.device,
                &ctx.physical_device.memory_properties,
                extent,
                SHADOW_FORMAT,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                SHADOW_CASCADE_COUNT as u32,
            )?;

            for cascade in 0..SHADOW_CASCADE_COUNT {
                let view = create_image_view(
                    &ctx.device,
                    image.image,
                    SHADOW_FORMAT,
                    vk::ImageAspectFlags::DEPTH,
                    cascade as u32,
                )?;
                self.shadow_layer_views.push(view);
            }
            let array_view = create_image_array_view(
                &ctx.device,
                image.image,
                SHADOW_FORMAT,
                vk::ImageAspectFlags::DEPTH,
                SHADOW_CASCADE_COUNT as u32,
            )?;
            self.shadow_array_views.push(array_view);
            self.shadow_images.push(image);
        }

        // Comparison sampler: LESS_OR_EQUAL so a fragment at or in front of
        // the stored depth samples as lit; opaque-white border leaves
        // everything outside the cascade fully lit.
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .compare_enable(true)
            .compare_op(vk::CompareOp::LESS_OR_EQUAL)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE);
        self.shadow_sampler = unsafe {
            ctx.device
                .create_sampler(&sampler_info, None)
                .map_err(VulkanError::Api)?
        };
        Ok(())
    }

    fn create_tlas_resources(&mut self, ctx: &VulkanContext) -> VulkanResult<()> {
        // Size the TLAS for the fixed maximum instance count once; the same
        // structure is rebuilt in place every frame.
        let instances_data =
            vk::AccelerationStructureGeometryInstancesDataKHR::builder().build();
        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            })
            .build();
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry))
            .build();

        let size_info = unsafe {
            ctx.accel_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[MAX_TLAS_INSTANCES],
            )
        };

        let instance_buffer_size = vk::DeviceSize::from(MAX_TLAS_INSTANCES)
            * std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as vk::DeviceSize;

        for _ in 0..self.slot_count {
            let storage = GpuBuffer::new(
                &ctx.device,
                &ctx.physical_device.memory_properties,
                size_info.acceleration_structure_size,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
                .buffer(storage.buffer)
                .size(size_info.acceleration_structure_size)
                .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL);
            let structure = unsafe {
                ctx.accel_loader
                    .create_acceleration_structure(&create_info, None)
                    .map_err(VulkanError::Api)?
            };
            self.tlas.push(structure);
            self.tlas_buffers.push(storage);

            let scratch = GpuBuffer::new(
                &ctx.device,
                &ctx.physical_device.memory_properties,
                size_info.build_scratch_size,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            self.tlas_scratch_addresses
                .push(scratch.device_address(&ctx.device));
            self.tlas_scratch_buffers.push(scratch);

            let instance_buffer = GpuBuffer::new(
                &ctx.device,
                &ctx.physical_device.memory_properties,
                instance_buffer_size,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            self.tlas_instance_mapped
                .push(instance_buffer.map(&ctx.device)?.cast::<u8>());
            self.tlas_instance_addresses
                .push(instance_buffer.device_address(&ctx.device));
            self.tlas_instance_buffers.push(instance_buffer);
        }
        Ok(())
    }

    fn destroy_extent_dependent(&mut self, device: &Device) {
        for view in self.depth_views.drain(..) {
            unsafe { device.destroy_image_view(view, None) };
        }
        for mut image in self.depth_images.drain(..) {
            image.destroy(device);
        }
        for view in self.storage_views.drain(..) {
            unsafe { device.destroy_image_view(view, None) };
        }
        for mut image in self.storage_images.drain(..) {
            image.destroy(device);
        }
        for view in self.ray_output_views.drain(..) {
            unsafe { device.destroy_image_view(view, None) };
        }
        for mut image in self.ray_output_images.drain(..) {
            image.destroy(device);
        }
    }

    /// Tear down everything. The device must be idle.
    pub fn destroy(&mut self, ctx: &VulkanContext) {
        let device = &ctx.device;

        self.destroy_extent_dependent(device);

        unsafe {
            for view in self.shadow_layer_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            for view in self.shadow_array_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            device.destroy_sampler(self.shadow_sampler, None);
        }
        for mut image in self.shadow_images.drain(..) {
            image.destroy(device);
        }

        for structure in self.tlas.drain(..) {
            unsafe {
                ctx.accel_loader
                    .destroy_acceleration_structure(structure, None);
            }
        }
        for mut buffer in self.tlas_buffers.drain(..) {
            buffer.destroy(device);
        }
        for mut buffer in self.tlas_scratch_buffers.drain(..) {
            buffer.destroy(device);
        }
        for mut buffer in self.tlas_instance_buffers.drain(..) {
            buffer.destroy(device);
        }

        for mut buffer in self.uniform_buffers.drain(..) {
            buffer.destroy(device);
        }

        unsafe {
            for fence in self.in_flight_fences.drain(..) {
                device.destroy_fence(fence, None);
            }
            for semaphore in self.image_acquired_semaphores.drain(..) {
                device.destroy_semaphore(semaphore, None);
            }
            for semaphore in self.render_finished_semaphores.drain(..) {
                device.destroy_semaphore(semaphore, None);
            }
            device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Next frame slot after `index`.
#[must_use]
pub fn next_slot(index: usize, slot_count: usize) -> usize {
    (index + 1) % slot_count
}

/// Position of a (slot, cascade) layer view in the slot-major layout.
#[must_use]
pub fn shadow_layer_index(slot: usize, cascade: usize) -> usize {
    slot * SHADOW_CASCADE_COUNT + cascade
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_index_cycles_through_all_slots() {
        let mut index = 0usize;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(index);
            index = next_slot(index, 2);
        }
        assert_eq!(seen, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_shadow_layer_views_are_slot_major() {
        assert_eq!(shadow_layer_index(0, 0), 0);
        assert_eq!(shadow_layer_index(0, 3), 3);
        assert_eq!(shadow_layer_index(1, 0), SHADOW_CASCADE_COUNT);
        assert_eq!(shadow_layer_index(1, 2), SHADOW_CASCADE_COUNT + 2);
    }

    #[test]
    fn test_instance_buffer_sized_for_max_instances() {
        // The wire-format instance is 64 bytes; the per-slot instance buffer
        // must hold the fixed maximum the TLAS was sized for.
        let instance_size = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>();
        assert_eq!(instance_size, 64);
        let total = vk::DeviceSize::from(MAX_TLAS_INSTANCES) * instance_size as vk::DeviceSize;
        assert_eq!(total, 640_000);
    }
}
