//! Pipeline and descriptor registry
//!
//! Defines the shader-visible binding contract once and compiles the fixed
//! set of pipelines against it. Binding numbers and types are ABI with the
//! compiled shaders:
//!
//! | Set      | Binding | Resource                         |
//! |----------|---------|----------------------------------|
//! | global   | 0       | frame uniform payload            |
//! | global   | 1       | shadow cascade depth array       |
//! | global   | 2       | shadow comparison sampler        |
//! | material | 0       | per-model material buffer        |
//! | material | 1       | texture array (bindless)         |
//! | compute  | 0       | storage image                    |
//! | physics  | 0       | physics object buffer            |
//! | rt       | 0       | top-level acceleration structure |
//! | rt       | 1       | ray output image                 |
//! | rt       | 2..4    | vertex/index/material arrays     |
//! | rt       | 5       | global texture array (bindless)  |
//!
//! The descriptor pool is a registry object with explicit allocate/free and
//! a capacity invariant, not ambient shared state.

use ash::{vk, Device};

use crate::render::assets::{ModelRegistry, Vertex};
use crate::render::config::RendererConfig;
use crate::render::vulkan::context::VulkanContext;
use crate::render::vulkan::frame::FrameResources;
use crate::render::vulkan::resources::{align_up, GpuBuffer};
use crate::render::vulkan::shader::{entry_point, ShaderModule};
use crate::render::vulkan::uniforms::{FrameUniforms, ScenePushConstants};
use crate::render::vulkan::{VulkanError, VulkanResult, BINDLESS_CAPACITY, FRAMES_IN_FLIGHT};

/// Descriptor pool with explicit allocate/free and a live-set capacity
/// invariant: `live_sets` never exceeds `max_sets`.
pub struct DescriptorPoolRegistry {
    pool: vk::DescriptorPool,
    max_sets: u32,
    live_sets: u32,
}

impl DescriptorPoolRegistry {
    /// Create the pool, sized generously for an arbitrary number of loaded
    /// models plus the fixed per-frame sets.
    pub fn new(device: &Device) -> VulkanResult<Self> {
        let frames = FRAMES_IN_FLIGHT as u32;
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1000,
            },
            // Per-model material textures plus the bindless texture array of
            // each ray-tracing set.
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 5000,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: 1000,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: 1000,
            },
            // Material buffers plus per-frame vertex/index/material arrays.
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 15_000,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 1000,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: frames,
            },
        ];

        let max_sets = 1000 * frames;
        // FREE_DESCRIPTOR_SET: sets are returned on rewrite and model unload.
        // UPDATE_AFTER_BIND: required by the bindless layouts.
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(
                vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET
                    | vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND,
            )
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);

        let pool = unsafe {
            device
                .create_descriptor_pool(&pool_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            pool,
            max_sets,
            live_sets: 0,
        })
    }

    /// Allocate sets for `layouts`, with optional per-set variable descriptor
    /// counts.
    pub fn allocate(
        &mut self,
        device: &Device,
        layouts: &[vk::DescriptorSetLayout],
        variable_counts: Option<&[u32]>,
    ) -> VulkanResult<Vec<vk::DescriptorSet>> {
        let requested = layouts.len() as u32;
        if self.live_sets + requested > self.max_sets {
            return Err(VulkanError::InitializationFailed(format!(
                "descriptor pool exhausted: {} live + {requested} requested > {} capacity",
                self.live_sets, self.max_sets
            )));
        }

        let mut variable_info = vk::DescriptorSetVariableDescriptorCountAllocateInfo::builder();
        let mut alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);
        if let Some(counts) = variable_counts {
            variable_info = variable_info.descriptor_counts(counts);
            alloc_info = alloc_info.push_next(&mut variable_info);
        }

        let sets = unsafe {
            device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(VulkanError::Api)?
        };
        self.live_sets += requested;
        Ok(sets)
    }

    /// Return sets to the pool.
    pub fn free(&mut self, device: &Device, sets: &[vk::DescriptorSet]) -> VulkanResult<()> {
        if sets.is_empty() {
            return Ok(());
        }
        unsafe {
            device
                .free_descriptor_sets(self.pool, sets)
                .map_err(VulkanError::Api)?;
        }
        self.live_sets = self.live_sets.saturating_sub(sets.len() as u32);
        Ok(())
    }

    /// Number of currently allocated sets.
    #[must_use]
    pub fn live_sets(&self) -> u32 {
        self.live_sets
    }

    /// Destroy the pool; implicitly frees any remaining sets.
    pub fn destroy(&mut self, device: &Device) {
        unsafe {
            device.destroy_descriptor_pool(self.pool, None);
        }
        self.pool = vk::DescriptorPool::null();
        self.live_sets = 0;
    }
}

/// The five descriptor set layouts.
pub struct DescriptorLayouts {
    /// Set 0 of raster and (as set 1) ray-tracing pipelines
    pub global: vk::DescriptorSetLayout,
    /// Per-model material set
    pub material: vk::DescriptorSetLayout,
    /// Background compute set
    pub compute: vk::DescriptorSetLayout,
    /// Physics compute set
    pub physics: vk::DescriptorSetLayout,
    /// Ray-tracing set
    pub ray_tracing: vk::DescriptorSetLayout,
}

/// Shader-binding-table buffers and dispatch regions.
pub struct ShaderBindingTable {
    raygen_buffer: GpuBuffer,
    miss_buffer: GpuBuffer,
    hit_buffer: GpuBuffer,
    /// Ray-generation region
    pub raygen_region: vk::StridedDeviceAddressRegionKHR,
    /// Miss region
    pub miss_region: vk::StridedDeviceAddressRegionKHR,
    /// Hit region
    pub hit_region: vk::StridedDeviceAddressRegionKHR,
}

/// SBT sizing derived from the device's ray-tracing properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtSizes {
    /// Raw shader group handle size
    pub handle_size: u32,
    /// Handle size rounded to the handle alignment (region stride)
    pub handle_size_aligned: u32,
    /// One-handle region rounded to the base alignment (region size, and the
    /// raygen region's stride, which must equal its size)
    pub region_size: u32,
}

/// Compute SBT sizing from device-reported alignments.
#[must_use]
pub fn sbt_sizes(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> SbtSizes {
    let handle_size_aligned = align_up(handle_size, handle_alignment);
    SbtSizes {
        handle_size,
        handle_size_aligned,
        region_size: align_up(handle_size_aligned, base_alignment),
    }
}

/// Owns layouts, pipelines, the SBT, the descriptor pool, and the per-frame
/// descriptor sets.
pub struct PipelineRegistry {
    /// The descriptor pool registry
    pub pool: DescriptorPoolRegistry,
    /// Set layouts
    pub layouts: DescriptorLayouts,

    /// Forward pass pipeline layout
    pub forward_layout: vk::PipelineLayout,
    /// Forward pass pipeline
    pub forward: vk::Pipeline,
    /// Shadow pass pipeline layout
    pub shadow_layout: vk::PipelineLayout,
    /// Depth-only shadow pipeline
    pub shadow: vk::Pipeline,
    /// Background compute pipeline layout
    pub background_layout: vk::PipelineLayout,
    /// Background compute pipeline
    pub background: vk::Pipeline,
    /// Physics compute pipeline layout
    pub physics_layout: vk::PipelineLayout,
    /// Physics compute pipeline
    pub physics: vk::Pipeline,
    /// Ray-tracing pipeline layout
    pub ray_tracing_layout: vk::PipelineLayout,
    /// Ray-tracing pipeline
    pub ray_tracing: vk::Pipeline,

    /// Shader binding table for the ray-tracing pipeline
    pub sbt: ShaderBindingTable,

    /// Per-slot global sets (uniforms + shadow map)
    pub global_sets: Vec<vk::DescriptorSet>,
    /// Per-slot background compute sets
    pub compute_sets: Vec<vk::DescriptorSet>,
    /// Per-slot ray-tracing sets
    pub rt_sets: Vec<vk::DescriptorSet>,
    /// Physics compute set
    pub physics_set: vk::DescriptorSet,
}

impl PipelineRegistry {
    /// Create layouts, pool, pipelines, and the SBT, then allocate and write
    /// the per-frame descriptor sets. Shader compilation failures are fatal.
    pub fn new(
        ctx: &VulkanContext,
        config: &RendererConfig,
        color_format: vk::Format,
        frames: &FrameResources,
    ) -> VulkanResult<Self> {
        let device = &ctx.device;
        let layouts = create_descriptor_layouts(device)?;
        let mut pool = DescriptorPoolRegistry::new(device)?;

        let (forward_layout, forward) = create_forward_pipeline(
            device,
            &layouts,
            color_format,
            frames.depth_format,
            config,
        )?;
        let (shadow_layout, shadow) = create_shadow_pipeline(device, &layouts, config)?;
        let (background_layout, background) = create_compute_pipeline(
            device,
            layouts.compute,
            &config.shader_path(&config.shaders.background_comp),
        )?;
        let (physics_layout, physics) = create_compute_pipeline(
            device,
            layouts.physics,
            &config.shader_path(&config.shaders.physics_comp),
        )?;
        let (ray_tracing_layout, ray_tracing) = create_ray_tracing_pipeline(
            ctx,
            &layouts,
            config,
        )?;
        let sbt = create_shader_binding_table(ctx, ray_tracing)?;

        let slot_count = frames.slot_count();
        let global_sets =
            pool.allocate(device, &vec![layouts.global; slot_count], None)?;
        let compute_sets =
            pool.allocate(device, &vec![layouts.compute; slot_count], None)?;
        let physics_set = pool.allocate(device, &[layouts.physics], None)?[0];

        let mut registry = Self {
            pool,
            layouts,
            forward_layout,
            forward,
            shadow_layout,
            shadow,
            background_layout,
            background,
            physics_layout,
            physics,
            ray_tracing_layout,
            ray_tracing,
            sbt,
            global_sets,
            compute_sets,
            rt_sets: Vec::new(),
            physics_set,
        };

        registry.write_global_sets(device, frames);
        registry.write_compute_sets(device, frames);
        // RT sets are written (and rewritten) against the live model list.
        registry.rewrite_ray_tracing_sets(ctx, frames, &ModelRegistry::new())?;

        Ok(registry)
    }

    /// Write the per-slot global sets: uniform buffer, shadow array view,
    /// shadow comparison sampler.
    pub fn write_global_sets(&self, device: &Device, frames: &FrameResources) {
        for (slot, &set) in self.global_sets.iter().enumerate() {
            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: frames.uniform_buffers[slot].buffer,
                offset: 0,
                range: std::mem::size_of::<FrameUniforms>() as vk::DeviceSize,
            }];
            // Declared SHADER_READ_ONLY: each frame's shadow pass transitions
            // the array UNDEFINED → DEPTH_ATTACHMENT → SHADER_READ_ONLY
            // before the main pass samples it.
            let shadow_image_info = [vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: frames.shadow_array_views[slot],
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];
            let sampler_info = [vk::DescriptorImageInfo {
                sampler: frames.shadow_sampler,
                image_view: vk::ImageView::null(),
                image_layout: vk::ImageLayout::UNDEFINED,
            }];

            let writes = [
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(1)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(&shadow_image_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(2)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .image_info(&sampler_info)
                    .build(),
            ];
            unsafe {
                device.update_descriptor_sets(&writes, &[]);
            }
        }
    }

    /// Write the per-slot compute sets against the current storage images.
    /// Called again after a resize recreates those images.
    pub fn write_compute_sets(&self, device: &Device, frames: &FrameResources) {
        for (slot, &set) in self.compute_sets.iter().enumerate() {
            let image_info = [vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: frames.storage_views[slot],
                image_layout: vk::ImageLayout::GENERAL,
            }];
            let write = vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&image_info)
                .build();
            unsafe {
                device.update_descriptor_sets(std::slice::from_ref(&write), &[]);
            }
        }
    }

    /// Write the physics set against the collaborator's object buffer.
    pub fn write_physics_set(&self, device: &Device, buffer: vk::Buffer, range: vk::DeviceSize) {
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.physics_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_info)
            .build();
        unsafe {
            device.update_descriptor_sets(std::slice::from_ref(&write), &[]);
        }
    }

    /// Free and re-allocate the per-slot ray-tracing sets, rewriting every
    /// binding from the live frame resources and model list.
    ///
    /// Must run with the queue idle: after model loads (the BLAS upload has
    /// already drained the queue) and after a resize (the resize path idles
    /// the device). Each model contributes one entry to the vertex, index,
    /// and material arrays at its id's position; a model missing any of the
    /// three buffers dies here rather than corrupting every other model's
    /// indexing.
    pub fn rewrite_ray_tracing_sets(
        &mut self,
        ctx: &VulkanContext,
        frames: &FrameResources,
        models: &ModelRegistry,
    ) -> VulkanResult<()> {
        let device = &ctx.device;
        let slot_count = frames.slot_count();

        let old_sets = std::mem::take(&mut self.rt_sets);
        self.pool.free(device, &old_sets)?;

        let counts = vec![BINDLESS_CAPACITY; slot_count];
        self.rt_sets = self.pool.allocate(
            device,
            &vec![self.layouts.ray_tracing; slot_count],
            Some(&counts),
        )?;

        // Gather model buffer and texture entries once; identical for every
        // slot.
        let mut vertex_infos = Vec::with_capacity(models.resource_count());
        let mut index_infos = Vec::with_capacity(models.resource_count());
        let mut material_infos = Vec::with_capacity(models.resource_count());
        let mut texture_infos = Vec::new();
        for model in models.iter() {
            let (vertex, index, material) = model.bindless_buffers();
            vertex_infos.push(vk::DescriptorBufferInfo {
                buffer: vertex,
                offset: 0,
                range: vk::WHOLE_SIZE,
            });
            index_infos.push(vk::DescriptorBufferInfo {
                buffer: index,
                offset: 0,
                range: vk::WHOLE_SIZE,
            });
            material_infos.push(vk::DescriptorBufferInfo {
                buffer: material,
                offset: 0,
                range: vk::WHOLE_SIZE,
            });
            for texture in &model.textures {
                texture_infos.push(vk::DescriptorImageInfo {
                    sampler: texture.sampler,
                    image_view: texture.view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                });
            }
        }

        for (slot, &set) in self.rt_sets.iter().enumerate() {
            // Binding 0 — the slot's TLAS. Acceleration structures hang off
            // the write's pNext; descriptor_count comes from that struct and
            // must be patched in explicitly.
            let tlas_handles = [frames.tlas[slot]];
            let mut tlas_info = vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                .acceleration_structures(&tlas_handles);
            let mut tlas_write = vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .push_next(&mut tlas_info)
                .build();
            tlas_write.descriptor_count = 1;

            // Binding 1 — the slot's ray output image, written in GENERAL.
            let output_info = [vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: frames.ray_output_views[slot],
                image_layout: vk::ImageLayout::GENERAL,
            }];
            let output_write = vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&output_info)
                .build();

            let mut writes = vec![tlas_write, output_write];
            if !vertex_infos.is_empty() {
                writes.push(
                    vk::WriteDescriptorSet::builder()
                        .dst_set(set)
                        .dst_binding(2)
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .buffer_info(&vertex_infos)
                        .build(),
                );
                writes.push(
                    vk::WriteDescriptorSet::builder()
                        .dst_set(set)
                        .dst_binding(3)
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .buffer_info(&index_infos)
                        .build(),
                );
                writes.push(
                    vk::WriteDescriptorSet::builder()
                        .dst_set(set)
                        .dst_binding(4)
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .buffer_info(&material_infos)
                        .build(),
                );
            }
            if !texture_infos.is_empty() {
                writes.push(
                    vk::WriteDescriptorSet::builder()
                        .dst_set(set)
                        .dst_binding(5)
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(&texture_infos)
                        .build(),
                );
            }

            unsafe {
                device.update_descriptor_sets(&writes, &[]);
            }
        }
        Ok(())
    }

    /// Tear down pipelines before layouts, then the descriptor pool.
    pub fn destroy(&mut self, device: &Device) {
        unsafe {
            for pipeline in [
                self.forward,
                self.shadow,
                self.background,
                self.physics,
                self.ray_tracing,
            ] {
                device.destroy_pipeline(pipeline, None);
            }
            for layout in [
                self.forward_layout,
                self.shadow_layout,
                self.background_layout,
                self.physics_layout,
                self.ray_tracing_layout,
            ] {
                device.destroy_pipeline_layout(layout, None);
            }
            for set_layout in [
                self.layouts.global,
                self.layouts.material,
                self.layouts.compute,
                self.layouts.physics,
                self.layouts.ray_tracing,
            ] {
                device.destroy_descriptor_set_layout(set_layout, None);
            }
        }
        self.sbt.raygen_buffer.destroy(device);
        self.sbt.miss_buffer.destroy(device);
        self.sbt.hit_buffer.destroy(device);
        self.pool.destroy(device);
    }
}

fn create_descriptor_layouts(device: &Device) -> VulkanResult<DescriptorLayouts> {
    // Global set. Bindings 1 and 2 are PARTIALLY_BOUND: the compute and
    // ray-tracing paths bind this set without sampling the shadow map.
    let global_bindings = [
        vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::VERTEX
                | vk::ShaderStageFlags::FRAGMENT
                | vk::ShaderStageFlags::RAYGEN_KHR
                | vk::ShaderStageFlags::CLOSEST_HIT_KHR
                | vk::ShaderStageFlags::MISS_KHR,
            ..Default::default()
        },
        vk::DescriptorSetLayoutBinding {
            binding: 1,
            descriptor_type: vk::DescriptorType::SAMPLED_IMAGE,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            ..Default::default()
        },
        vk::DescriptorSetLayoutBinding {
            binding: 2,
            descriptor_type: vk::DescriptorType::SAMPLER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            ..Default::default()
        },
    ];
    let global_flags = [
        vk::DescriptorBindingFlags::empty(),
        vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        vk::DescriptorBindingFlags::PARTIALLY_BOUND,
    ];
    let global = create_layout(
        device,
        &global_bindings,
        &global_flags,
        vk::DescriptorSetLayoutCreateFlags::empty(),
    )?;

    // Material set: binding 1 is the bindless texture array.
    let material_bindings = [
        vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            ..Default::default()
        },
        vk::DescriptorSetLayoutBinding {
            binding: 1,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: BINDLESS_CAPACITY,
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            ..Default::default()
        },
    ];
    let material_flags = [
        vk::DescriptorBindingFlags::empty(),
        vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
    ];
    let material = create_layout(
        device,
        &material_bindings,
        &material_flags,
        vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL,
    )?;

    let compute_bindings = [vk::DescriptorSetLayoutBinding {
        binding: 0,
        descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
        descriptor_count: 1,
        stage_flags: vk::ShaderStageFlags::COMPUTE,
        ..Default::default()
    }];
    let compute = create_layout(
        device,
        &compute_bindings,
        &[vk::DescriptorBindingFlags::empty()],
        vk::DescriptorSetLayoutCreateFlags::empty(),
    )?;

    let physics_bindings = [vk::DescriptorSetLayoutBinding {
        binding: 0,
        descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
        descriptor_count: 1,
        stage_flags: vk::ShaderStageFlags::COMPUTE,
        ..Default::default()
    }];
    let physics = create_layout(
        device,
        &physics_bindings,
        &[vk::DescriptorBindingFlags::empty()],
        vk::DescriptorSetLayoutCreateFlags::empty(),
    )?;

    let rt_stages = vk::ShaderStageFlags::CLOSEST_HIT_KHR;
    let rt_bindings = [
        vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            ..Default::default()
        },
        vk::DescriptorSetLayoutBinding {
            binding: 1,
            descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::RAYGEN_KHR,
            ..Default::default()
        },
        vk::DescriptorSetLayoutBinding {
            binding: 2,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: BINDLESS_CAPACITY,
            stage_flags: rt_stages,
            ..Default::default()
        },
        vk::DescriptorSetLayoutBinding {
            binding: 3,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: BINDLESS_CAPACITY,
            stage_flags: rt_stages,
            ..Default::default()
        },
        vk::DescriptorSetLayoutBinding {
            binding: 4,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: BINDLESS_CAPACITY,
            stage_flags: rt_stages,
            ..Default::default()
        },
        vk::DescriptorSetLayoutBinding {
            binding: 5,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: BINDLESS_CAPACITY,
            stage_flags: rt_stages,
            ..Default::default()
        },
    ];
    let array_flags = vk::DescriptorBindingFlags::PARTIALLY_BOUND
        | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
    let rt_flags = [
        vk::DescriptorBindingFlags::empty(),
        vk::DescriptorBindingFlags::empty(),
        array_flags,
        array_flags,
        array_flags,
        array_flags | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT,
    ];
    let ray_tracing = create_layout(
        device,
        &rt_bindings,
        &rt_flags,
        vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL,
    )?;

    Ok(DescriptorLayouts {
        global,
        material,
        compute,
        physics,
        ray_tracing,
    })
}

fn create_layout(
    device: &Device,
    bindings: &[vk::DescriptorSetLayoutBinding],
    flags: &[vk::DescriptorBindingFlags],
    layout_flags: vk::DescriptorSetLayoutCreateFlags,
) -> VulkanResult<vk::DescriptorSetLayout> {
    let mut binding_flags =
        vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(flags);
    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
        .flags(layout_flags)
        .bindings(bindings)
        .push_next(&mut binding_flags);
    unsafe {
        device
            .create_descriptor_set_layout(&layout_info, None)
            .map_err(VulkanError::Api)
    }
}

fn create_raster_pipeline_layout(
    device: &Device,
    layouts: &DescriptorLayouts,
) -> VulkanResult<vk::PipelineLayout> {
    let set_layouts = [layouts.global, layouts.material];
    let push_range = vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        offset: 0,
        size: std::mem::size_of::<ScenePushConstants>() as u32,
    };
    let info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&set_layouts)
        .push_constant_ranges(std::slice::from_ref(&push_range));
    unsafe {
        device
            .create_pipeline_layout(&info, None)
            .map_err(VulkanError::Api)
    }
}

fn create_forward_pipeline(
    device: &Device,
    layouts: &DescriptorLayouts,
    color_format: vk::Format,
    depth_format: vk::Format,
    config: &RendererConfig,
) -> VulkanResult<(vk::PipelineLayout, vk::Pipeline)> {
    let mut vert = ShaderModule::from_file(
        device,
        config.shader_path(&config.shaders.forward_vert),
    )?;
    let mut frag = ShaderModule::from_file(
        device,
        config.shader_path(&config.shaders.forward_frag),
    )?;

    let stages = [
        vert.stage_info(vk::ShaderStageFlags::VERTEX, entry_point()),
        frag.stage_info(vk::ShaderStageFlags::FRAGMENT, entry_point()),
    ];

    let binding = [Vertex::binding_description()];
    let attributes = Vertex::attribute_descriptions();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&binding)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS);

    let blend_attachment = vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::FALSE,
        color_write_mask: vk::ColorComponentFlags::RGBA,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
        .attachments(std::slice::from_ref(&blend_attachment));

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let layout = create_raster_pipeline_layout(device, layouts)?;

    let color_formats = [color_format];
    let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(depth_format);

    let info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipeline = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[info.build()], None)
            .map_err(|(_, e)| VulkanError::Api(e))?[0]
    };

    vert.destroy(device);
    frag.destroy(device);
    Ok((layout, pipeline))
}

fn create_shadow_pipeline(
    device: &Device,
    layouts: &DescriptorLayouts,
    config: &RendererConfig,
) -> VulkanResult<(vk::PipelineLayout, vk::Pipeline)> {
    let mut vert = ShaderModule::from_file(
        device,
        config.shader_path(&config.shaders.shadow_vert),
    )?;
    let mut frag = ShaderModule::from_file(
        device,
        config.shader_path(&config.shaders.shadow_frag),
    )?;

    let stages = [
        vert.stage_info(vk::ShaderStageFlags::VERTEX, entry_point()),
        frag.stage_info(vk::ShaderStageFlags::FRAGMENT, entry_point()),
    ];

    let binding = [Vertex::binding_description()];
    let attributes = Vertex::attribute_descriptions();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&binding)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    // depth_clamp keeps casters behind the light's near plane; no culling so
    // thin geometry shadows from both sides. Acne is handled by the shader's
    // normal-offset bias, not a hardware depth bias.
    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(true)
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::CLOCKWISE)
        .line_width(1.0);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS);

    // Depth-only: no color attachments.
    let color_blend = vk::PipelineColorBlendStateCreateInfo::builder();

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let layout = create_raster_pipeline_layout(device, layouts)?;

    let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
        .depth_attachment_format(crate::render::vulkan::frame::SHADOW_FORMAT);

    let info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipeline = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[info.build()], None)
            .map_err(|(_, e)| VulkanError::Api(e))?[0]
    };

    vert.destroy(device);
    frag.destroy(device);
    Ok((layout, pipeline))
}

fn create_compute_pipeline(
    device: &Device,
    set_layout: vk::DescriptorSetLayout,
    shader_path: &std::path::Path,
) -> VulkanResult<(vk::PipelineLayout, vk::Pipeline)> {
    let mut module = ShaderModule::from_file(device, shader_path)?;

    let push_range = vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::COMPUTE,
        offset: 0,
        size: std::mem::size_of::<ScenePushConstants>() as u32,
    };
    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(std::slice::from_ref(&set_layout))
        .push_constant_ranges(std::slice::from_ref(&push_range));
    let layout = unsafe {
        device
            .create_pipeline_layout(&layout_info, None)
            .map_err(VulkanError::Api)?
    };

    let info = vk::ComputePipelineCreateInfo::builder()
        .stage(module.stage_info(vk::ShaderStageFlags::COMPUTE, entry_point()))
        .layout(layout);
    let pipeline = unsafe {
        device
            .create_compute_pipelines(vk::PipelineCache::null(), &[info.build()], None)
            .map_err(|(_, e)| VulkanError::Api(e))?[0]
    };

    module.destroy(device);
    Ok((layout, pipeline))
}

fn create_ray_tracing_pipeline(
    ctx: &VulkanContext,
    layouts: &DescriptorLayouts,
    config: &RendererConfig,
) -> VulkanResult<(vk::PipelineLayout, vk::Pipeline)> {
    let device = &ctx.device;
    let mut raygen =
        ShaderModule::from_file(device, config.shader_path(&config.shaders.raygen))?;
    let mut miss = ShaderModule::from_file(device, config.shader_path(&config.shaders.miss))?;
    let mut closest_hit =
        ShaderModule::from_file(device, config.shader_path(&config.shaders.closest_hit))?;

    let stages = [
        raygen.stage_info(vk::ShaderStageFlags::RAYGEN_KHR, entry_point()),
        miss.stage_info(vk::ShaderStageFlags::MISS_KHR, entry_point()),
        closest_hit.stage_info(vk::ShaderStageFlags::CLOSEST_HIT_KHR, entry_point()),
    ];

    // Three groups: raygen, miss, triangles hit. Group order defines the SBT
    // handle order below.
    let groups = [
        vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(0)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build(),
        vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(1)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build(),
        vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .general_shader(vk::SHADER_UNUSED_KHR)
            .closest_hit_shader(2)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build(),
    ];

    let set_layouts = [layouts.ray_tracing, layouts.global];
    let push_range = vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::RAYGEN_KHR
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR
            | vk::ShaderStageFlags::MISS_KHR,
        offset: 0,
        size: std::mem::size_of::<ScenePushConstants>() as u32,
    };
    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&set_layouts)
        .push_constant_ranges(std::slice::from_ref(&push_range));
    let layout = unsafe {
        device
            .create_pipeline_layout(&layout_info, None)
            .map_err(VulkanError::Api)?
    };

    let info = vk::RayTracingPipelineCreateInfoKHR::builder()
        .stages(&stages)
        .groups(&groups)
        .max_pipeline_ray_recursion_depth(1)
        .layout(layout);
    let pipeline = unsafe {
        ctx.rt_loader
            .create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[info.build()],
                None,
            )
            .map_err(VulkanError::Api)?[0]
    };

    raygen.destroy(device);
    miss.destroy(device);
    closest_hit.destroy(device);
    Ok((layout, pipeline))
}

fn create_shader_binding_table(
    ctx: &VulkanContext,
    pipeline: vk::Pipeline,
) -> VulkanResult<ShaderBindingTable> {
    let props = &ctx.physical_device.ray_tracing_properties;
    let sizes = sbt_sizes(
        props.shader_group_handle_size,
        props.shader_group_handle_alignment,
        props.shader_group_base_alignment,
    );

    const GROUP_COUNT: u32 = 3;
    let handles = unsafe {
        ctx.rt_loader
            .get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                GROUP_COUNT,
                (GROUP_COUNT * sizes.handle_size) as usize,
            )
            .map_err(VulkanError::Api)?
    };

    let mut make_region_buffer = |handle_index: usize| -> VulkanResult<GpuBuffer> {
        let buffer = GpuBuffer::new(
            &ctx.device,
            &ctx.physical_device.memory_properties,
            vk::DeviceSize::from(sizes.region_size),
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let offset = handle_index * sizes.handle_size as usize;
        unsafe {
            let mapped = buffer.map(&ctx.device)?;
            std::ptr::copy_nonoverlapping(
                handles[offset..].as_ptr(),
                mapped.cast::<u8>(),
                sizes.handle_size as usize,
            );
            ctx.device.unmap_memory(buffer.memory);
        }
        Ok(buffer)
    };

    let raygen_buffer = make_region_buffer(0)?;
    let miss_buffer = make_region_buffer(1)?;
    let hit_buffer = make_region_buffer(2)?;

    // The raygen region's stride must equal its size; miss and hit regions
    // stride by the aligned handle size.
    let raygen_region = vk::StridedDeviceAddressRegionKHR {
        device_address: raygen_buffer.device_address(&ctx.device),
        stride: vk::DeviceSize::from(sizes.region_size),
        size: vk::DeviceSize::from(sizes.region_size),
    };
    let miss_region = vk::StridedDeviceAddressRegionKHR {
        device_address: miss_buffer.device_address(&ctx.device),
        stride: vk::DeviceSize::from(sizes.handle_size_aligned),
        size: vk::DeviceSize::from(sizes.region_size),
    };
    let hit_region = vk::StridedDeviceAddressRegionKHR {
        device_address: hit_buffer.device_address(&ctx.device),
        stride: vk::DeviceSize::from(sizes.handle_size_aligned),
        size: vk::DeviceSize::from(sizes.region_size),
    };

    Ok(ShaderBindingTable {
        raygen_buffer,
        miss_buffer,
        hit_buffer,
        raygen_region,
        miss_region,
        hit_region,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sbt_sizes_typical_hardware() {
        // Common discrete GPU values: 32-byte handles, 32-byte handle
        // alignment, 64-byte base alignment.
        let sizes = sbt_sizes(32, 32, 64);
        assert_eq!(sizes.handle_size_aligned, 32);
        assert_eq!(sizes.region_size, 64);
    }

    #[test]
    fn test_sbt_sizes_loose_alignment() {
        let sizes = sbt_sizes(32, 64, 256);
        assert_eq!(sizes.handle_size_aligned, 64);
        assert_eq!(sizes.region_size, 256);
    }

    #[test]
    fn test_sbt_region_covers_handle() {
        for (h, ha, ba) in [(16u32, 16u32, 32u32), (32, 32, 64), (64, 64, 128)] {
            let sizes = sbt_sizes(h, ha, ba);
            assert!(sizes.handle_size_aligned >= sizes.handle_size);
            assert!(sizes.region_size >= sizes.handle_size_aligned);
            assert_eq!(sizes.region_size % ba, 0);
        }
    }
}
