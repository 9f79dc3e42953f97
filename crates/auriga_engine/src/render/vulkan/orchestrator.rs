//! Frame orchestration
//!
//! The per-frame driver. Each presented frame walks a fixed state machine:
//!
//! WaitFree → Acquire → UpdateState → RecordShadow (raster only) →
//! RecordMain (raster | ray tracing) → Submit → Present → loop | HandleResize
//!
//! The fence wait in WaitFree is the only hard backpressure point: the CPU
//! can never run more than the slot count ahead of the GPU. The resize path
//! is the only deviation; it discards the current frame, waits for the
//! device to idle, recreates everything extent-dependent, and rewrites the
//! descriptors that referenced it.

use ash::{vk, Device};
use std::time::Instant;

use crate::foundation::math::Vec3;
use crate::render::assets::{ModelRegistry, UploadContext};
use crate::render::camera::Camera;
use crate::render::config::RendererConfig;
use crate::render::scene::{Aabb, SceneSource};
use crate::render::vulkan::accel::{self, to_vk_instance};
use crate::render::vulkan::context::VulkanContext;
use crate::render::vulkan::frame::FrameResources;
use crate::render::vulkan::registry::PipelineRegistry;
use crate::render::vulkan::swapchain::Swapchain;
use crate::render::vulkan::uniforms::ScenePushConstants;
use crate::render::vulkan::window::Window;
use crate::render::vulkan::{
    VulkanError, VulkanResult, FRAMES_IN_FLIGHT, MAX_TLAS_INSTANCES, SHADOW_CASCADE_COUNT,
    SHADOW_MAP_DIM,
};

/// Distance of the box cull volume handed to the scene each frame.
const VIEW_DISTANCE: f32 = 2000.0;

/// Background sky parameters: xyz = color, w = star threshold.
const SKY_DATA: [f32; 4] = [0.01, 0.03, 0.1, 0.99];

/// Per-frame state supplied by the application and UI collaborators, passed
/// by reference each frame instead of stored as back-pointers.
pub struct FrameInputs<'a> {
    /// Camera for this frame
    pub camera: &'a Camera,
    /// Directional light, pointing from sky toward ground
    pub light_direction: Vec3,
    /// Render with the ray-tracing path instead of the raster path
    pub use_ray_tracing: bool,
}

/// Read-only per-frame timing exposed to the UI collaborator.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTimings {
    /// CPU time spent in the last `draw_frame`, milliseconds
    pub frame_cpu_ms: f32,
    /// Time of the last physics step, milliseconds (set by the caller)
    pub physics_ms: f32,
}

/// Callback recording overlay draws (UI) into the main pass, after scene
/// geometry.
pub type OverlayFn<'a> = dyn FnMut(&Device, vk::CommandBuffer) + 'a;

/// The renderer: owns the device context, swapchain, frame resources, and
/// pipeline registry, and drives the per-frame state machine.
pub struct Renderer {
    ctx: VulkanContext,
    swapchain: Swapchain,
    frames: FrameResources,
    registry: PipelineRegistry,
    prefer_mailbox: bool,
    prev_model_count: usize,
    timings: FrameTimings,
}

impl Renderer {
    /// Bring up the full backend for a window. Every failure here is fatal
    /// to startup.
    pub fn new(window: &mut Window, config: &RendererConfig) -> VulkanResult<Self> {
        let mut ctx = VulkanContext::new(window, &config.window_title, config.enable_validation)?;

        let depth_format = match ctx.find_depth_format() {
            Ok(format) => format,
            Err(e) => {
                ctx.destroy();
                return Err(e);
            }
        };

        let swapchain = Swapchain::new(&ctx, window.framebuffer_size(), config.prefer_mailbox)?;
        let frames = FrameResources::new(&ctx, &swapchain, FRAMES_IN_FLIGHT, depth_format)?;
        let registry = PipelineRegistry::new(&ctx, config, swapchain.format.format, &frames)?;

        Ok(Self {
            ctx,
            swapchain,
            frames,
            registry,
            prefer_mailbox: config.prefer_mailbox,
            prev_model_count: 0,
            timings: FrameTimings::default(),
        })
    }

    /// Context for model uploads: device handles plus the descriptor pool
    /// and material layout the registry owns.
    pub fn upload_context(&mut self) -> UploadContext<'_> {
        UploadContext {
            device: &self.ctx.device,
            memory_properties: &self.ctx.physical_device.memory_properties,
            command_pool: self.frames.command_pool,
            queue: self.ctx.queue,
            accel_loader: &self.ctx.accel_loader,
            pool: &mut self.registry.pool,
            material_layout: self.registry.layouts.material,
        }
    }

    /// Last frame's timings.
    #[must_use]
    pub fn timings(&self) -> FrameTimings {
        self.timings
    }

    /// Record the duration of an externally run physics step.
    pub fn set_physics_time(&mut self, milliseconds: f32) {
        self.timings.physics_ms = milliseconds;
    }

    /// The physics compute pipeline, its layout, and its descriptor set, for
    /// the physics collaborator to dispatch with.
    #[must_use]
    pub fn physics_compute(&self) -> (vk::Pipeline, vk::PipelineLayout, vk::DescriptorSet) {
        (
            self.registry.physics,
            self.registry.physics_layout,
            self.registry.physics_set,
        )
    }

    /// Point the physics descriptor set at the collaborator's object buffer.
    pub fn write_physics_buffer(&self, buffer: vk::Buffer, range: vk::DeviceSize) {
        self.registry
            .write_physics_set(&self.ctx.device, buffer, range);
    }

    /// Run `record` inside a one-shot command buffer and stall until the
    /// queue drains. For load-time work and the synchronous physics step;
    /// never the frame hot path.
    pub fn one_shot_commands(
        &self,
        record: impl FnOnce(&Device, vk::CommandBuffer),
    ) -> VulkanResult<()> {
        let cmd = crate::render::vulkan::resources::begin_single_time_commands(
            &self.ctx.device,
            self.frames.command_pool,
        )?;
        record(&self.ctx.device, cmd);
        crate::render::vulkan::resources::end_single_time_commands(
            &self.ctx.device,
            self.ctx.queue,
            self.frames.command_pool,
            cmd,
        )
    }

    /// Drive one frame through the state machine.
    ///
    /// Returns without submitting when acquisition reports the swapchain out
    /// of date; the frame is retried by the caller's loop after the resize.
    pub fn draw_frame(
        &mut self,
        window: &mut Window,
        models: &ModelRegistry,
        scene: &dyn SceneSource,
        inputs: &FrameInputs<'_>,
        mut overlay: Option<&mut OverlayFn<'_>>,
    ) -> VulkanResult<()> {
        let frame_start = Instant::now();

        // Models loaded since last frame: the bindless RT arrays (bindings
        // 2-5) must grow to include the new buffers. Model loads end with a
        // drained queue, so rewriting here is safe.
        if models.resource_count() != self.prev_model_count {
            self.prev_model_count = models.resource_count();
            self.registry
                .rewrite_ray_tracing_sets(&self.ctx, &self.frames, models)?;
        }

        let slot = self.frames.frame_index;

        // WaitFree: the sole backpressure point.
        unsafe {
            self.ctx
                .device
                .wait_for_fences(&[self.frames.in_flight_fences[slot]], true, u64::MAX)
                .map_err(VulkanError::Api)?;
        }

        // Acquire.
        let acquire_result = unsafe {
            self.ctx.swapchain_loader.acquire_next_image(
                self.swapchain.handle,
                u64::MAX,
                self.frames.image_acquired_semaphores[slot],
                vk::Fence::null(),
            )
        };
        let image_index = match acquire_result {
            Ok((index, _suboptimal)) => index,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.handle_resize(window, models)?;
                return Ok(());
            }
            Err(e) => return Err(VulkanError::Api(e)),
        };

        let device = &self.ctx.device;

        // UpdateState.
        self.frames.update_frame_uniforms(
            slot,
            inputs.camera,
            inputs.light_direction,
            self.swapchain.extent,
        );

        // Reset the fence only now that this frame is guaranteed to submit.
        unsafe {
            device
                .reset_fences(&[self.frames.in_flight_fences[slot]])
                .map_err(VulkanError::Api)?;
        }

        let cmd = self.frames.command_buffers[slot];
        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)?;
            device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::builder())
                .map_err(VulkanError::Api)?;
        }

        self.record_frame(cmd, image_index as usize, models, scene, inputs, &mut overlay);

        unsafe {
            device.end_command_buffer(cmd).map_err(VulkanError::Api)?;
        }

        // Submit. The presentable image is touched at color-attachment output
        // (main pass) and transfer (the HDR blit); both must wait on acquire.
        let wait_semaphores = [self.frames.image_acquired_semaphores[slot]];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::TRANSFER];
        let command_buffers = [cmd];
        let signal_semaphores = [self.frames.render_finished_semaphores[image_index as usize]];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            device
                .queue_submit(
                    self.ctx.queue,
                    &[submit.build()],
                    self.frames.in_flight_fences[slot],
                )
                .map_err(VulkanError::Api)?;
        }

        // Present, waiting on the per-image semaphore signalled above.
        let swapchains = [self.swapchain.handle];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let present_result = unsafe {
            self.ctx
                .swapchain_loader
                .queue_present(self.ctx.queue, &present_info)
        };

        let needs_resize = match present_result {
            Ok(suboptimal) => suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
            Err(e) => return Err(VulkanError::Api(e)),
        };
        if needs_resize || window.take_resize_request() {
            self.handle_resize(window, models)?;
        }

        self.frames.advance();
        self.timings.frame_cpu_ms = frame_start.elapsed().as_secs_f32() * 1000.0;
        Ok(())
    }

    /// HandleResize: block while the framebuffer is zero-sized (minimized),
    /// idle the device, recreate the swapchain and extent-dependent images,
    /// and rewrite every descriptor that referenced them.
    pub fn handle_resize(
        &mut self,
        window: &mut Window,
        models: &ModelRegistry,
    ) -> VulkanResult<()> {
        let mut framebuffer = window.framebuffer_size();
        while framebuffer.0 == 0 || framebuffer.1 == 0 {
            window.wait_events();
            framebuffer = window.framebuffer_size();
        }

        self.ctx.wait_idle()?;

        self.swapchain
            .recreate(&self.ctx, framebuffer, self.prefer_mailbox)?;
        self.frames.recreate_for_resize(&self.ctx, &self.swapchain)?;

        // Compute and RT sets reference the recreated storage and ray-output
        // images; both must be rewritten before the next frame records.
        self.registry
            .write_compute_sets(&self.ctx.device, &self.frames);
        self.registry
            .rewrite_ray_tracing_sets(&self.ctx, &self.frames, models)?;

        window.take_resize_request();
        Ok(())
    }

    fn record_frame(
        &self,
        cmd: vk::CommandBuffer,
        image_index: usize,
        models: &ModelRegistry,
        scene: &dyn SceneSource,
        inputs: &FrameInputs<'_>,
        overlay: &mut Option<&mut OverlayFn<'_>>,
    ) {
        let device = &self.ctx.device;
        let slot = self.frames.frame_index;
        let extent = self.swapchain.extent;

        let cull = Aabb::around(inputs.camera.position, VIEW_DISTANCE);
        let instances = scene.visible_instances(&cull);

        if inputs.use_ray_tracing {
            // RecordMain, ray-tracing path: rebuild the TLAS from the live
            // scene, then trace.
            let mut records = accel::emit_instance_records(&instances, models);
            if records.len() > MAX_TLAS_INSTANCES as usize {
                log::warn!(
                    "TLAS instance count {} exceeds the fixed capacity {}; excess dropped",
                    records.len(),
                    MAX_TLAS_INSTANCES
                );
                records.truncate(MAX_TLAS_INSTANCES as usize);
            }
            let vk_instances: Vec<vk::AccelerationStructureInstanceKHR> =
                records.iter().map(to_vk_instance).collect();

            unsafe {
                accel::record_tlas_build(
                    device,
                    &self.ctx.accel_loader,
                    cmd,
                    self.frames.tlas[slot],
                    self.frames.tlas_instance_ptr(slot),
                    self.frames.tlas_instance_addresses[slot],
                    self.frames.tlas_scratch_addresses[slot],
                    &vk_instances,
                );
            }
            self.record_ray_tracing(cmd, image_index);
        } else {
            // RecordShadow: all four cascades, then the background compute
            // pass that fills the presentable image.
            self.record_shadow_pass(cmd, models, &instances);
            self.record_background_compute(cmd, image_index);
        }

        // Common main pass over the presentable image (already filled by
        // blit on both paths, so color load-op is LOAD).
        self.transition_layout(
            cmd,
            self.frames.depth_images[image_index].image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::AccessFlags2::empty(),
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::ImageAspectFlags::DEPTH,
            1,
        );

        let color_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(self.swapchain.image_views[image_index])
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)
            .build();
        let depth_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(self.frames.depth_views[image_index])
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            })
            .build();
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment))
            .depth_attachment(&depth_attachment);

        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);
        }

        if !inputs.use_ray_tracing {
            self.record_scene_draws(cmd, models, &instances);
        }

        if let Some(callback) = overlay.as_deref_mut() {
            callback(device, cmd);
        }

        unsafe {
            device.cmd_end_rendering(cmd);
        }

        self.transition_layout(
            cmd,
            self.swapchain.images[image_index],
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE | vk::AccessFlags2::COLOR_ATTACHMENT_READ,
            vk::AccessFlags2::empty(),
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            vk::ImageAspectFlags::COLOR,
            1,
        );
    }

    /// Render each cascade into its own layer of the slot's shadow array.
    fn record_shadow_pass(
        &self,
        cmd: vk::CommandBuffer,
        models: &ModelRegistry,
        instances: &[crate::render::scene::SceneInstance],
    ) {
        let device = &self.ctx.device;
        let slot = self.frames.frame_index;
        let shadow_image = self.frames.shadow_images[slot].image;

        // All four layers UNDEFINED → DEPTH_ATTACHMENT; old contents are
        // discarded, each cascade clears on load.
        self.transition_layout(
            cmd,
            shadow_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::AccessFlags2::empty(),
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::ImageAspectFlags::DEPTH,
            SHADOW_CASCADE_COUNT as u32,
        );

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.registry.shadow);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.registry.shadow_layout,
                0,
                &[self.registry.global_sets[slot]],
                &[],
            );

            // Fixed viewport at the shadow map resolution, regardless of the
            // swapchain extent.
            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: SHADOW_MAP_DIM as f32,
                height: SHADOW_MAP_DIM as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: SHADOW_MAP_DIM,
                        height: SHADOW_MAP_DIM,
                    },
                }],
            );
        }

        for cascade in 0..SHADOW_CASCADE_COUNT {
            let depth_attachment = vk::RenderingAttachmentInfo::builder()
                .image_view(self.frames.shadow_layer_view(slot, cascade))
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                })
                .build();
            let rendering_info = vk::RenderingInfo::builder()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: SHADOW_MAP_DIM,
                        height: SHADOW_MAP_DIM,
                    },
                })
                .layer_count(1)
                .depth_attachment(&depth_attachment);

            unsafe {
                device.cmd_begin_rendering(cmd, &rendering_info);
            }

            for instance in instances {
                let Some(model) = models.resolve(instance.model_id) else {
                    continue;
                };
                let Some(mesh) = model.meshes.get(instance.mesh_index as usize) else {
                    continue;
                };

                models.bind(device, cmd, instance.model_id);
                unsafe {
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.registry.shadow_layout,
                        1,
                        &[model.descriptor_set],
                        &[],
                    );
                }

                for prim in &mesh.primitives {
                    let push = ScenePushConstants::for_draw(
                        &instance.transform,
                        prim.flat_primitive_index as i32,
                        cascade as i32,
                    );
                    unsafe {
                        device.cmd_push_constants(
                            cmd,
                            self.registry.shadow_layout,
                            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                            0,
                            bytemuck::bytes_of(&push),
                        );
                        device.cmd_draw_indexed(
                            cmd,
                            prim.index_count,
                            1,
                            prim.first_index,
                            prim.vertex_offset as i32,
                            0,
                        );
                    }
                }
            }

            unsafe {
                device.cmd_end_rendering(cmd);
            }
        }

        // DEPTH_ATTACHMENT → SHADER_READ_ONLY before the main pass samples
        // the cascades.
        self.transition_layout(
            cmd,
            shadow_image,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::AccessFlags2::SHADER_READ,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::ImageAspectFlags::DEPTH,
            SHADOW_CASCADE_COUNT as u32,
        );
    }

    /// Dispatch the procedural background into the slot's storage image and
    /// blit it into the presentable image.
    fn record_background_compute(&self, cmd: vk::CommandBuffer, image_index: usize) {
        let device = &self.ctx.device;
        let slot = self.frames.frame_index;
        let extent = self.swapchain.extent;
        let storage_image = self.frames.storage_images[slot].image;

        // Discard previous contents, but wait for the previous frame's blit
        // to finish reading before compute writes.
        self.transition_layout(
            cmd,
            storage_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags2::empty(),
            vk::AccessFlags2::SHADER_WRITE,
            vk::PipelineStageFlags2::TRANSFER,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::ImageAspectFlags::COLOR,
            1,
        );

        unsafe {
            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.registry.background,
            );
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.registry.background_layout,
                0,
                &[self.registry.compute_sets[slot]],
                &[],
            );
            let push = ScenePushConstants::for_background(SKY_DATA);
            device.cmd_push_constants(
                cmd,
                self.registry.background_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&push),
            );
            // 16x16 workgroups.
            device.cmd_dispatch(cmd, (extent.width + 15) / 16, (extent.height + 15) / 16, 1);
        }

        // Compute writes must finish before the blit reads.
        self.blit_to_swapchain(
            cmd,
            storage_image,
            image_index,
            (
                vk::AccessFlags2::SHADER_WRITE,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
            ),
        );
    }

    /// Trace the scene into the slot's ray output image and blit it into the
    /// presentable image.
    fn record_ray_tracing(&self, cmd: vk::CommandBuffer, image_index: usize) {
        let device = &self.ctx.device;
        let slot = self.frames.frame_index;
        let extent = self.swapchain.extent;
        let output_image = self.frames.ray_output_images[slot].image;

        self.transition_layout(
            cmd,
            output_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags2::empty(),
            vk::AccessFlags2::SHADER_WRITE,
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            vk::ImageAspectFlags::COLOR,
            1,
        );

        unsafe {
            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.registry.ray_tracing,
            );
            // Set 0 = RT resources, set 1 = the global frame set.
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.registry.ray_tracing_layout,
                0,
                &[self.registry.rt_sets[slot], self.registry.global_sets[slot]],
                &[],
            );
            let push = ScenePushConstants::for_background(SKY_DATA);
            device.cmd_push_constants(
                cmd,
                self.registry.ray_tracing_layout,
                vk::ShaderStageFlags::RAYGEN_KHR
                    | vk::ShaderStageFlags::CLOSEST_HIT_KHR
                    | vk::ShaderStageFlags::MISS_KHR,
                0,
                bytemuck::bytes_of(&push),
            );

            let callable_region = vk::StridedDeviceAddressRegionKHR::default();
            self.ctx.rt_loader.cmd_trace_rays(
                cmd,
                &self.registry.sbt.raygen_region,
                &self.registry.sbt.miss_region,
                &self.registry.sbt.hit_region,
                &callable_region,
                extent.width,
                extent.height,
                1,
            );
        }

        self.blit_to_swapchain(
            cmd,
            output_image,
            image_index,
            (
                vk::AccessFlags2::SHADER_WRITE,
                vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            ),
        );
    }

    /// Blit an HDR intermediate into the presentable image and leave the
    /// latter as a color attachment for the main pass.
    fn blit_to_swapchain(
        &self,
        cmd: vk::CommandBuffer,
        source: vk::Image,
        image_index: usize,
        (source_access, source_stage): (vk::AccessFlags2, vk::PipelineStageFlags2),
    ) {
        let device = &self.ctx.device;
        let extent = self.swapchain.extent;
        let swapchain_image = self.swapchain.images[image_index];

        self.transition_layout(
            cmd,
            source,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            source_access,
            vk::AccessFlags2::TRANSFER_READ,
            source_stage,
            vk::PipelineStageFlags2::TRANSFER,
            vk::ImageAspectFlags::COLOR,
            1,
        );
        self.transition_layout(
            cmd,
            swapchain_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags2::empty(),
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            vk::PipelineStageFlags2::TRANSFER,
            vk::ImageAspectFlags::COLOR,
            1,
        );

        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let offsets = [
            vk::Offset3D { x: 0, y: 0, z: 0 },
            vk::Offset3D {
                x: extent.width as i32,
                y: extent.height as i32,
                z: 1,
            },
        ];
        let blit = vk::ImageBlit {
            src_subresource: subresource,
            src_offsets: offsets,
            dst_subresource: subresource,
            dst_offsets: offsets,
        };
        unsafe {
            device.cmd_blit_image(
                cmd,
                source,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );
        }

        self.transition_layout(
            cmd,
            swapchain_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE | vk::AccessFlags2::COLOR_ATTACHMENT_READ,
            vk::PipelineStageFlags2::TRANSFER,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::ImageAspectFlags::COLOR,
            1,
        );
    }

    /// Draw the visible instances with the forward pipeline.
    fn record_scene_draws(
        &self,
        cmd: vk::CommandBuffer,
        models: &ModelRegistry,
        instances: &[crate::render::scene::SceneInstance],
    ) {
        let device = &self.ctx.device;
        let slot = self.frames.frame_index;
        let extent = self.swapchain.extent;

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.registry.forward);

            // Negative viewport height flips Vulkan's NDC Y so +Y is up in
            // clip space, matching the projection convention.
            let viewport = vk::Viewport {
                x: 0.0,
                y: extent.height as f32,
                width: extent.width as f32,
                height: -(extent.height as f32),
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                }],
            );

            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.registry.forward_layout,
                0,
                &[self.registry.global_sets[slot]],
                &[],
            );
        }

        for instance in instances {
            let Some(model) = models.resolve(instance.model_id) else {
                continue;
            };
            let Some(mesh) = model.meshes.get(instance.mesh_index as usize) else {
                continue;
            };

            models.bind(device, cmd, instance.model_id);
            unsafe {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.registry.forward_layout,
                    1,
                    &[model.descriptor_set],
                    &[],
                );
            }

            for prim in &mesh.primitives {
                let push = ScenePushConstants::for_draw(
                    &instance.transform,
                    prim.flat_primitive_index as i32,
                    0,
                );
                unsafe {
                    device.cmd_push_constants(
                        cmd,
                        self.registry.forward_layout,
                        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                        0,
                        bytemuck::bytes_of(&push),
                    );
                    device.cmd_draw_indexed(
                        cmd,
                        prim.index_count,
                        1,
                        prim.first_index,
                        prim.vertex_offset as i32,
                        0,
                    );
                }
            }
        }
    }

    /// Record a synchronization2 image barrier.
    fn transition_layout(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_access: vk::AccessFlags2,
        dst_access: vk::AccessFlags2,
        src_stage: vk::PipelineStageFlags2,
        dst_stage: vk::PipelineStageFlags2,
        aspect: vk::ImageAspectFlags,
        layer_count: u32,
    ) {
        let barrier = vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count,
            })
            .build();
        let dependency =
            vk::DependencyInfo::builder().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe {
            self.ctx.device.cmd_pipeline_barrier2(cmd, &dependency);
        }
    }

    /// Explicit teardown: device idle, then models, frame resources,
    /// registry, swapchain, and finally the context.
    pub fn destroy(&mut self, models: &mut ModelRegistry) {
        if self.ctx.wait_idle().is_err() {
            log::warn!("device_wait_idle failed during shutdown");
        }
        models.destroy(&self.ctx.device, &self.ctx.accel_loader);
        self.frames.destroy(&self.ctx);
        self.registry.destroy(&self.ctx.device);
        self.swapchain.destroy(&self.ctx.device, &self.ctx.swapchain_loader);
        self.ctx.destroy();
    }
}
