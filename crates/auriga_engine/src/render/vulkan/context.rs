//! Vulkan context: instance, device selection, logical device, queue
//!
//! Selects a physical device that can run both render paths: ray-tracing
//! pipelines and acceleration structures, bindless descriptor indexing,
//! synchronization2, and dynamic rendering. Devices are scored (discrete
//! first, then VRAM) and the best capable one wins; no capable device is a
//! fatal startup error. A single combined graphics/present queue keeps
//! cross-queue ownership transfers out of the frame pipeline.

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{
    AccelerationStructure as AccelLoader, DeferredHostOperations,
    RayTracingPipeline as RayTracingLoader, Surface as SurfaceLoader,
    Swapchain as SwapchainLoader,
};
use ash::{vk, Device, Entry, Instance};
use std::ffi::{CStr, CString};

use crate::render::vulkan::window::Window;
use crate::render::vulkan::{VulkanError, VulkanResult};

/// Device extensions the renderer cannot run without.
fn required_device_extensions() -> [&'static CStr; 4] {
    [
        SwapchainLoader::name(),
        AccelLoader::name(),
        RayTracingLoader::name(),
        DeferredHostOperations::name(),
    ]
}

/// Selected physical device and its cached capabilities.
pub struct PhysicalDeviceInfo {
    /// Physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory heaps and types, used for every allocation
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Index of the combined graphics + present queue family
    pub queue_family: u32,
    /// Ray-tracing pipeline properties (shader group handle sizing for the
    /// shader binding table)
    pub ray_tracing_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
}

/// Score a candidate device: discrete GPUs are strongly preferred, VRAM
/// breaks ties.
#[must_use]
pub fn score_device(
    properties: &vk::PhysicalDeviceProperties,
    memory: &vk::PhysicalDeviceMemoryProperties,
) -> u32 {
    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 10_000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1_000,
        _ => 0,
    };
    for heap in &memory.memory_heaps[..memory.memory_heap_count as usize] {
        if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
            score += (heap.size / (1024 * 1024)) as u32;
        }
    }
    score
}

/// Names of required device features absent from the queried feature set.
/// Empty means the device qualifies.
#[must_use]
pub fn missing_features(
    features12: &vk::PhysicalDeviceVulkan12Features,
    features13: &vk::PhysicalDeviceVulkan13Features,
    accel: &vk::PhysicalDeviceAccelerationStructureFeaturesKHR,
    ray_tracing: &vk::PhysicalDeviceRayTracingPipelineFeaturesKHR,
) -> Vec<&'static str> {
    let checks: [(&'static str, vk::Bool32); 12] = [
        ("bufferDeviceAddress", features12.buffer_device_address),
        ("runtimeDescriptorArray", features12.runtime_descriptor_array),
        (
            "shaderSampledImageArrayNonUniformIndexing",
            features12.shader_sampled_image_array_non_uniform_indexing,
        ),
        (
            "shaderStorageBufferArrayNonUniformIndexing",
            features12.shader_storage_buffer_array_non_uniform_indexing,
        ),
        (
            "descriptorBindingPartiallyBound",
            features12.descriptor_binding_partially_bound,
        ),
        (
            "descriptorBindingVariableDescriptorCount",
            features12.descriptor_binding_variable_descriptor_count,
        ),
        (
            "descriptorBindingSampledImageUpdateAfterBind",
            features12.descriptor_binding_sampled_image_update_after_bind,
        ),
        (
            "descriptorBindingStorageBufferUpdateAfterBind",
            features12.descriptor_binding_storage_buffer_update_after_bind,
        ),
        ("synchronization2", features13.synchronization2),
        ("dynamicRendering", features13.dynamic_rendering),
        ("accelerationStructure", accel.acceleration_structure),
        ("rayTracingPipeline", ray_tracing.ray_tracing_pipeline),
    ];

    checks
        .iter()
        .filter(|(_, supported)| *supported == vk::FALSE)
        .map(|(name, _)| *name)
        .collect()
}

/// First candidate format whose optimal-tiling features cover `features`.
#[must_use]
pub fn first_supported_format(
    candidates: &[(vk::Format, vk::FormatProperties)],
    features: vk::FormatFeatureFlags,
) -> Option<vk::Format> {
    candidates
        .iter()
        .find(|(_, props)| props.optimal_tiling_features.contains(features))
        .map(|(format, _)| *format)
}

/// Owns the Vulkan connection: instance, surface, logical device, queue,
/// and the extension loaders the rest of the backend calls through.
pub struct VulkanContext {
    /// Vulkan entry point
    pub entry: Entry,
    /// Instance handle
    pub instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    /// Window surface
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader
    pub surface_loader: SurfaceLoader,
    /// Selected physical device
    pub physical_device: PhysicalDeviceInfo,
    /// Logical device
    pub device: Device,
    /// Combined graphics + present queue
    pub queue: vk::Queue,
    /// Swapchain extension loader
    pub swapchain_loader: SwapchainLoader,
    /// Acceleration structure extension loader
    pub accel_loader: AccelLoader,
    /// Ray-tracing pipeline extension loader
    pub rt_loader: RayTracingLoader,
}

impl VulkanContext {
    /// Create the full Vulkan context for a window.
    pub fn new(window: &mut Window, app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            VulkanError::InitializationFailed(format!("failed to load Vulkan: {e:?}"))
        })?;

        let instance = create_instance(&entry, window, app_name, enable_validation)?;
        let debug = if enable_validation {
            Some(create_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = SurfaceLoader::new(&entry, &instance);
        let surface = window
            .create_vulkan_surface(instance.handle())
            .map_err(VulkanError::Window)?;

        let physical_device = select_physical_device(&instance, surface, &surface_loader)?;
        let (device, queue) = create_logical_device(&instance, &physical_device)?;

        let swapchain_loader = SwapchainLoader::new(&instance, &device);
        let accel_loader = AccelLoader::new(&instance, &device);
        let rt_loader = RayTracingLoader::new(&instance, &device);

        Ok(Self {
            entry,
            instance,
            debug,
            surface,
            surface_loader,
            physical_device,
            device,
            queue,
            swapchain_loader,
            accel_loader,
            rt_loader,
        })
    }

    /// First depth format the device supports as a depth attachment.
    pub fn find_depth_format(&self) -> VulkanResult<vk::Format> {
        let candidates: Vec<(vk::Format, vk::FormatProperties)> = [
            vk::Format::D32_SFLOAT,
            vk::Format::D32_SFLOAT_S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
        ]
        .into_iter()
        .map(|format| {
            let props = unsafe {
                self.instance
                    .get_physical_device_format_properties(self.physical_device.device, format)
            };
            (format, props)
        })
        .collect();

        first_supported_format(
            &candidates,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
        .ok_or_else(|| {
            VulkanError::InitializationFailed("no supported depth format".to_string())
        })
    }

    /// Block until the device is fully idle.
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device.device_wait_idle().map_err(VulkanError::Api) }
    }

    /// Tear down the context. Everything created from the device must
    /// already be destroyed.
    pub fn destroy(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn create_instance(
    entry: &Entry,
    window: &Window,
    app_name: &str,
    enable_validation: bool,
) -> VulkanResult<Instance> {
    let app_name_c = CString::new(app_name)
        .map_err(|_| VulkanError::InitializationFailed("app name contains NUL".to_string()))?;
    let engine_name_c = CString::new("Auriga").expect("static engine name has no NUL");

    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name_c)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(&engine_name_c)
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_3);

    let required = window.required_instance_extensions()?;
    let required_c: Vec<CString> = required
        .iter()
        .map(|name| CString::new(name.as_str()))
        .collect::<Result<_, _>>()
        .map_err(|_| {
            VulkanError::InitializationFailed("instance extension name contains NUL".to_string())
        })?;
    let mut extension_ptrs: Vec<*const i8> = required_c.iter().map(|s| s.as_ptr()).collect();
    if enable_validation {
        extension_ptrs.push(DebugUtils::name().as_ptr());
    }

    let validation_layer =
        CStr::from_bytes_with_nul(b"VK_LAYER_KHRONOS_validation\0").expect("static layer name");
    let layer_ptrs: Vec<*const i8> = if enable_validation {
        vec![validation_layer.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extension_ptrs)
        .enabled_layer_names(&layer_ptrs);

    let instance = unsafe {
        entry
            .create_instance(&create_info, None)
            .map_err(VulkanError::Api)?
    };
    log::info!("Vulkan instance created (validation: {enable_validation})");
    Ok(instance)
}

fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> VulkanResult<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = DebugUtils::new(entry, instance);
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));
    let messenger = unsafe {
        debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .map_err(VulkanError::Api)?
    };
    Ok((debug_utils, messenger))
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();
    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] {message_type:?} - {message}");
    } else {
        log::warn!("[Vulkan] {message_type:?} - {message}");
    }
    vk::FALSE
}

fn select_physical_device(
    instance: &Instance,
    surface: vk::SurfaceKHR,
    surface_loader: &SurfaceLoader,
) -> VulkanResult<PhysicalDeviceInfo> {
    let devices = unsafe {
        instance
            .enumerate_physical_devices()
            .map_err(VulkanError::Api)?
    };

    let mut best: Option<(u32, PhysicalDeviceInfo)> = None;

    for device in devices {
        match evaluate_device(instance, device, surface, surface_loader) {
            Ok(info) => {
                let score = score_device(&info.properties, &info.memory_properties);
                if best.as_ref().map_or(true, |(s, _)| score > *s) {
                    best = Some((score, info));
                }
            }
            Err(reason) => {
                log::debug!("Skipping GPU: {reason}");
            }
        }
    }

    let (score, info) = best.ok_or_else(|| {
        VulkanError::InitializationFailed(
            "no GPU supports ray tracing, bindless indexing, synchronization2, and dynamic rendering"
                .to_string(),
        )
    })?;

    let name = unsafe { CStr::from_ptr(info.properties.device_name.as_ptr()) };
    log::info!("Selected GPU: {} (score {score})", name.to_string_lossy());
    log::info!(
        "  shader group handle size {} / handle alignment {} / base alignment {}",
        info.ray_tracing_properties.shader_group_handle_size,
        info.ray_tracing_properties.shader_group_handle_alignment,
        info.ray_tracing_properties.shader_group_base_alignment,
    );
    Ok(info)
}

/// Check one device against the hard requirements. Returns a human-readable
/// rejection reason on failure.
fn evaluate_device(
    instance: &Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: &SurfaceLoader,
) -> Result<PhysicalDeviceInfo, String> {
    let properties = unsafe { instance.get_physical_device_properties(device) };

    if properties.api_version < vk::API_VERSION_1_3 {
        return Err("does not support Vulkan 1.3".to_string());
    }

    // Combined graphics + present queue family.
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(device) };
    let mut queue_family = None;
    for (index, family) in queue_families.iter().enumerate() {
        let index = index as u32;
        if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            continue;
        }
        let present = unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .map_err(|e| format!("surface query failed: {e:?}"))?
        };
        if present {
            queue_family = Some(index);
            break;
        }
    }
    let queue_family =
        queue_family.ok_or_else(|| "no combined graphics/present queue family".to_string())?;

    // Required extensions.
    let available = unsafe {
        instance
            .enumerate_device_extension_properties(device)
            .map_err(|e| format!("extension query failed: {e:?}"))?
    };
    for required in required_device_extensions() {
        let found = available.iter().any(|ext| {
            let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
            name == required
        });
        if !found {
            return Err(format!("missing extension {}", required.to_string_lossy()));
        }
    }

    // Required features.
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut accel = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut ray_tracing = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::builder()
        .push_next(&mut features12)
        .push_next(&mut features13)
        .push_next(&mut accel)
        .push_next(&mut ray_tracing);
    unsafe { instance.get_physical_device_features2(device, &mut features2) };

    let missing = missing_features(&features12, &features13, &accel, &ray_tracing);
    if !missing.is_empty() {
        return Err(format!("missing features: {}", missing.join(", ")));
    }

    // Ray-tracing properties for SBT sizing.
    let mut ray_tracing_properties =
        vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut properties2 =
        vk::PhysicalDeviceProperties2::builder().push_next(&mut ray_tracing_properties);
    unsafe { instance.get_physical_device_properties2(device, &mut properties2) };

    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };

    Ok(PhysicalDeviceInfo {
        device,
        properties,
        memory_properties,
        queue_family,
        ray_tracing_properties,
    })
}

fn create_logical_device(
    instance: &Instance,
    physical: &PhysicalDeviceInfo,
) -> VulkanResult<(Device, vk::Queue)> {
    let queue_priorities = [0.5f32];
    let queue_infos = [vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(physical.queue_family)
        .queue_priorities(&queue_priorities)
        .build()];

    let extension_ptrs: Vec<*const i8> = required_device_extensions()
        .iter()
        .map(|name| name.as_ptr())
        .collect();

    // depth_clamp keeps shadow casters behind the light frustum from being
    // clipped out of the cascade maps.
    let features = vk::PhysicalDeviceFeatures::builder()
        .sampler_anisotropy(true)
        .depth_clamp(true);

    let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
        .buffer_device_address(true)
        .runtime_descriptor_array(true)
        .shader_sampled_image_array_non_uniform_indexing(true)
        .shader_storage_buffer_array_non_uniform_indexing(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_variable_descriptor_count(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .descriptor_binding_storage_buffer_update_after_bind(true);
    let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
        .synchronization2(true)
        .dynamic_rendering(true);
    let mut accel_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
    let mut rt_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extension_ptrs)
        .enabled_features(&features)
        .push_next(&mut features12)
        .push_next(&mut features13)
        .push_next(&mut accel_features)
        .push_next(&mut rt_features);

    let device = unsafe {
        instance
            .create_device(physical.device, &create_info, None)
            .map_err(VulkanError::Api)?
    };
    let queue = unsafe { device.get_device_queue(physical.queue_family, 0) };

    Ok((device, queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discrete_properties(vram_mb: u64) -> (vk::PhysicalDeviceProperties, vk::PhysicalDeviceMemoryProperties) {
        let properties = vk::PhysicalDeviceProperties {
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            ..Default::default()
        };
        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_heap_count: 1,
            ..Default::default()
        };
        memory.memory_heaps[0] = vk::MemoryHeap {
            size: vram_mb * 1024 * 1024,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        (properties, memory)
    }

    #[test]
    fn test_discrete_outranks_integrated() {
        let (discrete, discrete_mem) = discrete_properties(1024);
        let integrated = vk::PhysicalDeviceProperties {
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
            ..Default::default()
        };
        let mut integrated_mem = vk::PhysicalDeviceMemoryProperties {
            memory_heap_count: 1,
            ..Default::default()
        };
        // Far more shared memory than the discrete card has VRAM.
        integrated_mem.memory_heaps[0] = vk::MemoryHeap {
            size: 8 * 1024 * 1024 * 1024,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };

        assert!(
            score_device(&discrete, &discrete_mem)
                > score_device(&integrated, &integrated_mem)
        );
    }

    #[test]
    fn test_vram_breaks_ties() {
        let (props_a, mem_a) = discrete_properties(4096);
        let (props_b, mem_b) = discrete_properties(8192);
        assert!(score_device(&props_b, &mem_b) > score_device(&props_a, &mem_a));
    }

    fn all_features_on() -> (
        vk::PhysicalDeviceVulkan12Features,
        vk::PhysicalDeviceVulkan13Features,
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR,
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR,
    ) {
        let features12 = vk::PhysicalDeviceVulkan12Features {
            buffer_device_address: vk::TRUE,
            runtime_descriptor_array: vk::TRUE,
            shader_sampled_image_array_non_uniform_indexing: vk::TRUE,
            shader_storage_buffer_array_non_uniform_indexing: vk::TRUE,
            descriptor_binding_partially_bound: vk::TRUE,
            descriptor_binding_variable_descriptor_count: vk::TRUE,
            descriptor_binding_sampled_image_update_after_bind: vk::TRUE,
            descriptor_binding_storage_buffer_update_after_bind: vk::TRUE,
            ..Default::default()
        };
        let features13 = vk::PhysicalDeviceVulkan13Features {
            synchronization2: vk::TRUE,
            dynamic_rendering: vk::TRUE,
            ..Default::default()
        };
        let accel = vk::PhysicalDeviceAccelerationStructureFeaturesKHR {
            acceleration_structure: vk::TRUE,
            ..Default::default()
        };
        let ray_tracing = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR {
            ray_tracing_pipeline: vk::TRUE,
            ..Default::default()
        };
        (features12, features13, accel, ray_tracing)
    }

    #[test]
    fn test_full_feature_set_passes() {
        let (f12, f13, accel, rt) = all_features_on();
        assert!(missing_features(&f12, &f13, &accel, &rt).is_empty());
    }

    #[test]
    fn test_missing_ray_tracing_reported_by_name() {
        let (f12, f13, accel, mut rt) = all_features_on();
        rt.ray_tracing_pipeline = vk::FALSE;
        let missing = missing_features(&f12, &f13, &accel, &rt);
        assert_eq!(missing, vec!["rayTracingPipeline"]);
    }

    #[test]
    fn test_missing_bindless_features_reported() {
        let (mut f12, f13, accel, rt) = all_features_on();
        f12.descriptor_binding_partially_bound = vk::FALSE;
        f12.runtime_descriptor_array = vk::FALSE;
        let missing = missing_features(&f12, &f13, &accel, &rt);
        assert!(missing.contains(&"descriptorBindingPartiallyBound"));
        assert!(missing.contains(&"runtimeDescriptorArray"));
    }

    #[test]
    fn test_first_supported_format_prefers_order() {
        let depth_feature = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        let unsupported = vk::FormatProperties::default();
        let supported = vk::FormatProperties {
            optimal_tiling_features: depth_feature,
            ..Default::default()
        };

        let candidates = [
            (vk::Format::D32_SFLOAT, unsupported),
            (vk::Format::D32_SFLOAT_S8_UINT, supported),
            (vk::Format::D24_UNORM_S8_UINT, supported),
        ];
        assert_eq!(
            first_supported_format(&candidates, depth_feature),
            Some(vk::Format::D32_SFLOAT_S8_UINT)
        );

        let none = [(vk::Format::D32_SFLOAT, unsupported)];
        assert_eq!(first_supported_format(&none, depth_feature), None);
    }
}
