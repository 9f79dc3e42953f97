//! Ray-tracing acceleration structures
//!
//! Bottom-level structures are built once per model sub-mesh group right
//! after its geometry buffers are uploaded and are immutable afterwards. The
//! top-level structure is rebuilt every frame from the live scene; building
//! with zero instances is valid and still produces a traversable structure.
//!
//! Each TLAS instance carries a packed 24-bit custom index: model id in the
//! top 10 bits, flat primitive offset in the bottom 14. Hit shaders decode it
//! to look up geometry and materials in the bindless arrays.

use ash::extensions::khr::AccelerationStructure as AccelLoader;
use ash::{vk, Device};

use crate::foundation::math::Mat4;
use crate::render::assets::{Mesh, ModelRegistry, Vertex};
use crate::render::scene::SceneInstance;
use crate::render::vulkan::resources::{
    begin_single_time_commands, end_single_time_commands, GpuBuffer,
};
use crate::render::vulkan::{VulkanError, VulkanResult};

/// Bits of the custom index carrying the model id.
pub const MODEL_ID_BITS: u32 = 10;

/// Bits of the custom index carrying the flat primitive offset.
pub const PRIMITIVE_OFFSET_BITS: u32 = 14;

/// Pack (model id, primitive offset) into the 24-bit instance custom index.
///
/// Exceeding either field would silently corrupt shader-side lookups, so
/// both are checked. Model ids are already bounded at registration; reaching
/// this point with an oversized value is a programming error.
#[must_use]
pub fn encode_custom_index(model_id: u32, primitive_offset: u32) -> u32 {
    debug_assert!(
        model_id < (1 << MODEL_ID_BITS),
        "model id {model_id} exceeds the 10-bit custom index field"
    );
    debug_assert!(
        primitive_offset < (1 << PRIMITIVE_OFFSET_BITS),
        "primitive offset {primitive_offset} exceeds the 14-bit custom index field"
    );
    (model_id << PRIMITIVE_OFFSET_BITS) | (primitive_offset & ((1 << PRIMITIVE_OFFSET_BITS) - 1))
}

/// Unpack a 24-bit custom index into (model id, primitive offset).
#[must_use]
pub fn decode_custom_index(custom_index: u32) -> (u32, u32) {
    (
        (custom_index >> PRIMITIVE_OFFSET_BITS) & ((1 << MODEL_ID_BITS) - 1),
        custom_index & ((1 << PRIMITIVE_OFFSET_BITS) - 1),
    )
}

/// Convert a column-major world matrix to the 3×4 row-major layout
/// acceleration-structure instances use.
#[must_use]
pub fn transform_to_3x4(m: &Mat4) -> [f32; 12] {
    let mut out = [0.0f32; 12];
    for row in 0..3 {
        for col in 0..4 {
            out[row * 4 + col] = m[(row, col)];
        }
    }
    out
}

/// One emitted TLAS instance, before conversion to the Vulkan wire format.
/// Kept as plain data so emission is testable without a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceRecord {
    /// 3×4 row-major world transform
    pub transform: [f32; 12],
    /// Packed 24-bit custom index
    pub custom_index: u32,
    /// Device address of the referenced BLAS
    pub blas_address: vk::DeviceAddress,
}

/// Emit one instance record per visible (instance, sub-mesh) pair.
///
/// Instances referencing unknown models, models without built BLAS, or
/// out-of-range mesh indices are skipped; the scene may briefly reference a
/// model that failed to load.
#[must_use]
pub fn emit_instance_records(
    instances: &[SceneInstance],
    models: &ModelRegistry,
) -> Vec<InstanceRecord> {
    let mut records = Vec::with_capacity(instances.len());

    for instance in instances {
        let Some(model) = models.resolve(instance.model_id) else {
            continue;
        };
        let mesh_index = instance.mesh_index as usize;
        if mesh_index >= model.blas.len() {
            continue;
        }

        let primitive_offset = primitive_offset(&model.meshes, mesh_index);
        records.push(InstanceRecord {
            transform: transform_to_3x4(&instance.transform),
            custom_index: encode_custom_index(instance.model_id, primitive_offset),
            blas_address: model.blas[mesh_index].address,
        });
    }

    records
}

/// Flat primitive offset of `mesh_index`: the number of primitives in all
/// earlier meshes of the model.
#[must_use]
pub fn primitive_offset(meshes: &[Mesh], mesh_index: usize) -> u32 {
    meshes
        .iter()
        .take(mesh_index)
        .map(|m| m.primitives.len() as u32)
        .sum()
}

/// Convert an [`InstanceRecord`] to the Vulkan instance wire format.
#[must_use]
pub fn to_vk_instance(record: &InstanceRecord) -> vk::AccelerationStructureInstanceKHR {
    vk::AccelerationStructureInstanceKHR {
        transform: vk::TransformMatrixKHR {
            matrix: record.transform,
        },
        // mask 0xFF: visible to all rays.
        instance_custom_index_and_mask: vk::Packed24_8::new(record.custom_index, 0xFF),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            0,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: record.blas_address,
        },
    }
}

/// A built bottom-level acceleration structure.
pub struct Blas {
    /// Acceleration structure handle
    pub structure: vk::AccelerationStructureKHR,
    /// Buffer backing the structure
    pub buffer: GpuBuffer,
    /// Device address, captured once at build time
    pub address: vk::DeviceAddress,
}

impl Blas {
    /// Destroy the structure, then its backing buffer.
    pub fn destroy(&mut self, device: &Device, accel_loader: &AccelLoader) {
        unsafe {
            accel_loader.destroy_acceleration_structure(self.structure, None);
        }
        self.structure = vk::AccelerationStructureKHR::null();
        self.buffer.destroy(device);
    }
}

/// Build one BLAS per mesh of a model.
///
/// Uses one-shot commands per mesh, deliberately stalling the queue; this
/// runs at model load time, never on the frame hot path. Vertex and index
/// buffers must already carry ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY
/// and SHADER_DEVICE_ADDRESS usage.
pub fn build_blas(
    device: &Device,
    accel_loader: &AccelLoader,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    vertex_buffer: &GpuBuffer,
    index_buffer: &GpuBuffer,
    meshes: &[Mesh],
    vertex_count: u32,
) -> VulkanResult<Vec<Blas>> {
    let vertex_address = vertex_buffer.device_address(device);
    let index_address = index_buffer.device_address(device);

    let mut out = Vec::with_capacity(meshes.len());

    for mesh in meshes {
        let mut geometries = Vec::with_capacity(mesh.primitives.len());
        let mut build_ranges = Vec::with_capacity(mesh.primitives.len());
        let mut max_primitive_counts = Vec::with_capacity(mesh.primitives.len());

        for (prim_idx, prim) in mesh.primitives.iter().enumerate() {
            // Primitives are packed contiguously, so this geometry's vertex
            // range ends at the next primitive's offset (or the buffer end).
            let next_vertex_offset = mesh
                .primitives
                .get(prim_idx + 1)
                .map_or(vertex_count, |next| next.vertex_offset);
            let max_vertex = next_vertex_offset - prim.vertex_offset - 1;

            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: vertex_address,
                })
                .vertex_stride(std::mem::size_of::<Vertex>() as u64)
                .max_vertex(max_vertex)
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: index_address,
                })
                .build();

            geometries.push(
                vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                    .build(),
            );

            let primitive_count = prim.index_count / 3;
            build_ranges.push(
                vk::AccelerationStructureBuildRangeInfoKHR::builder()
                    .primitive_count(primitive_count)
                    .primitive_offset(prim.first_index * std::mem::size_of::<u32>() as u32)
                    .first_vertex(prim.vertex_offset)
                    .build(),
            );
            max_primitive_counts.push(primitive_count);
        }

        if geometries.is_empty() {
            continue;
        }

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries)
            .build();

        let size_info = unsafe {
            accel_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &max_primitive_counts,
            )
        };

        let buffer = GpuBuffer::new(
            device,
            memory_properties,
            size_info.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.buffer)
            .size(size_info.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
        let structure = unsafe {
            accel_loader
                .create_acceleration_structure(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let mut scratch = GpuBuffer::new(
            device,
            memory_properties,
            size_info.build_scratch_size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        build_info.dst_acceleration_structure = structure;
        build_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: scratch.device_address(device),
        };

        let cmd = begin_single_time_commands(device, command_pool)?;
        unsafe {
            accel_loader.cmd_build_acceleration_structures(
                cmd,
                std::slice::from_ref(&build_info),
                &[&build_ranges],
            );
        }
        end_single_time_commands(device, queue, command_pool, cmd)?;

        scratch.destroy(device);

        let address = unsafe {
            accel_loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                    .acceleration_structure(structure),
            )
        };

        out.push(Blas {
            structure,
            buffer,
            address,
        });
    }

    Ok(out)
}

/// Record the per-frame TLAS rebuild into `cmd`.
///
/// The instance data is copied into the slot's host-coherent instance buffer
/// first. The build is recorded even when `instances` is empty: an empty
/// TLAS is traversable, and skipping the build would leave the structure in
/// last frame's state. The host→build barrier publishes the instance-buffer
/// writes and the build→trace barrier publishes the structure itself; both
/// are recorded unconditionally.
///
/// # Safety
///
/// `instance_mapped` must point at the slot's mapped instance buffer with
/// room for `instances.len()` entries, and the slot's fence must have
/// signalled (the GPU is no longer reading the buffer).
pub unsafe fn record_tlas_build(
    device: &Device,
    accel_loader: &AccelLoader,
    cmd: vk::CommandBuffer,
    tlas: vk::AccelerationStructureKHR,
    instance_mapped: *mut u8,
    instance_buffer_address: vk::DeviceAddress,
    scratch_address: vk::DeviceAddress,
    instances: &[vk::AccelerationStructureInstanceKHR],
) {
    if !instances.is_empty() {
        std::ptr::copy_nonoverlapping(
            instances.as_ptr(),
            instance_mapped.cast::<vk::AccelerationStructureInstanceKHR>(),
            instances.len(),
        );
    }

    let host_to_build = vk::MemoryBarrier2::builder()
        .src_stage_mask(vk::PipelineStageFlags2::HOST)
        .src_access_mask(vk::AccessFlags2::HOST_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
        .dst_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR)
        .build();
    let dep = vk::DependencyInfo::builder().memory_barriers(std::slice::from_ref(&host_to_build));
    device.cmd_pipeline_barrier2(cmd, &dep);

    let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: instance_buffer_address,
        })
        .build();
    let geometry = vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: instances_data,
        })
        .build();

    let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(std::slice::from_ref(&geometry))
        .build();
    build_info.dst_acceleration_structure = tlas;
    build_info.scratch_data = vk::DeviceOrHostAddressKHR {
        device_address: scratch_address,
    };

    let range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
        .primitive_count(instances.len() as u32)
        .build();
    accel_loader.cmd_build_acceleration_structures(
        cmd,
        std::slice::from_ref(&build_info),
        &[std::slice::from_ref(&range)],
    );

    let build_to_trace = vk::MemoryBarrier2::builder()
        .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
        .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
        .dst_stage_mask(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR)
        .dst_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR)
        .build();
    let dep = vk::DependencyInfo::builder().memory_barriers(std::slice::from_ref(&build_to_trace));
    device.cmd_pipeline_barrier2(cmd, &dep);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::assets::SubMesh;

    #[test]
    fn test_custom_index_round_trip() {
        for model_id in [0u32, 1, 2, 511, 1023] {
            for offset in [0u32, 1, 100, 8191, 16383] {
                let packed = encode_custom_index(model_id, offset);
                assert!(packed < (1 << 24), "custom index must fit 24 bits");
                assert_eq!(decode_custom_index(packed), (model_id, offset));
            }
        }
    }

    #[test]
    #[should_panic(expected = "10-bit")]
    #[cfg(debug_assertions)]
    fn test_oversized_model_id_asserts() {
        let _ = encode_custom_index(1024, 0);
    }

    #[test]
    fn test_transform_conversion_is_row_major() {
        let mut m = Mat4::identity();
        m[(0, 3)] = 5.0;
        m[(1, 3)] = 6.0;
        m[(2, 3)] = 7.0;
        let t = transform_to_3x4(&m);
        // Row-major 3x4: translation sits at the end of each row.
        assert_eq!(t[3], 5.0);
        assert_eq!(t[7], 6.0);
        assert_eq!(t[11], 7.0);
        assert_eq!(t[0], 1.0);
        assert_eq!(t[5], 1.0);
        assert_eq!(t[10], 1.0);
    }

    fn two_mesh_model() -> crate::render::assets::ModelResource {
        let meshes = vec![
            Mesh {
                name: "a".to_string(),
                primitives: vec![
                    SubMesh {
                        first_index: 0,
                        index_count: 3,
                        vertex_offset: 0,
                        material_index: 0,
                        flat_primitive_index: 0,
                    },
                    SubMesh {
                        first_index: 3,
                        index_count: 3,
                        vertex_offset: 3,
                        material_index: 0,
                        flat_primitive_index: 1,
                    },
                ],
            },
            Mesh {
                name: "b".to_string(),
                primitives: vec![SubMesh {
                    first_index: 6,
                    index_count: 3,
                    vertex_offset: 6,
                    material_index: 0,
                    flat_primitive_index: 2,
                }],
            },
        ];
        crate::render::assets::ModelResource::stub_for_tests(meshes, 2)
    }

    #[test]
    fn test_primitive_offset_accumulates_across_meshes() {
        let model = two_mesh_model();
        assert_eq!(primitive_offset(&model.meshes, 0), 0);
        assert_eq!(primitive_offset(&model.meshes, 1), 2);
    }

    #[test]
    fn test_emission_with_no_models_is_empty() {
        let models = ModelRegistry::new();
        let instances = vec![SceneInstance {
            transform: Mat4::identity(),
            model_id: 0,
            mesh_index: 0,
        }];
        assert!(emit_instance_records(&instances, &models).is_empty());
    }

    #[test]
    fn test_emission_three_instances_share_model_bits() {
        let mut models = ModelRegistry::new();
        models.insert_for_tests(two_mesh_model());

        let mk = |mesh_index, x| SceneInstance {
            transform: {
                let mut m = Mat4::identity();
                m[(0, 3)] = x;
                m
            },
            model_id: 0,
            mesh_index,
        };
        let instances = vec![mk(0, 1.0), mk(1, 2.0), mk(1, 3.0)];

        let records = emit_instance_records(&instances, &models);
        assert_eq!(records.len(), 3);

        let decoded: Vec<_> = records
            .iter()
            .map(|r| decode_custom_index(r.custom_index))
            .collect();
        // All share model id 0; primitive offsets follow the mesh layout.
        assert!(decoded.iter().all(|&(model, _)| model == 0));
        assert_eq!(decoded[0].1, 0);
        assert_eq!(decoded[1].1, 2);
        assert_eq!(decoded[2].1, 2);
        // Transforms carried through in row-major form.
        assert_eq!(records[0].transform[3], 1.0);
        assert_eq!(records[2].transform[3], 3.0);
    }

    #[test]
    fn test_emission_skips_out_of_range_mesh() {
        let mut models = ModelRegistry::new();
        models.insert_for_tests(two_mesh_model());
        let instances = vec![SceneInstance {
            transform: Mat4::identity(),
            model_id: 0,
            mesh_index: 9,
        }];
        assert!(emit_instance_records(&instances, &models).is_empty());
    }

    #[test]
    fn test_vk_instance_packs_mask_and_flags() {
        let record = InstanceRecord {
            transform: transform_to_3x4(&Mat4::identity()),
            custom_index: encode_custom_index(3, 5),
            blas_address: 0xDEAD_BEEF,
        };
        let instance = to_vk_instance(&record);
        assert_eq!(
            instance.instance_custom_index_and_mask.low_24(),
            encode_custom_index(3, 5)
        );
        assert_eq!(instance.instance_custom_index_and_mask.high_8(), 0xFF);
        let handle = unsafe { instance.acceleration_structure_reference.device_handle };
        assert_eq!(handle, 0xDEAD_BEEF);
    }
}
