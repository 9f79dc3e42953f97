//! Model resources and the asset registry
//!
//! Asset decoding (glTF parsing, texture decompression) happens outside the
//! renderer. What arrives here is decoded geometry and pixel data; the
//! registry uploads it, builds the per-model acceleration structures, and
//! hands out stable integer ids. Ids are assigned in load order and never
//! reused while the model is alive — bindless arrays are indexed by offsets
//! derived from them.

use ash::extensions::khr::AccelerationStructure as AccelLoader;
use ash::{vk, Device};
use bytemuck::{Pod, Zeroable};

use crate::render::vulkan::accel::{self, Blas};
use crate::render::vulkan::registry::DescriptorPoolRegistry;
use crate::render::vulkan::resources::{create_device_local_buffer, GpuBuffer, GpuImage};
use crate::render::vulkan::uniforms::MaterialData;
use crate::render::vulkan::{VulkanError, VulkanResult, BINDLESS_CAPACITY, MAX_MODELS};

/// Stable integer id of a loaded model.
pub type ModelId = u32;

/// Interleaved vertex layout shared by every mesh in the engine.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Object-space normal
    pub normal: [f32; 3],
    /// Tangent (w carries handedness)
    pub tangent: [f32; 4],
    /// Texture coordinates
    pub tex_coord: [f32; 2],
    /// Vertex color
    pub color: [f32; 3],
}

impl Vertex {
    /// Vertex buffer binding description (binding 0, per-vertex rate).
    #[must_use]
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Attribute descriptions matching the shader's vertex inputs.
    #[must_use]
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 5] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 12,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: 24,
            },
            vk::VertexInputAttributeDescription {
                location: 3,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 40,
            },
            vk::VertexInputAttributeDescription {
                location: 4,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 48,
            },
        ]
    }
}

/// One drawable primitive range within a model's shared vertex/index buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubMesh {
    /// First index within the model index buffer
    pub first_index: u32,
    /// Number of indices
    pub index_count: u32,
    /// Vertex offset added to each index
    pub vertex_offset: u32,
    /// Index into the model's source material list, -1 for the default
    pub material_index: i32,
    /// Position of this primitive in the model's flattened material buffer;
    /// assigned at registration
    pub flat_primitive_index: u32,
}

/// A named group of primitives. One BLAS is built per mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mesh {
    /// Mesh name from the source asset
    pub name: String,
    /// Primitive ranges in this mesh
    pub primitives: Vec<SubMesh>,
}

/// Decoded geometry handed to the registry by the asset collaborator.
pub struct ModelGeometry {
    /// Model name, for logs
    pub name: String,
    /// Interleaved vertices for all meshes
    pub vertices: Vec<Vertex>,
    /// Indices for all meshes, relative to each primitive's vertex offset
    pub indices: Vec<u32>,
    /// Source materials referenced by the sub-meshes
    pub materials: Vec<MaterialData>,
    /// Mesh/primitive layout over the shared buffers
    pub meshes: Vec<Mesh>,
}

/// A GPU texture owned by a model: image, sampled view, and sampler.
pub struct ModelTexture {
    /// Image and its memory
    pub image: GpuImage,
    /// Sampled view over the whole image
    pub view: vk::ImageView,
    /// Sampler paired with the view in combined descriptors
    pub sampler: vk::Sampler,
}

impl ModelTexture {
    /// Destroy sampler and view before the image that backs them.
    pub fn destroy(&mut self, device: &Device) {
        unsafe {
            device.destroy_sampler(self.sampler, None);
            device.destroy_image_view(self.view, None);
        }
        self.image.destroy(device);
    }
}

/// GPU resources of one loaded model. Immutable after registration.
pub struct ModelResource {
    /// Model name, for logs
    pub name: String,
    /// Vertex buffer (also a storage buffer and BLAS build input)
    pub vertex_buffer: Option<GpuBuffer>,
    /// Index buffer (also a storage buffer and BLAS build input)
    pub index_buffer: Option<GpuBuffer>,
    /// Per-primitive material storage buffer
    pub material_buffer: Option<GpuBuffer>,
    /// Textures referenced by the material buffer
    pub textures: Vec<ModelTexture>,
    /// Mesh/primitive layout
    pub meshes: Vec<Mesh>,
    /// One BLAS per mesh, built once at registration
    pub blas: Vec<Blas>,
    /// Material descriptor set (set 1 of the raster pipelines)
    pub descriptor_set: vk::DescriptorSet,
    /// Offset of this model's textures in the global texture array
    pub global_texture_offset: u32,
}

impl ModelResource {
    /// Vertex and index buffer handles for drawing.
    ///
    /// A model reaching the draw stage without them is a programming error:
    /// skipping it silently would desynchronize the bindless array indices
    /// shared by every other model.
    #[must_use]
    pub fn draw_buffers(&self) -> (vk::Buffer, vk::Buffer) {
        let vertex = self
            .vertex_buffer
            .as_ref()
            .unwrap_or_else(|| panic!("model '{}' reached draw with no vertex buffer", self.name));
        let index = self
            .index_buffer
            .as_ref()
            .unwrap_or_else(|| panic!("model '{}' reached draw with no index buffer", self.name));
        (vertex.buffer, index.buffer)
    }

    /// The three buffers every bindless array entry requires.
    ///
    /// Writing a null buffer into a descriptor array is invalid even with
    /// PARTIALLY_BOUND, so a missing buffer here is fatal.
    #[must_use]
    pub fn bindless_buffers(&self) -> (vk::Buffer, vk::Buffer, vk::Buffer) {
        let (vertex, index) = self.draw_buffers();
        let material = self.material_buffer.as_ref().unwrap_or_else(|| {
            panic!("model '{}' reached draw with no material buffer", self.name)
        });
        (vertex, index, material.buffer)
    }

    /// Release all GPU resources owned by this model.
    pub fn destroy(&mut self, device: &Device, accel_loader: &AccelLoader) {
        for blas in &mut self.blas {
            blas.destroy(device, accel_loader);
        }
        for texture in &mut self.textures {
            texture.destroy(device);
        }
        if let Some(buffer) = &mut self.vertex_buffer {
            buffer.destroy(device);
        }
        if let Some(buffer) = &mut self.index_buffer {
            buffer.destroy(device);
        }
        if let Some(buffer) = &mut self.material_buffer {
            buffer.destroy(device);
        }
        // The descriptor set is returned to the pool by the registry owner.
    }

    #[cfg(test)]
    pub(crate) fn stub_for_tests(meshes: Vec<Mesh>, blas_count: usize) -> Self {
        let blas = (0..blas_count)
            .map(|_| Blas {
                structure: vk::AccelerationStructureKHR::null(),
                buffer: GpuBuffer {
                    buffer: vk::Buffer::null(),
                    memory: vk::DeviceMemory::null(),
                    size: 0,
                },
                address: 0,
            })
            .collect();
        Self {
            name: "stub".to_string(),
            vertex_buffer: None,
            index_buffer: None,
            material_buffer: None,
            textures: Vec::new(),
            meshes,
            blas,
            descriptor_set: vk::DescriptorSet::null(),
            global_texture_offset: 0,
        }
    }
}

/// Everything a model upload needs from the device, passed explicitly
/// instead of stored as back-references.
pub struct UploadContext<'a> {
    /// Logical device
    pub device: &'a Device,
    /// Physical device memory properties
    pub memory_properties: &'a vk::PhysicalDeviceMemoryProperties,
    /// Pool for one-shot upload command buffers
    pub command_pool: vk::CommandPool,
    /// Combined queue the uploads stall on
    pub queue: vk::Queue,
    /// Acceleration structure extension loader
    pub accel_loader: &'a AccelLoader,
    /// Pool registry the material descriptor set is allocated from
    pub pool: &'a mut DescriptorPoolRegistry,
    /// Material descriptor set layout
    pub material_layout: vk::DescriptorSetLayout,
}

/// Owns every loaded model and the stable id space over them.
#[derive(Default)]
pub struct ModelRegistry {
    models: Vec<ModelResource>,
}

impl ModelRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of loaded models. The orchestrator compares this across frames
    /// to decide when the ray-tracing descriptor arrays must be rewritten.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.models.len()
    }

    /// Look up a model by id.
    #[must_use]
    pub fn resolve(&self, id: ModelId) -> Option<&ModelResource> {
        self.models.get(id as usize)
    }

    /// Iterate models in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ModelResource> {
        self.models.iter()
    }

    /// Total number of textures across all models, in id order. New models'
    /// `global_texture_offset` starts here.
    #[must_use]
    pub fn total_texture_count(&self) -> u32 {
        self.models.iter().map(|m| m.textures.len() as u32).sum()
    }

    /// Bind a model's vertex and index buffers for drawing.
    pub fn bind(&self, device: &Device, cmd: vk::CommandBuffer, id: ModelId) {
        let Some(model) = self.resolve(id) else {
            return;
        };
        let (vertex, index) = model.draw_buffers();
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[vertex], &[0]);
            device.cmd_bind_index_buffer(cmd, index, 0, vk::IndexType::UINT32);
        }
    }

    /// Upload a model's geometry, build its BLAS, and allocate its material
    /// descriptor set. Returns the model's stable id.
    ///
    /// Stalls the queue for the uploads and BLAS builds; call at load time,
    /// outside the overlapped frame region. Registration is rejected (not
    /// asserted) when the model would exceed the bindless id space or the
    /// geometry is unusable.
    pub fn register_model(
        &mut self,
        ctx: &mut UploadContext<'_>,
        mut geometry: ModelGeometry,
        textures: Vec<ModelTexture>,
    ) -> VulkanResult<ModelId> {
        if self.models.len() as u32 >= MAX_MODELS {
            return Err(VulkanError::ModelRejected(format!(
                "model limit {MAX_MODELS} reached (10-bit custom index)"
            )));
        }
        if geometry.vertices.is_empty() || geometry.indices.is_empty() {
            return Err(VulkanError::ModelRejected(format!(
                "model '{}' has empty geometry",
                geometry.name
            )));
        }

        let global_texture_offset = self.total_texture_count();
        let per_primitive_materials = flatten_materials(
            &mut geometry.meshes,
            &geometry.materials,
            global_texture_offset as i32,
        );

        let buffer_usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;

        let vertex_buffer = create_device_local_buffer(
            ctx.device,
            ctx.memory_properties,
            ctx.command_pool,
            ctx.queue,
            bytemuck::cast_slice(&geometry.vertices),
            buffer_usage | vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = create_device_local_buffer(
            ctx.device,
            ctx.memory_properties,
            ctx.command_pool,
            ctx.queue,
            bytemuck::cast_slice(&geometry.indices),
            buffer_usage | vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        let material_buffer = create_device_local_buffer(
            ctx.device,
            ctx.memory_properties,
            ctx.command_pool,
            ctx.queue,
            bytemuck::cast_slice(&per_primitive_materials),
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;

        // BLAS build requires the geometry buffers to be resident; the
        // staging copies above have already drained the queue.
        let blas = accel::build_blas(
            ctx.device,
            ctx.accel_loader,
            ctx.memory_properties,
            ctx.command_pool,
            ctx.queue,
            &vertex_buffer,
            &index_buffer,
            &geometry.meshes,
            geometry.vertices.len() as u32,
        )?;

        let descriptor_set =
            allocate_material_set(ctx, material_buffer.buffer, &textures)?;

        let id = self.models.len() as ModelId;
        log::info!(
            "Registered model '{}' as id {id}: {} vertices, {} indices, {} meshes, {} textures",
            geometry.name,
            geometry.vertices.len(),
            geometry.indices.len(),
            geometry.meshes.len(),
            textures.len()
        );

        self.models.push(ModelResource {
            name: geometry.name,
            vertex_buffer: Some(vertex_buffer),
            index_buffer: Some(index_buffer),
            material_buffer: Some(material_buffer),
            textures,
            meshes: geometry.meshes,
            blas,
            descriptor_set,
            global_texture_offset,
        });

        Ok(id)
    }

    /// Release every model's GPU resources.
    pub fn destroy(&mut self, device: &Device, accel_loader: &AccelLoader) {
        for model in &mut self.models {
            model.destroy(device, accel_loader);
        }
        self.models.clear();
    }

    #[cfg(test)]
    pub(crate) fn insert_for_tests(&mut self, model: ModelResource) {
        self.models.push(model);
    }
}

/// Build the flattened per-primitive material list: one record per
/// primitive in mesh order, with geometry offsets and the model's global
/// texture offset baked in. Assigns each primitive's flat index.
fn flatten_materials(
    meshes: &mut [Mesh],
    materials: &[MaterialData],
    global_texture_offset: i32,
) -> Vec<MaterialData> {
    let mut flattened = Vec::new();
    let mut flat_index = 0u32;

    for mesh in meshes {
        for prim in &mut mesh.primitives {
            let mut record = if prim.material_index >= 0 {
                materials
                    .get(prim.material_index as usize)
                    .copied()
                    .unwrap_or_default()
            } else {
                MaterialData::default()
            };

            prim.flat_primitive_index = flat_index;
            flat_index += 1;

            record.first_index = prim.first_index;
            record.vertex_offset = prim.vertex_offset;
            record.global_texture_offset = global_texture_offset;
            flattened.push(record);
        }
    }

    flattened
}

/// Allocate and write a model's material descriptor set:
/// binding 0 = material buffer, binding 1 = bindless texture array.
fn allocate_material_set(
    ctx: &mut UploadContext<'_>,
    material_buffer: vk::Buffer,
    textures: &[ModelTexture],
) -> VulkanResult<vk::DescriptorSet> {
    let set = ctx.pool.allocate(
        ctx.device,
        &[ctx.material_layout],
        Some(&[BINDLESS_CAPACITY]),
    )?[0];

    let buffer_info = [vk::DescriptorBufferInfo {
        buffer: material_buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    }];
    let mut writes = vec![vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(0)
        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
        .buffer_info(&buffer_info)
        .build()];

    let image_infos: Vec<vk::DescriptorImageInfo> = textures
        .iter()
        .map(|t| vk::DescriptorImageInfo {
            sampler: t.sampler,
            image_view: t.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        })
        .collect();
    if !image_infos.is_empty() {
        writes.push(
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&image_infos)
                .build(),
        );
    }

    unsafe {
        ctx.device.update_descriptor_sets(&writes, &[]);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 60);
        let attrs = Vertex::attribute_descriptions();
        assert_eq!(attrs[1].offset, 12);
        assert_eq!(attrs[2].offset, 24);
        assert_eq!(attrs[3].offset, 40);
        assert_eq!(attrs[4].offset, 48);
        assert_eq!(Vertex::binding_description().stride, 60);
    }

    fn sample_meshes() -> Vec<Mesh> {
        vec![
            Mesh {
                name: "first".to_string(),
                primitives: vec![
                    SubMesh {
                        first_index: 0,
                        index_count: 6,
                        vertex_offset: 0,
                        material_index: 1,
                        flat_primitive_index: 0,
                    },
                    SubMesh {
                        first_index: 6,
                        index_count: 3,
                        vertex_offset: 4,
                        material_index: -1,
                        flat_primitive_index: 0,
                    },
                ],
            },
            Mesh {
                name: "second".to_string(),
                primitives: vec![SubMesh {
                    first_index: 9,
                    index_count: 3,
                    vertex_offset: 7,
                    material_index: 0,
                    flat_primitive_index: 0,
                }],
            },
        ]
    }

    #[test]
    fn test_flatten_materials_assigns_flat_indices_in_order() {
        let mut meshes = sample_meshes();
        let materials = vec![
            MaterialData {
                metallic_factor: 0.25,
                ..MaterialData::default()
            },
            MaterialData {
                roughness_factor: 0.5,
                ..MaterialData::default()
            },
        ];
        let flattened = flatten_materials(&mut meshes, &materials, 7);

        assert_eq!(flattened.len(), 3);
        assert_eq!(meshes[0].primitives[0].flat_primitive_index, 0);
        assert_eq!(meshes[0].primitives[1].flat_primitive_index, 1);
        assert_eq!(meshes[1].primitives[0].flat_primitive_index, 2);

        // Source material carried through; geometry offsets baked in.
        assert_eq!(flattened[0].roughness_factor, 0.5);
        assert_eq!(flattened[0].first_index, 0);
        assert_eq!(flattened[2].metallic_factor, 0.25);
        assert_eq!(flattened[2].vertex_offset, 7);
        assert!(flattened.iter().all(|m| m.global_texture_offset == 7));
    }

    #[test]
    fn test_flatten_materials_defaults_for_unassigned() {
        let mut meshes = sample_meshes();
        let flattened = flatten_materials(&mut meshes, &[], 0);
        // material_index 1 and 0 are out of range of the empty list; all
        // three primitives fall back to the default material.
        assert_eq!(flattened.len(), 3);
        assert!(flattened
            .iter()
            .all(|m| (m.base_color_factor, m.metallic_factor) == ([1.0; 4], 1.0)));
    }

    #[test]
    fn test_registry_resolve_and_count() {
        let mut registry = ModelRegistry::new();
        assert_eq!(registry.resource_count(), 0);
        assert!(registry.resolve(0).is_none());

        registry.insert_for_tests(ModelResource::stub_for_tests(sample_meshes(), 2));
        assert_eq!(registry.resource_count(), 1);
        assert!(registry.resolve(0).is_some());
        assert!(registry.resolve(1).is_none());
    }

    #[test]
    #[should_panic(expected = "no vertex buffer")]
    fn test_draw_invariant_asserts_on_missing_buffers() {
        let model = ModelResource::stub_for_tests(sample_meshes(), 0);
        let _ = model.draw_buffers();
    }
}
