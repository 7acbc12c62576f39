//! Loaded objects and their GPU resources.
//!
//! Each object owns a texture, vertex, index, meshlet and uniform buffer and
//! one slot in every per-object descriptor buffer. Callers must make sure no
//! frame still using an object is in flight before unloading it.

use crate::camera::{Camera, SceneUniforms};
use crate::error::{RenderError, Result};
use crate::import::{ModelImporter, TextureData};
use glam::{EulerRot, Mat4, Quat, Vec3};
use hashbrown::HashMap;
use prism_gpu::memory::{create_image_view, create_sampler};
use prism_gpu::{
    upload_image_via_staging, upload_via_staging, vk, BufferAllocation, DescriptorBinding,
    DescriptorBufferSizes, DescriptorBuffers, GpuAllocator, GpuError, ImageAllocation,
    MemoryLocation, UploadTarget,
};
use prism_mesh::{build_meshlets, MeshletMesh, MeshletOptions};
use std::path::Path;

/// Byte offset of the material block inside an object's uniform buffer.
pub const MATERIAL_OFFSET: u64 = 256;

/// Size of an object's uniform buffer.
pub const OBJECT_UNIFORM_SIZE: u64 = 512;

/// Distance between the per-frame copies of the scene uniforms. Matches the
/// largest `minUniformBufferOffsetAlignment` Vulkan allows.
pub const SCENE_UNIFORM_STRIDE: u64 = 256;

/// Byte offset of the scene uniforms written for `frame_slot`.
pub const fn scene_uniform_offset(frame_slot: u32) -> u64 {
    frame_slot as u64 * SCENE_UNIFORM_STRIDE
}

/// Identifier of a loaded object. Never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Position, Euler rotation (degrees, applied Y then X then Z) and scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn matrix(&self) -> Mat4 {
        let rotation = Quat::from_euler(
            EulerRot::YXZ,
            self.rotation.y.to_radians(),
            self.rotation.x.to_radians(),
            self.rotation.z.to_radians(),
        );
        Mat4::from_scale_rotation_translation(self.scale, rotation, self.position)
    }
}

/// Material block read by the fragment shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MaterialData {
    pub base_color: [f32; 4],
    pub metallic: f32,
    pub roughness: f32,
    pub _padding: [f32; 2],
}

impl Default for MaterialData {
    fn default() -> Self {
        Self {
            base_color: [1.0; 4],
            metallic: 0.0,
            roughness: 1.0,
            _padding: [0.0; 2],
        }
    }
}

/// Model block read by the mesh shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ModelUniforms {
    pub model: [[f32; 4]; 4],
}

/// GPU resources of one loaded object.
#[derive(Debug, Default)]
pub struct ObjectAllocation {
    pub name: String,
    /// Slot in the per-object descriptor buffers.
    pub slot: u32,
    pub texture: ImageAllocation,
    pub vertex_buffer: BufferAllocation,
    /// Meshlet vertex indices (`u32`) followed by packed triangle bytes.
    pub index_buffer: BufferAllocation,
    pub meshlet_buffer: BufferAllocation,
    pub uniform_buffer: BufferAllocation,
    pub index_count: u32,
    pub meshlet_count: u32,
    /// Word offset of the triangle bytes inside the index buffer.
    pub triangle_word_offset: u32,
    pub transform: Transform,
    pub material: MaterialData,
    /// Uniforms need rewriting.
    pub dirty: bool,
}

impl ObjectAllocation {
    /// All geometry and texture resources exist and there is something to draw.
    pub fn is_valid(&self) -> bool {
        self.texture.is_valid()
            && self.vertex_buffer.is_valid()
            && self.index_buffer.is_valid()
            && self.meshlet_buffer.is_valid()
            && self.index_count > 0
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
        self.dirty = true;
    }

    pub fn set_material(&mut self, material: MaterialData) {
        self.material = material;
        self.dirty = true;
    }

    /// Write model and material blocks if dirty.
    pub fn write_uniforms(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let model = ModelUniforms {
            model: self.transform.matrix().to_cols_array_2d(),
        };
        self.uniform_buffer.write(0, &[model])?;
        self.uniform_buffer.write(MATERIAL_OFFSET, &[self.material])?;
        self.dirty = false;
        Ok(())
    }

    /// Release every sub-resource. Safe on partially built objects.
    pub fn destroy(&mut self, allocator: &mut GpuAllocator) {
        self.texture.destroy(allocator);
        self.vertex_buffer.destroy(allocator);
        self.index_buffer.destroy(allocator);
        self.meshlet_buffer.destroy(allocator);
        self.uniform_buffer.destroy(allocator);
        self.index_count = 0;
        self.meshlet_count = 0;
    }
}

/// Loaded objects keyed by [`ObjectId`].
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    next_id: u64,
    objects: HashMap<ObjectId, ObjectAllocation>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next identifier. Identifiers strictly increase.
    pub fn reserve_id(&mut self) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, id: ObjectId, object: ObjectAllocation) {
        self.objects.insert(id, object);
    }

    /// Remove an object; unknown identifiers yield `None`.
    pub fn remove(&mut self, id: ObjectId) -> Option<ObjectAllocation> {
        self.objects.remove(&id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&ObjectAllocation> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut ObjectAllocation> {
        self.objects.get_mut(&id)
    }

    /// Index count of an object, 0 if unknown.
    pub fn indices_count(&self, id: ObjectId) -> u32 {
        self.objects.get(&id).map_or(0, |object| object.index_count)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &ObjectAllocation)> {
        self.objects.iter().map(|(&id, object)| (id, object))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ObjectId, &mut ObjectAllocation)> {
        self.objects.iter_mut().map(|(&id, object)| (id, object))
    }

    /// Remove every object.
    pub fn drain(&mut self) -> impl Iterator<Item = (ObjectId, ObjectAllocation)> + '_ {
        self.objects.drain()
    }
}

/// Free descriptor slots, lowest first.
#[derive(Debug, Clone)]
pub struct SlotPool {
    free: Vec<u32>,
}

impl SlotPool {
    pub fn new(capacity: u32) -> Self {
        Self {
            free: (0..capacity).rev().collect(),
        }
    }

    pub fn acquire(&mut self) -> Option<u32> {
        self.free.pop()
    }

    pub fn release(&mut self, slot: u32) {
        if !self.free.contains(&slot) {
            self.free.push(slot);
            self.free.sort_unstable_by(|a, b| b.cmp(a));
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// Scene creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct SceneConfig {
    pub capacity: u32,
    /// Frames that may be in flight at once; each gets its own scene uniforms.
    pub frame_slots: u32,
    pub max_anisotropy: f32,
    pub meshlet_options: MeshletOptions,
}

/// All loaded objects plus the descriptor buffers that expose them to the
/// mesh pipeline.
pub struct Scene {
    registry: ObjectRegistry,
    slots: SlotPool,
    descriptors: DescriptorBuffers,
    scene_uniform: BufferAllocation,
    importer: Box<dyn ModelImporter>,
    config: SceneConfig,
    destroyed: bool,
}

impl Scene {
    /// Create the descriptor buffers and one scene uniform slice per frame
    /// slot.
    ///
    /// # Safety
    /// The allocator's device must have descriptor buffers enabled.
    pub unsafe fn new(
        instance: &ash::Instance,
        allocator: &mut GpuAllocator,
        sizes: DescriptorBufferSizes,
        config: SceneConfig,
        importer: Box<dyn ModelImporter>,
    ) -> Result<Self> {
        let mut descriptors = unsafe {
            DescriptorBuffers::new(
                instance,
                allocator,
                sizes,
                config.capacity,
                config.frame_slots,
            )?
        };

        let scene_uniform = match allocator.create_buffer(
            scene_uniform_offset(descriptors.frame_slots()),
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            "scene uniforms",
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                descriptors.destroy(allocator);
                return Err(err.into());
            }
        };

        let mut scene = Self {
            registry: ObjectRegistry::new(),
            slots: SlotPool::new(descriptors.capacity()),
            descriptors,
            scene_uniform,
            importer,
            config,
            destroyed: false,
        };

        for frame_slot in 0..scene.descriptors.frame_slots() {
            if let Err(err) = scene.descriptors.write_buffer(
                DescriptorBinding::Scene,
                frame_slot,
                scene.scene_uniform.address + scene_uniform_offset(frame_slot),
                std::mem::size_of::<SceneUniforms>() as u64,
            ) {
                scene.destroy(allocator);
                return Err(err.into());
            }
        }

        Ok(scene)
    }

    pub const fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut ObjectAllocation> {
        self.registry.get_mut(id)
    }

    pub const fn descriptors(&self) -> &DescriptorBuffers {
        &self.descriptors
    }

    /// Index count of an object, 0 if unknown.
    pub fn indices_count(&self, id: ObjectId) -> u32 {
        self.registry.indices_count(id)
    }

    /// Import a model, build meshlets, upload everything and register the
    /// object.
    ///
    /// A missing or unreadable texture falls back to the placeholder; a
    /// geometry failure aborts this load without touching other objects.
    pub fn load_object(
        &mut self,
        allocator: &mut GpuAllocator,
        target: UploadTarget,
        model_path: &Path,
        texture_path: Option<&Path>,
    ) -> Result<ObjectId> {
        let Some(slot) = self.slots.acquire() else {
            return Err(RenderError::CapacityReached(self.descriptors.capacity()));
        };

        let built = self.importer.load_model(model_path).and_then(|model| {
            build_meshlets(&model.vertices, &model.indices, &self.config.meshlet_options)
                .map(|mesh| (model.name, mesh))
                .map_err(RenderError::from)
        });
        let (name, mesh) = match built {
            Ok(built) => built,
            Err(err) => {
                self.slots.release(slot);
                return Err(err);
            }
        };

        let texture = texture_path.map_or_else(
            || {
                tracing::debug!("No texture for {name}, using placeholder");
                TextureData::placeholder()
            },
            |path| match self.importer.load_texture(path) {
                Ok(texture) => texture,
                Err(err) => {
                    tracing::warn!("Texture fallback for {name}: {err}");
                    TextureData::placeholder()
                }
            },
        );

        let id = self.registry.reserve_id();
        let mut object = ObjectAllocation {
            name,
            slot,
            dirty: true,
            ..Default::default()
        };

        if let Err(err) = self.upload_object(allocator, target, &mut object, &mesh, &texture) {
            tracing::error!("Failed to load object {id} ({}): {err}", model_path.display());
            object.destroy(allocator);
            self.slots.release(slot);
            return Err(err);
        }

        tracing::info!(
            "Loaded object {id} ({}): {} vertices, {} meshlets",
            object.name,
            mesh.vertices.len(),
            object.meshlet_count
        );
        self.registry.insert(id, object);
        Ok(id)
    }

    fn upload_object(
        &mut self,
        allocator: &mut GpuAllocator,
        target: UploadTarget,
        object: &mut ObjectAllocation,
        mesh: &MeshletMesh,
        texture: &TextureData,
    ) -> Result<()> {
        let storage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&mesh.vertices);
        object.vertex_buffer = allocator.create_buffer(
            vertex_bytes.len() as u64,
            storage,
            MemoryLocation::GpuOnly,
            &format!("{}:vertices", object.name),
        )?;
        upload_via_staging(allocator, vertex_bytes, &object.vertex_buffer, target)?;

        let mut index_bytes: Vec<u8> = bytemuck::cast_slice(&mesh.meshlet_vertices).to_vec();
        index_bytes.extend_from_slice(&mesh.meshlet_triangles);
        object.index_buffer = allocator.create_buffer(
            index_bytes.len() as u64,
            storage,
            MemoryLocation::GpuOnly,
            &format!("{}:indices", object.name),
        )?;
        upload_via_staging(allocator, &index_bytes, &object.index_buffer, target)?;

        let meshlet_bytes: &[u8] = bytemuck::cast_slice(&mesh.meshlets);
        object.meshlet_buffer = allocator.create_buffer(
            meshlet_bytes.len() as u64,
            storage,
            MemoryLocation::GpuOnly,
            &format!("{}:meshlets", object.name),
        )?;
        upload_via_staging(allocator, meshlet_bytes, &object.meshlet_buffer, target)?;

        object.uniform_buffer = allocator.create_buffer(
            OBJECT_UNIFORM_SIZE,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            &format!("{}:uniforms", object.name),
        )?;

        object.index_count = u32::try_from(mesh.indices.len())
            .map_err(|_| RenderError::import(&object.name, "too many indices"))?;
        object.meshlet_count = mesh.meshlet_count();
        object.triangle_word_offset = u32::try_from(mesh.meshlet_vertices.len())
            .map_err(|_| RenderError::import(&object.name, "too many meshlet vertices"))?;

        object.texture = self.upload_texture(allocator, target, texture, &object.name)?;

        self.write_descriptors(object)?;
        object.write_uniforms()
    }

    fn upload_texture(
        &self,
        allocator: &mut GpuAllocator,
        target: UploadTarget,
        texture: &TextureData,
        name: &str,
    ) -> Result<ImageAllocation> {
        let placeholder;
        let texture = if texture.pixels.len() == texture.expected_len() {
            texture
        } else {
            tracing::warn!("Texture of {name} has inconsistent size, using placeholder");
            placeholder = TextureData::placeholder();
            &placeholder
        };

        let format = vk::Format::R8G8B8A8_SRGB;
        let mut image = allocator.create_image(
            format,
            vk::Extent2D {
                width: texture.width,
                height: texture.height,
            },
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            MemoryLocation::GpuOnly,
            &format!("{name}:texture"),
        )?;

        let finished = (|| -> Result<()> {
            upload_image_via_staging(allocator, &texture.pixels, &image, target)?;
            let device = allocator.device();
            image.view = unsafe {
                create_image_view(device, image.image, format, vk::ImageAspectFlags::COLOR)?
            };
            image.sampler = unsafe { create_sampler(device, self.config.max_anisotropy)? };
            Ok(())
        })();

        match finished {
            Ok(()) => Ok(image),
            Err(err) => {
                image.destroy(allocator);
                Err(err)
            }
        }
    }

    fn write_descriptors(&mut self, object: &ObjectAllocation) -> Result<()> {
        let slot = object.slot;
        let uniforms = object.uniform_buffer.address;
        let descriptors = &mut self.descriptors;

        descriptors.write_buffer(
            DescriptorBinding::Model,
            slot,
            uniforms,
            std::mem::size_of::<ModelUniforms>() as u64,
        )?;
        descriptors.write_buffer(
            DescriptorBinding::Material,
            slot,
            uniforms + MATERIAL_OFFSET,
            std::mem::size_of::<MaterialData>() as u64,
        )?;
        for (binding, buffer) in [
            (DescriptorBinding::Meshlets, &object.meshlet_buffer),
            (DescriptorBinding::Indices, &object.index_buffer),
            (DescriptorBinding::Vertices, &object.vertex_buffer),
        ] {
            descriptors.write_buffer(binding, slot, buffer.address, buffer.size)?;
        }
        descriptors.write_image(slot, object.texture.sampler, object.texture.view)?;
        Ok(())
    }

    /// Destroy an object's resources. Unknown identifiers are ignored.
    ///
    /// No in-flight frame may reference the object.
    pub fn unload_object(&mut self, allocator: &mut GpuAllocator, id: ObjectId) -> bool {
        let Some(mut object) = self.registry.remove(id) else {
            return false;
        };
        object.destroy(allocator);
        self.slots.release(object.slot);
        tracing::info!("Unloaded object {id} ({})", object.name);
        true
    }

    /// Rewrite the scene uniforms of `frame_slot` and every dirty object's
    /// uniforms. The slot's previous submission must have completed.
    ///
    /// Object uniforms have a single copy and are only written when an
    /// object changes.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn update_uniforms(
        &mut self,
        camera: &Camera,
        aspect: f32,
        frame_slot: u32,
    ) -> Result<()> {
        if frame_slot >= self.descriptors.frame_slots() {
            return Err(GpuError::InvalidState(format!(
                "frame slot {frame_slot} out of range ({} slots)",
                self.descriptors.frame_slots()
            ))
            .into());
        }
        self.scene_uniform.write(
            scene_uniform_offset(frame_slot),
            &[SceneUniforms::new(camera, aspect)],
        )?;
        for (_, object) in self.registry.iter_mut() {
            object.write_uniforms()?;
        }
        Ok(())
    }

    /// Objects that can be drawn.
    pub fn drawable(&self) -> impl Iterator<Item = &ObjectAllocation> {
        self.registry
            .iter()
            .map(|(_, object)| object)
            .filter(|object| object.is_valid() && object.meshlet_count > 0)
    }

    /// Destroy every object, the scene uniform and the descriptor buffers.
    /// Calling it again does nothing.
    pub fn destroy(&mut self, allocator: &mut GpuAllocator) {
        if self.destroyed {
            return;
        }
        for (_, mut object) in self.registry.drain() {
            object.destroy(allocator);
        }
        self.scene_uniform.destroy(allocator);
        self.descriptors.destroy(allocator);
        self.destroyed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn object(index_count: u32) -> ObjectAllocation {
        ObjectAllocation {
            index_count,
            ..Default::default()
        }
    }

    #[test]
    fn ids_strictly_increase() {
        let mut registry = ObjectRegistry::new();
        let a = registry.reserve_id();
        let b = registry.reserve_id();
        registry.insert(a, object(3));
        registry.remove(a);
        let c = registry.reserve_id();
        assert!(a < b && b < c);
        assert_eq!(c, ObjectId(2));
    }

    #[test]
    fn unknown_ids() {
        let mut registry = ObjectRegistry::new();
        let id = registry.reserve_id();
        registry.insert(id, object(36));
        assert!(registry.remove(ObjectId(99)).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.indices_count(ObjectId(99)), 0);
        assert_eq!(registry.indices_count(id), 36);
    }

    #[test]
    fn object_without_resources_is_invalid() {
        assert!(!object(3).is_valid());
        assert!(!ObjectAllocation::default().is_valid());
    }

    #[test]
    fn slots_are_reused_lowest_first() {
        let mut slots = SlotPool::new(3);
        assert_eq!(slots.acquire(), Some(0));
        assert_eq!(slots.acquire(), Some(1));
        assert_eq!(slots.acquire(), Some(2));
        assert_eq!(slots.acquire(), None);
        slots.release(2);
        slots.release(0);
        slots.release(0);
        assert_eq!(slots.available(), 2);
        assert_eq!(slots.acquire(), Some(0));
    }

    #[test]
    fn transform_matrix() {
        let transform = Transform {
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation: Vec3::new(0.0, 90.0, 0.0),
            scale: Vec3::splat(2.0),
        };
        let point = transform.matrix().transform_point3(Vec3::X);
        assert_relative_eq!(point.x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(point.y, 2.0, epsilon = 1e-5);
        assert_relative_eq!(point.z, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn setters_mark_dirty() {
        let mut object = object(3);
        object.set_material(MaterialData {
            metallic: 1.0,
            ..Default::default()
        });
        assert!(object.dirty);
        // no mapped buffer to write into
        assert!(object.write_uniforms().is_err());
        assert!(object.dirty);
    }

    #[test]
    fn frame_slots_write_distinct_scene_uniforms() {
        assert_eq!(scene_uniform_offset(0), 0);
        assert_ne!(scene_uniform_offset(0), scene_uniform_offset(1));
        // slices never overlap
        assert!(
            scene_uniform_offset(0) + std::mem::size_of::<SceneUniforms>() as u64
                <= scene_uniform_offset(1)
        );
        assert_eq!(scene_uniform_offset(2) % SCENE_UNIFORM_STRIDE, 0);
    }

    #[test]
    fn uniform_blocks_fit() {
        assert!(std::mem::size_of::<ModelUniforms>() as u64 <= MATERIAL_OFFSET);
        assert!(
            MATERIAL_OFFSET + std::mem::size_of::<MaterialData>() as u64 <= OBJECT_UNIFORM_SIZE
        );
    }
}
