//! Descriptor buffers (`VK_EXT_descriptor_buffer`).
//!
//! Every binding lives in its own set with one descriptor, backed by a
//! host-visible buffer holding one descriptor slot per object. The scene
//! binding instead holds one slot per frame in flight, so each frame reads
//! its own copy of the scene uniforms. Slots are selected at draw time with
//! `vkCmdSetDescriptorBufferOffsetsEXT`.

use crate::capabilities::DescriptorBufferSizes;
use crate::error::{GpuError, Result};
use crate::memory::{BufferAllocation, GpuAllocator};
use ash::vk;
use gpu_allocator::MemoryLocation;

/// The fixed, ordered set of bindings used by the mesh pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorBinding {
    Scene,
    Model,
    Material,
    Meshlets,
    Indices,
    Vertices,
    Texture,
}

impl DescriptorBinding {
    /// All bindings in set order.
    pub const ALL: [Self; 7] = [
        Self::Scene,
        Self::Model,
        Self::Material,
        Self::Meshlets,
        Self::Indices,
        Self::Vertices,
        Self::Texture,
    ];

    /// Descriptor set index.
    pub const fn set_index(self) -> u32 {
        self as u32
    }

    pub const fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::Scene | Self::Model | Self::Material => vk::DescriptorType::UNIFORM_BUFFER,
            Self::Meshlets | Self::Indices | Self::Vertices => vk::DescriptorType::STORAGE_BUFFER,
            Self::Texture => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }

    /// The scene binding is shared by all objects and indexed by frame slot.
    pub const fn is_per_object(self) -> bool {
        !matches!(self, Self::Scene)
    }

    /// Stages that read this binding.
    pub const fn stages(self) -> vk::ShaderStageFlags {
        let mesh = vk::ShaderStageFlags::TASK_EXT.as_raw() | vk::ShaderStageFlags::MESH_EXT.as_raw();
        match self {
            Self::Texture => vk::ShaderStageFlags::FRAGMENT,
            Self::Model | Self::Material => {
                vk::ShaderStageFlags::from_raw(mesh | vk::ShaderStageFlags::FRAGMENT.as_raw())
            }
            Self::Scene | Self::Meshlets | Self::Indices | Self::Vertices => {
                vk::ShaderStageFlags::from_raw(mesh)
            }
        }
    }

    /// Usage of the buffer that stores this binding's descriptors.
    pub fn buffer_usage(self) -> vk::BufferUsageFlags {
        let usage = match self.descriptor_type() {
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER => {
                vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT
                    | vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT
            }
            _ => vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT,
        };
        usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
    }

    /// Size in bytes of one descriptor of this binding's type.
    pub const fn descriptor_size(self, sizes: &DescriptorBufferSizes) -> usize {
        match self {
            Self::Scene | Self::Model | Self::Material => sizes.uniform_buffer,
            Self::Meshlets | Self::Indices | Self::Vertices => sizes.storage_buffer,
            Self::Texture => sizes.combined_image_sampler,
        }
    }
}

/// Round `size` up to a multiple of `alignment` (a power of two, or zero).
pub const fn aligned_size(size: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        size
    } else {
        (size + alignment - 1) & !(alignment - 1)
    }
}

/// Byte offset of the descriptor read by `object_index` during `frame_slot`.
pub const fn descriptor_offset(
    binding: DescriptorBinding,
    object_index: u32,
    frame_slot: u32,
    layout_size: u64,
    layout_offset: u64,
) -> u64 {
    let slot = if binding.is_per_object() {
        object_index
    } else {
        frame_slot
    };
    slot as u64 * layout_size + layout_offset
}

/// Set layout and backing buffer of one binding.
#[derive(Debug)]
pub struct DescriptorBufferLayout {
    pub binding: DescriptorBinding,
    pub set_layout: vk::DescriptorSetLayout,
    /// Set layout size, aligned to the descriptor buffer offset alignment.
    pub layout_size: u64,
    /// Offset of binding 0 within the set layout.
    pub layout_offset: u64,
    pub buffer: BufferAllocation,
    pub usage: vk::BufferUsageFlags,
}

impl DescriptorBufferLayout {
    pub const fn offset(&self, object_index: u32, frame_slot: u32) -> u64 {
        descriptor_offset(
            self.binding,
            object_index,
            frame_slot,
            self.layout_size,
            self.layout_offset,
        )
    }

    pub const fn address(&self) -> vk::DeviceAddress {
        self.buffer.address
    }
}

/// All descriptor buffers of the mesh pipeline.
pub struct DescriptorBuffers {
    loader: ash::ext::descriptor_buffer::Device,
    layouts: Vec<DescriptorBufferLayout>,
    sizes: DescriptorBufferSizes,
    capacity: u32,
    frame_slots: u32,
}

impl DescriptorBuffers {
    /// Create set layouts and buffers for up to `capacity` objects and
    /// `frame_slots` frames in flight.
    ///
    /// # Safety
    /// The allocator's device must have `descriptorBuffer` enabled.
    pub unsafe fn new(
        instance: &ash::Instance,
        allocator: &mut GpuAllocator,
        sizes: DescriptorBufferSizes,
        capacity: u32,
        frame_slots: u32,
    ) -> Result<Self> {
        let device = allocator.device().clone();
        let mut buffers = Self {
            loader: ash::ext::descriptor_buffer::Device::new(instance, &device),
            layouts: Vec::with_capacity(DescriptorBinding::ALL.len()),
            sizes,
            capacity: capacity.max(1),
            frame_slots: frame_slots.max(1),
        };

        for binding in DescriptorBinding::ALL {
            match unsafe { buffers.create_layout(allocator, binding) } {
                Ok(layout) => buffers.layouts.push(layout),
                Err(err) => {
                    buffers.destroy(allocator);
                    return Err(err);
                }
            }
        }

        tracing::debug!(
            "Created {} descriptor buffers for {} objects, {} frame slot(s)",
            buffers.layouts.len(),
            buffers.capacity,
            buffers.frame_slots
        );
        Ok(buffers)
    }

    unsafe fn create_layout(
        &self,
        allocator: &mut GpuAllocator,
        binding: DescriptorBinding,
    ) -> Result<DescriptorBufferLayout> {
        let device = allocator.device().clone();
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(binding.descriptor_type())
            .descriptor_count(1)
            .stage_flags(binding.stages())];
        let create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::DESCRIPTOR_BUFFER_EXT)
            .bindings(&bindings);
        let set_layout = unsafe { device.create_descriptor_set_layout(&create_info, None)? };

        let (layout_size, layout_offset) = unsafe {
            (
                self.loader.get_descriptor_set_layout_size(set_layout),
                self.loader
                    .get_descriptor_set_layout_binding_offset(set_layout, 0),
            )
        };
        let layout_size = aligned_size(layout_size, self.sizes.offset_alignment);

        let slots = u64::from(self.slot_count(binding));
        let usage = binding.buffer_usage();
        let buffer = match allocator.create_buffer(
            layout_size * slots,
            usage,
            MemoryLocation::CpuToGpu,
            &format!("descriptors:{binding:?}"),
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(err);
            }
        };

        Ok(DescriptorBufferLayout {
            binding,
            set_layout,
            layout_size,
            layout_offset,
            buffer,
            usage,
        })
    }

    /// Number of object slots.
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    pub const fn frame_slots(&self) -> u32 {
        self.frame_slots
    }

    /// Descriptor slots stored for `binding`.
    pub const fn slot_count(&self, binding: DescriptorBinding) -> u32 {
        if binding.is_per_object() {
            self.capacity
        } else {
            self.frame_slots
        }
    }

    pub fn layout(&self, binding: DescriptorBinding) -> &DescriptorBufferLayout {
        &self.layouts[binding as usize]
    }

    /// Set layouts in set order, for pipeline layout creation.
    pub fn set_layouts(&self) -> Vec<vk::DescriptorSetLayout> {
        self.layouts.iter().map(|layout| layout.set_layout).collect()
    }

    fn check_slot(&self, binding: DescriptorBinding, slot: u32) -> Result<()> {
        let count = self.slot_count(binding);
        if slot >= count {
            return Err(GpuError::InvalidState(format!(
                "{binding:?} slot {slot} exceeds descriptor capacity {count}"
            )));
        }
        if self.layouts.len() != DescriptorBinding::ALL.len() {
            return Err(GpuError::InvalidState(
                "descriptor buffers destroyed".to_string(),
            ));
        }
        Ok(())
    }

    fn store(
        &mut self,
        binding: DescriptorBinding,
        slot: u32,
        info: &vk::DescriptorGetInfoEXT<'_>,
    ) -> Result<()> {
        let mut descriptor = vec![0u8; binding.descriptor_size(&self.sizes)];
        unsafe { self.loader.get_descriptor(info, &mut descriptor) };

        let layout = &mut self.layouts[binding as usize];
        let offset = layout.offset(slot, slot);
        layout.buffer.write_bytes(offset, &descriptor)
    }

    /// Write a uniform or storage buffer descriptor. `slot` is the object
    /// index, or the frame slot for the scene binding.
    pub fn write_buffer(
        &mut self,
        binding: DescriptorBinding,
        slot: u32,
        address: vk::DeviceAddress,
        range: u64,
    ) -> Result<()> {
        self.check_slot(binding, slot)?;
        let ty = binding.descriptor_type();
        if ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER {
            return Err(GpuError::InvalidState(format!(
                "{binding:?} is not a buffer binding"
            )));
        }

        let address_info = vk::DescriptorAddressInfoEXT::default()
            .address(address)
            .range(range)
            .format(vk::Format::UNDEFINED);
        let data = if ty == vk::DescriptorType::UNIFORM_BUFFER {
            vk::DescriptorDataEXT {
                p_uniform_buffer: &address_info,
            }
        } else {
            vk::DescriptorDataEXT {
                p_storage_buffer: &address_info,
            }
        };
        let info = vk::DescriptorGetInfoEXT::default().ty(ty).data(data);

        self.store(binding, slot, &info)
    }

    /// Write the combined image sampler descriptor of an object.
    pub fn write_image(
        &mut self,
        object_index: u32,
        sampler: vk::Sampler,
        view: vk::ImageView,
    ) -> Result<()> {
        let binding = DescriptorBinding::Texture;
        self.check_slot(binding, object_index)?;

        let image_info = vk::DescriptorImageInfo::default()
            .sampler(sampler)
            .image_view(view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let info = vk::DescriptorGetInfoEXT::default()
            .ty(binding.descriptor_type())
            .data(vk::DescriptorDataEXT {
                p_combined_image_sampler: &image_info,
            });

        self.store(binding, object_index, &info)
    }

    /// Bind every descriptor buffer to `cmd`.
    ///
    /// # Safety
    /// `cmd` must be recording.
    pub unsafe fn bind_buffers(&self, cmd: vk::CommandBuffer) {
        let infos: Vec<_> = self
            .layouts
            .iter()
            .map(|layout| {
                vk::DescriptorBufferBindingInfoEXT::default()
                    .address(layout.address())
                    .usage(layout.usage)
            })
            .collect();
        unsafe { self.loader.cmd_bind_descriptor_buffers(cmd, &infos) };
    }

    /// Point every set at the descriptors of `object_index`, and the scene
    /// set at the copy owned by `frame_slot`.
    ///
    /// # Safety
    /// `cmd` must be recording with these buffers bound.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn set_offsets(
        &self,
        cmd: vk::CommandBuffer,
        pipeline_layout: vk::PipelineLayout,
        object_index: u32,
        frame_slot: u32,
    ) {
        let indices: Vec<u32> = (0..self.layouts.len() as u32).collect();
        let offsets: Vec<u64> = self
            .layouts
            .iter()
            .map(|layout| layout.offset(object_index, frame_slot))
            .collect();
        unsafe {
            self.loader.cmd_set_descriptor_buffer_offsets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline_layout,
                0,
                &indices,
                &offsets,
            );
        }
    }

    /// Destroy set layouts and buffers. Calling it again does nothing.
    pub fn destroy(&mut self, allocator: &mut GpuAllocator) {
        for mut layout in self.layouts.drain(..) {
            layout.buffer.destroy(allocator);
            unsafe {
                allocator
                    .device()
                    .destroy_descriptor_set_layout(layout.set_layout, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_are_ordered() {
        for (index, binding) in DescriptorBinding::ALL.iter().enumerate() {
            assert_eq!(binding.set_index() as usize, index);
        }
        assert_eq!(DescriptorBinding::ALL[0], DescriptorBinding::Scene);
        assert_eq!(DescriptorBinding::ALL[6], DescriptorBinding::Texture);
    }

    #[test]
    fn descriptor_types() {
        assert_eq!(
            DescriptorBinding::Material.descriptor_type(),
            vk::DescriptorType::UNIFORM_BUFFER
        );
        assert_eq!(
            DescriptorBinding::Vertices.descriptor_type(),
            vk::DescriptorType::STORAGE_BUFFER
        );
        assert!(DescriptorBinding::Texture
            .buffer_usage()
            .contains(vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT));
        assert!(!DescriptorBinding::Indices
            .buffer_usage()
            .contains(vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT));
        assert!(DescriptorBinding::Scene
            .buffer_usage()
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
    }

    #[test]
    fn alignment() {
        assert_eq!(aligned_size(0, 64), 0);
        assert_eq!(aligned_size(1, 64), 64);
        assert_eq!(aligned_size(64, 64), 64);
        assert_eq!(aligned_size(65, 64), 128);
        assert_eq!(aligned_size(24, 0), 24);
    }

    #[test]
    fn offsets() {
        assert_eq!(descriptor_offset(DescriptorBinding::Model, 0, 1, 64, 0), 0);
        assert_eq!(descriptor_offset(DescriptorBinding::Model, 3, 1, 64, 16), 208);
        assert_eq!(descriptor_offset(DescriptorBinding::Texture, 2, 0, 128, 0), 256);
        // the scene slot ignores the object
        assert_eq!(descriptor_offset(DescriptorBinding::Scene, 5, 0, 64, 16), 16);
    }

    #[test]
    fn frame_slots_read_distinct_scene_descriptors() {
        let first = descriptor_offset(DescriptorBinding::Scene, 0, 0, 64, 16);
        let second = descriptor_offset(DescriptorBinding::Scene, 0, 1, 64, 16);
        assert_ne!(first, second);
        assert_eq!(second - first, 64);

        // object bindings do not move between frames
        assert_eq!(
            descriptor_offset(DescriptorBinding::Model, 2, 0, 64, 0),
            descriptor_offset(DescriptorBinding::Model, 2, 1, 64, 0)
        );
    }

    #[test]
    fn descriptor_sizes_by_type() {
        let sizes = DescriptorBufferSizes {
            uniform_buffer: 16,
            storage_buffer: 24,
            combined_image_sampler: 32,
            offset_alignment: 64,
        };
        assert_eq!(DescriptorBinding::Scene.descriptor_size(&sizes), 16);
        assert_eq!(DescriptorBinding::Meshlets.descriptor_size(&sizes), 24);
        assert_eq!(DescriptorBinding::Texture.descriptor_size(&sizes), 32);
    }
}
