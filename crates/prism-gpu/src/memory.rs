//! GPU memory management.
//!
//! The allocator is externally synchronized: every call that allocates or
//! frees takes `&mut self`, so a single owner serializes access.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Smallest buffer size handed to the allocator.
pub const MIN_BUFFER_SIZE: u64 = 256;

/// Clamp a requested buffer size up to [`MIN_BUFFER_SIZE`].
pub const fn clamp_buffer_size(size: u64) -> u64 {
    if size < MIN_BUFFER_SIZE {
        MIN_BUFFER_SIZE
    } else {
        size
    }
}

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    /// Device the allocator was created for.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))
    }

    /// Allocate a buffer of at least `size` bytes.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<BufferAllocation> {
        let size = clamp_buffer_size(size);
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.inner().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| GpuError::AllocationFailed(format!("{name}: {e}")))
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let mut result = BufferAllocation {
            buffer,
            allocation: Some(allocation),
            size,
            address: 0,
        };

        let bound = result.allocation.as_ref().map(|allocation| unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        });
        if let Some(Err(err)) = bound {
            result.destroy(self);
            return Err(err.into());
        }

        if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            result.address = unsafe { self.device.get_buffer_device_address(&info) };
        }

        Ok(result)
    }

    /// Allocate a 2D image with a single mip level.
    pub fn create_image(
        &mut self,
        format: vk::Format,
        extent: vk::Extent2D,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<ImageAllocation> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.inner().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location,
                    linear: tiling == vk::ImageTiling::LINEAR,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| GpuError::AllocationFailed(format!("{name}: {e}")))
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(err);
            }
        };

        let mut result = ImageAllocation {
            image,
            allocation: Some(allocation),
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            format,
            extent,
        };

        let bound = result.allocation.as_ref().map(|allocation| unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        });
        if let Some(Err(err)) = bound {
            result.destroy(self);
            return Err(err.into());
        }

        Ok(result)
    }

    /// Return an allocation to the allocator. Errors are logged.
    fn free(&mut self, allocation: Allocation) {
        match self.inner() {
            Ok(allocator) => {
                if let Err(e) = allocator.free(allocation) {
                    tracing::error!("Failed to free GPU allocation: {e}");
                }
            }
            // Memory went away with the allocator.
            Err(_) => drop(allocation),
        }
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// Must run before the Vulkan device is destroyed. Remaining allocations
    /// are reported as leaks. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
            tracing::debug!("GPU allocator shut down");
        }
    }

    /// Whether [`GpuAllocator::shutdown`] has run.
    pub const fn is_shut_down(&self) -> bool {
        self.allocator.is_none()
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Create a view covering the whole first mip level and layer of `image`.
///
/// # Safety
/// The device and image must be valid.
pub unsafe fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );

    Ok(unsafe { device.create_image_view(&view_info, None)? })
}

/// Create a linear, repeating sampler.
///
/// # Safety
/// The device must be valid and created with sampler anisotropy enabled.
pub unsafe fn create_sampler(device: &ash::Device, max_anisotropy: f32) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(max_anisotropy > 1.0)
        .max_anisotropy(max_anisotropy.max(1.0))
        .compare_enable(false)
        .min_lod(0.0)
        .max_lod(vk::LOD_CLAMP_NONE)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK);

    Ok(unsafe { device.create_sampler(&sampler_info, None)? })
}

/// A GPU buffer with its allocation.
///
/// Host-visible buffers stay persistently mapped by the allocator; the
/// mapping is dropped together with the allocation.
#[derive(Debug, Default)]
pub struct BufferAllocation {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    /// Device address, zero unless created with `SHADER_DEVICE_ADDRESS`.
    pub address: vk::DeviceAddress,
}

impl BufferAllocation {
    /// Both the buffer handle and its memory are present.
    pub fn is_valid(&self) -> bool {
        self.buffer != vk::Buffer::null() && self.allocation.is_some()
    }

    /// Mapped host pointer, if the buffer is host-visible.
    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.allocation.as_mut().and_then(Allocation::mapped_slice_mut)
    }

    /// Write raw bytes at `offset` (must be host-visible).
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(format!(
                "write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                self.size
            )));
        }

        let mapped = self
            .mapped_slice_mut()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;
        mapped[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// Write plain-old-data values at `offset` (must be host-visible).
    pub fn write<T: bytemuck::Pod>(&mut self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Release the buffer and its memory. Safe to call more than once.
    pub fn destroy(&mut self, allocator: &mut GpuAllocator) {
        if let Some(allocation) = self.allocation.take() {
            allocator.free(allocation);
        }
        if self.buffer != vk::Buffer::null() {
            unsafe { allocator.device().destroy_buffer(self.buffer, None) };
            self.buffer = vk::Buffer::null();
        }
        self.address = 0;
    }
}

/// A GPU image with its allocation, optional view and optional sampler.
///
/// Swapchain images are represented with a view but no allocation; their
/// image handle belongs to the presentation engine.
#[derive(Debug, Default)]
pub struct ImageAllocation {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl ImageAllocation {
    /// Wrap an image owned by the presentation engine.
    pub fn borrowed(image: vk::Image, view: vk::ImageView, format: vk::Format, extent: vk::Extent2D) -> Self {
        Self {
            image,
            allocation: None,
            view,
            sampler: vk::Sampler::null(),
            format,
            extent,
        }
    }

    /// Both the image handle and its memory are present.
    pub fn is_valid(&self) -> bool {
        self.image != vk::Image::null() && self.allocation.is_some()
    }

    /// Whether the image memory is owned here.
    pub fn owns_image(&self) -> bool {
        self.allocation.is_some()
    }

    /// Destroy the view and sampler only.
    pub fn destroy_view(&mut self, device: &ash::Device) {
        if self.view != vk::ImageView::null() {
            unsafe { device.destroy_image_view(self.view, None) };
            self.view = vk::ImageView::null();
        }
        if self.sampler != vk::Sampler::null() {
            unsafe { device.destroy_sampler(self.sampler, None) };
            self.sampler = vk::Sampler::null();
        }
    }

    /// Release view, sampler, then image and memory. Tolerates any subset
    /// being unset and is safe to call more than once. Borrowed images only
    /// lose their view.
    pub fn destroy(&mut self, allocator: &mut GpuAllocator) {
        self.destroy_view(allocator.device());

        if let Some(allocation) = self.allocation.take() {
            allocator.free(allocation);
            if self.image != vk::Image::null() {
                unsafe { allocator.device().destroy_image(self.image, None) };
            }
        }
        self.image = vk::Image::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn small_buffers_are_clamped() {
        assert_eq!(clamp_buffer_size(0), MIN_BUFFER_SIZE);
        assert_eq!(clamp_buffer_size(4), MIN_BUFFER_SIZE);
        assert_eq!(clamp_buffer_size(MIN_BUFFER_SIZE), MIN_BUFFER_SIZE);
        assert_eq!(clamp_buffer_size(4096), 4096);
    }

    #[test]
    fn default_allocations_are_invalid() {
        assert!(!BufferAllocation::default().is_valid());
        assert!(!ImageAllocation::default().is_valid());
    }

    #[test]
    fn borrowed_image_is_not_owned() {
        let image = ImageAllocation::borrowed(
            vk::Image::from_raw(0x10),
            vk::ImageView::from_raw(0x20),
            vk::Format::B8G8R8A8_UNORM,
            vk::Extent2D {
                width: 4,
                height: 4,
            },
        );
        assert!(!image.owns_image());
        assert!(!image.is_valid());
    }

    #[test]
    fn unmapped_write_fails() {
        let mut buffer = BufferAllocation {
            size: 16,
            ..Default::default()
        };
        assert!(matches!(
            buffer.write_bytes(0, &[1, 2, 3]),
            Err(GpuError::InvalidState(_))
        ));
        assert!(matches!(
            buffer.write_bytes(15, &[1, 2]),
            Err(GpuError::InvalidState(_))
        ));
    }
}
