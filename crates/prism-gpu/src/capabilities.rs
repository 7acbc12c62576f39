//! GPU capability detection.

use ash::vk;
use hashbrown::HashSet;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Descriptor sizes reported by `VK_EXT_descriptor_buffer`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorBufferSizes {
    pub uniform_buffer: usize,
    pub storage_buffer: usize,
    pub combined_image_sampler: usize,
    pub offset_alignment: u64,
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Largest supported sampler anisotropy
    pub max_sampler_anisotropy: f32,

    // Mesh shading limits
    pub max_mesh_output_vertices: u32,
    pub max_mesh_output_primitives: u32,
    pub max_task_work_group_count: [u32; 3],

    /// Descriptor buffer layout properties
    pub descriptor_buffer: DescriptorBufferSizes,

    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let mut mesh_properties = vk::PhysicalDeviceMeshShaderPropertiesEXT::default();
        let mut descriptor_properties = vk::PhysicalDeviceDescriptorBufferPropertiesEXT::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut mesh_properties)
            .push_next(&mut descriptor_properties);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
        let properties = properties2.properties;

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let extensions =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }
                .unwrap_or_default();
        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                ext.extension_name_as_c_str()
                    .ok()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .collect();

        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            device_local_memory_mb,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,

            max_mesh_output_vertices: mesh_properties.max_mesh_output_vertices,
            max_mesh_output_primitives: mesh_properties.max_mesh_output_primitives,
            max_task_work_group_count: mesh_properties.max_task_work_group_count,

            descriptor_buffer: DescriptorBufferSizes {
                uniform_buffer: descriptor_properties.uniform_buffer_descriptor_size,
                storage_buffer: descriptor_properties.storage_buffer_descriptor_size,
                combined_image_sampler: descriptor_properties.combined_image_sampler_descriptor_size,
                offset_alignment: descriptor_properties.descriptor_buffer_offset_alignment,
            },

            available_extensions,
        }
    }

    /// Whether the device can hold meshlets of the given size.
    pub const fn supports_meshlets(&self, max_vertices: u32, max_primitives: u32) -> bool {
        self.max_mesh_output_vertices >= max_vertices
            && self.max_mesh_output_primitives >= max_primitives
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn meshlet_limits_check() {
        let caps = GpuCapabilities {
            vendor: GpuVendor::Nvidia,
            device_name: "Test".into(),
            api_version: vk::API_VERSION_1_3,
            driver_version: 0,
            device_local_memory_mb: 8192,
            max_sampler_anisotropy: 16.0,
            max_mesh_output_vertices: 256,
            max_mesh_output_primitives: 256,
            max_task_work_group_count: [65535; 3],
            descriptor_buffer: DescriptorBufferSizes::default(),
            available_extensions: HashSet::new(),
        };
        assert!(caps.supports_meshlets(64, 124));
        assert!(!caps.supports_meshlets(64, 512));
        assert!(caps.summary().starts_with("Test (Nvidia) - Vulkan 1.3.0"));
    }
}
