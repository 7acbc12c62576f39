//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::device::{
    create_logical_device, find_queue_families, select_physical_device, QueueFamilyIndices,
};
use crate::error::{GpuError, Result};
use crate::instance::create_instance;
use crate::memory::GpuAllocator;
use crate::surface::{DeviceProperties, SurfaceContext};
use crate::transfer::UploadTarget;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

/// A queue and the family it was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueReference {
    pub family: u32,
    pub queue: vk::Queue,
}

/// Main GPU context holding Vulkan resources.
///
/// Dropping the context waits for the device, shuts the allocator down and
/// destroys the device and instance, in that order. Surfaces created through
/// [`GpuContextBuilder::build`] must be destroyed first.
pub struct GpuContext {
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    capabilities: GpuCapabilities,
    allocator: GpuAllocator,

    queue_families: QueueFamilyIndices,
    graphics: QueueReference,
    presentation: QueueReference,
    transfer: QueueReference,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared handle to the device.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        Arc::clone(&self.device)
    }

    pub const fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan instance handle.
    pub const fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub const fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    pub const fn allocator(&self) -> &GpuAllocator {
        &self.allocator
    }

    /// Exclusive access to the allocator.
    pub fn allocator_mut(&mut self) -> &mut GpuAllocator {
        &mut self.allocator
    }

    pub const fn queue_families(&self) -> &QueueFamilyIndices {
        &self.queue_families
    }

    pub const fn graphics(&self) -> QueueReference {
        self.graphics
    }

    pub const fn presentation(&self) -> QueueReference {
        self.presentation
    }

    pub const fn transfer(&self) -> QueueReference {
        self.transfer
    }

    /// Staging uploads go through a queue of the graphics family, which owns
    /// every uploaded resource. The transfer queue is used only when it
    /// shares that family.
    pub const fn upload_target(&self, timeout_ns: u64) -> UploadTarget {
        let queue = if self.queue_families.upload_family() == self.transfer.family {
            self.transfer
        } else {
            self.graphics
        };
        UploadTarget {
            queue: queue.queue,
            queue_family: queue.family,
            timeout_ns,
        }
    }

    /// Recompute presentation properties for the surface at `window_size`.
    pub fn device_properties(
        &self,
        surface: &SurfaceContext,
        window_size: (u32, u32),
        vsync: bool,
    ) -> Result<DeviceProperties> {
        unsafe {
            DeviceProperties::compute(
                &self.instance,
                self.physical_device,
                surface,
                window_size,
                vsync,
            )
        }
    }

    /// Wait for device to be idle.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::error!("Device wait idle failed during shutdown: {e}");
            }

            // Frees all VkDeviceMemory; must precede device destruction.
            self.allocator.shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        tracing::debug!("GPU context destroyed");
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    meshlet_limits: (u32, u32),
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Prism".to_string(),
            enable_validation: cfg!(debug_assertions),
            meshlet_limits: (64, 124),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub const fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Meshlet vertex and primitive counts the device must be able to emit.
    #[must_use]
    pub const fn meshlet_limits(mut self, max_vertices: u32, max_primitives: u32) -> Self {
        self.meshlet_limits = (max_vertices, max_primitives);
        self
    }

    /// Build the GPU context and a surface for `window`.
    ///
    /// The surface is created before device selection because presentation
    /// support is a queue family property. On failure nothing is leaked.
    pub fn build<W>(self, window: &W) -> Result<(GpuContext, SurfaceContext)>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        let display = window
            .display_handle()
            .map_err(|e| GpuError::Surface(format!("Failed to get display handle: {e}")))?
            .as_raw();

        let instance =
            unsafe { create_instance(&entry, &self.app_name, display, self.enable_validation)? };

        let mut surface = match unsafe { SurfaceContext::from_window(&entry, &instance, window) } {
            Ok(surface) => surface,
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err);
            }
        };

        let opened = unsafe { self.open_device(&instance, &surface) };
        let (physical_device, capabilities, device, queue_families, queues) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                unsafe {
                    surface.destroy();
                    instance.destroy_instance(None);
                }
                return Err(err);
            }
        };

        let device = Arc::new(device);
        let allocator =
            match unsafe { GpuAllocator::new(&instance, Arc::clone(&device), physical_device) } {
                Ok(allocator) => allocator,
                Err(err) => {
                    unsafe {
                        device.destroy_device(None);
                        surface.destroy();
                        instance.destroy_instance(None);
                    }
                    return Err(err);
                }
            };

        let context = GpuContext {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator,
            graphics: QueueReference {
                family: queue_families.graphics,
                queue: queues.graphics,
            },
            presentation: QueueReference {
                family: queue_families.presentation,
                queue: queues.presentation,
            },
            transfer: QueueReference {
                family: queue_families.transfer,
                queue: queues.transfer,
            },
            queue_families,
        };

        Ok((context, surface))
    }

    #[allow(clippy::type_complexity)]
    unsafe fn open_device(
        &self,
        instance: &ash::Instance,
        surface: &SurfaceContext,
    ) -> Result<(
        vk::PhysicalDevice,
        GpuCapabilities,
        ash::Device,
        QueueFamilyIndices,
        crate::device::DeviceQueues,
    )> {
        let physical_device = unsafe { select_physical_device(instance)? };
        let capabilities = unsafe { GpuCapabilities::query(instance, physical_device) };
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let (max_vertices, max_primitives) = self.meshlet_limits;
        if !capabilities.supports_meshlets(max_vertices, max_primitives) {
            tracing::error!(
                "GPU mesh output limits ({} vertices, {} primitives) below meshlet size",
                capabilities.max_mesh_output_vertices,
                capabilities.max_mesh_output_primitives
            );
            return Err(GpuError::NoSuitableDevice);
        }

        let (queue_families, families) = unsafe {
            find_queue_families(
                instance,
                &surface.surface_loader,
                surface.surface,
                physical_device,
            )?
        };

        let (device, queues) = unsafe {
            create_logical_device(instance, physical_device, &queue_families, &families)?
        };

        Ok((physical_device, capabilities, device, queue_families, queues))
    }
}
