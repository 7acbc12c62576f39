//! Surface management and presentation property selection.
//!
//! The selection policies are pure functions over the data the surface
//! reports, so they are unit tested without a device.

use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// Preferred swapchain format.
pub const PREFERRED_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Number of images requested when the surface allows it.
pub const PREFERRED_IMAGE_COUNT: u32 = 3;

/// Vulkan surface for a window.
pub struct SurfaceContext {
    /// The Vulkan surface handle.
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader.
    pub surface_loader: ash::khr::surface::Instance,
}

impl SurfaceContext {
    /// Create a surface for `window`.
    ///
    /// # Safety
    /// The entry and instance must be valid and outlive the surface.
    pub unsafe fn from_window<W>(entry: &ash::Entry, instance: &ash::Instance, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::Surface(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::Surface(format!("Failed to get window handle: {e}")))?;

        let surface = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::Surface(e.to_string()))?;

        let surface_loader = ash::khr::surface::Instance::new(entry, instance);

        Ok(Self {
            surface,
            surface_loader,
        })
    }

    /// Query what the surface supports on `physical_device`.
    pub fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            let capabilities = self
                .surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)?;
            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)?;
            let present_modes = self
                .surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)?;

            Ok(SurfaceSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// No swapchain may still reference the surface.
    pub unsafe fn destroy(&mut self) {
        if self.surface != vk::SurfaceKHR::null() {
            unsafe { self.surface_loader.destroy_surface(self.surface, None) };
            self.surface = vk::SurfaceKHR::null();
        }
    }
}

/// Surface query result.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Presentation parameters chosen for the current surface and window size.
#[derive(Debug, Clone, Copy)]
pub struct DeviceProperties {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub depth_format: vk::Format,
    pub extent: vk::Extent2D,
}

impl DeviceProperties {
    /// Apply the selection policy to a surface query.
    ///
    /// `depth_supported` reports whether a format supports optimal-tiling
    /// depth attachments.
    pub fn choose(
        support: &SurfaceSupport,
        window_size: (u32, u32),
        vsync: bool,
        depth_supported: impl Fn(vk::Format) -> bool,
    ) -> Result<Self> {
        let format = select_surface_format(&support.formats)?;
        let present_mode = select_present_mode(&support.present_modes, vsync)?;
        let depth_format = select_depth_format(depth_supported)?;
        let extent = select_extent(&support.capabilities, window_size.0, window_size.1);

        Ok(Self {
            capabilities: support.capabilities,
            format,
            present_mode,
            depth_format,
            extent,
        })
    }

    /// Query the surface and choose properties for `window_size`.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn compute(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface: &SurfaceContext,
        window_size: (u32, u32),
        vsync: bool,
    ) -> Result<Self> {
        let support = surface.support(physical_device)?;
        let properties = Self::choose(&support, window_size, vsync, |format| {
            let props =
                unsafe { instance.get_physical_device_format_properties(physical_device, format) };
            props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })?;

        tracing::debug!(
            "Surface properties: {:?} {:?}, {:?}, depth {:?}, {}x{}",
            properties.format.format,
            properties.format.color_space,
            properties.present_mode,
            properties.depth_format,
            properties.extent.width,
            properties.extent.height
        );

        Ok(properties)
    }

    /// Swapchain image count for these capabilities.
    pub const fn min_image_count(&self) -> u32 {
        min_image_count(&self.capabilities)
    }

    /// Whether pipelines built for `other` can render with these properties.
    pub fn formats_match(&self, other: &Self) -> bool {
        self.format.format == other.format.format && self.depth_format == other.depth_format
    }
}

/// Select the surface format: the preferred pair if offered, else the first.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|f| {
            f.format == PREFERRED_SURFACE_FORMAT.format
                && f.color_space == PREFERRED_SURFACE_FORMAT.color_space
        })
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| GpuError::Surface("surface reports no formats".to_string()))
}

/// Select the present mode: mailbox when vsync is off and it is offered,
/// otherwise FIFO, which every surface supports.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> Result<vk::PresentModeKHR> {
    if available.is_empty() {
        return Err(GpuError::Surface("surface reports no present modes".to_string()));
    }
    if !vsync && available.contains(&vk::PresentModeKHR::MAILBOX) {
        return Ok(vk::PresentModeKHR::MAILBOX);
    }
    Ok(vk::PresentModeKHR::FIFO)
}

/// Use the surface's fixed extent, or clamp the window size into its range.
pub fn select_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// First depth candidate the device supports.
pub fn select_depth_format(supported: impl Fn(vk::Format) -> bool) -> Result<vk::Format> {
    DEPTH_FORMAT_CANDIDATES
        .into_iter()
        .find(|&format| supported(format))
        .ok_or_else(|| GpuError::Surface("no supported depth format".to_string()))
}

/// Triple buffering when `min < 3 <= max` (a max of 0 means unbounded),
/// otherwise the surface minimum.
pub const fn min_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let min = capabilities.min_image_count;
    let max = capabilities.max_image_count;
    if min < PREFERRED_IMAGE_COUNT && (max == 0 || PREFERRED_IMAGE_COUNT <= max) {
        PREFERRED_IMAGE_COUNT
    } else {
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        }
    }

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn min_image_count_policy() {
        assert_eq!(min_image_count(&caps(1, 1)), 1);
        assert_eq!(min_image_count(&caps(2, 4)), 3);
        assert_eq!(min_image_count(&caps(3, 3)), 3);
        assert_eq!(min_image_count(&caps(2, 0)), 3);
        assert_eq!(min_image_count(&caps(2, 2)), 2);
        assert_eq!(min_image_count(&caps(4, 8)), 4);
    }

    #[test]
    fn prefers_bgra_unorm_srgb_nonlinear() {
        let formats = [
            format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(select_surface_format(&formats).unwrap(), formats[1]);
    }

    #[test]
    fn falls_back_to_first_format() {
        let formats = [
            format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
        ];
        assert_eq!(select_surface_format(&formats).unwrap(), formats[0]);
        assert!(select_surface_format(&[]).is_err());
    }

    #[test]
    fn present_mode_policy() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(select_present_mode(&modes, false).unwrap(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(select_present_mode(&modes, true).unwrap(), vk::PresentModeKHR::FIFO);
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO], false)
                .unwrap(),
            vk::PresentModeKHR::FIFO
        );
        assert!(select_present_mode(&[], false).is_err());
    }

    #[test]
    fn fixed_extent_wins() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        assert_eq!(
            select_extent(&capabilities, 1920, 1080),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn window_size_is_clamped() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        assert_eq!(
            select_extent(&capabilities, 4000, 10),
            vk::Extent2D {
                width: 1024,
                height: 64
            }
        );
    }

    #[test]
    fn depth_format_order() {
        assert_eq!(select_depth_format(|_| true).unwrap(), vk::Format::D32_SFLOAT);
        assert_eq!(
            select_depth_format(|f| f == vk::Format::D24_UNORM_S8_UINT).unwrap(),
            vk::Format::D24_UNORM_S8_UINT
        );
        assert!(select_depth_format(|_| false).is_err());
    }

    #[test]
    fn formats_match_ignores_extent() {
        let support = SurfaceSupport {
            capabilities: caps(2, 4),
            formats: vec![PREFERRED_SURFACE_FORMAT],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        let small = DeviceProperties::choose(&support, (640, 480), true, |_| true).unwrap();
        let large = DeviceProperties::choose(&support, (1920, 1080), false, |_| true).unwrap();
        assert!(small.formats_match(&large));

        let no_d32 = DeviceProperties::choose(&support, (640, 480), true, |f| {
            f != vk::Format::D32_SFLOAT
        })
        .unwrap();
        assert!(!small.formats_match(&no_d32));
    }

    #[test]
    fn choose_requires_formats_and_modes() {
        let support = SurfaceSupport {
            capabilities: caps(2, 4),
            formats: Vec::new(),
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(DeviceProperties::choose(&support, (640, 480), true, |_| true).is_err());

        let support = SurfaceSupport {
            formats: vec![PREFERRED_SURFACE_FORMAT],
            present_modes: Vec::new(),
            ..support
        };
        assert!(DeviceProperties::choose(&support, (640, 480), true, |_| true).is_err());
    }
}
