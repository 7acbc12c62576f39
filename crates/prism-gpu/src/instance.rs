//! Vulkan instance creation.

use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance extensions needed to present to the given display.
pub fn required_instance_extensions(display: RawDisplayHandle) -> Result<Vec<*const c_char>> {
    let mut extensions = ash_window::enumerate_required_extensions(display)
        .map_err(|e| GpuError::ExtensionNotSupported(format!("surface extensions: {e}")))?
        .to_vec();

    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        extensions.push(ash::khr::get_physical_device_properties2::NAME.as_ptr());
    }

    extensions.shrink_to_fit();
    Ok(extensions)
}

/// Create a Vulkan 1.3 instance able to present to `display`.
///
/// A missing validation layer is logged and skipped rather than failing.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    display: RawDisplayHandle,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::InvalidState("application name contains a NUL byte".into()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Prism")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_names = required_instance_extensions(display)?;

    let mut layer_names = Vec::new();
    if enable_validation {
        let available = unsafe { entry.enumerate_instance_layer_properties()? };
        let found = available
            .iter()
            .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
        if found {
            layer_names.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!(
                "Validation layer {} not available",
                VALIDATION_LAYER.to_string_lossy()
            );
        }
    }

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = unsafe { entry.create_instance(&create_info, None)? };

    tracing::debug!(
        "Vulkan instance created (validation: {})",
        !layer_names.is_empty()
    );

    Ok(instance)
}
