//! Physical device selection, queue family resolution and logical device
//! creation.
//!
//! Selection and queue resolution run over plain data ([`DeviceCandidate`],
//! [`QueueFamilyInfo`]) gathered from Vulkan up front.

use crate::error::{GpuError, QueueRole, Result};
use ash::vk;
use std::ffi::{c_char, CStr};

/// What device selection needs to know about one physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub device_type: vk::PhysicalDeviceType,
    pub sampler_anisotropy: bool,
}

impl DeviceCandidate {
    /// Discrete GPU with anisotropic sampling.
    pub fn is_suitable(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU && self.sampler_anisotropy
    }
}

/// Pick the first suitable device in enumeration order.
pub fn select_candidate(candidates: &[DeviceCandidate]) -> Result<usize> {
    candidates
        .iter()
        .position(DeviceCandidate::is_suitable)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Enumerate physical devices and select the first suitable one.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    let candidates: Vec<DeviceCandidate> = devices
        .iter()
        .map(|&device| {
            let properties = unsafe { instance.get_physical_device_properties(device) };
            let features = unsafe { instance.get_physical_device_features(device) };
            DeviceCandidate {
                device_type: properties.device_type,
                sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            }
        })
        .collect();

    let index = select_candidate(&candidates)?;
    Ok(devices[index])
}

/// Queue family flags plus presentation support for the target surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    pub present_support: bool,
}

/// Resolved queue family index per role. Roles may share a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub presentation: u32,
    pub transfer: u32,
}

impl QueueFamilyIndices {
    /// Distinct families with the number of roles mapped to each, in
    /// ascending family order.
    pub fn unique_families(&self) -> Vec<(u32, u32)> {
        let mut families: Vec<(u32, u32)> = Vec::with_capacity(3);
        for family in [self.graphics, self.presentation, self.transfer] {
            match families.iter_mut().find(|(f, _)| *f == family) {
                Some((_, roles)) => *roles += 1,
                None => families.push((family, 1)),
            }
        }
        families.sort_unstable_by_key(|&(f, _)| f);
        families
    }

    /// Family that staging uploads are submitted on.
    ///
    /// Uploaded resources are exclusively owned by the graphics family and
    /// the final texture barrier targets shader stages, so uploads never run
    /// on a transfer-only family.
    pub const fn upload_family(&self) -> u32 {
        self.graphics
    }
}

/// Resolve graphics, presentation and transfer families in a single scan.
///
/// Graphics is the first family with graphics support, presentation the
/// first with surface support, transfer the first transfer-capable family
/// other than the graphics one. Without such a family transfer falls back to
/// the graphics family, which always supports transfer operations.
pub fn resolve_queue_families(families: &[QueueFamilyInfo]) -> Result<QueueFamilyIndices> {
    let mut graphics = None;
    let mut presentation = None;
    let mut transfer = None;

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;

        if graphics.is_none() && family.flags.contains(vk::QueueFlags::GRAPHICS) {
            graphics = Some(index);
        }

        if transfer.is_none()
            && family.flags.contains(vk::QueueFlags::TRANSFER)
            && graphics != Some(index)
        {
            transfer = Some(index);
        }

        if presentation.is_none() && family.present_support {
            presentation = Some(index);
        }

        if graphics.is_some() && presentation.is_some() && transfer.is_some() {
            break;
        }
    }

    let graphics = graphics.ok_or(GpuError::IncompleteQueueFamilies(QueueRole::Graphics))?;
    let presentation =
        presentation.ok_or(GpuError::IncompleteQueueFamilies(QueueRole::Presentation))?;
    let transfer = transfer.unwrap_or(graphics);

    Ok(QueueFamilyIndices {
        graphics,
        presentation,
        transfer,
    })
}

/// Query queue families of `physical_device` and resolve them against `surface`.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn find_queue_families(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Result<(QueueFamilyIndices, Vec<QueueFamilyInfo>)> {
    let properties =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let mut families = Vec::with_capacity(properties.len());
    for (index, family) in properties.iter().enumerate() {
        let present_support = unsafe {
            surface_loader.get_physical_device_surface_support(
                physical_device,
                index as u32,
                surface,
            )?
        };
        families.push(QueueFamilyInfo {
            flags: family.queue_flags,
            queue_count: family.queue_count,
            present_support,
        });
    }

    let indices = resolve_queue_families(&families)?;
    Ok((indices, families))
}

/// Device extensions the renderer cannot run without.
pub fn required_device_extensions() -> [&'static CStr; 3] {
    [
        ash::khr::swapchain::NAME,
        ash::ext::mesh_shader::NAME,
        ash::ext::descriptor_buffer::NAME,
    ]
}

/// Device extensions enabled only when the device offers them.
pub fn optional_device_extensions() -> [&'static CStr; 1] {
    [ash::ext::robustness2::NAME]
}

/// Extensions to enable on a device offering `available`: every required
/// one plus the optional ones it supports.
pub fn select_device_extensions(available: &[&CStr]) -> Result<Vec<&'static CStr>> {
    let mut selected = Vec::with_capacity(4);
    for required in required_device_extensions() {
        if !available.contains(&required) {
            return Err(GpuError::ExtensionNotSupported(
                required.to_string_lossy().into_owned(),
            ));
        }
        selected.push(required);
    }
    selected.extend(
        optional_device_extensions()
            .into_iter()
            .filter(|optional| available.contains(optional)),
    );
    Ok(selected)
}

/// Queues retrieved from a freshly created device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceQueues {
    pub graphics: vk::Queue,
    pub presentation: vk::Queue,
    pub transfer: vk::Queue,
}

/// Create the logical device with one queue per role and fetch the queues.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    indices: &QueueFamilyIndices,
    families: &[QueueFamilyInfo],
) -> Result<(ash::Device, DeviceQueues)> {
    let available = unsafe { instance.enumerate_device_extension_properties(physical_device)? };
    let available: Vec<&CStr> = available
        .iter()
        .filter_map(|ext| ext.extension_name_as_c_str().ok())
        .collect();
    let extensions = select_device_extensions(&available)?;
    let robustness = extensions.contains(&ash::ext::robustness2::NAME);

    // Role count per family, clamped to what the family offers.
    let plan: Vec<(u32, u32)> = indices
        .unique_families()
        .into_iter()
        .map(|(family, roles)| {
            let available = families
                .get(family as usize)
                .map_or(1, |f| f.queue_count.max(1));
            (family, roles.min(available))
        })
        .collect();

    let priorities = [1.0_f32; 3];
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = plan
        .iter()
        .map(|&(family, count)| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&priorities[..count as usize])
        })
        .collect();

    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true)
        .maintenance4(true);

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .scalar_block_layout(true)
        .storage_buffer8_bit_access(true)
        .uniform_and_storage_buffer8_bit_access(true);

    let mut mesh_shader_features = vk::PhysicalDeviceMeshShaderFeaturesEXT::default()
        .task_shader(true)
        .mesh_shader(true);

    let mut descriptor_buffer_features =
        vk::PhysicalDeviceDescriptorBufferFeaturesEXT::default().descriptor_buffer(true);

    let mut robustness_features =
        vk::PhysicalDeviceRobustness2FeaturesEXT::default().null_descriptor(true);

    let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features)
        .push_next(&mut mesh_shader_features)
        .push_next(&mut descriptor_buffer_features);
    if robustness {
        features2 = features2.push_next(&mut robustness_features);
    }

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None)? };

    let queues = match unsafe { fetch_queues(&device, &plan, indices) } {
        Ok(queues) => queues,
        Err(err) => {
            unsafe { device.destroy_device(None) };
            return Err(err);
        }
    };

    tracing::info!(
        "Logical device created (graphics: {}, presentation: {}, transfer: {})",
        indices.graphics,
        indices.presentation,
        indices.transfer
    );
    if !robustness {
        tracing::debug!("VK_EXT_robustness2 not available, null descriptors disabled");
    }

    Ok((device, queues))
}

/// Fetch one queue per role. Roles sharing a family take consecutive queue
/// indices while the family has them.
unsafe fn fetch_queues(
    device: &ash::Device,
    plan: &[(u32, u32)],
    indices: &QueueFamilyIndices,
) -> Result<DeviceQueues> {
    let mut taken: Vec<(u32, u32)> = plan.iter().map(|&(family, _)| (family, 0)).collect();

    let mut take = |family: u32| -> Result<vk::Queue> {
        let (count, used) = plan
            .iter()
            .zip(taken.iter_mut())
            .find(|((f, _), _)| *f == family)
            .map(|((_, count), (_, used))| (*count, used))
            .ok_or_else(|| GpuError::InvalidState(format!("queue family {family} not requested")))?;
        let queue_index = (*used).min(count.saturating_sub(1));
        *used += 1;

        let queue = unsafe { device.get_device_queue(family, queue_index) };
        if queue == vk::Queue::null() {
            return Err(GpuError::InvalidState(format!(
                "null queue for family {family} index {queue_index}"
            )));
        }
        Ok(queue)
    };

    Ok(DeviceQueues {
        graphics: take(indices.graphics)?,
        presentation: take(indices.presentation)?,
        transfer: take(indices.transfer)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{layout_transition, queue_supports_stages};

    fn family(flags: vk::QueueFlags, present: bool) -> QueueFamilyInfo {
        QueueFamilyInfo {
            flags,
            queue_count: 1,
            present_support: present,
        }
    }

    const GFX: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw()
            | vk::QueueFlags::COMPUTE.as_raw()
            | vk::QueueFlags::TRANSFER.as_raw(),
    );

    #[test]
    fn selects_first_discrete_gpu_with_anisotropy() {
        let candidates = [
            DeviceCandidate {
                device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
                sampler_anisotropy: true,
            },
            DeviceCandidate {
                device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
                sampler_anisotropy: false,
            },
            DeviceCandidate {
                device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
                sampler_anisotropy: true,
            },
            DeviceCandidate {
                device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
                sampler_anisotropy: true,
            },
        ];
        assert_eq!(select_candidate(&candidates).unwrap(), 2);
    }

    #[test]
    fn no_discrete_gpu_fails() {
        let candidates = [
            DeviceCandidate {
                device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
                sampler_anisotropy: true,
            },
            DeviceCandidate {
                device_type: vk::PhysicalDeviceType::CPU,
                sampler_anisotropy: true,
            },
        ];
        assert!(matches!(
            select_candidate(&candidates),
            Err(GpuError::NoSuitableDevice)
        ));
        assert!(matches!(select_candidate(&[]), Err(GpuError::NoSuitableDevice)));
    }

    #[test]
    fn resolves_distinct_transfer_family() {
        let families = [
            family(GFX, true),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, false),
            family(vk::QueueFlags::TRANSFER, false),
        ];
        let indices = resolve_queue_families(&families).unwrap();
        assert_eq!(
            indices,
            QueueFamilyIndices {
                graphics: 0,
                presentation: 0,
                transfer: 1,
            }
        );
    }

    #[test]
    fn transfer_falls_back_to_graphics() {
        let families = [family(GFX, true)];
        let indices = resolve_queue_families(&families).unwrap();
        assert_eq!(indices.transfer, indices.graphics);
        assert_eq!(indices.unique_families(), vec![(0, 3)]);
    }

    #[test]
    fn presentation_on_separate_family() {
        let families = [
            family(GFX, false),
            family(vk::QueueFlags::COMPUTE, true),
        ];
        let indices = resolve_queue_families(&families).unwrap();
        assert_eq!(indices.graphics, 0);
        assert_eq!(indices.presentation, 1);
        assert_eq!(indices.transfer, 0);
        assert_eq!(indices.unique_families(), vec![(0, 2), (1, 1)]);
    }

    #[test]
    fn missing_roles_fail() {
        let no_graphics = [family(vk::QueueFlags::TRANSFER, true)];
        assert!(matches!(
            resolve_queue_families(&no_graphics),
            Err(GpuError::IncompleteQueueFamilies(QueueRole::Graphics))
        ));

        let no_present = [family(GFX, false)];
        assert!(matches!(
            resolve_queue_families(&no_present),
            Err(GpuError::IncompleteQueueFamilies(QueueRole::Presentation))
        ));
    }

    #[test]
    fn resolved_roles_satisfy_their_capabilities() {
        let families = [
            family(vk::QueueFlags::TRANSFER, false),
            family(vk::QueueFlags::COMPUTE, true),
            family(GFX, false),
        ];
        let indices = resolve_queue_families(&families).unwrap();
        let g = families[indices.graphics as usize];
        let p = families[indices.presentation as usize];
        let t = families[indices.transfer as usize];
        assert!(g.flags.contains(vk::QueueFlags::GRAPHICS));
        assert!(p.present_support);
        assert!(t.flags.contains(vk::QueueFlags::TRANSFER));
        assert_ne!(indices.transfer, indices.graphics);
    }

    #[test]
    fn uploads_run_where_texture_barriers_are_valid() {
        let families = [
            family(GFX, true),
            family(vk::QueueFlags::TRANSFER, false),
        ];
        let indices = resolve_queue_families(&families).unwrap();
        assert_eq!(indices.transfer, 1);
        assert_eq!(indices.upload_family(), indices.graphics);

        let to_shader = layout_transition(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        let upload = families[indices.upload_family() as usize];
        let transfer_only = families[indices.transfer as usize];
        assert!(queue_supports_stages(upload.flags, to_shader.src_stage | to_shader.dst_stage));
        assert!(!queue_supports_stages(transfer_only.flags, to_shader.dst_stage));
    }

    #[test]
    fn robustness2_is_enabled_only_when_offered() {
        let mut available: Vec<&CStr> = required_device_extensions().to_vec();
        let extensions = select_device_extensions(&available).unwrap();
        assert_eq!(extensions.len(), 3);
        assert!(!extensions.contains(&ash::ext::robustness2::NAME));

        available.push(ash::ext::robustness2::NAME);
        let extensions = select_device_extensions(&available).unwrap();
        assert!(extensions.contains(&ash::ext::robustness2::NAME));
    }

    #[test]
    fn missing_required_extension_fails() {
        let available = [ash::khr::swapchain::NAME, ash::ext::robustness2::NAME];
        assert!(matches!(
            select_device_extensions(&available),
            Err(GpuError::ExtensionNotSupported(name)) if name.contains("mesh_shader")
        ));
    }
}
