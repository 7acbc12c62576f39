//! Tests against a real Vulkan device. Run with `cargo test -- --ignored`.

use ash::vk;
use prism_gpu::memory::create_image_view;
use prism_gpu::transfer::transition_image_layout;
use prism_gpu::{
    upload_via_staging, FrameSync, GpuAllocator, GpuError, MemoryLocation, SlotState,
    UploadTarget,
};
use std::sync::Arc;

const TIMEOUT_NS: u64 = 5_000_000_000;

/// Minimal headless device: one graphics queue, the features the allocator
/// and submission helpers rely on.
struct Headless {
    instance: ash::Instance,
    device: Arc<ash::Device>,
    allocator: Option<GpuAllocator>,
    queue: vk::Queue,
    family: u32,
    _entry: ash::Entry,
}

impl Headless {
    fn new() -> Self {
        let entry = unsafe { ash::Entry::load() }.unwrap();
        let app_info = vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_3);
        let instance = unsafe {
            entry
                .create_instance(
                    &vk::InstanceCreateInfo::default().application_info(&app_info),
                    None,
                )
                .unwrap()
        };

        let physical_devices = unsafe { instance.enumerate_physical_devices() }.unwrap();
        let (physical, family) = physical_devices
            .iter()
            .find_map(|&physical| {
                let families =
                    unsafe { instance.get_physical_device_queue_family_properties(physical) };
                families
                    .iter()
                    .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                    .map(|family| (physical, family as u32))
            })
            .unwrap();

        let priorities = [1.0];
        let queue_info = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(family)
            .queue_priorities(&priorities)];
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
        let mut features12 =
            vk::PhysicalDeviceVulkan12Features::default().buffer_device_address(true);
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_info)
            .push_next(&mut features13)
            .push_next(&mut features12);
        let device = Arc::new(unsafe { instance.create_device(physical, &create_info, None) }.unwrap());
        let queue = unsafe { device.get_device_queue(family, 0) };

        let allocator =
            unsafe { GpuAllocator::new(&instance, Arc::clone(&device), physical) }.unwrap();

        Self {
            instance,
            device,
            allocator: Some(allocator),
            queue,
            family,
            _entry: entry,
        }
    }

    fn allocator(&mut self) -> &mut GpuAllocator {
        self.allocator.as_mut().unwrap()
    }

    fn target(&self) -> UploadTarget {
        UploadTarget {
            queue: self.queue,
            queue_family: self.family,
            timeout_ns: TIMEOUT_NS,
        }
    }
}

impl Drop for Headless {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().unwrap();
            drop(self.allocator.take());
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

#[test]
#[ignore = "Requires GPU hardware"]
fn buffer_destroy_is_idempotent() {
    let mut gpu = Headless::new();
    let allocator = gpu.allocator();

    let mut buffer = allocator
        .create_buffer(
            4,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            "test",
        )
        .unwrap();
    assert!(buffer.is_valid());
    assert_eq!(buffer.size, prism_gpu::memory::MIN_BUFFER_SIZE);
    assert_ne!(buffer.address, 0);

    buffer.write(0, &[1u32, 2, 3, 4]).unwrap();

    buffer.destroy(allocator);
    assert!(!buffer.is_valid());
    buffer.destroy(allocator);
    assert!(!buffer.is_valid());
}

#[test]
#[ignore = "Requires GPU hardware"]
fn staging_upload_completes() {
    let mut gpu = Headless::new();
    let target = gpu.target();
    let allocator = gpu.allocator();

    let mut dst = allocator
        .create_buffer(
            1024,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::GpuOnly,
            "dst",
        )
        .unwrap();
    let data = vec![7u8; 1024];
    upload_via_staging(allocator, &data, &dst, target).unwrap();

    let too_big = vec![0u8; 4096];
    assert!(matches!(
        upload_via_staging(allocator, &too_big, &dst, target),
        Err(GpuError::InvalidState(_))
    ));

    dst.destroy(allocator);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn image_transitions() {
    let mut gpu = Headless::new();
    let target = gpu.target();
    let device = Arc::clone(&gpu.device);
    let allocator = gpu.allocator();

    let extent = vk::Extent2D {
        width: 2,
        height: 2,
    };
    let mut image = allocator
        .create_image(
            vk::Format::R8G8B8A8_UNORM,
            extent,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            MemoryLocation::GpuOnly,
            "texture",
        )
        .unwrap();
    image.view = unsafe {
        create_image_view(
            &device,
            image.image,
            image.format,
            vk::ImageAspectFlags::COLOR,
        )
    }
    .unwrap();

    unsafe {
        transition_image_layout(
            &device,
            image.image,
            image.format,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            target.queue,
            target.queue_family,
            TIMEOUT_NS,
        )
        .unwrap();

        let rejected = transition_image_layout(
            &device,
            image.image,
            image.format,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            target.queue,
            target.queue_family,
            TIMEOUT_NS,
        );
        assert!(matches!(
            rejected,
            Err(GpuError::UnsupportedLayoutTransition { .. })
        ));
    }

    image.destroy(allocator);
    image.destroy(allocator);
    assert!(!image.is_valid());
}

#[test]
#[ignore = "Requires GPU hardware"]
fn unused_slots_are_not_waited_on() {
    let gpu = Headless::new();
    let mut sync = unsafe { FrameSync::new(&gpu.device, 2, gpu.family, TIMEOUT_NS) }.unwrap();

    // Fences start unsignaled, but idle slots skip the wait entirely.
    unsafe { sync.wait_all(&gpu.device) }.unwrap();
    assert!(!sync.in_use(0));

    unsafe {
        sync.reset_semaphores(&gpu.device, gpu.queue).unwrap();
        sync.release(&gpu.device);
        sync.release(&gpu.device);
    }
    assert!(sync.is_released());
}

#[test]
#[ignore = "Requires GPU hardware"]
fn submitted_slot_is_recycled() {
    let gpu = Headless::new();
    let device = &gpu.device;
    let mut sync = unsafe { FrameSync::new(device, 1, gpu.family, TIMEOUT_NS) }.unwrap();
    let slot = *sync.slot(0).unwrap();

    unsafe {
        prism_gpu::begin_command_buffer(
            device,
            slot.command_buffer,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        )
        .unwrap();
        prism_gpu::end_command_buffer(device, slot.command_buffer).unwrap();

        let cmd_info = [vk::CommandBufferSubmitInfo::default().command_buffer(slot.command_buffer)];
        let submit = vk::SubmitInfo2::default().command_buffer_infos(&cmd_info);
        device
            .queue_submit2(gpu.queue, &[submit], slot.in_flight)
            .unwrap();
    }
    sync.mark_submitted(0).unwrap();
    assert!(sync.in_use(0));

    unsafe { sync.wait_and_reset_fence(device, 0) }.unwrap();
    assert!(!sync.in_use(0));
    assert!(!unsafe { device.get_fence_status(slot.in_flight) }.unwrap());

    unsafe { sync.release(device) };
}

#[test]
#[ignore = "Requires GPU hardware"]
fn semaphore_reset_recycles_submitted_slots() {
    let gpu = Headless::new();
    let device = &gpu.device;
    let mut sync = unsafe { FrameSync::new(device, 2, gpu.family, TIMEOUT_NS) }.unwrap();
    let before = *sync.slot(0).unwrap();

    unsafe {
        prism_gpu::begin_command_buffer(
            device,
            before.command_buffer,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        )
        .unwrap();
        prism_gpu::end_command_buffer(device, before.command_buffer).unwrap();

        let cmd_info = [vk::CommandBufferSubmitInfo::default().command_buffer(before.command_buffer)];
        let submit = vk::SubmitInfo2::default().command_buffer_infos(&cmd_info);
        device
            .queue_submit2(gpu.queue, &[submit], before.in_flight)
            .unwrap();
    }
    sync.mark_submitted(0).unwrap();
    assert_eq!(sync.state(0).unwrap(), SlotState::Submitted);

    unsafe { sync.reset_semaphores(device, gpu.queue) }.unwrap();

    for slot in 0..2 {
        assert_eq!(sync.state(slot).unwrap(), SlotState::Idle);
    }
    let after = *sync.slot(0).unwrap();
    assert_ne!(after.image_available, vk::Semaphore::null());
    assert_ne!(after.render_finished, vk::Semaphore::null());
    assert!(!unsafe { device.get_fence_status(after.in_flight) }.unwrap());

    // the slot can be submitted again
    sync.mark_submitted(0).unwrap();
    unsafe { sync.release(device) };
}
