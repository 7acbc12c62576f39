//! Command pool and command buffer helpers.

use crate::error::{GpuError, Result};
use ash::vk;

/// Command pool for allocating command buffers.
#[derive(Debug, Clone, Copy)]
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.create_command_pool(&create_info, None)? };

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub const fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub const fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single primary command buffer.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_primary(&self, device: &ash::Device) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("no command buffer allocated".to_string()))
    }

    /// Reset the command pool, recycling all of its command buffers.
    ///
    /// # Safety
    /// The device must be valid and no command buffer from this pool may be pending.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        unsafe { device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())? };
        Ok(())
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    unsafe { device.begin_command_buffer(cmd, &begin_info)? };
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    unsafe { device.end_command_buffer(cmd)? };
    Ok(())
}

/// Submit one frame's command buffer.
///
/// Waits on `wait` at color attachment output, signals `signal` once all
/// commands complete, and signals `fence` for the frame slot.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_frame(
    device: &ash::Device,
    queue: vk::Queue,
    cmd: vk::CommandBuffer,
    wait: vk::Semaphore,
    signal: vk::Semaphore,
    fence: vk::Fence,
) -> Result<()> {
    let wait_info = [vk::SemaphoreSubmitInfo::default()
        .semaphore(wait)
        .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)];
    let signal_info = [vk::SemaphoreSubmitInfo::default()
        .semaphore(signal)
        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
    let cmd_info = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];

    let submit = vk::SubmitInfo2::default()
        .wait_semaphore_infos(&wait_info)
        .command_buffer_infos(&cmd_info)
        .signal_semaphore_infos(&signal_info);

    unsafe { device.queue_submit2(queue, &[submit], fence)? };
    Ok(())
}

/// Record and run a one-shot command buffer, blocking until it completes.
///
/// Uses a transient pool and a fence bounded by `timeout_ns`; both are
/// released whether or not the submission succeeds.
///
/// # Safety
/// All handles must be valid and `queue` must belong to `queue_family`.
pub unsafe fn execute_one_shot<F>(
    device: &ash::Device,
    queue: vk::Queue,
    queue_family: u32,
    timeout_ns: u64,
    record: F,
) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let pool =
        unsafe { CommandPool::new(device, queue_family, vk::CommandPoolCreateFlags::TRANSIENT)? };
    let fence = match unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) } {
        Ok(fence) => fence,
        Err(err) => {
            unsafe { pool.destroy(device) };
            return Err(err.into());
        }
    };

    let result = (|| -> Result<()> {
        let cmd = unsafe { pool.allocate_primary(device)? };
        unsafe { begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)? };
        record(cmd);
        unsafe { end_command_buffer(device, cmd)? };

        let cmd_info = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let submit = vk::SubmitInfo2::default().command_buffer_infos(&cmd_info);
        unsafe { device.queue_submit2(queue, &[submit], fence)? };

        match unsafe { device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout(timeout_ns)),
            Err(err) => Err(err.into()),
        }
    })();

    unsafe {
        device.destroy_fence(fence, None);
        pool.destroy(device);
    }

    result
}
