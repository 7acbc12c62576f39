//! Per-frame synchronization.
//!
//! Each frame slot owns two semaphores, a fence and a command pool with one
//! primary command buffer. A slot's fence must be signaled before its pool
//! is reset and the slot is reused; [`SlotTracker`] enforces that ordering.

use crate::command::CommandPool;
use crate::error::{GpuError, Result};
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    Ok(unsafe { device.create_semaphore(&create_info, None)? })
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    Ok(unsafe { device.create_fence(&create_info, None)? })
}

/// Wait for a fence, mapping `VK_TIMEOUT` to [`GpuError::Timeout`].
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
    match unsafe { device.wait_for_fences(&[fence], true, timeout_ns) } {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout(timeout_ns)),
        Err(err) => Err(err.into()),
    }
}

/// Lifecycle of a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Nothing pending; the pool may be reset.
    #[default]
    Idle,
    /// Work submitted, fence not yet observed.
    Submitted,
    /// Fence observed signaled, pool not yet recycled.
    Signaled,
}

/// Tracks [`SlotState`] for every frame slot.
#[derive(Debug, Clone, Default)]
pub struct SlotTracker {
    states: Vec<SlotState>,
}

impl SlotTracker {
    pub fn new(slots: usize) -> Self {
        Self {
            states: vec![SlotState::Idle; slots],
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, slot: usize) -> Result<SlotState> {
        self.states
            .get(slot)
            .copied()
            .ok_or_else(|| GpuError::InvalidState(format!("frame slot {slot} out of range")))
    }

    /// Whether the slot has work the CPU has not yet waited for.
    pub fn in_use(&self, slot: usize) -> bool {
        matches!(self.states.get(slot), Some(SlotState::Submitted))
    }

    fn set(&mut self, slot: usize, from: SlotState, to: SlotState) -> Result<()> {
        let state = self
            .states
            .get_mut(slot)
            .ok_or_else(|| GpuError::InvalidState(format!("frame slot {slot} out of range")))?;
        if *state != from {
            return Err(GpuError::InvalidState(format!(
                "frame slot {slot} is {state:?}, expected {from:?}"
            )));
        }
        *state = to;
        Ok(())
    }

    pub fn mark_submitted(&mut self, slot: usize) -> Result<()> {
        self.set(slot, SlotState::Idle, SlotState::Submitted)
    }

    pub fn mark_signaled(&mut self, slot: usize) -> Result<()> {
        self.set(slot, SlotState::Submitted, SlotState::Signaled)
    }

    /// Recycle a signaled slot.
    pub fn mark_idle(&mut self, slot: usize) -> Result<()> {
        self.set(slot, SlotState::Signaled, SlotState::Idle)
    }

    /// Reject resetting the slot's pool while its work may still execute.
    pub fn check_reset_allowed(&self, slot: usize) -> Result<()> {
        match self.state(slot)? {
            SlotState::Submitted => Err(GpuError::InvalidState(format!(
                "command pool of frame slot {slot} is still in use"
            ))),
            SlotState::Idle | SlotState::Signaled => Ok(()),
        }
    }
}

/// Synchronization objects and command buffer of one frame slot.
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    /// Signaled when the swapchain image is available
    pub image_available: vk::Semaphore,
    /// Signaled when rendering is complete
    pub render_finished: vk::Semaphore,
    /// Signaled when the slot's submission retires
    pub in_flight: vk::Fence,
    pub command_pool: CommandPool,
    pub command_buffer: vk::CommandBuffer,
}

/// Synchronization for all frames in flight.
pub struct FrameSync {
    slots: Vec<FrameSlot>,
    tracker: SlotTracker,
    current: usize,
    timeout_ns: u64,
    released: bool,
}

impl FrameSync {
    /// Create resources for `frames_in_flight` slots.
    ///
    /// Fences are created signaled and immediately reset so that a slot that
    /// never submitted is not waited on.
    ///
    /// # Safety
    /// The device must be valid and `queue_family` must exist.
    pub unsafe fn new(
        device: &ash::Device,
        frames_in_flight: usize,
        queue_family: u32,
        timeout_ns: u64,
    ) -> Result<Self> {
        let frames_in_flight = frames_in_flight.max(1);
        let mut sync = Self {
            slots: Vec::with_capacity(frames_in_flight),
            tracker: SlotTracker::new(frames_in_flight),
            current: 0,
            timeout_ns,
            released: false,
        };

        for _ in 0..frames_in_flight {
            match unsafe { Self::create_slot(device, queue_family) } {
                Ok(slot) => sync.slots.push(slot),
                Err(err) => {
                    unsafe { sync.destroy_slots(device) };
                    sync.released = true;
                    return Err(err);
                }
            }
        }

        tracing::debug!("Created frame sync with {frames_in_flight} slot(s)");
        Ok(sync)
    }

    unsafe fn create_slot(device: &ash::Device, queue_family: u32) -> Result<FrameSlot> {
        let command_pool = unsafe {
            CommandPool::new(
                device,
                queue_family,
                vk::CommandPoolCreateFlags::TRANSIENT,
            )?
        };

        let created = (|| -> Result<FrameSlot> {
            let command_buffer = unsafe { command_pool.allocate_primary(device)? };
            let image_available = unsafe { create_semaphore(device)? };
            let render_finished = unsafe { create_semaphore(device)? };
            let in_flight = unsafe { create_fence(device, true)? };
            unsafe { device.reset_fences(&[in_flight])? };
            Ok(FrameSlot {
                image_available,
                render_finished,
                in_flight,
                command_pool,
                command_buffer,
            })
        })();

        if created.is_err() {
            unsafe { command_pool.destroy(device) };
        }
        created
    }

    /// Number of slots.
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Index of the current slot.
    pub const fn current_slot(&self) -> usize {
        self.current
    }

    /// Move on to the next slot.
    pub fn advance(&mut self) {
        if !self.slots.is_empty() {
            self.current = (self.current + 1) % self.slots.len();
        }
    }

    pub fn slot(&self, slot: usize) -> Result<&FrameSlot> {
        self.slots
            .get(slot)
            .ok_or_else(|| GpuError::InvalidState(format!("frame slot {slot} out of range")))
    }

    pub const fn timeout_ns(&self) -> u64 {
        self.timeout_ns
    }

    pub fn in_use(&self, slot: usize) -> bool {
        self.tracker.in_use(slot)
    }

    pub fn state(&self, slot: usize) -> Result<SlotState> {
        self.tracker.state(slot)
    }

    /// Wait for the slot's last submission, then recycle its fence and pool.
    ///
    /// Does nothing if the slot has no pending submission.
    ///
    /// # Safety
    /// The device must be the one the slot was created on.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn wait_and_reset_fence(&mut self, device: &ash::Device, slot: usize) -> Result<()> {
        if !self.tracker.in_use(slot) {
            return Ok(());
        }
        let frame = *self.slot(slot)?;

        unsafe { wait_for_fence(device, frame.in_flight, self.timeout_ns)? };
        self.tracker.mark_signaled(slot)?;

        unsafe { device.reset_fences(&[frame.in_flight])? };
        self.tracker.check_reset_allowed(slot)?;
        unsafe { frame.command_pool.reset(device)? };
        self.tracker.mark_idle(slot)
    }

    /// Wait on every slot's fence.
    ///
    /// # Safety
    /// The device must be the one the slots were created on.
    pub unsafe fn wait_all(&mut self, device: &ash::Device) -> Result<()> {
        for slot in 0..self.slots.len() {
            unsafe { self.wait_and_reset_fence(device, slot)? };
        }
        Ok(())
    }

    /// Record that the slot's command buffer was submitted with its fence.
    pub fn mark_submitted(&mut self, slot: usize) -> Result<()> {
        self.tracker.mark_submitted(slot)
    }

    /// Recreate every semaphore after waiting for `queue` to go idle.
    ///
    /// A failed acquire or present can leave a semaphore signaled with no
    /// pending wait; new semaphores start unsignaled. Every submission has
    /// retired once the queue is idle, so all slots are recycled and end up
    /// [`SlotState::Idle`].
    ///
    /// # Safety
    /// The device and queue must be valid, and `queue` must be the queue the
    /// slots submit to.
    pub unsafe fn reset_semaphores(&mut self, device: &ash::Device, queue: vk::Queue) -> Result<()> {
        unsafe {
            device.queue_wait_idle(queue)?;
            self.wait_all(device)?;
        }

        for frame in &mut self.slots {
            unsafe {
                device.destroy_semaphore(frame.image_available, None);
                device.destroy_semaphore(frame.render_finished, None);
            }
            frame.image_available = vk::Semaphore::null();
            frame.render_finished = vk::Semaphore::null();

            frame.image_available = unsafe { create_semaphore(device)? };
            frame.render_finished = unsafe { create_semaphore(device)? };
        }

        tracing::debug!("Recreated frame semaphores");
        Ok(())
    }

    /// Wait for the device to go idle and destroy everything. Calling it
    /// again does nothing.
    ///
    /// # Safety
    /// The device must be the one the slots were created on.
    pub unsafe fn release(&mut self, device: &ash::Device) {
        if self.released {
            return;
        }
        if let Err(e) = unsafe { device.device_wait_idle() } {
            tracing::error!("Device wait idle failed during frame sync release: {e}");
        }
        unsafe { self.destroy_slots(device) };
        self.tracker = SlotTracker::new(0);
        self.current = 0;
        self.released = true;
    }

    pub const fn is_released(&self) -> bool {
        self.released
    }

    unsafe fn destroy_slots(&mut self, device: &ash::Device) {
        for frame in self.slots.drain(..) {
            unsafe {
                if frame.image_available != vk::Semaphore::null() {
                    device.destroy_semaphore(frame.image_available, None);
                }
                if frame.render_finished != vk::Semaphore::null() {
                    device.destroy_semaphore(frame.render_finished, None);
                }
                device.destroy_fence(frame.in_flight, None);
                frame.command_pool.destroy(device);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_cycle() {
        let mut tracker = SlotTracker::new(2);
        assert_eq!(tracker.state(0).unwrap(), SlotState::Idle);
        assert!(!tracker.in_use(0));

        tracker.mark_submitted(0).unwrap();
        assert!(tracker.in_use(0));
        assert!(!tracker.in_use(1));

        tracker.mark_signaled(0).unwrap();
        assert_eq!(tracker.state(0).unwrap(), SlotState::Signaled);
        tracker.mark_idle(0).unwrap();
        assert_eq!(tracker.state(0).unwrap(), SlotState::Idle);
    }

    #[test]
    fn pool_reset_rejected_while_submitted() {
        let mut tracker = SlotTracker::new(1);
        tracker.check_reset_allowed(0).unwrap();
        tracker.mark_submitted(0).unwrap();
        assert!(matches!(
            tracker.check_reset_allowed(0),
            Err(GpuError::InvalidState(_))
        ));
        tracker.mark_signaled(0).unwrap();
        tracker.check_reset_allowed(0).unwrap();
    }

    #[test]
    fn double_submit_rejected() {
        let mut tracker = SlotTracker::new(1);
        tracker.mark_submitted(0).unwrap();
        assert!(tracker.mark_submitted(0).is_err());
    }

    #[test]
    fn out_of_range_slot() {
        let mut tracker = SlotTracker::new(1);
        assert!(tracker.state(3).is_err());
        assert!(tracker.mark_submitted(3).is_err());
        assert!(!tracker.in_use(3));
    }

    #[test]
    fn skipping_states_is_rejected() {
        let mut tracker = SlotTracker::new(1);
        assert!(tracker.mark_signaled(0).is_err());
        assert!(tracker.mark_idle(0).is_err());
    }
}
