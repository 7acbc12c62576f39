//! Swapchain management.

use crate::device::QueueFamilyIndices;
use crate::error::{GpuError, Result};
use crate::memory::{create_image_view, GpuAllocator, ImageAllocation};
use crate::surface::DeviceProperties;
use crate::sync::FrameSync;
use crate::transfer::transition_aspect;
use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::MemoryLocation;

/// Current swapchain handle plus at most one retired handle awaiting
/// destruction during recreation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapchainChain {
    current: vk::SwapchainKHR,
    old: vk::SwapchainKHR,
}

impl SwapchainChain {
    pub const fn current(&self) -> vk::SwapchainKHR {
        self.current
    }

    pub const fn old(&self) -> vk::SwapchainKHR {
        self.old
    }

    /// Move the current handle into the retired slot.
    ///
    /// A chain with no current handle keeps its retired one, so a failed
    /// recreation can be retried.
    pub fn retire_current(&mut self) -> Result<()> {
        if self.current == vk::SwapchainKHR::null() {
            return Ok(());
        }
        if self.old != vk::SwapchainKHR::null() {
            return Err(GpuError::InvalidState(
                "a retired swapchain is still pending destruction".to_string(),
            ));
        }
        self.old = std::mem::take(&mut self.current);
        Ok(())
    }

    /// Install a freshly created swapchain.
    pub fn install(&mut self, swapchain: vk::SwapchainKHR) {
        self.current = swapchain;
    }

    /// Hand the retired handle back for destruction.
    pub fn take_old(&mut self) -> Option<vk::SwapchainKHR> {
        let old = std::mem::take(&mut self.old);
        (old != vk::SwapchainKHR::null()).then_some(old)
    }

    /// Remove both handles.
    pub fn take_all(&mut self) -> [Option<vk::SwapchainKHR>; 2] {
        let current = std::mem::take(&mut self.current);
        [
            (current != vk::SwapchainKHR::null()).then_some(current),
            self.take_old(),
        ]
    }
}

/// Result of presenting an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Optimal,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    /// Whether the swapchain must be recreated.
    pub const fn needs_recreate(self) -> bool {
        !matches!(self, Self::Optimal)
    }
}

/// What the frame loop does after an acquire or present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Keep rendering with the current swapchain.
    Continue,
    /// Rebuild the swapchain.
    Recreate,
    /// Recreate every frame semaphore, then rebuild the swapchain. A failed
    /// acquire or present may leave a semaphore signaled with nothing
    /// waiting on it.
    ResetAndRecreate,
}

impl Recovery {
    /// `acquired` is the result of [`Swapchain::acquire_next_image`].
    pub const fn after_acquire(acquired: Option<u32>) -> Self {
        match acquired {
            Some(_) => Self::Continue,
            None => Self::ResetAndRecreate,
        }
    }

    pub const fn after_present(presented: &Result<PresentOutcome>) -> Self {
        match presented {
            Ok(PresentOutcome::Optimal) => Self::Continue,
            Ok(PresentOutcome::Suboptimal | PresentOutcome::OutOfDate) => Self::Recreate,
            Err(_) => Self::ResetAndRecreate,
        }
    }

    pub const fn resets_semaphores(self) -> bool {
        matches!(self, Self::ResetAndRecreate)
    }

    pub const fn recreates(self) -> bool {
        !matches!(self, Self::Continue)
    }
}

/// Map the result of `vkAcquireNextImageKHR`.
///
/// Suboptimal, out-of-date, timeout and not-ready acquisitions all yield
/// `None`; the caller recreates the swapchain.
pub fn map_acquire_result(result: VkResult<(u32, bool)>) -> Result<Option<u32>> {
    match result {
        Ok((index, false)) => Ok(Some(index)),
        Ok((_, true))
        | Err(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::TIMEOUT | vk::Result::NOT_READY) => {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Map the result of `vkQueuePresentKHR`.
pub fn map_present_result(result: VkResult<bool>) -> Result<PresentOutcome> {
    match result {
        Ok(false) => Ok(PresentOutcome::Optimal),
        Ok(true) => Ok(PresentOutcome::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
        Err(e) => Err(e.into()),
    }
}

/// Swapchain with per-image views and a matching depth image.
pub struct Swapchain {
    loader: ash::khr::swapchain::Device,
    chain: SwapchainChain,
    /// Presentation images; views are owned, images are not.
    pub images: Vec<ImageAllocation>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub depth: ImageAllocation,
}

impl Swapchain {
    /// Create an empty swapchain; call [`Swapchain::create_or_recreate`]
    /// before rendering.
    pub fn new(instance: &ash::Instance, device: &ash::Device) -> Self {
        Self {
            loader: ash::khr::swapchain::Device::new(instance, device),
            chain: SwapchainChain::default(),
            images: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            depth: ImageAllocation::default(),
        }
    }

    /// Raw handle of the current swapchain.
    pub const fn handle(&self) -> vk::SwapchainKHR {
        self.chain.current()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Create the swapchain, or replace the current one after a resize.
    ///
    /// The previous swapchain is passed as `old_swapchain` and destroyed as
    /// soon as the new image list is fetched. The device must be idle.
    ///
    /// # Safety
    /// The surface must be valid and belong to the allocator's device.
    pub unsafe fn create_or_recreate(
        &mut self,
        allocator: &mut GpuAllocator,
        surface: vk::SurfaceKHR,
        properties: &DeviceProperties,
        queue_families: &QueueFamilyIndices,
    ) -> Result<()> {
        self.chain.retire_current()?;

        let family_indices = [queue_families.graphics, queue_families.presentation];
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(properties.min_image_count())
            .image_format(properties.format.format)
            .image_color_space(properties.format.color_space)
            .image_extent(properties.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(properties.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(properties.present_mode)
            .clipped(true)
            .old_swapchain(self.chain.old());
        create_info = if queue_families.graphics == queue_families.presentation {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        };

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;
        self.chain.install(swapchain);

        let images = unsafe { self.loader.get_swapchain_images(swapchain)? };

        if let Some(old) = self.chain.take_old() {
            unsafe { self.loader.destroy_swapchain(old, None) };
        }

        let device = allocator.device().clone();
        for image in &mut self.images {
            image.destroy_view(&device);
        }
        self.images.clear();

        self.format = properties.format.format;
        self.extent = properties.extent;
        for image in images {
            let view = unsafe {
                create_image_view(&device, image, self.format, vk::ImageAspectFlags::COLOR)?
            };
            self.images
                .push(ImageAllocation::borrowed(image, view, self.format, self.extent));
        }

        self.recreate_depth(allocator, properties.depth_format)?;

        tracing::info!(
            "Swapchain ready: {}x{}, {} images, {:?}, {:?}",
            self.extent.width,
            self.extent.height,
            self.images.len(),
            self.format,
            properties.present_mode
        );
        Ok(())
    }

    fn recreate_depth(&mut self, allocator: &mut GpuAllocator, format: vk::Format) -> Result<()> {
        self.depth.destroy(allocator);

        let mut depth = allocator.create_image(
            format,
            self.extent,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            MemoryLocation::GpuOnly,
            "depth",
        )?;
        let aspect = transition_aspect(format, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        match unsafe { create_image_view(allocator.device(), depth.image, format, aspect) } {
            Ok(view) => depth.view = view,
            Err(err) => {
                depth.destroy(allocator);
                return Err(err);
            }
        }

        self.depth = depth;
        Ok(())
    }

    /// Wait for the slot's previous frame, then acquire the next image.
    ///
    /// Returns `None` when the swapchain must be recreated before rendering.
    ///
    /// # Safety
    /// The device must be the one the swapchain and frame sync belong to.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn acquire_next_image(
        &self,
        device: &ash::Device,
        sync: &mut FrameSync,
        slot: usize,
    ) -> Result<Option<u32>> {
        unsafe { sync.wait_and_reset_fence(device, slot)? };
        let semaphore = sync.slot(slot)?.image_available;

        let result = unsafe {
            self.loader.acquire_next_image(
                self.chain.current(),
                sync.timeout_ns(),
                semaphore,
                vk::Fence::null(),
            )
        };
        map_acquire_result(result)
    }

    /// Present `image_index` once `wait` is signaled.
    ///
    /// # Safety
    /// The queue must support presentation to this swapchain's surface.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let wait_semaphores = [wait];
        let swapchains = [self.chain.current()];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        map_present_result(unsafe { self.loader.queue_present(queue, &present_info) })
    }

    /// Destroy views, depth image and swapchain handles. Calling it again
    /// does nothing.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, allocator: &mut GpuAllocator) {
        let device = allocator.device().clone();
        for image in &mut self.images {
            image.destroy_view(&device);
        }
        self.images.clear();
        self.depth.destroy(allocator);

        for swapchain in self.chain.take_all().into_iter().flatten() {
            unsafe { self.loader.destroy_swapchain(swapchain, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn chain_retires_and_installs() {
        let first = vk::SwapchainKHR::from_raw(1);
        let second = vk::SwapchainKHR::from_raw(2);

        let mut chain = SwapchainChain::default();
        chain.retire_current().unwrap();
        assert_eq!(chain.take_old(), None);

        chain.install(first);
        chain.retire_current().unwrap();
        assert_eq!(chain.current(), vk::SwapchainKHR::null());
        assert_eq!(chain.old(), first);

        chain.install(second);
        assert_eq!(chain.take_old(), Some(first));
        assert_eq!(chain.take_old(), None);
        assert_eq!(chain.current(), second);
    }

    #[test]
    fn at_most_one_retired_swapchain() {
        let mut chain = SwapchainChain::default();
        chain.install(vk::SwapchainKHR::from_raw(1));
        chain.retire_current().unwrap();
        chain.install(vk::SwapchainKHR::from_raw(2));
        assert!(chain.retire_current().is_err());
    }

    #[test]
    fn failed_recreate_keeps_retired_handle() {
        let mut chain = SwapchainChain::default();
        chain.install(vk::SwapchainKHR::from_raw(7));
        chain.retire_current().unwrap();
        // creation failed, nothing installed
        chain.retire_current().unwrap();
        assert_eq!(chain.old(), vk::SwapchainKHR::from_raw(7));
    }

    #[test]
    fn take_all_empties_chain() {
        let mut chain = SwapchainChain::default();
        chain.install(vk::SwapchainKHR::from_raw(3));
        let handles: Vec<_> = chain.take_all().into_iter().flatten().collect();
        assert_eq!(handles, vec![vk::SwapchainKHR::from_raw(3)]);
        assert_eq!(chain, SwapchainChain::default());
    }

    #[test]
    fn acquire_results() {
        assert_eq!(map_acquire_result(Ok((2, false))).unwrap(), Some(2));
        assert_eq!(map_acquire_result(Ok((2, true))).unwrap(), None);
        assert_eq!(
            map_acquire_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            None
        );
        assert_eq!(map_acquire_result(Err(vk::Result::TIMEOUT)).unwrap(), None);
        assert!(map_acquire_result(Err(vk::Result::ERROR_DEVICE_LOST)).is_err());
    }

    #[test]
    fn present_results() {
        assert_eq!(map_present_result(Ok(false)).unwrap(), PresentOutcome::Optimal);
        assert_eq!(map_present_result(Ok(true)).unwrap(), PresentOutcome::Suboptimal);
        assert_eq!(
            map_present_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            PresentOutcome::OutOfDate
        );
        assert!(map_present_result(Err(vk::Result::ERROR_SURFACE_LOST_KHR)).is_err());
        assert!(PresentOutcome::Suboptimal.needs_recreate());
        assert!(!PresentOutcome::Optimal.needs_recreate());
    }

    #[test]
    fn stale_acquire_resets_semaphores() {
        assert_eq!(Recovery::after_acquire(Some(0)), Recovery::Continue);
        let stale = Recovery::after_acquire(
            map_acquire_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
        );
        assert_eq!(stale, Recovery::ResetAndRecreate);
        assert!(stale.resets_semaphores());
        assert!(stale.recreates());
    }

    #[test]
    fn present_failures_recover() {
        let suboptimal = Recovery::after_present(&map_present_result(Ok(true)));
        assert_eq!(suboptimal, Recovery::Recreate);
        assert!(!suboptimal.resets_semaphores());

        let lost = Recovery::after_present(&map_present_result(Err(
            vk::Result::ERROR_SURFACE_LOST_KHR,
        )));
        assert_eq!(lost, Recovery::ResetAndRecreate);

        let fine = Recovery::after_present(&Ok(PresentOutcome::Optimal));
        assert!(!fine.recreates());
    }

    #[test]
    fn repeated_recreation_leaves_one_swapchain() {
        let mut chain = SwapchainChain::default();
        chain.install(vk::SwapchainKHR::from_raw(1));

        let mut destroyed = Vec::new();
        for next in [2, 3] {
            chain.retire_current().unwrap();
            chain.install(vk::SwapchainKHR::from_raw(next));
            destroyed.extend(chain.take_old());
        }
        assert_eq!(
            destroyed,
            vec![vk::SwapchainKHR::from_raw(1), vk::SwapchainKHR::from_raw(2)]
        );
        assert_eq!(chain.old(), vk::SwapchainKHR::null());

        let remaining: Vec<_> = chain.take_all().into_iter().flatten().collect();
        assert_eq!(remaining, vec![vk::SwapchainKHR::from_raw(3)]);
        assert_eq!(chain, SwapchainChain::default());
    }
}
