//! Immediate-mode UI overlay seam.
//!
//! No UI library is bundled. The scene is rendered into offscreen viewport
//! images, one per swapchain image. Once the overlay is installed the frame
//! ends with a second rendering scope on the swapchain image, without depth,
//! in which the overlay records its draw commands. The viewport image of
//! that frame is readable from fragment shaders at that point, so the
//! overlay can show it as a texture.

use ash::vk;
use prism_gpu::QueueReference;

/// Handles an overlay needs to create its own GPU resources.
pub struct OverlayInit<'a> {
    pub entry: &'a ash::Entry,
    pub instance: &'a ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: &'a ash::Device,
    pub graphics: QueueReference,
    pub color_format: vk::Format,
    /// Always `UNDEFINED`: the overlay pass has no depth attachment.
    pub depth_format: vk::Format,
    pub image_count: usize,
}

/// Viewport images the overlay may sample, refreshed whenever the
/// swapchain is recreated.
pub struct OverlayTargets<'a> {
    pub extent: vk::Extent2D,
    pub color_format: vk::Format,
    pub sampler: vk::Sampler,
    /// One sampleable viewport view per swapchain image.
    pub image_views: &'a [vk::ImageView],
    /// Layout of a viewport image while the overlay records.
    pub image_layout: vk::ImageLayout,
}

/// UI drawn on top of the scene.
pub trait UiOverlay {
    fn init(&mut self, init: &OverlayInit<'_>) -> anyhow::Result<()>;

    fn refresh_targets(&mut self, targets: &OverlayTargets<'_>) -> anyhow::Result<()>;

    /// Record draw commands for the frame presenting `image_index`. The
    /// viewport of that frame is `image_views[image_index]`.
    fn record(&mut self, cmd: vk::CommandBuffer, image_index: u32);

    /// Release GPU resources. The device is idle.
    fn destroy(&mut self, device: &ash::Device);
}
