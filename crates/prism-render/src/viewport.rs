//! Offscreen color targets the scene is rendered into when an overlay
//! composites the final image.

use crate::draw::ColorTarget;
use crate::error::Result;
use prism_gpu::memory::create_image_view;
use prism_gpu::{vk, GpuAllocator, ImageAllocation, MemoryLocation};

/// One offscreen color image per swapchain image, renderable and sampleable.
#[derive(Default)]
pub struct ViewportTargets {
    images: Vec<ImageAllocation>,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl ViewportTargets {
    pub const USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
        vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw() | vk::ImageUsageFlags::SAMPLED.as_raw(),
    );

    /// Layout the images are in while the overlay samples them.
    pub const READ_LAYOUT: vk::ImageLayout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;

    /// Create `count` targets. Nothing is leaked if any creation fails.
    pub fn new(
        allocator: &mut GpuAllocator,
        format: vk::Format,
        extent: vk::Extent2D,
        count: usize,
    ) -> Result<Self> {
        let mut targets = Self {
            images: Vec::with_capacity(count),
            format,
            extent,
        };
        for index in 0..count {
            match Self::create_image(allocator, format, extent, index) {
                Ok(image) => targets.images.push(image),
                Err(err) => {
                    targets.destroy(allocator);
                    return Err(err);
                }
            }
        }
        tracing::debug!(
            "Created {count} viewport target(s) {}x{} {format:?}",
            extent.width,
            extent.height
        );
        Ok(targets)
    }

    fn create_image(
        allocator: &mut GpuAllocator,
        format: vk::Format,
        extent: vk::Extent2D,
        index: usize,
    ) -> Result<ImageAllocation> {
        let mut image = allocator.create_image(
            format,
            extent,
            vk::ImageTiling::OPTIMAL,
            Self::USAGE,
            MemoryLocation::GpuOnly,
            &format!("viewport:{index}"),
        )?;
        match unsafe {
            create_image_view(
                allocator.device(),
                image.image,
                format,
                vk::ImageAspectFlags::COLOR,
            )
        } {
            Ok(view) => image.view = view,
            Err(err) => {
                image.destroy(allocator);
                return Err(err.into());
            }
        }
        Ok(image)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub const fn format(&self) -> vk::Format {
        self.format
    }

    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Whether the targets match a swapchain of `count` images.
    pub fn matches(&self, format: vk::Format, extent: vk::Extent2D, count: usize) -> bool {
        self.format == format && self.extent == extent && self.images.len() == count
    }

    /// Views handed to the overlay, indexed like the swapchain images.
    pub fn views(&self) -> Vec<vk::ImageView> {
        self.images.iter().map(|image| image.view).collect()
    }

    /// Target rendered for swapchain image `index`.
    pub fn get(&self, index: usize) -> Option<ColorTarget> {
        self.images.get(index).map(|image| ColorTarget {
            image: image.image,
            view: image.view,
        })
    }

    /// Release every image. Calling it again does nothing.
    pub fn destroy(&mut self, allocator: &mut GpuAllocator) {
        for mut image in self.images.drain(..) {
            image.destroy(allocator);
        }
    }
}
