//! Renderer state flags.

use bitflags::bitflags;

bitflags! {
    /// Deferred work and conditions that stop frames from being rendered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RendererStateFlags: u8 {
        /// Surface properties must be recomputed before the next frame.
        const PENDING_DEVICE_PROPERTIES_UPDATE = 1 << 0;
        /// Object unloads are queued.
        const PENDING_RESOURCES_DESTRUCTION = 1 << 1;
        /// Object loads are queued.
        const PENDING_RESOURCES_CREATION = 1 << 2;
        /// The framebuffer has a zero dimension.
        const INVALID_SIZE = 1 << 3;
    }
}

impl RendererStateFlags {
    /// Flags after the window framebuffer changed to `width` x `height`.
    ///
    /// Any resize requires new surface properties. A zero dimension also
    /// marks the size invalid until a usable size arrives.
    #[must_use]
    pub fn after_resize(self, width: u32, height: u32) -> Self {
        let flags = self | Self::PENDING_DEVICE_PROPERTIES_UPDATE;
        if width == 0 || height == 0 {
            flags | Self::INVALID_SIZE
        } else {
            flags - Self::INVALID_SIZE
        }
    }

    /// Flags after surface properties and the swapchain were rebuilt.
    #[must_use]
    pub fn after_properties_update(self) -> Self {
        self - Self::PENDING_DEVICE_PROPERTIES_UPDATE
    }

    /// Whether a frame may be recorded and presented.
    pub const fn can_render(self) -> bool {
        !self.intersects(Self::PENDING_DEVICE_PROPERTIES_UPDATE.union(Self::INVALID_SIZE))
    }

    /// Whether the properties can be recomputed now.
    pub const fn can_update_properties(self) -> bool {
        self.contains(Self::PENDING_DEVICE_PROPERTIES_UPDATE) && !self.contains(Self::INVALID_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_blocks_rendering() {
        let flags = RendererStateFlags::empty().after_resize(0, 720);
        assert!(flags.contains(RendererStateFlags::INVALID_SIZE));
        assert!(flags.contains(RendererStateFlags::PENDING_DEVICE_PROPERTIES_UPDATE));
        assert!(!flags.can_render());
        assert!(!flags.can_update_properties());
    }

    #[test]
    fn restored_size_updates_then_renders() {
        let flags = RendererStateFlags::empty()
            .after_resize(0, 0)
            .after_resize(1280, 720);
        assert!(!flags.contains(RendererStateFlags::INVALID_SIZE));
        assert!(flags.can_update_properties());
        assert!(!flags.can_render());

        let flags = flags.after_properties_update();
        assert!(flags.can_render());
        assert_eq!(flags, RendererStateFlags::empty());
    }

    #[test]
    fn resource_flags_survive_resize() {
        let flags = RendererStateFlags::PENDING_RESOURCES_CREATION
            .after_resize(640, 480)
            .after_properties_update();
        assert_eq!(flags, RendererStateFlags::PENDING_RESOURCES_CREATION);
        assert!(flags.can_render());
    }
}
