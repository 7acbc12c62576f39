//! GPU error types.

use ash::vk;
use thiserror::Error;

/// Queue role that could not be resolved to a queue family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    Graphics,
    Presentation,
    Transfer,
}

impl std::fmt::Display for QueueRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Graphics => "graphics",
            Self::Presentation => "presentation",
            Self::Transfer => "transfer",
        };
        f.write_str(name)
    }
}

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Vulkan library could not be loaded.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No discrete GPU with the required features was found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// The selected GPU is missing a queue family for one of the roles.
    #[error("No queue family found for the {0} role")]
    IncompleteQueueFamilies(QueueRole),

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Image layout transition outside the supported table.
    #[error("Unsupported layout transition: {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    /// Surface creation or query failed.
    #[error("Surface error: {0}")]
    Surface(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Swapchain no longer matches the surface and must be recreated.
    #[error("Swapchain is out of date or suboptimal")]
    SwapchainStale,

    /// A fence or acquire wait exceeded its bound. Treated as device loss.
    #[error("GPU wait timed out after {0} ns")]
    Timeout(u64),

    /// SPIR-V module could not be created.
    #[error("Shader module creation failed: {0}")]
    ShaderModule(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GpuError {
    /// Whether the error is recovered by recreating the swapchain.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SwapchainStale | Self::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)
        )
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stale_swapchain_is_recoverable() {
        assert!(GpuError::SwapchainStale.is_recoverable());
        assert!(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR).is_recoverable());
        assert!(!GpuError::Timeout(10).is_recoverable());
        assert!(!GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_recoverable());
    }

    #[test]
    fn queue_role_in_message() {
        let err = GpuError::IncompleteQueueFamilies(QueueRole::Presentation);
        assert_eq!(err.to_string(), "No queue family found for the presentation role");
    }
}
