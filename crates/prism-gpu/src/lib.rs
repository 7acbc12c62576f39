//! Vulkan layer of the Prism engine.
//!
//! This crate provides:
//! - Instance, physical device and logical device management
//! - GPU capability detection
//! - Memory allocation via gpu-allocator, staging uploads and layout transitions
//! - Surface property selection and swapchain handling
//! - Per-frame synchronization
//! - Descriptor buffers and the mesh shading pipeline

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod transfer;

pub use capabilities::{DescriptorBufferSizes, GpuCapabilities, GpuVendor};
pub use command::{begin_command_buffer, end_command_buffer, execute_one_shot, submit_frame, CommandPool};
pub use context::{GpuContext, GpuContextBuilder, QueueReference};
pub use descriptors::{DescriptorBinding, DescriptorBufferLayout, DescriptorBuffers};
pub use device::{QueueFamilyIndices, QueueFamilyInfo};
pub use error::{GpuError, QueueRole, Result};
pub use memory::{BufferAllocation, GpuAllocator, ImageAllocation};
pub use pipeline::{MeshPipeline, MeshPipelineConfig};
pub use surface::{DeviceProperties, SurfaceContext, SurfaceSupport};
pub use swapchain::{PresentOutcome, Recovery, Swapchain, SwapchainChain};
pub use sync::{FrameSlot, FrameSync, SlotState, SlotTracker};
pub use transfer::{upload_image_via_staging, upload_via_staging, UploadTarget};

pub use ash::vk;
pub use gpu_allocator::MemoryLocation;
