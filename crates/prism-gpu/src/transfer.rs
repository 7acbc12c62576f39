//! Staging uploads and image layout transitions.
//!
//! Uploads block until the GPU copy finishes. They run at load time only.

use crate::command::execute_one_shot;
use crate::error::{GpuError, Result};
use crate::memory::{BufferAllocation, GpuAllocator, ImageAllocation};
use ash::vk;
use gpu_allocator::MemoryLocation;

/// Access masks and pipeline stages for one supported layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags2,
    pub dst_access: vk::AccessFlags2,
    pub src_stage: vk::PipelineStageFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
}

/// Look up the barrier parameters for `old -> new`.
///
/// Only three transitions are supported: undefined to transfer destination,
/// transfer destination to shader read-only, and undefined to depth
/// attachment. Everything else is rejected.
pub fn layout_transition(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<LayoutTransition> {
    use vk::ImageLayout as L;

    match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => Ok(LayoutTransition {
            src_access: vk::AccessFlags2::NONE,
            dst_access: vk::AccessFlags2::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags2::TRANSFER,
        }),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => Ok(LayoutTransition {
            src_access: vk::AccessFlags2::TRANSFER_WRITE,
            dst_access: vk::AccessFlags2::SHADER_READ,
            src_stage: vk::PipelineStageFlags2::TRANSFER,
            dst_stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
        }),
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => Ok(LayoutTransition {
            src_access: vk::AccessFlags2::NONE,
            dst_access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
        }),
        _ => Err(GpuError::UnsupportedLayoutTransition { old, new }),
    }
}

/// Stages that only graphics-capable queue families execute.
const GRAPHICS_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::DRAW_INDIRECT.as_raw()
        | vk::PipelineStageFlags2::VERTEX_INPUT.as_raw()
        | vk::PipelineStageFlags2::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags2::TASK_SHADER_EXT.as_raw()
        | vk::PipelineStageFlags2::MESH_SHADER_EXT.as_raw()
        | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
        | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw()
        | vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT.as_raw()
        | vk::PipelineStageFlags2::ALL_GRAPHICS.as_raw(),
);

/// Whether a queue family with `flags` may use `stages` in a barrier.
pub fn queue_supports_stages(flags: vk::QueueFlags, stages: vk::PipelineStageFlags2) -> bool {
    if stages.intersects(GRAPHICS_STAGES) && !flags.contains(vk::QueueFlags::GRAPHICS) {
        return false;
    }
    if stages.contains(vk::PipelineStageFlags2::COMPUTE_SHADER)
        && !flags.contains(vk::QueueFlags::COMPUTE)
    {
        return false;
    }
    true
}

/// Whether a depth format also carries a stencil aspect.
pub fn has_stencil_component(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM_S8_UINT
    )
}

/// Image aspect affected by a transition into `new`.
pub fn transition_aspect(format: vk::Format, new: vk::ImageLayout) -> vk::ImageAspectFlags {
    if new == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL {
        if has_stencil_component(format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Record the barrier for a supported transition into `cmd`.
///
/// # Safety
/// The device, command buffer and image must be valid; `cmd` must be recording.
pub unsafe fn cmd_transition_image_layout(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    format: vk::Format,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let transition = layout_transition(old, new)?;

    let barrier = vk::ImageMemoryBarrier2::default()
        .src_stage_mask(transition.src_stage)
        .src_access_mask(transition.src_access)
        .dst_stage_mask(transition.dst_stage)
        .dst_access_mask(transition.dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(transition_aspect(format, new))
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );

    let barriers = [barrier];
    let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
    Ok(())
}

/// Transition an image layout with a blocking one-shot submission.
///
/// # Safety
/// All handles must be valid and `queue` must belong to `queue_family`.
#[allow(clippy::too_many_arguments)]
pub unsafe fn transition_image_layout(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    queue: vk::Queue,
    queue_family: u32,
    timeout_ns: u64,
) -> Result<()> {
    // Reject before touching the queue.
    layout_transition(old, new)?;

    let mut recorded = Ok(());
    unsafe {
        execute_one_shot(device, queue, queue_family, timeout_ns, |cmd| {
            recorded = cmd_transition_image_layout(device, cmd, image, format, old, new);
        })?;
    }
    recorded
}

/// Queue and timing parameters shared by staging uploads.
#[derive(Debug, Clone, Copy)]
pub struct UploadTarget {
    pub queue: vk::Queue,
    pub queue_family: u32,
    pub timeout_ns: u64,
}

fn create_staging(allocator: &mut GpuAllocator, data: &[u8]) -> Result<BufferAllocation> {
    let mut staging = allocator.create_buffer(
        data.len() as u64,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        "staging",
    )?;
    if let Err(err) = staging.write_bytes(0, data) {
        staging.destroy(allocator);
        return Err(err);
    }
    Ok(staging)
}

/// Copy `data` into the device-local `dst` through a host-visible staging
/// buffer, blocking until the copy completes.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn upload_via_staging(
    allocator: &mut GpuAllocator,
    data: &[u8],
    dst: &BufferAllocation,
    target: UploadTarget,
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    if data.len() as u64 > dst.size {
        return Err(GpuError::InvalidState(format!(
            "upload of {} bytes exceeds destination size {}",
            data.len(),
            dst.size
        )));
    }

    let mut staging = create_staging(allocator, data)?;

    let device = allocator.device().clone();
    let region = vk::BufferCopy::default().size(data.len() as u64);
    let result = unsafe {
        execute_one_shot(
            &device,
            target.queue,
            target.queue_family,
            target.timeout_ns,
            |cmd| device.cmd_copy_buffer(cmd, staging.buffer, dst.buffer, &[region]),
        )
    };

    staging.destroy(allocator);
    result
}

/// Upload tightly packed pixels into `image` and leave it shader-readable.
///
/// Runs UNDEFINED -> TRANSFER_DST, the buffer-to-image copy, then
/// TRANSFER_DST -> SHADER_READ_ONLY in one blocking submission.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn upload_image_via_staging(
    allocator: &mut GpuAllocator,
    pixels: &[u8],
    image: &ImageAllocation,
    target: UploadTarget,
) -> Result<()> {
    if !image.is_valid() {
        return Err(GpuError::InvalidState(
            "image upload target has no memory".to_string(),
        ));
    }

    let mut staging = create_staging(allocator, pixels)?;

    let device = allocator.device().clone();
    let region = vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .mip_level(0)
                .base_array_layer(0)
                .layer_count(1),
        )
        .image_offset(vk::Offset3D::default())
        .image_extent(vk::Extent3D {
            width: image.extent.width,
            height: image.extent.height,
            depth: 1,
        });

    let mut recorded = Ok(());
    let result = unsafe {
        execute_one_shot(
            &device,
            target.queue,
            target.queue_family,
            target.timeout_ns,
            |cmd| {
                recorded = (|| {
                    cmd_transition_image_layout(
                        &device,
                        cmd,
                        image.image,
                        image.format,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    )?;
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        staging.buffer,
                        image.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                    cmd_transition_image_layout(
                        &device,
                        cmd,
                        image.image,
                        image.format,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    )
                })();
            },
        )
    };

    staging.destroy(allocator);
    result.and(recorded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::ImageLayout as L;

    #[test]
    fn supported_transitions() {
        let to_transfer = layout_transition(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL).unwrap();
        assert_eq!(to_transfer.src_access, vk::AccessFlags2::NONE);
        assert_eq!(to_transfer.dst_access, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(to_transfer.dst_stage, vk::PipelineStageFlags2::TRANSFER);

        let to_shader =
            layout_transition(L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert_eq!(to_shader.src_access, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(to_shader.dst_access, vk::AccessFlags2::SHADER_READ);
        assert_eq!(to_shader.dst_stage, vk::PipelineStageFlags2::FRAGMENT_SHADER);

        let to_depth =
            layout_transition(L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL).unwrap();
        assert!(to_depth
            .dst_access
            .contains(vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert_eq!(to_depth.dst_stage, vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS);
    }

    #[test]
    fn other_transitions_are_rejected() {
        let rejected = [
            (L::PRESENT_SRC_KHR, L::TRANSFER_SRC_OPTIMAL),
            (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL),
            (L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL),
            (L::TRANSFER_DST_OPTIMAL, L::UNDEFINED),
            (L::UNDEFINED, L::UNDEFINED),
        ];
        for (old, new) in rejected {
            assert!(matches!(
                layout_transition(old, new),
                Err(GpuError::UnsupportedLayoutTransition { old: o, new: n }) if o == old && n == new
            ));
        }
    }

    #[test]
    fn shader_stages_need_a_graphics_family() {
        let to_shader =
            layout_transition(L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert!(queue_supports_stages(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
            to_shader.dst_stage
        ));
        assert!(!queue_supports_stages(vk::QueueFlags::TRANSFER, to_shader.dst_stage));
        assert!(!queue_supports_stages(
            vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            to_shader.dst_stage
        ));

        let to_transfer = layout_transition(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL).unwrap();
        assert!(queue_supports_stages(
            vk::QueueFlags::TRANSFER,
            to_transfer.src_stage | to_transfer.dst_stage
        ));
    }

    #[test]
    fn depth_aspect_includes_stencil_when_present() {
        assert_eq!(
            transition_aspect(vk::Format::D32_SFLOAT, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            transition_aspect(vk::Format::D24_UNORM_S8_UINT, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            transition_aspect(vk::Format::R8G8B8A8_SRGB, L::TRANSFER_DST_OPTIMAL),
            vk::ImageAspectFlags::COLOR
        );
    }
}
