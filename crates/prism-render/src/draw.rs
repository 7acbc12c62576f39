//! Frame command recording for the mesh pipeline.

use crate::error::Result;
use crate::scene::{ObjectAllocation, Scene};
use prism_gpu::transfer::cmd_transition_image_layout;
use prism_gpu::{vk, DescriptorBuffers, MeshPipeline};
use prism_mesh::constants::MAX_MESHLETS_PER_TASK;

/// Task workgroups needed to cover `meshlet_count` meshlets.
pub const fn task_count(meshlet_count: u32) -> u32 {
    meshlet_count.div_ceil(MAX_MESHLETS_PER_TASK)
}

/// Push constants read by the task and mesh shaders.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrawPushConstants {
    pub meshlet_count: u32,
    /// Word offset of the triangle bytes inside the index buffer.
    pub triangle_offset: u32,
}

impl DrawPushConstants {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;

    pub const fn for_object(object: &ObjectAllocation) -> Self {
        Self {
            meshlet_count: object.meshlet_count,
            triangle_offset: object.triangle_word_offset,
        }
    }
}

/// A color image and the view rendering writes through.
#[derive(Debug, Clone, Copy)]
pub struct ColorTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

/// Images rendered into this frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameTarget {
    /// Swapchain image presented at the end of the frame.
    pub present: ColorTarget,
    /// Offscreen image the scene is drawn into when an overlay composites
    /// the frame. Without one the scene is drawn straight to `present`.
    pub viewport: Option<ColorTarget>,
    pub depth_image: vk::Image,
    pub depth_view: vk::ImageView,
    pub depth_format: vk::Format,
    pub extent: vk::Extent2D,
    /// Frame slot whose scene uniforms the draws read.
    pub frame_slot: u32,
}

/// Viewport covering the whole extent with depth range 0..1.
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

pub fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

fn color_barrier(
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    src: (vk::PipelineStageFlags2, vk::AccessFlags2),
    dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src.0)
        .src_access_mask(src.1)
        .dst_stage_mask(dst.0)
        .dst_access_mask(dst.1)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(1)
                .layer_count(1),
        )
}

/// Barrier that makes a rendered viewport image readable by the overlay's
/// fragment shader.
pub fn viewport_read_barrier(image: vk::Image) -> vk::ImageMemoryBarrier2<'static> {
    color_barrier(
        image,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        crate::viewport::ViewportTargets::READ_LAYOUT,
        (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        (
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        ),
    )
}

/// Barrier that discards `image` and prepares it as a color attachment.
/// Offscreen images may still be sampled by an earlier overlay pass.
fn attachment_barrier(image: vk::Image, offscreen: bool) -> vk::ImageMemoryBarrier2<'static> {
    let src_stage = if offscreen {
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags2::FRAGMENT_SHADER
    } else {
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
    };
    color_barrier(
        image,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        (src_stage, vk::AccessFlags2::NONE),
        (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
    )
}

fn color_attachment(
    view: vk::ImageView,
    clear_color: [f32; 4],
) -> vk::RenderingAttachmentInfo<'static> {
    vk::RenderingAttachmentInfo::default()
        .image_view(view)
        .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .clear_value(vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        })
}

/// Records mesh-task draws. Holds the extension loader for
/// `vkCmdDrawMeshTasksEXT`.
pub struct MeshRenderer {
    mesh_shader: ash::ext::mesh_shader::Device,
    pub clear_color: [f32; 4],
}

impl MeshRenderer {
    pub fn new(instance: &ash::Instance, device: &ash::Device, clear_color: [f32; 4]) -> Self {
        Self {
            mesh_shader: ash::ext::mesh_shader::Device::new(instance, device),
            clear_color,
        }
    }

    /// Select the object's descriptors, push its counts and launch the task
    /// workgroups. Descriptor buffers must already be bound.
    ///
    /// # Safety
    /// `cmd` must be recording inside dynamic rendering with `pipeline` bound.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn record_object(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        pipeline: &MeshPipeline,
        descriptors: &DescriptorBuffers,
        object: &ObjectAllocation,
        frame_slot: u32,
    ) {
        let push = DrawPushConstants::for_object(object);
        unsafe {
            descriptors.set_offsets(cmd, pipeline.layout, object.slot, frame_slot);
            device.cmd_push_constants(
                cmd,
                pipeline.layout,
                prism_gpu::pipeline::PUSH_CONSTANT_STAGES,
                0,
                bytemuck::bytes_of(&push),
            );
            self.mesh_shader
                .cmd_draw_mesh_tasks(cmd, task_count(object.meshlet_count), 1, 1);
        }
    }

    /// Record a whole frame into `cmd`, which must already be begun.
    ///
    /// The scene is rendered with depth into the viewport image when the
    /// target has one, or into the swapchain image otherwise. With a
    /// viewport the image is then transitioned to
    /// [`ViewportTargets::READ_LAYOUT`](crate::ViewportTargets::READ_LAYOUT)
    /// and `overlay` is recorded in a second rendering scope on the
    /// swapchain image, where it can sample the viewport. Without one
    /// `overlay` is not called. The swapchain image ends in
    /// `PRESENT_SRC_KHR`.
    ///
    /// # Safety
    /// All handles must be valid and `cmd` must be recording.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn record_frame<F>(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        pipeline: &MeshPipeline,
        scene: &Scene,
        target: &FrameTarget,
        overlay: F,
    ) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let scene_target = target.viewport.unwrap_or(target.present);
        let barriers = [attachment_barrier(scene_target.image, target.viewport.is_some())];
        unsafe {
            device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().image_memory_barriers(&barriers),
            );
            cmd_transition_image_layout(
                device,
                cmd,
                target.depth_image,
                target.depth_format,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            )?;
        }

        let color = [color_attachment(scene_target.view, self.clear_color)];
        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(target.depth_view)
            .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let rendering_info = vk::RenderingInfo::default()
            .render_area(full_scissor(target.extent))
            .layer_count(1)
            .color_attachments(&color)
            .depth_attachment(&depth_attachment);

        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_set_viewport(cmd, 0, &[full_viewport(target.extent)]);
            device.cmd_set_scissor(cmd, 0, &[full_scissor(target.extent)]);

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
            let descriptors = scene.descriptors();
            descriptors.bind_buffers(cmd);
            for object in scene.drawable() {
                self.record_object(
                    device,
                    cmd,
                    pipeline,
                    descriptors,
                    object,
                    target.frame_slot,
                );
            }
            device.cmd_end_rendering(cmd);
        }

        if let Some(viewport) = target.viewport {
            unsafe { self.record_overlay_pass(device, cmd, target, viewport, overlay) };
        }

        let to_present = color_barrier(
            target.present.image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            (
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            ),
            (
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::NONE,
            ),
        );
        let barriers = [to_present];
        unsafe {
            device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().image_memory_barriers(&barriers),
            );
        }
        Ok(())
    }

    /// Make the viewport readable and record `overlay` onto the swapchain
    /// image.
    unsafe fn record_overlay_pass<F>(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        target: &FrameTarget,
        viewport: ColorTarget,
        overlay: F,
    ) where
        F: FnOnce(vk::CommandBuffer),
    {
        let barriers = [
            viewport_read_barrier(viewport.image),
            attachment_barrier(target.present.image, false),
        ];
        let color = [color_attachment(target.present.view, self.clear_color)];
        let rendering_info = vk::RenderingInfo::default()
            .render_area(full_scissor(target.extent))
            .layer_count(1)
            .color_attachments(&color);

        unsafe {
            device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().image_memory_barriers(&barriers),
            );
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_set_viewport(cmd, 0, &[full_viewport(target.extent)]);
            device.cmd_set_scissor(cmd, 0, &[full_scissor(target.extent)]);
        }

        overlay(cmd);

        unsafe { device.cmd_end_rendering(cmd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_count_rounds_up() {
        assert_eq!(task_count(0), 0);
        assert_eq!(task_count(1), 1);
        assert_eq!(task_count(32), 1);
        assert_eq!(task_count(33), 2);
        assert_eq!(task_count(100), 4);
    }

    #[test]
    fn push_constants_from_object() {
        let object = ObjectAllocation {
            meshlet_count: 7,
            triangle_word_offset: 448,
            ..Default::default()
        };
        let push = DrawPushConstants::for_object(&object);
        assert_eq!(push.meshlet_count, 7);
        assert_eq!(push.triangle_offset, 448);
        assert_eq!(DrawPushConstants::SIZE, 8);
    }

    #[test]
    fn viewport_covers_extent() {
        let extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let viewport = full_viewport(extent);
        assert_eq!((viewport.width, viewport.height), (1280.0, 720.0));
        assert_eq!((viewport.min_depth, viewport.max_depth), (0.0, 1.0));
        let scissor = full_scissor(extent);
        assert_eq!(scissor.extent, extent);
        assert_eq!((scissor.offset.x, scissor.offset.y), (0, 0));
    }

    #[test]
    fn viewport_is_readable_by_fragment_shaders() {
        let barrier = viewport_read_barrier(vk::Image::null());
        assert_eq!(barrier.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(barrier
            .src_access_mask
            .contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));
        assert!(barrier
            .dst_stage_mask
            .contains(vk::PipelineStageFlags2::FRAGMENT_SHADER));
        assert!(barrier
            .dst_access_mask
            .contains(vk::AccessFlags2::SHADER_SAMPLED_READ));
    }

    #[test]
    fn offscreen_attachment_waits_for_earlier_reads() {
        let offscreen = attachment_barrier(vk::Image::null(), true);
        assert!(offscreen
            .src_stage_mask
            .contains(vk::PipelineStageFlags2::FRAGMENT_SHADER));
        let swapchain = attachment_barrier(vk::Image::null(), false);
        assert_eq!(
            swapchain.src_stage_mask,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(swapchain.old_layout, vk::ImageLayout::UNDEFINED);
    }
}
