//! Mesh shading pipeline.

use crate::error::{GpuError, Result};
use ash::vk;

/// Mesh pipeline configuration.
#[derive(Clone)]
pub struct MeshPipelineConfig {
    pub task_shader: Vec<u32>,
    pub mesh_shader: Vec<u32>,
    pub fragment_shader: Vec<u32>,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    /// Size of the push constant block visible to task and mesh shaders.
    pub push_constant_size: u32,
}

impl Default for MeshPipelineConfig {
    fn default() -> Self {
        Self {
            task_shader: Vec::new(),
            mesh_shader: Vec::new(),
            fragment_shader: Vec::new(),
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            color_format: vk::Format::B8G8R8A8_UNORM,
            depth_format: vk::Format::D32_SFLOAT,
            push_constant_size: 0,
        }
    }
}

/// Create a shader module from SPIR-V words.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_shader_module(
    device: &ash::Device,
    code: &[u32],
    label: &str,
) -> Result<vk::ShaderModule> {
    if code.is_empty() {
        return Err(GpuError::ShaderModule(format!("{label}: empty SPIR-V")));
    }
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    unsafe { device.create_shader_module(&info, None) }
        .map_err(|e| GpuError::ShaderModule(format!("{label}: {e}")))
}

/// Stages that see the push constant block.
pub const PUSH_CONSTANT_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::TASK_EXT.as_raw() | vk::ShaderStageFlags::MESH_EXT.as_raw(),
);

/// Task + mesh + fragment pipeline rendering with dynamic rendering and
/// descriptor buffers.
pub struct MeshPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl MeshPipeline {
    /// Create the pipeline.
    ///
    /// # Safety
    /// The device must be valid, have mesh shading and descriptor buffers
    /// enabled, and the set layouts must be descriptor buffer layouts.
    pub unsafe fn new(
        device: &ash::Device,
        config: &MeshPipelineConfig,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Self> {
        let mut modules = Vec::with_capacity(3);
        let stages = [
            (vk::ShaderStageFlags::TASK_EXT, &config.task_shader, "task"),
            (vk::ShaderStageFlags::MESH_EXT, &config.mesh_shader, "mesh"),
            (vk::ShaderStageFlags::FRAGMENT, &config.fragment_shader, "fragment"),
        ];
        for (stage, code, label) in stages {
            match unsafe { create_shader_module(device, code, label) } {
                Ok(module) => modules.push((stage, module)),
                Err(err) => {
                    for (_, module) in modules {
                        unsafe { device.destroy_shader_module(module, None) };
                    }
                    return Err(err);
                }
            }
        }

        let result = unsafe { Self::build(device, config, descriptor_set_layouts, &modules) };

        for (_, module) in modules {
            unsafe { device.destroy_shader_module(module, None) };
        }

        if result.is_ok() {
            tracing::debug!("Created mesh pipeline");
        }
        result
    }

    unsafe fn build(
        device: &ash::Device,
        config: &MeshPipelineConfig,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        modules: &[(vk::ShaderStageFlags, vk::ShaderModule)],
    ) -> Result<Self> {
        let shader_stages: Vec<_> = modules
            .iter()
            .map(|&(stage, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(c"main")
            })
            .collect();

        // Viewport (dynamic)
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(config.polygon_mode)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(PUSH_CONSTANT_STAGES)
            .offset(0)
            .size(config.push_constant_size)];
        let ranges: &[vk::PushConstantRange] = if config.push_constant_size == 0 {
            &[]
        } else {
            &push_constant_ranges
        };

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(descriptor_set_layouts)
            .push_constant_ranges(ranges);
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(|e| GpuError::PipelineCreation(e.to_string()))?;

        let color_formats = [config.color_format];
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(config.depth_format);

        // Mesh pipelines take no vertex input or input assembly state.
        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .flags(vk::PipelineCreateFlags::DESCRIPTOR_BUFFER_EXT)
            .stages(&shader_stages)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipelines = match unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        } {
            Ok(pipelines) => pipelines,
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };

        let Some(&pipeline) = pipelines.first() else {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            return Err(GpuError::PipelineCreation("no pipeline returned".to_string()));
        };

        Ok(Self { pipeline, layout })
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                device.destroy_pipeline(self.pipeline, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.layout, None);
            }
        }
        self.pipeline = vk::Pipeline::null();
        self.layout = vk::PipelineLayout::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = MeshPipelineConfig::default();
        assert_eq!(config.cull_mode, vk::CullModeFlags::BACK);
        assert_eq!(config.depth_format, vk::Format::D32_SFLOAT);
        assert_eq!(config.push_constant_size, 0);
    }

    #[test]
    fn push_constants_reach_task_and_mesh() {
        assert!(PUSH_CONSTANT_STAGES.contains(vk::ShaderStageFlags::TASK_EXT));
        assert!(PUSH_CONSTANT_STAGES.contains(vk::ShaderStageFlags::MESH_EXT));
        assert!(!PUSH_CONSTANT_STAGES.contains(vk::ShaderStageFlags::FRAGMENT));
    }
}
