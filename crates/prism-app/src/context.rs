//! Render context.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use ash::vk;
use prism_gpu::memory::create_sampler;
use prism_gpu::{
    begin_command_buffer, end_command_buffer, submit_frame, DeviceProperties, FrameSync,
    GpuContext, GpuContextBuilder, GpuError, MeshPipeline, MeshPipelineConfig, Recovery,
    SurfaceContext, Swapchain,
};
use prism_mesh::constants::{MAX_MESHLET_PRIMITIVES, MAX_MESHLET_VERTICES};
use prism_mesh::MeshletOptions;
use prism_render::{
    Camera, ColorTarget, DrawPushConstants, FrameTarget, MeshRenderer, ObjImporter, ObjectId,
    Scene, SceneConfig, ShaderSet, Transform, ViewportTargets,
};
use tracing::{debug, error, info, warn};
use winit::window::Window;

use crate::config::{AppConfig, RendererSettings};
use crate::overlay::{OverlayInit, OverlayTargets, UiOverlay};
use crate::state::RendererStateFlags;

/// A queued object load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub model: PathBuf,
    pub texture: Option<PathBuf>,
}

/// Root of the renderer: owns the device, presentation, frame slots,
/// pipeline, scene and camera.
///
/// Dropping the context tears everything down in reverse creation order.
pub struct RenderContext {
    /// The window handle.
    pub window: Arc<Window>,
    pub camera: Camera,
    /// Total frames submitted.
    pub frame_count: u64,

    settings: RendererSettings,
    vsync: bool,
    flags: RendererStateFlags,
    pending_loads: Vec<LoadRequest>,
    pending_unloads: Vec<ObjectId>,

    properties: DeviceProperties,
    swapchain: Swapchain,
    sync: FrameSync,
    scene: Scene,
    pipeline: MeshPipeline,
    pipeline_config: MeshPipelineConfig,
    renderer: MeshRenderer,
    overlay_sampler: vk::Sampler,
    overlay: Option<Box<dyn UiOverlay>>,
    /// Offscreen scene images sampled by the overlay. Empty without one.
    viewport: ViewportTargets,
    destroyed: bool,

    surface: SurfaceContext,
    gpu: GpuContext,
}

/// Resources created after the device, torn down together on failure.
struct Resources {
    properties: DeviceProperties,
    swapchain: Swapchain,
    sync: FrameSync,
    scene: Scene,
    pipeline: MeshPipeline,
    pipeline_config: MeshPipelineConfig,
    overlay_sampler: vk::Sampler,
}

impl RenderContext {
    /// Create the device, surface and every renderer resource for `window`.
    pub fn new(window: Arc<Window>, config: &AppConfig) -> anyhow::Result<Self> {
        let (mut gpu, mut surface) = GpuContextBuilder::new()
            .app_name(&config.title)
            .validation(config.validation)
            .meshlet_limits(MAX_MESHLET_VERTICES as u32, MAX_MESHLET_PRIMITIVES as u32)
            .build(window.as_ref())?;

        let size = window.inner_size();
        let resources =
            match unsafe { create_resources(&mut gpu, &surface, (size.width, size.height), config) }
            {
                Ok(resources) => resources,
                Err(err) => {
                    unsafe { surface.destroy() };
                    return Err(err);
                }
            };

        info!(
            "Swapchain created: {}x{} ({} images)",
            resources.swapchain.extent.width,
            resources.swapchain.extent.height,
            resources.swapchain.image_count()
        );

        let renderer = MeshRenderer::new(gpu.instance(), gpu.device(), config.renderer.clear_color);
        let flags = if size.width == 0 || size.height == 0 {
            RendererStateFlags::empty().after_resize(size.width, size.height)
        } else {
            RendererStateFlags::empty()
        };

        Ok(Self {
            window,
            camera: Camera::default(),
            frame_count: 0,
            settings: config.renderer.clone(),
            vsync: config.vsync,
            flags,
            pending_loads: Vec::new(),
            pending_unloads: Vec::new(),
            properties: resources.properties,
            swapchain: resources.swapchain,
            sync: resources.sync,
            scene: resources.scene,
            pipeline: resources.pipeline,
            pipeline_config: resources.pipeline_config,
            renderer,
            overlay_sampler: resources.overlay_sampler,
            overlay: None,
            viewport: ViewportTargets::default(),
            destroyed: false,
            surface,
            gpu,
        })
    }

    pub const fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    pub const fn scene(&self) -> &Scene {
        &self.scene
    }

    pub const fn flags(&self) -> RendererStateFlags {
        self.flags
    }

    pub const fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Get the current swapchain extent.
    pub const fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.swapchain.extent;
        if extent.height == 0 {
            1.0
        } else {
            extent.width as f32 / extent.height as f32
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.sync.frames_in_flight()
    }

    /// Install a UI overlay, replacing any previous one.
    pub fn set_overlay(&mut self, mut overlay: Box<dyn UiOverlay>) -> anyhow::Result<()> {
        let graphics = self.gpu.graphics();
        overlay.init(&OverlayInit {
            entry: self.gpu.entry(),
            instance: self.gpu.instance(),
            physical_device: self.gpu.physical_device(),
            device: self.gpu.device(),
            graphics,
            color_format: self.swapchain.format,
            depth_format: vk::Format::UNDEFINED,
            image_count: self.swapchain.image_count(),
        })?;

        if let Some(mut previous) = self.overlay.replace(overlay) {
            self.gpu.wait_idle()?;
            previous.destroy(self.gpu.device());
        }
        self.refresh_overlay_targets()
    }

    /// Load a model and optional texture right away.
    pub fn load_object(&mut self, model: &Path, texture: Option<&Path>) -> anyhow::Result<ObjectId> {
        let target = self.gpu.upload_target(self.settings.timeout_ns);
        let id = self
            .scene
            .load_object(self.gpu.allocator_mut(), target, model, texture)?;
        Ok(id)
    }

    /// Queue a load for the start of the next frame.
    pub fn request_load(&mut self, model: impl Into<PathBuf>, texture: Option<PathBuf>) {
        self.pending_loads.push(LoadRequest {
            model: model.into(),
            texture,
        });
        self.flags |= RendererStateFlags::PENDING_RESOURCES_CREATION;
    }

    /// Unload an object after every frame slot has retired. Returns whether
    /// the object existed.
    pub fn unload_object(&mut self, id: ObjectId) -> anyhow::Result<bool> {
        unsafe { self.sync.wait_all(self.gpu.device())? };
        Ok(self.scene.unload_object(self.gpu.allocator_mut(), id))
    }

    /// Queue an unload for the start of the next frame.
    pub fn request_unload(&mut self, id: ObjectId) {
        self.pending_unloads.push(id);
        self.flags |= RendererStateFlags::PENDING_RESOURCES_DESTRUCTION;
    }

    /// Index count of an object, 0 if unknown.
    pub fn indices_count(&self, id: ObjectId) -> u32 {
        self.scene.indices_count(id)
    }

    pub fn set_transform(&mut self, id: ObjectId, transform: Transform) -> anyhow::Result<()> {
        let object = self
            .scene
            .object_mut(id)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("object {id}")))?;
        object.set_transform(transform);
        Ok(())
    }

    /// Run queued unloads, then queued loads. Failures are logged per object.
    fn process_pending(&mut self) {
        if self
            .flags
            .contains(RendererStateFlags::PENDING_RESOURCES_DESTRUCTION)
        {
            for id in std::mem::take(&mut self.pending_unloads) {
                match self.unload_object(id) {
                    Ok(true) => {}
                    Ok(false) => debug!("Unload of unknown object {id} ignored"),
                    Err(e) => error!("Failed to unload object {id}: {e}"),
                }
            }
            self.flags -= RendererStateFlags::PENDING_RESOURCES_DESTRUCTION;
        }

        if self
            .flags
            .contains(RendererStateFlags::PENDING_RESOURCES_CREATION)
        {
            for request in std::mem::take(&mut self.pending_loads) {
                if let Err(e) = self.load_object(&request.model, request.texture.as_deref()) {
                    error!("Failed to load {}: {e}", request.model.display());
                }
            }
            self.flags -= RendererStateFlags::PENDING_RESOURCES_CREATION;
        }
    }

    /// React to a new framebuffer size.
    pub fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        self.flags = self.flags.after_resize(width, height);
        if self.flags.can_update_properties() {
            self.update_device_properties()?;
        } else {
            debug!("Rendering paused at {width}x{height}");
        }
        Ok(())
    }

    /// Mark the swapchain stale and rebuild it if the size allows.
    fn recreate_swapchain(&mut self) -> anyhow::Result<()> {
        self.flags |= RendererStateFlags::PENDING_DEVICE_PROPERTIES_UPDATE;
        if self.flags.can_update_properties() {
            self.update_device_properties()?;
        }
        Ok(())
    }

    /// Recompute surface properties and rebuild the swapchain, depth image
    /// and, if the formats changed, the pipeline.
    fn update_device_properties(&mut self) -> anyhow::Result<()> {
        self.gpu.wait_idle()?;

        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            self.flags = self.flags.after_resize(size.width, size.height);
            return Ok(());
        }

        let properties =
            self.gpu
                .device_properties(&self.surface, (size.width, size.height), self.vsync)?;
        let families = *self.gpu.queue_families();
        unsafe {
            self.swapchain.create_or_recreate(
                self.gpu.allocator_mut(),
                self.surface.surface,
                &properties,
                &families,
            )?;
        }

        if !properties.formats_match(&self.properties) {
            info!("Surface formats changed, rebuilding pipeline");
            let mut config = self.pipeline_config.clone();
            config.color_format = properties.format.format;
            config.depth_format = properties.depth_format;
            let pipeline = unsafe {
                MeshPipeline::new(
                    self.gpu.device(),
                    &config,
                    &self.scene.descriptors().set_layouts(),
                )?
            };
            unsafe { self.pipeline.destroy(self.gpu.device()) };
            self.pipeline = pipeline;
            self.pipeline_config = config;
        }

        self.properties = properties;
        self.refresh_overlay_targets()?;
        self.flags = self.flags.after_properties_update();

        info!(
            "Swapchain recreated: {}x{} ({} images)",
            self.swapchain.extent.width,
            self.swapchain.extent.height,
            self.swapchain.image_count()
        );
        Ok(())
    }

    /// Rebuild the viewport images for the current swapchain and hand their
    /// views to the overlay. The device must be idle.
    fn refresh_overlay_targets(&mut self) -> anyhow::Result<()> {
        let Some(overlay) = self.overlay.as_mut() else {
            return Ok(());
        };

        let (format, extent, count) = (
            self.swapchain.format,
            self.swapchain.extent,
            self.swapchain.image_count(),
        );
        if !self.viewport.matches(format, extent, count) {
            let allocator = self.gpu.allocator_mut();
            self.viewport.destroy(allocator);
            self.viewport = ViewportTargets::new(allocator, format, extent, count)?;
        }

        let views = self.viewport.views();
        overlay.refresh_targets(&OverlayTargets {
            extent,
            color_format: format,
            sampler: self.overlay_sampler,
            image_views: &views,
            image_layout: ViewportTargets::READ_LAYOUT,
        })
    }

    /// Acquire, record, submit and present one frame.
    ///
    /// Skipped while the surface properties are pending or the size is
    /// invalid. A stale swapchain is rebuilt and the frame dropped.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn render_frame(&mut self, dt: f32) -> anyhow::Result<()> {
        self.process_pending();

        if !self.flags.can_render() {
            if self.flags.can_update_properties() {
                self.update_device_properties()?;
            }
            return Ok(());
        }

        self.camera.update(dt);

        let device = self.gpu.device_arc();
        let graphics_queue = self.gpu.graphics().queue;
        let slot_index = self.sync.current_slot();

        let acquired = {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.acquire").entered();
            unsafe {
                self.swapchain
                    .acquire_next_image(&device, &mut self.sync, slot_index)?
            }
        };
        let Some(image_index) = acquired else {
            debug!("Swapchain stale on acquire");
            return self.recover(Recovery::after_acquire(acquired), &device, graphics_queue);
        };

        let slot = *self.sync.slot(slot_index)?;
        let frame_slot = slot_index as u32;
        self.scene
            .update_uniforms(&self.camera, self.aspect_ratio(), frame_slot)?;

        let image = self
            .swapchain
            .images
            .get(image_index as usize)
            .ok_or_else(|| anyhow!("Acquired image {image_index} out of range"))?;
        let viewport = if self.overlay.is_some() {
            self.viewport.get(image_index as usize)
        } else {
            None
        };
        let target = FrameTarget {
            present: ColorTarget {
                image: image.image,
                view: image.view,
            },
            viewport,
            depth_image: self.swapchain.depth.image,
            depth_view: self.swapchain.depth.view,
            depth_format: self.properties.depth_format,
            extent: self.swapchain.extent,
            frame_slot,
        };

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.record").entered();

            let overlay = &mut self.overlay;
            unsafe {
                begin_command_buffer(
                    &device,
                    slot.command_buffer,
                    vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                )?;
                self.renderer.record_frame(
                    &device,
                    slot.command_buffer,
                    &self.pipeline,
                    &self.scene,
                    &target,
                    |cmd| {
                        if let Some(overlay) = overlay.as_mut() {
                            overlay.record(cmd, image_index);
                        }
                    },
                )?;
                end_command_buffer(&device, slot.command_buffer)?;
            }
        }

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.submit").entered();
            unsafe {
                submit_frame(
                    &device,
                    graphics_queue,
                    slot.command_buffer,
                    slot.image_available,
                    slot.render_finished,
                    slot.in_flight,
                )?;
            }
            self.sync.mark_submitted(slot_index)?;
        }

        let presented = {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.present").entered();
            unsafe {
                self.swapchain.present(
                    self.gpu.presentation().queue,
                    image_index,
                    slot.render_finished,
                )
            }
        };

        self.sync.advance();
        self.frame_count += 1;

        let recovery = Recovery::after_present(&presented);
        match &presented {
            Ok(outcome) if recovery.recreates() => debug!("Swapchain {outcome:?} on present"),
            Ok(_) => {}
            Err(e) => warn!("Present failed: {e}"),
        }
        self.recover(recovery, &device, graphics_queue)
    }

    /// Reset the frame semaphores and rebuild the swapchain as `recovery`
    /// asks.
    fn recover(
        &mut self,
        recovery: Recovery,
        device: &ash::Device,
        graphics_queue: vk::Queue,
    ) -> anyhow::Result<()> {
        if recovery.resets_semaphores() {
            unsafe { self.sync.reset_semaphores(device, graphics_queue)? };
        }
        if recovery.recreates() {
            self.recreate_swapchain()?;
        }
        Ok(())
    }

    /// Tear everything down in reverse creation order. Errors are logged.
    /// Calling it again does nothing.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        info!("Starting cleanup...");

        if let Err(e) = self.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        let device = self.gpu.device_arc();
        if let Some(mut overlay) = self.overlay.take() {
            overlay.destroy(&device);
        }
        self.viewport.destroy(self.gpu.allocator_mut());
        unsafe { self.swapchain.destroy(self.gpu.allocator_mut()) };
        self.scene.destroy(self.gpu.allocator_mut());
        unsafe {
            self.pipeline.destroy(&device);
            self.sync.release(&device);
            if self.overlay_sampler != vk::Sampler::null() {
                device.destroy_sampler(self.overlay_sampler, None);
                self.overlay_sampler = vk::Sampler::null();
            }
            self.surface.destroy();
        }

        self.destroyed = true;
        info!("Cleanup complete");
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Build everything between the device and the frame loop. On failure all
/// partially created resources are released; the surface stays alive.
unsafe fn create_resources(
    gpu: &mut GpuContext,
    surface: &SurfaceContext,
    window_size: (u32, u32),
    config: &AppConfig,
) -> anyhow::Result<Resources> {
    let settings = &config.renderer;
    let properties = gpu.device_properties(surface, window_size, config.vsync)?;
    let families = *gpu.queue_families();
    let instance = gpu.instance().clone();
    let device = gpu.device_arc();
    let capabilities = gpu.capabilities().clone();

    let mut swapchain = Swapchain::new(&instance, &device);
    let mut sync: Option<FrameSync> = None;
    let mut scene: Option<Scene> = None;

    let built = (|| -> anyhow::Result<(MeshPipeline, MeshPipelineConfig, vk::Sampler)> {
        unsafe {
            swapchain.create_or_recreate(gpu.allocator_mut(), surface.surface, &properties, &families)?;
        }

        let frame_sync = unsafe {
            FrameSync::new(
                &device,
                settings.frames_in_flight,
                families.graphics,
                settings.timeout_ns,
            )?
        };
        let frame_slots = frame_sync.frames_in_flight() as u32;
        sync = Some(frame_sync);

        let scene_config = SceneConfig {
            capacity: settings.max_objects,
            frame_slots,
            max_anisotropy: capabilities.max_sampler_anisotropy,
            meshlet_options: MeshletOptions {
                overdraw_threshold: settings.overdraw_threshold,
                ..MeshletOptions::default()
            },
        };
        let created = unsafe {
            Scene::new(
                &instance,
                gpu.allocator_mut(),
                capabilities.descriptor_buffer,
                scene_config,
                Box::new(ObjImporter),
            )?
        };
        let scene = scene.insert(created);

        let shaders = ShaderSet::load(&settings.shader_dir)?;
        let pipeline_config = MeshPipelineConfig {
            task_shader: shaders.task,
            mesh_shader: shaders.mesh,
            fragment_shader: shaders.fragment,
            color_format: properties.format.format,
            depth_format: properties.depth_format,
            push_constant_size: DrawPushConstants::SIZE,
            ..MeshPipelineConfig::default()
        };
        let mut pipeline = unsafe {
            MeshPipeline::new(&device, &pipeline_config, &scene.descriptors().set_layouts())?
        };

        match unsafe { create_sampler(&device, capabilities.max_sampler_anisotropy) } {
            Ok(sampler) => Ok((pipeline, pipeline_config, sampler)),
            Err(e) => {
                unsafe { pipeline.destroy(&device) };
                Err(e.into())
            }
        }
    })();

    match (built, sync, scene) {
        (Ok((pipeline, pipeline_config, overlay_sampler)), Some(sync), Some(scene)) => {
            Ok(Resources {
                properties,
                swapchain,
                sync,
                scene,
                pipeline,
                pipeline_config,
                overlay_sampler,
            })
        }
        (result, sync, scene) => {
            if let Err(e) = unsafe { device.device_wait_idle() } {
                error!("Failed to wait idle: {e}");
            }
            if let Some(mut scene) = scene {
                scene.destroy(gpu.allocator_mut());
            }
            if let Some(mut sync) = sync {
                unsafe { sync.release(&device) };
            }
            unsafe { swapchain.destroy(gpu.allocator_mut()) };
            Err(result
                .err()
                .unwrap_or_else(|| anyhow!("Renderer initialization incomplete")))
        }
    }
}
