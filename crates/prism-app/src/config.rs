//! Application and renderer configuration.

use prism_mesh::constants::DEFAULT_OVERDRAW_THRESHOLD;
use std::path::PathBuf;

/// Renderer tuning knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct RendererSettings {
    /// Frame slots recorded ahead of the GPU.
    pub frames_in_flight: usize,
    /// Bound on fence waits, image acquisition and one-shot uploads.
    pub timeout_ns: u64,
    /// Directory holding the precompiled SPIR-V stages.
    pub shader_dir: PathBuf,
    pub clear_color: [f32; 4],
    pub overdraw_threshold: f32,
    /// Descriptor buffer capacity, i.e. the number of loadable objects.
    pub max_objects: u32,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: 1,
            timeout_ns: u64::from(u32::MAX),
            shader_dir: PathBuf::from("shaders"),
            clear_color: [0.1, 0.1, 0.1, 1.0],
            overdraw_threshold: DEFAULT_OVERDRAW_THRESHOLD,
            max_objects: 64,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Prefer FIFO presentation over mailbox.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    pub renderer: RendererSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Prism".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: false,
            validation: cfg!(debug_assertions),
            renderer: RendererSettings::default(),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    #[must_use]
    pub const fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    #[must_use]
    pub const fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    #[must_use]
    pub const fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    #[must_use]
    pub const fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    #[must_use]
    pub fn with_shader_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.renderer.shader_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_renderer(mut self, renderer: RendererSettings) -> Self {
        self.renderer = renderer;
        self
    }

    /// Frame budget for the target FPS; zero means unlimited.
    pub fn target_frame_time(&self) -> Option<std::time::Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| std::time::Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renderer_defaults() {
        let settings = RendererSettings::default();
        assert_eq!(settings.frames_in_flight, 1);
        assert_eq!(settings.timeout_ns, 4_294_967_295);
        assert!((settings.overdraw_threshold - 1.05).abs() < f32::EPSILON);
    }

    #[test]
    fn builder_sets_fields() {
        let config = AppConfig::new("viewer")
            .with_size(800, 600)
            .with_vsync(true)
            .with_shader_dir("/tmp/spv");
        assert_eq!(config.title, "viewer");
        assert_eq!((config.width, config.height), (800, 600));
        assert!(config.vsync);
        assert_eq!(config.renderer.shader_dir, PathBuf::from("/tmp/spv"));
    }

    #[test]
    fn frame_time_from_fps() {
        assert_eq!(AppConfig::default().target_frame_time(), None);
        let config = AppConfig::default().with_target_fps(50);
        assert_eq!(
            config.target_frame_time(),
            Some(std::time::Duration::from_millis(20))
        );
        assert_eq!(AppConfig::default().with_target_fps(0).target_frame_time(), None);
    }
}
