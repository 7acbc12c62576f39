//! Application framework for the Prism engine.
//!
//! This crate provides:
//! - The [`RenderContext`] root that owns the device, swapchain, frame
//!   slots, pipeline, scene and camera
//! - The frame loop with swapchain recreation and resize handling
//! - Camera controls from window input
//! - A [`UiOverlay`] seam for immediate-mode UI
//! - Logging initialization and the winit event loop
//!
//! # Example
//!
//! ```no_run
//! use prism_app::{run_app, AppConfig, PrismApp, RenderContext};
//!
//! struct MyApp;
//!
//! impl PrismApp for MyApp {
//!     fn init(ctx: &mut RenderContext) -> anyhow::Result<Self> {
//!         ctx.load_object(std::path::Path::new("models/cube.obj"), None)?;
//!         Ok(MyApp)
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod config;
mod context;
mod frame;
mod input;
mod overlay;
mod runner;
mod state;

pub use app::PrismApp;
pub use config::{AppConfig, RendererSettings};
pub use context::{LoadRequest, RenderContext};
pub use frame::FrameStats;
pub use input::{movement_for_key, CameraController, CursorChange};
pub use overlay::{OverlayInit, OverlayTargets, UiOverlay};
pub use runner::{init_logging, run_app};
pub use state::RendererStateFlags;

// Re-export commonly used types for convenience
pub use prism_render::{Camera, ObjectId, Transform};
pub use winit::event::WindowEvent;
