//! `PrismApp` trait definition.

use crate::context::RenderContext;
use winit::event::WindowEvent;

/// Trait for Prism applications.
///
/// The framework owns the window, the render context and the frame loop;
/// an application loads objects and reacts to events.
pub trait PrismApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the window and render context have been created.
    fn init(ctx: &mut RenderContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before rendering with the delta time in seconds.
    #[allow(unused_variables)]
    fn update(&mut self, ctx: &mut RenderContext, dt: f32) {}

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not reach camera
    /// controls.
    #[allow(unused_variables)]
    fn on_event(&mut self, ctx: &mut RenderContext, event: &WindowEvent) -> bool {
        false
    }

    /// Cleanup before shutdown. The GPU is idle.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut RenderContext) {}
}
