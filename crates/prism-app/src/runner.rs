//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::PrismApp;
use crate::config::AppConfig;
use crate::context::RenderContext;
use crate::frame::FrameStats;
use crate::input::{apply_cursor_change, CameraController};

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default `info` filter.
pub fn init_logging() {
    #[cfg(feature = "profiling-tracy")]
    {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,prism_app=trace,prism_render=trace,prism_gpu=trace,prism_viewer=trace")
        });

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .try_init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .try_init();
    }
}

/// Run a `PrismApp` with the given configuration.
///
/// Initializes logging, creates the window and render context, and runs the
/// event loop until the window closes.
pub fn run_app<A: PrismApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_logging();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        init_error: None,
    };

    if let Err(e) = event_loop.run_app(&mut runner) {
        error!("Event loop error: {e}");
    }

    if let Some(state) = runner.state.take() {
        state.shutdown();
    }
    runner.init_error.map_or(Ok(()), Err)
}

/// Internal application runner that implements winit's ApplicationHandler.
struct AppRunner<A: PrismApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    init_error: Option<anyhow::Error>,
}

/// Internal application state.
struct AppState<A: PrismApp> {
    ctx: RenderContext,
    app: A,
    controller: CameraController,
    stats: FrameStats,
    target_frame_time: Option<Duration>,
}

impl<A: PrismApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.init_error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(state) = &mut self.state else {
            return;
        };

        if state.app.on_event(&mut state.ctx, &event) {
            return;
        }
        if let Some(change) = state.controller.window_event(&mut state.ctx.camera, &event) {
            apply_cursor_change(&state.ctx.window, change);
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(state) = self.state.take() {
                    state.shutdown();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = state.render_frame() {
                    error!("Render error: {e:#}");
                    if let Some(state) = self.state.take() {
                        state.shutdown();
                    }
                    event_loop.exit();
                    return;
                }
                state.ctx.window.request_redraw();
            }
            WindowEvent::Resized(size) => {
                if let Err(e) = state.ctx.handle_resize(size.width, size.height) {
                    error!("Resize error: {e:#}");
                }
            }
            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        _device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let Some(state) = &mut self.state {
            state.controller.device_event(&mut state.ctx.camera, &event);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: PrismApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let mut ctx = RenderContext::new(window, &self.config)?;
        info!("GPU: {}", ctx.gpu().capabilities().summary());

        let app = A::init(&mut ctx)?;

        Ok(AppState {
            ctx,
            app,
            controller: CameraController::new(),
            stats: FrameStats::new(),
            target_frame_time: self.config.target_frame_time(),
        })
    }
}

impl<A: PrismApp> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();
        let dt = self.stats.tick();

        self.app.update(&mut self.ctx, dt);
        self.ctx.render_frame(dt)?;

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                #[cfg(feature = "profiling-tracy")]
                let _span = tracing::trace_span!("frame.pacing").entered();
                thread::sleep(target - elapsed);
            }
        }
        Ok(())
    }

    fn shutdown(mut self) {
        self.stats.report();

        if let Err(e) = self.ctx.gpu().wait_idle() {
            error!("Failed to wait idle: {e}");
        }
        self.app.cleanup(&mut self.ctx);
        self.ctx.destroy();
    }
}
