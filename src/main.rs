// =============================================================================
// QUAD PRESENTER - Vulkan presentation and frame-synchronization engine
// =============================================================================
//
// Draws one colored quad into a resizable window, keeping N frames in
// flight and rebuilding the swapchain whenever the surface goes stale.
//
// FRAME FLOW (backend::frame):
// 1. Wait for the slot's fence
// 2. Acquire swapchain image
// 3. Reset fence + command buffer, record the draw
// 4. Submit (wait image-available, signal render-finished)
// 5. Present (wait render-finished)
//
// =============================================================================

mod backend;
mod config;
mod renderer;

use anyhow::{Context, Result};
use backend::FrameOutcome;
use config::Config;
use renderer::Renderer;
use std::fs::File;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowAttributes, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();
    init_logging(&config)?;

    log::info!("Starting quad presenter");
    log::info!(
        "Window: {}x{}, {} frames in flight",
        config.window.width,
        config.window.height,
        config.graphics.frames_in_flight
    );

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Any fatal error ends the process with exit code 1
    match app.error.take() {
        Some(e) => Err(e),
        None => {
            log::info!("Clean shutdown");
            Ok(())
        }
    }
}

/// Level from config (RUST_LOG wins), optionally redirected to a file
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let level = config.debug.level_filter().unwrap_or(LevelFilter::Info);

    let mut builder = Builder::new();
    builder.filter_level(level).parse_default_env();

    if let Some(path) = &config.debug.log_file {
        let file = File::create(path)
            .with_context(|| format!("Failed to create log file {:?}", path))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

// =============================================================================
// FPS TRACKING
// =============================================================================

/// Presented-frame counter, summarized once per interval
struct FrameStats {
    frame_count: u32,
    last_frame: Instant,
    last_report: Instant,
    interval: Duration,
}

/// Frames per second and last frame time, ready for the title bar
#[derive(Debug, Clone, Copy, PartialEq)]
struct FpsReport {
    fps: f32,
    frame_ms: f32,
}

impl FrameStats {
    fn new(now: Instant) -> Self {
        Self {
            frame_count: 0,
            last_frame: now,
            last_report: now,
            interval: Duration::from_secs(1),
        }
    }

    fn frame_presented(&mut self, now: Instant) -> Option<FpsReport> {
        let frame_time = now.duration_since(self.last_frame);
        self.last_frame = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_report);
        if elapsed < self.interval {
            return None;
        }

        let report = FpsReport {
            fps: self.frame_count as f32 / elapsed.as_secs_f32(),
            frame_ms: frame_time.as_secs_f32() * 1000.0,
        };
        self.frame_count = 0;
        self.last_report = now;
        Some(report)
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer owns the surface and must
/// go before the window it was created from.
struct App {
    renderer: Option<Renderer>,
    window: Option<Window>,
    config: Config,
    minimized: bool,
    stats: FrameStats,
    error: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            renderer: None,
            window: None,
            config,
            minimized: false,
            stats: FrameStats::new(Instant::now()),
            error: None,
        }
    }

    /// Log, keep the error for main, release the GPU and stop the loop
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.error = Some(error);
        self.renderer = None;
        event_loop.exit();
    }

    fn render(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref()) else {
            return;
        };

        match renderer.draw_frame(window) {
            Ok(FrameOutcome::Presented { recreated, .. }) => {
                if recreated {
                    log::debug!("Frame presented after swapchain recreation");
                }
                if let Some(report) = self.stats.frame_presented(Instant::now()) {
                    if self.config.debug.show_fps {
                        window.set_title(&format!(
                            "{} - {:.0} FPS ({:.2}ms)",
                            self.config.window.title, report.fps, report.frame_ms
                        ));
                    }
                }
            }
            Ok(FrameOutcome::Retry) | Ok(FrameOutcome::Suspended) => {}
            Err(e) => {
                let error = anyhow::Error::new(e).context("Frame failed");
                self.fail(event_loop, error);
            }
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => window,
            Err(e) => {
                self.fail(event_loop, anyhow::anyhow!("Failed to create window: {}", e));
                return;
            }
        };

        match Renderer::new(&self.config, &window) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                self.fail(event_loop, e);
                return;
            }
        }

        self.stats = FrameStats::new(Instant::now());
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                self.minimized = size.width == 0 || size.height == 0;
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.request_recreate();
                }
            }

            WindowEvent::RedrawRequested => {
                if !self.minimized {
                    self.render(event_loop);
                }
            }

            _ => {}
        }
    }

    /// Keep frames coming while there is something to draw into
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.minimized {
            return;
        }
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Device idle + teardown before the window goes away
        self.renderer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_report_before_interval() {
        let start = Instant::now();
        let mut stats = FrameStats::new(start);

        for ms in [10, 20, 500, 999] {
            assert_eq!(stats.frame_presented(start + Duration::from_millis(ms)), None);
        }
    }

    #[test]
    fn report_covers_whole_interval() {
        let start = Instant::now();
        let mut stats = FrameStats::new(start);

        for i in 1..50 {
            stats.frame_presented(start + Duration::from_millis(i * 20));
        }
        let report = stats
            .frame_presented(start + Duration::from_millis(1000))
            .unwrap();

        assert!((report.fps - 50.0).abs() < 0.01);
        assert!((report.frame_ms - 20.0).abs() < 0.01);

        // Counter starts over
        assert_eq!(stats.frame_presented(start + Duration::from_millis(1020)), None);
    }
}
