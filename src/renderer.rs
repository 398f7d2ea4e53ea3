// Renderer - all GPU state for one window
//
// Built by a straight sequence of fallible steps; the first failure aborts
// and everything created so far is released by its own Drop. Fields are
// declared in destruction order.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use winit::window::Window;

use crate::backend::swapchain::{choose_surface_format, SurfaceSupport};
use crate::backend::{
    FrameEngine, FrameOutcome, GraphicsPipeline, PresentTarget, QuadMesh, RendererError,
    VulkanDevice,
};
use crate::config::Config;

pub struct Renderer {
    engine: FrameEngine,
    mesh: QuadMesh,
    pipeline: GraphicsPipeline,
    device: Arc<VulkanDevice>,
}

impl Renderer {
    pub fn new(config: &Config, window: &Window) -> Result<Self> {
        let target = PresentTarget {
            display: window.raw_display_handle(),
            window: window.raw_window_handle(),
        };

        // Validation only makes sense in debug builds
        let enable_validation = config.debug.validation_layers && cfg!(debug_assertions);

        let device = VulkanDevice::new(&config.window.title, enable_validation, Some(target))
            .context("Failed to initialize Vulkan device")?;

        // The render pass is tied to this format for the renderer's lifetime
        let support = SurfaceSupport::query(&device).context("Failed to query surface support")?;
        let surface_format = choose_surface_format(&support.formats).ok_or(
            RendererError::ResourceCreation {
                op: "vkGetPhysicalDeviceSurfaceFormatsKHR",
                result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
            },
        )?;
        log::info!(
            "Surface format: {:?} / {:?}",
            surface_format.format,
            surface_format.color_space
        );

        let pipeline = GraphicsPipeline::new(&device, surface_format.format, &config.shaders.directory)
            .context("Failed to create graphics pipeline")?;

        let mesh = QuadMesh::upload(&device).context("Failed to upload quad geometry")?;

        let engine = FrameEngine::new(
            &device,
            pipeline.render_pass,
            surface_format,
            config.graphics.frames_in_flight,
            config.graphics.clear_color,
            drawable_extent(window),
        )
        .context("Failed to create frame engine")?;

        match engine.extent() {
            Some(extent) => log::info!(
                "Renderer ready: {}x{}, {} frames in flight",
                extent.width,
                extent.height,
                engine.frames_in_flight()
            ),
            None => log::info!(
                "Renderer ready, waiting for a drawable window ({} frames in flight)",
                engine.frames_in_flight()
            ),
        }

        Ok(Self {
            engine,
            mesh,
            pipeline,
            device,
        })
    }

    pub fn draw_frame(&mut self, window: &Window) -> Result<FrameOutcome, RendererError> {
        let draw = self.mesh.draw(self.pipeline.pipeline);
        self.engine.draw_frame(&draw, drawable_extent(window))
    }

    pub fn request_recreate(&mut self) {
        self.engine.request_recreate();
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Shutting down renderer after {} frames", self.engine.frame_counter());
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device wait failed during shutdown: {}", e);
        }
    }
}

/// Current window size in pixels
pub fn drawable_extent(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}
