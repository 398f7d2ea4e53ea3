// Frame engine - Vulkan side of the frame loop
//
// Owns the command pool, the slot ring and the current swapchain. The
// swapchain is an Option: None while the window has no drawable area.

use ash::vk;
use std::sync::Arc;

use super::device::VulkanDevice;
use super::error::{RendererError, RendererResult, VkResultExt};
use super::frame::{FrameBackend, FrameLoop, FrameOutcome};
use super::quad::QuadDraw;
use super::swapchain::{Acquire, PresentStatus, SurfaceSupport, SwapchainPlan, SwapchainState};
use super::sync::FrameSlot;

pub struct FrameEngine {
    frames: FrameLoop<FrameSlot>,
    target: SwapchainTarget,
    command_pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

/// Everything that is rebuilt, or read while recording, per swapchain
struct SwapchainTarget {
    swapchain: Option<SwapchainState>,
    render_pass: vk::RenderPass,
    surface_format: vk::SurfaceFormatKHR,
    clear_color: [f32; 4],
}

impl FrameEngine {
    /// `surface_format` is the one the render pass was built for; every
    /// later swapchain keeps it while the surface still offers it.
    pub fn new(
        device: &Arc<VulkanDevice>,
        render_pass: vk::RenderPass,
        surface_format: vk::SurfaceFormatKHR,
        frames_in_flight: usize,
        clear_color: [f32; 4],
        drawable: vk::Extent2D,
    ) -> RendererResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .resource("vkCreateCommandPool")?;

        let slots = match FrameSlot::create_ring(device, command_pool, frames_in_flight.max(1)) {
            Ok(slots) => slots,
            Err(e) => {
                unsafe { device.device.destroy_command_pool(command_pool, None) };
                return Err(e);
            }
        };

        log::info!("Created {} frame slots", slots.len());

        // From here on drop cleans up
        let mut engine = Self {
            frames: FrameLoop::new(slots),
            target: SwapchainTarget {
                swapchain: None,
                render_pass,
                surface_format,
                clear_color,
            },
            command_pool,
            device: device.clone(),
        };

        if !engine.target.rebuild(&engine.device, drawable)? {
            log::info!("Window has no drawable area, deferring swapchain creation");
            engine.frames.request_recreate();
        }

        Ok(engine)
    }

    /// Run one pass of the frame loop for `draw`
    pub fn draw_frame(
        &mut self,
        draw: &QuadDraw,
        drawable: vk::Extent2D,
    ) -> RendererResult<FrameOutcome> {
        let mut backend = VulkanFrameBackend {
            target: &mut self.target,
            device: &self.device,
            draw,
            drawable,
        };
        self.frames.run_frame(&mut backend)
    }

    /// The window changed size; rebuild before the next frame
    pub fn request_recreate(&mut self) {
        self.frames.request_recreate();
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.slots().len()
    }

    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.target.swapchain.as_ref().map(SwapchainState::extent)
    }

    /// Frames submitted since startup
    pub fn frame_counter(&self) -> u64 {
        self.frames.frame_counter()
    }
}

impl Drop for FrameEngine {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device wait failed during frame engine teardown: {}", e);
        }

        self.target.swapchain = None;
        for slot in self.frames.slots() {
            slot.destroy(&self.device);
        }
        unsafe {
            self.device.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

impl SwapchainTarget {
    fn swapchain(&self, op: &'static str) -> RendererResult<&SwapchainState> {
        self.swapchain.as_ref().ok_or(RendererError::Submission {
            op,
            result: vk::Result::ERROR_OUT_OF_DATE_KHR,
        })
    }

    /// Idle the device, drop the old swapchain, then build a new one
    /// against fresh surface capabilities. Returns false for a zero-area
    /// window, leaving no swapchain behind.
    fn rebuild(&mut self, device: &Arc<VulkanDevice>, drawable: vk::Extent2D) -> RendererResult<bool> {
        device.wait_idle()?;

        // Old state goes fully before the new one exists
        self.swapchain = None;

        let support = SurfaceSupport::query(device)?;
        let Some(plan) = SwapchainPlan::renegotiate(
            &support,
            drawable,
            device.queue_families,
            self.surface_format,
        )?
        else {
            return Ok(false);
        };

        self.swapchain = Some(SwapchainState::new(device, plan, self.render_pass)?);
        Ok(true)
    }
}

/// Borrowed view of the engine for the duration of one pass
struct VulkanFrameBackend<'a> {
    target: &'a mut SwapchainTarget,
    device: &'a Arc<VulkanDevice>,
    draw: &'a QuadDraw,
    drawable: vk::Extent2D,
}

impl FrameBackend for VulkanFrameBackend<'_> {
    type Slot = FrameSlot;

    fn wait(&mut self, slot: &FrameSlot) -> RendererResult<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[slot.in_flight], true, u64::MAX)
                .submission("vkWaitForFences")
        }
    }

    fn acquire(&mut self, slot: &FrameSlot) -> RendererResult<Acquire> {
        match &self.target.swapchain {
            Some(swapchain) => swapchain.acquire_next_image(slot.image_available),
            None => Ok(Acquire::OutOfDate),
        }
    }

    fn reset(&mut self, slot: &FrameSlot) -> RendererResult<()> {
        unsafe {
            self.device
                .device
                .reset_fences(&[slot.in_flight])
                .submission("vkResetFences")?;
            self.device
                .device
                .reset_command_buffer(slot.command_buffer, vk::CommandBufferResetFlags::empty())
                .submission("vkResetCommandBuffer")
        }
    }

    fn record(&mut self, slot: &FrameSlot, image_index: u32) -> RendererResult<()> {
        let swapchain = self.target.swapchain("vkCmdBeginRenderPass")?;
        let framebuffer = *swapchain
            .framebuffers
            .get(image_index as usize)
            .ok_or(RendererError::Submission {
                op: "vkCmdBeginRenderPass",
                result: vk::Result::ERROR_OUT_OF_DATE_KHR,
            })?;
        let extent = swapchain.extent();

        let device = &self.device.device;
        let cmd = slot.command_buffer;
        let draw = self.draw;

        let begin_info = vk::CommandBufferBeginInfo::builder();
        unsafe { device.begin_command_buffer(cmd, &begin_info) }
            .submission("vkBeginCommandBuffer")?;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.target.clear_color,
            },
        }];

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.target.render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, draw.pipeline);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);
            device.cmd_bind_vertex_buffers(cmd, 0, &[draw.vertex_buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, draw.index_buffer, 0, draw.index_type);
            device.cmd_draw_indexed(cmd, draw.index_count, 1, 0, 0, 0);
            device.cmd_end_render_pass(cmd);
            device.end_command_buffer(cmd).submission("vkEndCommandBuffer")
        }
    }

    fn submit(&mut self, slot: &FrameSlot) -> RendererResult<()> {
        // Vertex work may start before the image is ours
        let wait_semaphores = [slot.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [slot.command_buffer];
        let signal_semaphores = [slot.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], slot.in_flight)
                .submission("vkQueueSubmit")
        }
    }

    fn present(&mut self, slot: &FrameSlot, image_index: u32) -> RendererResult<PresentStatus> {
        self.target.swapchain("vkQueuePresentKHR")?.present(
            self.device.present_queue,
            image_index,
            slot.render_finished,
        )
    }

    fn recreate(&mut self) -> RendererResult<bool> {
        let rebuilt = self.target.rebuild(self.device, self.drawable)?;
        if rebuilt {
            if let Some(swapchain) = &self.target.swapchain {
                let extent = swapchain.extent();
                log::debug!(
                    "Recreated swapchain: {}x{}, {} images",
                    extent.width,
                    extent.height,
                    swapchain.image_count()
                );
            }
        }
        Ok(rebuilt)
    }
}
