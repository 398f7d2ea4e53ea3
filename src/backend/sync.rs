// Synchronization primitives
//
// One FrameSlot per frame in flight: a command buffer, the two semaphores
// chaining acquire -> submit -> present, and the fence gating re-recording.

use ash::vk;

use super::device::VulkanDevice;
use super::error::{RendererError, RendererResult, VkResultExt};

/// Per-frame resources, owned by the frame engine for its whole lifetime
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSlot {
    /// Allocate `count` slots from `pool`. Fences start signaled so the
    /// first wait on each slot returns immediately.
    pub fn create_ring(
        device: &VulkanDevice,
        pool: vk::CommandPool,
        count: usize,
    ) -> RendererResult<Vec<Self>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        // Freed together with the pool
        let command_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .resource("vkAllocateCommandBuffers")?;

        let mut slots = Vec::with_capacity(count);
        for command_buffer in command_buffers {
            match Self::new(device, command_buffer) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in &slots {
                        slot.destroy(device);
                    }
                    return Err(e);
                }
            }
        }

        Ok(slots)
    }

    fn new(device: &VulkanDevice, command_buffer: vk::CommandBuffer) -> RendererResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            let image_available = device
                .device
                .create_semaphore(&semaphore_info, None)
                .resource("vkCreateSemaphore")?;

            let render_finished = match device
                .device
                .create_semaphore(&semaphore_info, None)
                .resource("vkCreateSemaphore")
            {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.device.destroy_semaphore(image_available, None);
                    return Err(e);
                }
            };

            let in_flight = match device
                .device
                .create_fence(&fence_info, None)
                .resource("vkCreateFence")
            {
                Ok(fence) => fence,
                Err(e) => {
                    device.device.destroy_semaphore(render_finished, None);
                    device.device.destroy_semaphore(image_available, None);
                    return Err(e);
                }
            };

            Ok(Self {
                command_buffer,
                image_available,
                render_finished,
                in_flight,
            })
        }
    }

    /// Destroy the sync objects. The device must be idle.
    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_semaphore(self.image_available, None);
            device.device.destroy_semaphore(self.render_finished, None);
            device.device.destroy_fence(self.in_flight, None);
        }
    }
}

/// CPU-side view of where a slot is in its cycle
///
/// `AwaitingFence` covers both "submitted, GPU may be executing" and the
/// initial state; only an observed-signaled fence makes a slot `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotPhase {
    #[default]
    AwaitingFence,
    Ready,
    Recording,
}

impl SlotPhase {
    /// The slot's fence was waited on and found signaled
    pub fn fence_observed(&mut self) {
        *self = Self::Ready;
    }

    /// Gate for reset + record; fails unless the fence was observed first
    pub fn begin_recording(&mut self, slot: usize) -> RendererResult<()> {
        match self {
            Self::Ready => {
                *self = Self::Recording;
                Ok(())
            }
            _ => Err(RendererError::SlotInFlight { slot }),
        }
    }

    /// Work handed to the queue; the fence is armed again
    pub fn submitted(&mut self) {
        *self = Self::AwaitingFence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle() {
        let mut phase = SlotPhase::default();
        assert_eq!(phase, SlotPhase::AwaitingFence);

        phase.fence_observed();
        phase.begin_recording(0).unwrap();
        assert_eq!(phase, SlotPhase::Recording);

        phase.submitted();
        assert_eq!(phase, SlotPhase::AwaitingFence);
    }

    #[test]
    fn recording_without_wait_is_refused() {
        let mut phase = SlotPhase::default();
        let err = phase.begin_recording(1).unwrap_err();
        assert!(matches!(err, RendererError::SlotInFlight { slot: 1 }));

        phase.fence_observed();
        phase.begin_recording(1).unwrap();
        phase.submitted();
        assert!(phase.begin_recording(1).is_err());
    }

    #[test]
    fn double_record_is_refused() {
        let mut phase = SlotPhase::Ready;
        phase.begin_recording(0).unwrap();
        assert!(phase.begin_recording(0).is_err());
    }

    #[test]
    fn waiting_again_after_abandoned_frame_is_fine() {
        // Acquire went out of date after the wait: nothing was reset
        let mut phase = SlotPhase::default();
        phase.fence_observed();
        phase.fence_observed();
        assert!(phase.begin_recording(0).is_ok());
    }
}
