// Transfer engine - one-shot staging uploads into device-local buffers
//
// Runs before the frame loop starts. Each upload blocks until the
// graphics queue is idle, so the returned buffer can be bound right away
// without further synchronization.

use ash::vk;
use std::sync::Arc;

use super::buffer::Buffer;
use super::device::VulkanDevice;
use super::error::{RendererError, RendererResult, VkResultExt};

const STAGING_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// Upload `data` into a new device-local buffer usable as `usage`
pub fn upload(
    device: &Arc<VulkanDevice>,
    data: &[u8],
    usage: vk::BufferUsageFlags,
) -> RendererResult<Buffer> {
    upload_into(device, data, usage, vk::MemoryPropertyFlags::DEVICE_LOCAL)
}

/// Typed convenience over [`upload`]
pub fn upload_slice<T: bytemuck::Pod>(
    device: &Arc<VulkanDevice>,
    data: &[T],
    usage: vk::BufferUsageFlags,
) -> RendererResult<Buffer> {
    upload(device, bytemuck::cast_slice(data), usage)
}

/// Same protocol as [`upload`] with the destination memory chosen by the
/// caller. Host-visible destinations allow reading the result back.
pub fn upload_into(
    device: &Arc<VulkanDevice>,
    data: &[u8],
    usage: vk::BufferUsageFlags,
    destination_memory: vk::MemoryPropertyFlags,
) -> RendererResult<Buffer> {
    if data.is_empty() {
        return Err(RendererError::EmptyUpload);
    }
    let size = data.len() as vk::DeviceSize;

    // Step 1-2: Staging buffer, whole-buffer map-copy-unmap
    let staging = Buffer::new(device, size, vk::BufferUsageFlags::TRANSFER_SRC, STAGING_MEMORY)?;
    staging.write(data)?;

    // Step 3: Destination buffer
    let destination = Buffer::new(
        device,
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        destination_memory,
    )?;

    // Step 4-5: Record, submit and drain the queue
    let commands = OneShotCommands::begin(device)?;
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size,
    };
    unsafe {
        device
            .device
            .cmd_copy_buffer(commands.buffer, staging.handle(), destination.handle(), &[region]);
    }
    commands.submit_and_wait()?;

    log::debug!(
        "Uploaded {} bytes into {:?} buffer (memory type {})",
        destination.size(),
        destination.usage(),
        destination.memory().memory_type_index()
    );

    // Step 6: Staging buffer and its memory are released here
    drop(staging);

    Ok(destination)
}

/// Transient pool + single primary command buffer, released on drop
struct OneShotCommands<'a> {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    device: &'a VulkanDevice,
}

impl<'a> OneShotCommands<'a> {
    fn begin(device: &'a VulkanDevice) -> RendererResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_families.graphics)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .resource("vkCreateCommandPool")?;

        // From here on drop cleans up the pool
        let mut commands = Self {
            pool,
            buffer: vk::CommandBuffer::null(),
            device,
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        commands.buffer = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .resource("vkAllocateCommandBuffers")?[0];

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe { device.device.begin_command_buffer(commands.buffer, &begin_info) }
            .resource("vkBeginCommandBuffer")?;

        Ok(commands)
    }

    /// Submit with no semaphores and block until the graphics queue drains
    fn submit_and_wait(self) -> RendererResult<()> {
        let device = &self.device.device;

        unsafe { device.end_command_buffer(self.buffer) }.resource("vkEndCommandBuffer")?;

        let command_buffers = [self.buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        unsafe {
            device
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], vk::Fence::null())
                .submission("vkQueueSubmit")?;
            device
                .queue_wait_idle(self.device.graphics_queue)
                .submission("vkQueueWaitIdle")?;
        }

        Ok(())
    }
}

impl Drop for OneShotCommands<'_> {
    fn drop(&mut self) {
        unsafe {
            if self.buffer != vk::CommandBuffer::null() {
                self.device.device.free_command_buffers(self.pool, &[self.buffer]);
            }
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_memory_is_host_visible_and_coherent() {
        assert!(STAGING_MEMORY.contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
        assert!(STAGING_MEMORY.contains(vk::MemoryPropertyFlags::HOST_COHERENT));
        assert!(!STAGING_MEMORY.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL));
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn staged_bytes_read_back_identically() {
        let device = VulkanDevice::headless("transfer-roundtrip").unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let buffer = upload_into(
            &device,
            &data,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            STAGING_MEMORY,
        )
        .unwrap();

        assert!(buffer.memory().is_host_visible());
        assert!(buffer.usage().contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert_eq!(buffer.read_back().unwrap(), data);
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn empty_upload_is_rejected() {
        let device = VulkanDevice::headless("transfer-empty").unwrap();
        let result = upload(&device, &[], vk::BufferUsageFlags::INDEX_BUFFER);
        assert!(matches!(result, Err(RendererError::EmptyUpload)));
    }
}
