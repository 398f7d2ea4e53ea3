// GPU buffers
//
// A Buffer owns its vk::Buffer and the MemoryBlock bound to it at
// offset 0. Both are released together on drop.

use ash::vk;
use std::sync::Arc;

use super::device::VulkanDevice;
use super::error::{RendererError, RendererResult, VkResultExt};
use super::memory::MemoryBlock;

pub struct Buffer {
    handle: vk::Buffer,
    memory: MemoryBlock,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    device: Arc<VulkanDevice>,
}

impl Buffer {
    /// Create a buffer and bind freshly allocated memory with the given properties
    pub fn new(
        device: &Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> RendererResult<Self> {
        if size == 0 {
            return Err(RendererError::EmptyUpload);
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.device.create_buffer(&buffer_info, None) }
            .resource("vkCreateBuffer")?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(handle) };

        let memory = match MemoryBlock::allocate(device, requirements, memory_properties) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_buffer(handle, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { device.device.bind_buffer_memory(handle, memory.handle(), 0) }
            .resource("vkBindBufferMemory")
        {
            unsafe { device.device.destroy_buffer(handle, None) };
            memory.free(device);
            return Err(e);
        }

        Ok(Self {
            handle,
            memory,
            size,
            usage,
            device: device.clone(),
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn memory(&self) -> &MemoryBlock {
        &self.memory
    }

    /// Copy `data` into a host-visible buffer
    pub fn write(&self, data: &[u8]) -> RendererResult<()> {
        self.memory.write(&self.device, data)
    }

    /// Read the whole buffer back; only valid for host-visible memory
    #[cfg(test)]
    pub fn read_back(&self) -> RendererResult<Vec<u8>> {
        self.memory.read(&self.device, self.size as usize)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.handle, None);
        }
        self.memory.free(&self.device);
    }
}
