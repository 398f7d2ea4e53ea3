// Device memory - type selection and raw allocations
//
// A MemoryBlock belongs to exactly one buffer and is always bound at
// offset 0. There is no sub-allocation and no retry on exhaustion.

use ash::vk;

use super::device::VulkanDevice;
use super::error::{RendererError, RendererResult, VkResultExt};

/// First memory type, in index order, that is allowed by `type_bits`
/// and whose flags contain every flag in `required`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> RendererResult<u32> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);

    (0..count)
        .find(|&i| {
            let allowed = type_bits & (1 << i) != 0;
            allowed
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(RendererError::NoSuitableMemoryType {
            type_bits,
            properties: required,
        })
}

/// A single device memory allocation
#[derive(Debug)]
pub struct MemoryBlock {
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type_index: u32,
    host_visible: bool,
}

impl MemoryBlock {
    /// Allocate memory satisfying `requirements` with the given properties.
    pub fn allocate(
        device: &VulkanDevice,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> RendererResult<Self> {
        let memory_type_index = find_memory_type(
            &device.memory_properties,
            requirements.memory_type_bits,
            properties,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
            .resource("vkAllocateMemory")?;

        let host_visible = device.memory_properties.memory_types[memory_type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);

        log::trace!(
            "Allocated {} bytes from memory type {} (host visible: {})",
            requirements.size,
            memory_type_index,
            host_visible
        );

        Ok(Self {
            memory,
            size: requirements.size,
            memory_type_index,
            host_visible,
        })
    }

    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    #[cfg(test)]
    pub fn is_host_visible(&self) -> bool {
        self.host_visible
    }

    /// Only host-visible memory is mapped, and never past its end
    fn check_mappable(&self, len: usize) -> RendererResult<()> {
        if !self.host_visible {
            return Err(RendererError::NotHostVisible {
                memory_type_index: self.memory_type_index,
            });
        }
        let requested = len as vk::DeviceSize;
        if requested > self.size {
            return Err(RendererError::MappedRangeExceeded {
                requested,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Map the whole range, copy `data` to the start, unmap.
    pub fn write(&self, device: &VulkanDevice, data: &[u8]) -> RendererResult<()> {
        self.check_mappable(data.len())?;

        unsafe {
            let ptr = device
                .device
                .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .resource("vkMapMemory")? as *mut u8;

            ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
            device.device.unmap_memory(self.memory);
        }

        Ok(())
    }

    /// Map the whole range and copy the first `len` bytes out.
    #[cfg(test)]
    pub fn read(&self, device: &VulkanDevice, len: usize) -> RendererResult<Vec<u8>> {
        self.check_mappable(len)?;

        let mut out = vec![0u8; len];
        unsafe {
            let ptr = device
                .device
                .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .resource("vkMapMemory")? as *const u8;

            out.as_mut_ptr().copy_from_nonoverlapping(ptr, len);
            device.device.unmap_memory(self.memory);
        }

        Ok(out)
    }

    /// Release the allocation; the owner must not use it afterwards.
    pub fn free(&self, device: &VulkanDevice) {
        unsafe {
            device.device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = flags.len() as u32;
        for (i, &property_flags) in flags.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags,
                heap_index: 0,
            };
        }
        props
    }

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
            | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );

    #[test]
    fn picks_first_matching_index() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            HOST,
            HOST | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);

        assert_eq!(find_memory_type(&props, 0b111, HOST).unwrap(), 1);
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn respects_type_filter() {
        let props = memory_properties(&[HOST, HOST]);

        // Only bit 1 is allowed
        assert_eq!(find_memory_type(&props, 0b10, HOST).unwrap(), 1);
    }

    #[test]
    fn superset_of_flags_qualifies() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | HOST,
        ]);

        // Index 0 lacks HOST_COHERENT, index 1 has everything and more
        assert_eq!(find_memory_type(&props, 0b11, HOST).unwrap(), 1);
    }

    #[test]
    fn no_match_is_an_error() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);

        let err = find_memory_type(&props, 0b1, HOST).unwrap_err();
        assert!(matches!(
            err,
            RendererError::NoSuitableMemoryType { type_bits: 0b1, .. }
        ));
    }

    #[test]
    fn bits_beyond_type_count_are_ignored() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);

        // Bit 5 set, but only one type exists
        assert!(find_memory_type(&props, 0b100000, vk::MemoryPropertyFlags::empty()).is_err());
    }

    fn block(size: vk::DeviceSize, host_visible: bool) -> MemoryBlock {
        MemoryBlock {
            memory: vk::DeviceMemory::null(),
            size,
            memory_type_index: 2,
            host_visible,
        }
    }

    #[test]
    fn device_local_memory_is_never_mapped() {
        let err = block(64, false).check_mappable(4).unwrap_err();
        assert!(matches!(
            err,
            RendererError::NotHostVisible { memory_type_index: 2 }
        ));
    }

    #[test]
    fn mapped_access_stays_inside_the_allocation() {
        let host = block(4, true);
        assert!(host.check_mappable(4).is_ok());
        assert!(host.check_mappable(0).is_ok());

        let err = host.check_mappable(4096).unwrap_err();
        assert!(matches!(
            err,
            RendererError::MappedRangeExceeded { requested: 4096, size: 4 }
        ));
    }
}
