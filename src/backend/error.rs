// Renderer error taxonomy
//
// Every Vulkan call that can fail is tagged with the call name and a
// category: initialization, resource creation, or submission. Swapchain
// staleness is NOT an error here; see `Acquire` / `PresentStatus`.

use ash::prelude::VkResult;
use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("Failed to load Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("Initialization failed in {op}: {result:?}")]
    Initialization { op: &'static str, result: vk::Result },

    #[error("No Vulkan device supports graphics and presentation to this surface")]
    NoSuitableDevice,

    #[error("Failed to load shader {}: {source} (SPIR-V is built from GLSL by glslc)", .path.display())]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Resource creation failed in {op}: {result:?}")]
    ResourceCreation { op: &'static str, result: vk::Result },

    #[error("No memory type matches type bits {type_bits:#b} with properties {properties:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("Memory type {memory_type_index} is not host visible and cannot be mapped")]
    NotHostVisible { memory_type_index: u32 },

    #[error("Mapped access of {requested} bytes exceeds the {size}-byte allocation")]
    MappedRangeExceeded {
        requested: vk::DeviceSize,
        size: vk::DeviceSize,
    },

    #[error("Refusing to upload an empty buffer")]
    EmptyUpload,

    #[error("Surface format changed from {expected:?} to {found:?}; the render pass cannot follow")]
    SurfaceFormatChanged {
        expected: vk::Format,
        found: vk::Format,
    },

    #[error("Submission failed in {op}: {result:?}")]
    Submission { op: &'static str, result: vk::Result },

    #[error("Frame slot {slot} was re-recorded before its fence was observed signaled")]
    SlotInFlight { slot: usize },
}

impl RendererError {
    /// Vulkan result code behind the failure, if there is one.
    #[cfg(test)]
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            Self::Initialization { result, .. }
            | Self::ResourceCreation { result, .. }
            | Self::Submission { result, .. } => Some(*result),
            _ => None,
        }
    }
}

pub type RendererResult<T> = Result<T, RendererError>;

/// Tags a raw `VkResult` with the failing call and its error category.
pub trait VkResultExt<T> {
    fn init(self, op: &'static str) -> RendererResult<T>;
    fn resource(self, op: &'static str) -> RendererResult<T>;
    fn submission(self, op: &'static str) -> RendererResult<T>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn init(self, op: &'static str) -> RendererResult<T> {
        self.map_err(|result| RendererError::Initialization { op, result })
    }

    fn resource(self, op: &'static str) -> RendererResult<T> {
        self.map_err(|result| RendererError::ResourceCreation { op, result })
    }

    fn submission(self, op: &'static str) -> RendererResult<T> {
        self.map_err(|result| RendererError::Submission { op, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_failing_call_and_result() {
        let raw: VkResult<()> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let err = raw.resource("vkAllocateMemory").unwrap_err();

        assert!(matches!(
            err,
            RendererError::ResourceCreation { op: "vkAllocateMemory", .. }
        ));
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert_eq!(
            err.to_string(),
            "Resource creation failed in vkAllocateMemory: ERROR_OUT_OF_DEVICE_MEMORY"
        );
    }

    #[test]
    fn success_passes_through() {
        let raw: VkResult<u32> = Ok(7);
        assert_eq!(raw.submission("vkQueueSubmit").unwrap(), 7);
    }

    #[test]
    fn memory_type_error_shows_mask() {
        let err = RendererError::NoSuitableMemoryType {
            type_bits: 0b101,
            properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        };
        assert!(err.to_string().contains("0b101"));
        assert_eq!(err.vk_result(), None);
    }
}
