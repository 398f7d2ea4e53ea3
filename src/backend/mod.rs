// Backend module - Vulkan presentation layer
//
// Leaves first: error, device, memory, buffer, transfer, shader, pipeline,
// quad. Then the presentation core: swapchain, sync, frame, engine.

pub mod buffer;
pub mod device;
pub mod engine;
pub mod error;
pub mod frame;
pub mod memory;
pub mod pipeline;
pub mod quad;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod transfer;

pub use device::{PresentTarget, VulkanDevice};
pub use engine::FrameEngine;
pub use error::RendererError;
pub use frame::FrameOutcome;
pub use pipeline::GraphicsPipeline;
pub use quad::QuadMesh;
