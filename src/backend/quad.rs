// Quad geometry
//
// Four colored corners and six 16-bit indices, uploaded once into
// device-local vertex and index buffers.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use std::mem::{offset_of, size_of};
use std::sync::Arc;

use super::buffer::Buffer;
use super::device::VulkanDevice;
use super::error::RendererResult;
use super::transfer;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec2,
    pub color: Vec3,
}

impl Vertex {
    pub const fn new(position: [f32; 2], color: [f32; 3]) -> Self {
        Self {
            position: Vec2::from_array(position),
            color: Vec3::from_array(color),
        }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Self>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            // Position (location 0)
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(offset_of!(Self, position) as u32)
                .build(),
            // Color (location 1)
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Self, color) as u32)
                .build(),
        ]
    }
}

pub const QUAD_VERTICES: [Vertex; 4] = [
    Vertex::new([-0.5, -0.5], [1.0, 1.0, 1.0]), // Top left
    Vertex::new([0.5, -0.5], [1.0, 0.0, 0.0]),  // Top right
    Vertex::new([0.5, 0.5], [0.0, 0.0, 1.0]),   // Bottom right
    Vertex::new([-0.5, 0.5], [0.0, 1.0, 0.0]),  // Bottom left
];

/// Two clockwise triangles
pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// Handles the frame loop binds for its single draw
#[derive(Debug, Clone, Copy)]
pub struct QuadDraw {
    pub pipeline: vk::Pipeline,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
    pub index_type: vk::IndexType,
}

/// Device-local quad buffers
pub struct QuadMesh {
    pub vertex_buffer: Buffer,
    pub index_buffer: Buffer,
    pub index_count: u32,
}

impl QuadMesh {
    pub fn upload(device: &Arc<VulkanDevice>) -> RendererResult<Self> {
        let vertex_buffer =
            transfer::upload_slice(device, &QUAD_VERTICES, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let index_buffer =
            transfer::upload_slice(device, &QUAD_INDICES, vk::BufferUsageFlags::INDEX_BUFFER)?;

        log::info!(
            "Uploaded quad: {} vertices, {} indices",
            QUAD_VERTICES.len(),
            QUAD_INDICES.len()
        );

        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: QUAD_INDICES.len() as u32,
        })
    }

    pub fn draw(&self, pipeline: vk::Pipeline) -> QuadDraw {
        QuadDraw {
            pipeline,
            vertex_buffer: self.vertex_buffer.handle(),
            index_buffer: self.index_buffer.handle(),
            index_count: self.index_count,
            index_type: vk::IndexType::UINT16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_is_five_packed_floats() {
        assert_eq!(size_of::<Vertex>(), 5 * 4);
        assert_eq!(Vertex::binding_description().stride, 20);

        let [position, color] = Vertex::attribute_descriptions();
        assert_eq!(position.offset, 0);
        assert_eq!(color.offset, 8);
        assert_eq!(color.location, 1);
    }

    #[test]
    fn vertex_bytes_match_declared_layout() {
        let bytes: &[u8] = bytemuck::cast_slice(&QUAD_VERTICES);
        assert_eq!(bytes.len(), 80);

        let floats: &[f32] = bytemuck::cast_slice(bytes);
        assert_eq!(&floats[5..10], &[0.5, -0.5, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn indices_reference_every_corner() {
        assert!(QUAD_INDICES.iter().all(|&i| (i as usize) < QUAD_VERTICES.len()));
        for corner in 0..QUAD_VERTICES.len() as u16 {
            assert!(QUAD_INDICES.contains(&corner));
        }
        assert_eq!(bytemuck::cast_slice::<u16, u8>(&QUAD_INDICES).len(), 12);
    }

    #[test]
    fn triangles_wind_clockwise_on_screen() {
        // Vulkan clip space has +y pointing down
        for tri in QUAD_INDICES.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|k| QUAD_VERTICES[tri[k] as usize].position);
            let cross = (b - a).perp_dot(c - a);
            assert!(cross > 0.0, "triangle {:?} is not clockwise", tri);
        }
    }
}
