use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

/// Vertex of a flat model drawn with the orthographic projection
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable, PartialEq)]
pub struct Vertex2D {
    pub position: Vec3,
    pub texcoord: Vec2,
}

/// Data unique to each static 3D vertex. `tex_id` indexes the owning pool's textures.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable, PartialEq)]
pub struct Vertex3D {
    pub position: Vec3,
    pub normal: Vec3,
    pub texcoord: Vec2,
    pub tex_id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable, PartialEq)]
pub struct VertexAnim3D {
    pub position: Vec3,
    pub normal: Vec3,
    pub texcoord: Vec2,
    pub tex_id: u32,
    pub bone_ids: [u32; 4],
    pub weights: [f32; 4],
}

/// Vertices of one staged mesh, tagged by the layout they are drawn with
#[derive(Debug, Clone, PartialEq)]
pub enum StagedVertices {
    Flat2D(Vec<Vertex2D>),
    Static3D(Vec<Vertex3D>),
    Animated3D(Vec<VertexAnim3D>),
}

impl StagedVertices {
    pub fn len(&self) -> usize {
        match self {
            Self::Flat2D(v) => v.len(),
            Self::Static3D(v) => v.len(),
            Self::Animated3D(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Flat2D(v) => bytemuck::cast_slice(v),
            Self::Static3D(v) => bytemuck::cast_slice(v),
            Self::Animated3D(v) => bytemuck::cast_slice(v),
        }
    }
}

/// Unit quad spanning 0..1 with counter-clockwise winding
pub fn quad() -> (Vec<Vertex2D>, Vec<u32>) {
    let vertices = vec![
        Vertex2D { // Top left
            position: [0.0, 0.0, 0.0].into(),
            texcoord: [0.0, 0.0].into(),
        },
        Vertex2D { // Bottom left
            position: [0.0, 1.0, 0.0].into(),
            texcoord: [0.0, 1.0].into(),
        },
        Vertex2D { // Top right
            position: [1.0, 0.0, 0.0].into(),
            texcoord: [1.0, 0.0].into(),
        },
        Vertex2D { // Bottom right
            position: [1.0, 1.0, 0.0].into(),
            texcoord: [1.0, 1.0].into(),
        },
    ];

    let indices = vec![
        0, 1, 2, // Top left triangle
        2, 1, 3, // Bottom right triangle
    ];

    (vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layouts_are_tightly_packed() {
        assert_eq!(size_of::<Vertex2D>(), 20);
        assert_eq!(size_of::<Vertex3D>(), 36);
        assert_eq!(size_of::<VertexAnim3D>(), 68);
    }
}
