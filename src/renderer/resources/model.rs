use glam::{Vec2, Vec3, Vec4};
use crate::renderer::backend::BufferId;
use crate::renderer::descriptors::align_up;
use crate::renderer::error::RenderResult;
use crate::renderer::resources::import::{MeshDescription, SceneDescription, TextureSource};
use crate::renderer::resources::texture::TextureLoader;
use crate::renderer::resources::vertex::{StagedVertices, Vertex2D, Vertex3D, VertexAnim3D};
use crate::renderer::resources::{ModelKind, PoolId};

#[derive(Debug, Clone, PartialEq)]
pub struct StagedMesh {
    pub vertices: StagedVertices,
    pub indices: Vec<u32>,
    pub diffuse: Vec4,
    /// Pool-local texture index
    pub texture: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedModel {
    pub kind: ModelKind,
    pub meshes: Vec<StagedMesh>,
}

impl StagedModel {
    /// A model that draws nothing, substituted when loading fails
    pub fn empty(kind: ModelKind) -> Self {
        Self { kind, meshes: Vec::new() }
    }

    /// Flattens `scene` into vertices of `kind`, staging referenced textures into `textures`
    pub fn from_scene(
        kind: ModelKind,
        scene: &SceneDescription,
        pool: PoolId,
        textures: &mut TextureLoader,
    ) -> RenderResult<Self> {
        let mut meshes = Vec::with_capacity(scene.meshes.len());
        for mesh in &scene.meshes {
            if mesh.positions.is_empty() {
                continue;
            }
            let texture = match &mesh.diffuse_texture {
                Some(TextureSource::File(path)) => textures.load(pool, path)?,
                Some(TextureSource::Rgba { name, width, height, data }) => {
                    textures.load_rgba(pool, name, *width, *height, data.clone())?
                }
                None => textures.fallback(pool)?,
            };
            meshes.push(StagedMesh {
                vertices: flatten(kind, mesh, texture.index),
                indices: valid_indices(mesh),
                diffuse: Vec4::from(mesh.diffuse_colour),
                texture: texture.index,
            });
        }
        Ok(Self { kind, meshes })
    }
}

fn valid_indices(mesh: &MeshDescription) -> Vec<u32> {
    let count = mesh.positions.len() as u32;
    let mut indices: Vec<u32> = mesh.indices.iter().copied().filter(|&i| i < count).collect();
    if indices.len() != mesh.indices.len() {
        log::warn!("dropped {} out of range indices", mesh.indices.len() - indices.len());
    }
    indices.truncate(indices.len() - indices.len() % 3);
    indices
}

fn flatten(kind: ModelKind, mesh: &MeshDescription, tex_id: u32) -> StagedVertices {
    let texcoord = |i: usize| mesh.tex_coords.get(i).copied().map_or(Vec2::ZERO, Vec2::from);
    let normal = |i: usize| mesh.normals.get(i).copied().map_or(Vec3::Z, Vec3::from);
    let positions = mesh.positions.iter().copied().map(Vec3::from).enumerate();
    match kind {
        ModelKind::Flat2D => StagedVertices::Flat2D(
            positions
                .map(|(i, position)| Vertex2D { position, texcoord: texcoord(i) })
                .collect(),
        ),
        ModelKind::Static3D => StagedVertices::Static3D(
            positions
                .map(|(i, position)| Vertex3D {
                    position,
                    normal: normal(i),
                    texcoord: texcoord(i),
                    tex_id,
                })
                .collect(),
        ),
        ModelKind::Animated3D => StagedVertices::Animated3D(
            positions
                .map(|(i, position)| VertexAnim3D {
                    position,
                    normal: normal(i),
                    texcoord: texcoord(i),
                    tex_id,
                    bone_ids: mesh.joints.get(i).copied().unwrap_or_default(),
                    weights: mesh.weights.get(i).copied().unwrap_or([1.0, 0.0, 0.0, 0.0]),
                })
                .collect(),
        ),
    }
}

/// Where one mesh lives inside its pool's geometry buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshRange {
    pub index_count: u32,
    pub first_index: u32,
    /// In vertices, relative to the start of the model kind's section
    pub vertex_offset: i32,
    pub diffuse: Vec4,
    pub texture: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuModel {
    pub kind: ModelKind,
    pub meshes: Vec<MeshRange>,
}

/// Device-local vertex and index data of a pool, laid out as
/// `[2D vertices][3D vertices][animated vertices][indices]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub buffer: BufferId,
    pub vertex_offsets: [u64; 3],
    pub index_offset: u64,
}

impl PoolGeometry {
    pub fn vertex_offset(&self, kind: ModelKind) -> u64 {
        self.vertex_offsets[kind.index()]
    }
}

/// CPU image of a pool's geometry buffer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackedGeometry {
    pub bytes: Vec<u8>,
    pub vertex_offsets: [u64; 3],
    pub index_offset: u64,
    pub models: Vec<GpuModel>,
}

/// Concatenates the staged models of a pool, grouped by vertex layout
pub fn pack_models(models: &[StagedModel]) -> PackedGeometry {
    let mut sections: [Vec<u8>; 3] = Default::default();
    let mut vertex_counts = [0usize; 3];
    let mut indices: Vec<u32> = Vec::new();
    let mut gpu_models = Vec::with_capacity(models.len());

    for model in models {
        let section = model.kind.index();
        let meshes = model
            .meshes
            .iter()
            .map(|mesh| {
                let range = MeshRange {
                    index_count: mesh.indices.len() as u32,
                    first_index: indices.len() as u32,
                    vertex_offset: vertex_counts[section] as i32,
                    diffuse: mesh.diffuse,
                    texture: mesh.texture,
                };
                sections[section].extend_from_slice(mesh.vertices.as_bytes());
                vertex_counts[section] += mesh.vertices.len();
                indices.extend_from_slice(&mesh.indices);
                range
            })
            .collect();
        gpu_models.push(GpuModel { kind: model.kind, meshes });
    }

    let mut bytes = Vec::new();
    let mut vertex_offsets = [0u64; 3];
    for (offset, section) in vertex_offsets.iter_mut().zip(&sections) {
        *offset = bytes.len() as u64;
        bytes.extend_from_slice(section);
    }
    let index_offset = align_up(bytes.len() as u64, 4);
    bytes.resize(index_offset as usize, 0);
    bytes.extend_from_slice(bytemuck::cast_slice(&indices));

    PackedGeometry {
        bytes,
        vertex_offsets,
        index_offset,
        models: gpu_models,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::resources::vertex::quad;

    const POOL: PoolId = PoolId { index: 0, generation: 0 };

    fn triangle(colour: [f32; 4]) -> MeshDescription {
        MeshDescription {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            indices: vec![0, 1, 2],
            diffuse_colour: colour,
            ..Default::default()
        }
    }

    #[test]
    fn meshes_without_texture_use_the_pool_fallback() {
        let mut textures = TextureLoader::new(8);
        let scene = SceneDescription {
            meshes: vec![triangle([1.0, 0.0, 0.0, 1.0])],
            ..Default::default()
        };
        let model = StagedModel::from_scene(ModelKind::Static3D, &scene, POOL, &mut textures).unwrap();
        assert_eq!(textures.count(), 1);
        assert_eq!(model.meshes[0].texture, 0);
        let StagedVertices::Static3D(vertices) = &model.meshes[0].vertices else {
            panic!("expected static vertices");
        };
        assert_eq!(vertices[0].normal, Vec3::Z);
    }

    #[test]
    fn out_of_range_indices_are_dropped() {
        let mut mesh = triangle([1.0; 4]);
        mesh.indices = vec![0, 1, 2, 0, 2, 9];
        assert_eq!(valid_indices(&mesh), vec![0, 1, 2]);
    }

    #[test]
    fn packing_groups_vertices_by_kind() {
        let mut textures = TextureLoader::new(8);
        let scene = SceneDescription {
            meshes: vec![triangle([1.0; 4])],
            ..Default::default()
        };
        let (quad_vertices, quad_indices) = quad();
        let models = vec![
            StagedModel::from_scene(ModelKind::Static3D, &scene, POOL, &mut textures).unwrap(),
            StagedModel {
                kind: ModelKind::Flat2D,
                meshes: vec![StagedMesh {
                    vertices: StagedVertices::Flat2D(quad_vertices),
                    indices: quad_indices,
                    diffuse: Vec4::ONE,
                    texture: 0,
                }],
            },
            StagedModel::from_scene(ModelKind::Static3D, &scene, POOL, &mut textures).unwrap(),
        ];

        let packed = pack_models(&models);
        let flat_bytes = 4 * size_of::<Vertex2D>() as u64;
        let static_bytes = 6 * size_of::<Vertex3D>() as u64;
        assert_eq!(packed.vertex_offsets, [0, flat_bytes, flat_bytes + static_bytes]);
        assert_eq!(packed.index_offset, flat_bytes + static_bytes);
        assert_eq!(packed.bytes.len() as u64, packed.index_offset + 12 * 4);

        assert_eq!(packed.models[0].meshes[0].vertex_offset, 0);
        assert_eq!(packed.models[1].meshes[0].first_index, 3);
        assert_eq!(packed.models[2].meshes[0].vertex_offset, 3);
        assert_eq!(packed.models[2].meshes[0].first_index, 9);
    }

    #[test]
    fn empty_pool_packs_to_nothing() {
        let packed = pack_models(&[]);
        assert!(packed.bytes.is_empty());
        assert_eq!(packed.index_offset, 0);
    }
}
