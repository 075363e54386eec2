//! Turns model files into flattened scene descriptions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use glam::{Mat3, Mat4, Quat, Vec3};
use crate::renderer::error::AssetLoadError;
use crate::renderer::resources::animation::{
    AnimationClip, Channel, ChannelValues, Joint, JointTransform, Skeleton,
};

/// Where the texels of a diffuse texture come from
#[derive(Debug, Clone, PartialEq)]
pub enum TextureSource {
    File(PathBuf),
    /// Already decoded RGBA8, `name` is the dedup key
    Rgba {
        name: String,
        width: u32,
        height: u32,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeshDescription {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub tex_coords: Vec<[f32; 2]>,
    pub joints: Vec<[u32; 4]>,
    pub weights: Vec<[f32; 4]>,
    pub indices: Vec<u32>,
    pub diffuse_colour: [f32; 4],
    pub diffuse_texture: Option<TextureSource>,
}

impl Default for MeshDescription {
    fn default() -> Self {
        Self {
            positions: Vec::new(),
            normals: Vec::new(),
            tex_coords: Vec::new(),
            joints: Vec::new(),
            weights: Vec::new(),
            indices: Vec::new(),
            diffuse_colour: [1.0; 4],
            diffuse_texture: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneDescription {
    pub meshes: Vec<MeshDescription>,
    pub skeleton: Option<Skeleton>,
    pub animations: Vec<AnimationClip>,
}

pub trait SceneImporter {
    fn import(&self, path: &Path) -> Result<SceneDescription, AssetLoadError>;
}

/// Dispatches on the file extension: glTF through `gltf`, Wavefront through `tobj`
#[derive(Debug, Default, Clone, Copy)]
pub struct FileImporter;

impl SceneImporter for FileImporter {
    fn import(&self, path: &Path) -> Result<SceneDescription, AssetLoadError> {
        if !path.exists() {
            return Err(AssetLoadError::NotFound(path.to_path_buf()));
        }
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("gltf" | "glb") => import_gltf(path),
            Some("obj") => import_obj(path),
            _ => Err(AssetLoadError::Unsupported(path.to_path_buf())),
        }
    }
}

fn import_error(path: &Path, reason: impl ToString) -> AssetLoadError {
    AssetLoadError::Import {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn import_obj(path: &Path) -> Result<SceneDescription, AssetLoadError> {
    let (models, materials) = tobj::load_obj(
        path,
        &tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        },
    )
    .map_err(|e| import_error(path, e))?;
    let materials = materials.unwrap_or_else(|e| {
        log::warn!("{:?}: failed to load materials: {e}", path);
        Vec::new()
    });
    let directory = path.parent().unwrap_or(Path::new(""));

    let meshes = models
        .into_iter()
        .map(|model| {
            let mesh = model.mesh;
            let material = mesh.material_id.and_then(|id| materials.get(id));
            let diffuse = material
                .and_then(|m| m.diffuse)
                .map_or([1.0; 4], |[r, g, b]| [r, g, b, 1.0]);
            MeshDescription {
                positions: mesh.positions.chunks_exact(3).map(|p| [p[0], p[1], p[2]]).collect(),
                normals: mesh.normals.chunks_exact(3).map(|n| [n[0], n[1], n[2]]).collect(),
                tex_coords: mesh
                    .texcoords
                    .chunks_exact(2)
                    .map(|t| [t[0], 1.0 - t[1]])
                    .collect(),
                indices: mesh.indices,
                diffuse_colour: diffuse,
                diffuse_texture: material
                    .and_then(|m| m.diffuse_texture.as_ref())
                    .map(|t| TextureSource::File(directory.join(t))),
                ..Default::default()
            }
        })
        .collect();

    Ok(SceneDescription {
        meshes,
        ..Default::default()
    })
}

fn gltf_rgba(image: &gltf::image::Data) -> Option<Vec<u8>> {
    use gltf::image::Format;
    match image.format {
        Format::R8G8B8A8 => Some(image.pixels.clone()),
        Format::R8G8B8 => Some(
            image
                .pixels
                .chunks_exact(3)
                .flat_map(|p| [p[0], p[1], p[2], 255])
                .collect(),
        ),
        Format::R8 => Some(image.pixels.iter().flat_map(|&p| [p, p, p, 255]).collect()),
        _ => None,
    }
}

struct GltfImport<'a> {
    path: &'a Path,
    buffers: &'a [gltf::buffer::Data],
    images: &'a [gltf::image::Data],
    meshes: Vec<MeshDescription>,
}

impl GltfImport<'_> {
    fn visit(&mut self, node: gltf::Node, parent: Mat4) {
        let global = parent * Mat4::from_cols_array_2d(&node.transform().matrix());
        if let Some(mesh) = node.mesh() {
            // skinned vertices are positioned by their joints
            let transform = if node.skin().is_some() { Mat4::IDENTITY } else { global };
            for primitive in mesh.primitives() {
                self.primitive(&primitive, transform);
            }
        }
        for child in node.children() {
            self.visit(child, global);
        }
    }

    fn primitive(&mut self, primitive: &gltf::Primitive, transform: Mat4) {
        let buffers = self.buffers;
        let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()]));
        let Some(positions) = reader.read_positions() else {
            log::warn!("{:?}: primitive without positions skipped", self.path);
            return;
        };
        let normal_matrix = Mat3::from_mat4(transform).inverse().transpose();

        let positions: Vec<[f32; 3]> = positions
            .map(|p| transform.transform_point3(Vec3::from(p)).into())
            .collect();
        let normals = reader
            .read_normals()
            .map(|n| {
                n.map(|n| (normal_matrix * Vec3::from(n)).normalize_or_zero().into())
                    .collect()
            })
            .unwrap_or_default();
        let tex_coords = reader
            .read_tex_coords(0)
            .map(|t| t.into_f32().collect())
            .unwrap_or_default();
        let joints = reader
            .read_joints(0)
            .map(|j| j.into_u16().map(|j| j.map(u32::from)).collect())
            .unwrap_or_default();
        let weights = reader
            .read_weights(0)
            .map(|w| w.into_f32().collect())
            .unwrap_or_default();
        let indices = reader
            .read_indices()
            .map(|i| i.into_u32().collect())
            .unwrap_or_else(|| (0..positions.len() as u32).collect());

        let pbr = primitive.material().pbr_metallic_roughness();
        let diffuse_texture = pbr.base_color_texture().and_then(|info| {
            let index = info.texture().source().index();
            let image = self.images.get(index)?;
            match gltf_rgba(image) {
                Some(data) => Some(TextureSource::Rgba {
                    name: format!("{}#image{}", self.path.display(), index),
                    width: image.width,
                    height: image.height,
                    data,
                }),
                None => {
                    log::warn!("{:?}: image {} has an unsupported format", self.path, index);
                    None
                }
            }
        });

        self.meshes.push(MeshDescription {
            positions,
            normals,
            tex_coords,
            joints,
            weights,
            indices,
            diffuse_colour: pbr.base_color_factor(),
            diffuse_texture,
        });
    }
}

fn node_parents(document: &gltf::Document) -> HashMap<usize, usize> {
    document
        .nodes()
        .flat_map(|node| node.children().map(move |child| (child.index(), node.index())))
        .collect()
}

fn node_global(document: &gltf::Document, parents: &HashMap<usize, usize>, node: usize) -> Mat4 {
    let mut global = Mat4::IDENTITY;
    let mut current = Some(node);
    while let Some(index) = current {
        if let Some(node) = document.nodes().nth(index) {
            global = Mat4::from_cols_array_2d(&node.transform().matrix()) * global;
        }
        current = parents.get(&index).copied();
    }
    global
}

fn gltf_skeleton(
    document: &gltf::Document,
    buffers: &[gltf::buffer::Data],
    parents: &HashMap<usize, usize>,
) -> Option<(Skeleton, HashMap<usize, usize>)> {
    let skin = document.skins().next()?;
    let joint_nodes: Vec<gltf::Node> = skin.joints().collect();
    let by_node: HashMap<usize, usize> = joint_nodes
        .iter()
        .enumerate()
        .map(|(joint, node)| (node.index(), joint))
        .collect();
    let inverse_binds: Vec<Mat4> = skin
        .reader(|buffer| Some(&buffers[buffer.index()]))
        .read_inverse_bind_matrices()
        .map(|m| m.map(|m| Mat4::from_cols_array_2d(&m)).collect())
        .unwrap_or_default();

    let mut root = Mat4::IDENTITY;
    let joints = joint_nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let parent = parents.get(&node.index()).and_then(|p| by_node.get(p)).copied();
            if parent.is_none() {
                if let Some(&above) = parents.get(&node.index()) {
                    root = node_global(document, parents, above);
                }
            }
            let (translation, rotation, scale) = node.transform().decomposed();
            Joint {
                name: node.name().unwrap_or_default().to_string(),
                parent,
                inverse_bind: inverse_binds.get(i).copied().unwrap_or(Mat4::IDENTITY),
                rest: JointTransform {
                    translation: Vec3::from(translation),
                    rotation: Quat::from_array(rotation),
                    scale: Vec3::from(scale),
                },
            }
        })
        .collect();

    Some((Skeleton::new(joints, root), by_node))
}

/// Cubic spline outputs are (in-tangent, value, out-tangent) triples
fn keyframes<T>(values: impl Iterator<Item = T>, cubic: bool) -> Vec<T> {
    if cubic {
        values.skip(1).step_by(3).collect()
    } else {
        values.collect()
    }
}

fn gltf_clips(
    document: &gltf::Document,
    buffers: &[gltf::buffer::Data],
    joints_by_node: &HashMap<usize, usize>,
) -> Vec<AnimationClip> {
    use gltf::animation::{Interpolation, util::ReadOutputs};

    document
        .animations()
        .enumerate()
        .map(|(index, animation)| {
            let channels = animation
                .channels()
                .filter_map(|channel| {
                    let joint = *joints_by_node.get(&channel.target().node().index())?;
                    let interpolation = channel.sampler().interpolation();
                    let reader = channel.reader(|buffer| Some(&buffers[buffer.index()]));
                    let times: Vec<f32> = reader.read_inputs()?.collect();
                    let cubic = interpolation == Interpolation::CubicSpline;
                    let values = match reader.read_outputs()? {
                        ReadOutputs::Translations(t) => {
                            ChannelValues::Translation(keyframes(t.map(Vec3::from), cubic))
                        }
                        ReadOutputs::Rotations(r) => {
                            let rotations = r.into_f32().map(Quat::from_array);
                            ChannelValues::Rotation(keyframes(rotations, cubic))
                        }
                        ReadOutputs::Scales(s) => {
                            ChannelValues::Scale(keyframes(s.map(Vec3::from), cubic))
                        }
                        ReadOutputs::MorphTargetWeights(_) => return None,
                    };
                    Some(Channel {
                        joint,
                        times,
                        values,
                        step: interpolation == Interpolation::Step,
                    })
                })
                .collect();
            AnimationClip {
                name: animation
                    .name()
                    .map_or_else(|| format!("animation{index}"), str::to_string),
                channels,
            }
        })
        .collect()
}

fn import_gltf(path: &Path) -> Result<SceneDescription, AssetLoadError> {
    let (document, buffers, images) = gltf::import(path).map_err(|e| import_error(path, e))?;
    let parents = node_parents(&document);
    let (skeleton, joints_by_node) = match gltf_skeleton(&document, &buffers, &parents) {
        Some((skeleton, by_node)) => (Some(skeleton), by_node),
        None => (None, HashMap::new()),
    };
    let mut import = GltfImport {
        path,
        buffers: &buffers,
        images: &images,
        meshes: Vec::new(),
    };
    let scene = document
        .default_scene()
        .or_else(|| document.scenes().next())
        .ok_or_else(|| import_error(path, "file contains no scene"))?;
    for node in scene.nodes() {
        import.visit(node, Mat4::IDENTITY);
    }
    let meshes = import.meshes;

    let animations = if skeleton.is_some() {
        gltf_clips(&document, &buffers, &joints_by_node)
    } else {
        Vec::new()
    };

    Ok(SceneDescription {
        meshes,
        skeleton,
        animations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_is_not_found() {
        let result = FileImporter.import(Path::new("nowhere/model.gltf"));
        assert!(matches!(result, Err(AssetLoadError::NotFound(_))));
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let file = tempfile::Builder::new().suffix(".fbx").tempfile().unwrap();
        let result = FileImporter.import(file.path());
        assert!(matches!(result, Err(AssetLoadError::Unsupported(_))));
    }

    #[test]
    fn obj_triangles_are_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tri.obj");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "v 0 0 0\nv 1 0 0\nv 0 1 0\nv 1 1 0\nvt 0 0\nvt 1 0\nvt 0 1\nvt 1 1\n\
             f 1/1 2/2 4/4 3/3"
        )
        .unwrap();
        drop(file);

        let scene = FileImporter.import(&path).unwrap();
        assert_eq!(scene.meshes.len(), 1);
        let mesh = &scene.meshes[0];
        assert_eq!(mesh.positions.len(), 4);
        assert_eq!(mesh.indices.len(), 6);
        // v is flipped to the top-left texture origin
        assert_eq!(mesh.tex_coords[0], [0.0, 1.0]);
        assert_eq!(mesh.diffuse_colour, [1.0; 4]);
        assert!(scene.skeleton.is_none());
    }

    fn le_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn gltf_skin_and_rotation_channel_are_imported() {
        let mut data = le_bytes(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        data.extend([0u8; 12]);
        data.extend(le_bytes(&[1.0, 0.0, 0.0, 0.0].repeat(3)));
        data.extend(le_bytes(&[0.0, 1.0]));
        let half = std::f32::consts::FRAC_1_SQRT_2;
        data.extend(le_bytes(&[0.0, 0.0, 0.0, 1.0, 0.0, half, 0.0, half]));
        assert_eq!(data.len(), 136);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), &data).unwrap();
        let json = r#"{
            "asset": { "version": "2.0" },
            "scene": 0,
            "scenes": [{ "nodes": [0, 1] }],
            "nodes": [{ "mesh": 0, "skin": 0 }, { "name": "bone" }],
            "skins": [{ "joints": [1] }],
            "meshes": [{ "primitives": [{ "attributes": { "POSITION": 0, "JOINTS_0": 1, "WEIGHTS_0": 2 } }] }],
            "animations": [{
                "name": "turn",
                "samplers": [{ "input": 3, "output": 4, "interpolation": "LINEAR" }],
                "channels": [{ "sampler": 0, "target": { "node": 1, "path": "rotation" } }]
            }],
            "buffers": [{ "uri": "data.bin", "byteLength": 136 }],
            "bufferViews": [
                { "buffer": 0, "byteOffset": 0, "byteLength": 36 },
                { "buffer": 0, "byteOffset": 36, "byteLength": 12 },
                { "buffer": 0, "byteOffset": 48, "byteLength": 48 },
                { "buffer": 0, "byteOffset": 96, "byteLength": 8 },
                { "buffer": 0, "byteOffset": 104, "byteLength": 32 }
            ],
            "accessors": [
                { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
                  "min": [0, 0, 0], "max": [1, 1, 0] },
                { "bufferView": 1, "componentType": 5121, "count": 3, "type": "VEC4" },
                { "bufferView": 2, "componentType": 5126, "count": 3, "type": "VEC4" },
                { "bufferView": 3, "componentType": 5126, "count": 2, "type": "SCALAR",
                  "min": [0], "max": [1] },
                { "bufferView": 4, "componentType": 5126, "count": 2, "type": "VEC4" }
            ]
        }"#;
        let path = dir.path().join("bone.gltf");
        std::fs::write(&path, json).unwrap();

        let scene = FileImporter.import(&path).unwrap();
        assert_eq!(scene.meshes.len(), 1);
        assert_eq!(scene.meshes[0].joints, vec![[0, 0, 0, 0]; 3]);
        assert_eq!(scene.skeleton.as_ref().map(|s| s.len()), Some(1));
        assert_eq!(scene.animations.len(), 1);
        let clip = &scene.animations[0];
        assert_eq!(clip.name, "turn");
        assert_eq!(clip.channels.len(), 1);
        let channel = &clip.channels[0];
        assert_eq!(channel.joint, 0);
        assert_eq!(channel.times, vec![0.0, 1.0]);
        match &channel.values {
            ChannelValues::Rotation(keys) => {
                assert_eq!(keys.len(), 2);
                assert_eq!(keys[1], Quat::from_xyzw(0.0, half, 0.0, half));
            }
            other => panic!("expected rotation keys, got {other:?}"),
        }
    }
}
