use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use crate::renderer::backend::ShaderStages;
use crate::renderer::descriptors::{BindingDecl, SetDecl};

pub const MAX_3D_INSTANCE: u32 = 20;
pub const MAX_2D_INSTANCE: u32 = 20;
pub const MAX_ANIMATIONS_PER_FRAME: u32 = 10;
/// Instance blocks available per frame before draws are dropped
pub const INSTANCE_BLOCKS: u32 = 8;
pub const MAX_BONES: usize = 64;
pub const MAX_TEXTURES: u32 = 256;

/// View and projection matrices, one set for 3D and one for 2D
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct ViewProjection {
    pub view: Mat4,
    pub proj: Mat4,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct TimeData {
    pub time: f32,
    _padding: [f32; 3],
}

impl TimeData {
    pub fn new(time: f32) -> Self {
        Self {
            time,
            _padding: [0.0; 3],
        }
    }
}

/// Data unique to each 3D instance passed as elements into a storage buffer
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable, PartialEq)]
pub struct PerInstance3D {
    pub model: Mat4,
    pub normal: Mat4,
}

/// Fragment data of a 2D instance. The sampled uv is `uv * tex_offset.zw + tex_offset.xy`.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable, PartialEq)]
pub struct Frag2DData {
    pub colour: Vec4,
    pub tex_offset: Vec4,
    pub tex_id: u32,
    _padding: [u32; 3],
}

impl Frag2DData {
    pub fn new(colour: Vec4, tex_offset: Vec4, tex_id: u32) -> Self {
        Self {
            colour,
            tex_offset,
            tex_id,
            _padding: [0; 3],
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct Bones {
    pub matrices: [Mat4; MAX_BONES],
}

impl Default for Bones {
    fn default() -> Self {
        Self {
            matrices: [Mat4::IDENTITY; MAX_BONES],
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable, PartialEq)]
pub struct Lighting {
    pub ambient: Vec4,
    pub diffuse: Vec4,
    pub specular: Vec4,
    pub direction: Vec4,
    pub cam_pos: Vec4,
}

impl Default for Lighting {
    fn default() -> Self {
        Self {
            ambient: Vec4::new(1.0, 1.0, 1.0, 0.4),
            diffuse: Vec4::new(1.0, 1.0, 1.0, 0.8),
            specular: Vec4::new(1.0, 1.0, 1.0, 8.0),
            direction: Vec4::new(0.3, -0.3, -0.5, 0.0),
            cam_pos: Vec4::ZERO,
        }
    }
}

/// Data unique to each 3D draw call passed as a push constant
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable, PartialEq)]
pub struct DrawPushConstants {
    pub colour: Vec4,
    /// Global texture slot that mesh texture index 0 maps to
    pub texture_base: u32,
    _padding: [u32; 3],
}

impl DrawPushConstants {
    pub fn new(colour: Vec4, texture_base: u32) -> Self {
        Self {
            colour,
            texture_base,
            _padding: [0; 3],
        }
    }
}

/// Indices of the shader-visible sets, in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderSet {
    ViewProjection3D = 0,
    ViewProjection2D,
    Instances3D,
    Bones,
    Empty,
    Instances2DVert,
    Instances2DFrag,
    Lighting,
    OffscreenTransform,
    Textures,
    OffscreenTexture,
}

impl ShaderSet {
    pub const COUNT: usize = 11;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Every set the pipelines use. Order matches [`ShaderSet`].
pub fn set_declarations() -> Vec<SetDecl> {
    use ShaderStages::*;
    vec![
        SetDecl::new("view projection 3D")
            .binding(BindingDecl::uniform::<ViewProjection>("vp", Vertex))
            .binding(BindingDecl::uniform::<TimeData>("time", Vertex)),
        SetDecl::new("view projection 2D")
            .binding(BindingDecl::uniform::<ViewProjection>("vp", Vertex)),
        SetDecl::new("3D instances").binding(
            BindingDecl::storage_array::<PerInstance3D>("instances", Vertex, MAX_3D_INSTANCE)
                .dynamic(INSTANCE_BLOCKS),
        ),
        SetDecl::new("bones").binding(
            BindingDecl::uniform::<Bones>("bones", Vertex).dynamic(MAX_ANIMATIONS_PER_FRAME),
        ),
        SetDecl::new("empty"),
        SetDecl::new("2D instance transforms").binding(
            BindingDecl::storage_array::<Mat4>("models", Vertex, MAX_2D_INSTANCE)
                .dynamic(INSTANCE_BLOCKS),
        ),
        SetDecl::new("2D instance fragments").binding(
            BindingDecl::storage_array::<Frag2DData>("frags", Fragment, MAX_2D_INSTANCE)
                .dynamic(INSTANCE_BLOCKS),
        ),
        SetDecl::new("lighting").binding(BindingDecl::uniform::<Lighting>("lighting", Fragment)),
        SetDecl::new("offscreen transform")
            .binding(BindingDecl::uniform::<Mat4>("transform", Vertex)),
        SetDecl::new("textures")
            .binding(BindingDecl::sampler("sampler"))
            .binding(BindingDecl::images("textures", MAX_TEXTURES)),
        SetDecl::new("offscreen texture")
            .binding(BindingDecl::sampler("sampler"))
            .binding(BindingDecl::images("offscreen", 1)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declarations_follow_set_indices() {
        let decls = set_declarations();
        assert_eq!(decls.len(), ShaderSet::COUNT);
        assert_eq!(decls[ShaderSet::Bones.index()].name, "bones");
        assert_eq!(decls[ShaderSet::OffscreenTexture.index()].name, "offscreen texture");
        assert_eq!(decls[ShaderSet::Instances3D.index()].dynamic_binding_count(), 1);
    }

    #[test]
    fn shader_structs_have_gpu_friendly_sizes() {
        assert_eq!(size_of::<PerInstance3D>(), 128);
        assert_eq!(size_of::<Frag2DData>(), 48);
        assert_eq!(size_of::<DrawPushConstants>(), 32);
        assert_eq!(size_of::<Bones>(), 64 * MAX_BONES);
    }
}
