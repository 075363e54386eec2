//! Asset pools and the loaders that stage data into them.

pub mod animation;
pub mod font;
pub mod import;
pub mod model;
pub mod pool;
pub mod texture;
pub mod vertex;

/// Generational handle of a resource pool. A handle outlives its pool only as a stale id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId {
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Texture {
    pub pool: PoolId,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Flat2D,
    Static3D,
    Animated3D,
}

impl ModelKind {
    pub const ALL: [Self; 3] = [Self::Flat2D, Self::Static3D, Self::Animated3D];

    pub fn index(self) -> usize {
        match self {
            Self::Flat2D => 0,
            Self::Static3D => 1,
            Self::Animated3D => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Model {
    pub pool: PoolId,
    pub id: u32,
    pub kind: ModelKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Font {
    pub pool: PoolId,
    pub id: u32,
}
