//! Resource pools: isolated sets of assets staged on the CPU and uploaded together.

use std::path::Path;
use crate::renderer::backend::{
    Backend, BufferDesc, BufferId, BufferUsage, Format, TextureDesc, TextureId, TransferCopy,
};
use crate::renderer::error::{RenderError, RenderResult};
use crate::renderer::resources::animation::ModelAnimation;
use crate::renderer::resources::font::BitmapFont;
use crate::renderer::resources::import::{SceneDescription, SceneImporter};
use crate::renderer::resources::model::{pack_models, GpuModel, PoolGeometry, StagedModel};
use crate::renderer::resources::texture::{decode_rgba, TextureLoader};
use crate::renderer::resources::{Font, Model, ModelKind, PoolId, Texture};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Accepting loads
    Staging,
    /// Uploaded, read-only
    Resident,
}

#[derive(Debug)]
pub struct ResourcePool {
    id: PoolId,
    state: PoolState,
    textures: TextureLoader,
    staged_models: Vec<StagedModel>,
    models: Vec<GpuModel>,
    fonts: Vec<BitmapFont>,
    geometry: Option<PoolGeometry>,
    /// Whether the next frame resource build includes this pool
    pub use_gpu_resources: bool,
}

impl ResourcePool {
    pub(crate) fn new(id: PoolId, max_textures: usize) -> Self {
        Self {
            id,
            state: PoolState::Staging,
            textures: TextureLoader::new(max_textures),
            staged_models: Vec::new(),
            models: Vec::new(),
            fonts: Vec::new(),
            geometry: None,
            use_gpu_resources: true,
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    fn ensure_staging(&self) -> RenderResult<()> {
        match self.state {
            PoolState::Staging => Ok(()),
            PoolState::Resident => Err(RenderError::AlreadyFinalized(self.id)),
        }
    }

    pub fn load_texture(&mut self, path: &Path) -> RenderResult<Texture> {
        self.ensure_staging()?;
        self.textures.load(self.id, path)
    }

    pub fn load_texture_from_rgba(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        rgba: Vec<u8>,
    ) -> RenderResult<Texture> {
        self.ensure_staging()?;
        self.textures.load_rgba(self.id, name, width, height, rgba)
    }

    pub fn load_font(&mut self, path: &Path) -> RenderResult<Font> {
        self.ensure_staging()?;
        let font = match decode_rgba(path) {
            Ok(atlas) => {
                let key = path.to_string_lossy();
                let texture = self.textures.load_rgba(
                    self.id,
                    &key,
                    atlas.width,
                    atlas.height,
                    atlas.rgba.clone(),
                )?;
                BitmapFont::from_atlas(texture.index, &atlas)
            }
            Err(e) => {
                log::warn!("{e}, font will draw nothing");
                BitmapFont::blank(self.textures.fallback(self.id)?.index)
            }
        };
        self.fonts.push(font);
        Ok(Font {
            pool: self.id,
            id: self.fonts.len() as u32 - 1,
        })
    }

    /// Imports `path` and stages it as `kind`, returning the clips of animated models
    pub fn load_model(
        &mut self,
        kind: ModelKind,
        path: &Path,
        importer: &dyn SceneImporter,
    ) -> RenderResult<(Model, Vec<ModelAnimation>)> {
        self.ensure_staging()?;
        match importer.import(path) {
            Ok(scene) => self.load_model_from_scene(kind, &scene),
            Err(e) => {
                log::warn!("{e}, model will draw nothing");
                Ok((self.stage_model(StagedModel::empty(kind)), Vec::new()))
            }
        }
    }

    pub fn load_model_from_scene(
        &mut self,
        kind: ModelKind,
        scene: &SceneDescription,
    ) -> RenderResult<(Model, Vec<ModelAnimation>)> {
        self.ensure_staging()?;
        let mut animations = Vec::new();
        let kind = match (kind, &scene.skeleton) {
            (ModelKind::Animated3D, Some(skeleton)) if !scene.animations.is_empty() => {
                animations = scene
                    .animations
                    .iter()
                    .map(|clip| ModelAnimation::new(skeleton.clone(), clip.clone()))
                    .collect();
                ModelKind::Animated3D
            }
            (ModelKind::Animated3D, _) => {
                log::warn!("model has no animations, loading it as a static 3D model");
                ModelKind::Static3D
            }
            (kind, _) => kind,
        };
        let staged = StagedModel::from_scene(kind, scene, self.id, &mut self.textures)?;
        Ok((self.stage_model(staged), animations))
    }

    fn stage_model(&mut self, model: StagedModel) -> Model {
        let kind = model.kind;
        self.staged_models.push(model);
        Model {
            pool: self.id,
            id: self.staged_models.len() as u32 - 1,
            kind,
        }
    }

    pub fn model_count(&self) -> usize {
        self.staged_models.len().max(self.models.len())
    }

    pub fn texture_count(&self) -> usize {
        self.textures.count()
    }

    /// Uploads every staged asset with one staging buffer and one blocking transfer,
    /// then drops the CPU copies. Partially created objects are destroyed on failure.
    pub fn upload<B: Backend>(&mut self, backend: &mut B) -> RenderResult<()> {
        self.ensure_staging()?;
        let packed = pack_models(&self.staged_models);
        let texture_bytes: u64 = self.textures.staged().iter().map(|t| t.rgba.len() as u64).sum();
        let total = packed.bytes.len() as u64 + texture_bytes;

        if total == 0 {
            log::debug!("pool {:?} has nothing to upload", self.id);
            self.finish_upload(packed.models, None, Vec::new());
            return Ok(());
        }

        let mut created = UploadObjects::default();
        match self.upload_objects(backend, &packed.bytes, total, &mut created) {
            Ok(()) => {
                if let Some(staging) = created.staging.take() {
                    backend.destroy_buffer(staging);
                }
                let geometry = created.geometry.map(|buffer| PoolGeometry {
                    buffer,
                    vertex_offsets: packed.vertex_offsets,
                    index_offset: packed.index_offset,
                });
                log::debug!(
                    "pool {:?} uploaded: {} models, {} textures, {} bytes",
                    self.id,
                    packed.models.len(),
                    created.textures.len(),
                    total
                );
                self.finish_upload(packed.models, geometry, created.textures);
                Ok(())
            }
            Err(e) => {
                created.destroy(backend);
                Err(e)
            }
        }
    }

    fn upload_objects<B: Backend>(
        &self,
        backend: &mut B,
        geometry: &[u8],
        total: u64,
        created: &mut UploadObjects,
    ) -> RenderResult<()> {
        let staging = backend.create_buffer(&BufferDesc {
            label: format!("pool {} staging", self.id.index),
            size: total,
            usage: BufferUsage::Staging,
        })?;
        created.staging = Some(staging);

        let mut copies = Vec::with_capacity(self.textures.staged().len() + 1);
        if !geometry.is_empty() {
            backend.write_buffer(staging, 0, geometry)?;
            let buffer = backend.create_buffer(&BufferDesc {
                label: format!("pool {} geometry", self.id.index),
                size: geometry.len() as u64,
                usage: BufferUsage::Geometry,
            })?;
            created.geometry = Some(buffer);
            copies.push(TransferCopy::Buffer {
                src_offset: 0,
                dst: buffer,
                dst_offset: 0,
                size: geometry.len() as u64,
            });
        }

        let mut offset = geometry.len() as u64;
        for (i, texture) in self.textures.staged().iter().enumerate() {
            backend.write_buffer(staging, offset, &texture.rgba)?;
            let id = backend.create_texture(&TextureDesc {
                label: format!("pool {} texture {}", self.id.index, i),
                width: texture.width,
                height: texture.height,
                format: Format::Rgba8Srgb,
            })?;
            created.textures.push(id);
            copies.push(TransferCopy::Texture { src_offset: offset, dst: id });
            offset += texture.rgba.len() as u64;
        }

        backend.submit_transfer(staging, &copies)?;
        Ok(())
    }

    fn finish_upload(
        &mut self,
        models: Vec<GpuModel>,
        geometry: Option<PoolGeometry>,
        textures: Vec<TextureId>,
    ) {
        self.staged_models.clear();
        self.models = models;
        self.geometry = geometry;
        self.textures.make_resident(textures);
        self.state = PoolState::Resident;
    }

    pub fn model(&self, id: u32) -> Option<&GpuModel> {
        self.models.get(id as usize)
    }

    pub fn font(&self, id: u32) -> Option<&BitmapFont> {
        self.fonts.get(id as usize)
    }

    pub fn geometry(&self) -> Option<&PoolGeometry> {
        self.geometry.as_ref()
    }

    /// Device textures in pool-local index order, empty until resident
    pub fn texture_ids(&self) -> Vec<TextureId> {
        self.textures.resident().iter().map(|t| t.id).collect()
    }

    pub fn texture_size(&self, index: u32) -> Option<(u32, u32)> {
        self.textures.get(index).map(|t| (t.width, t.height))
    }

    pub fn destroy<B: Backend>(self, backend: &mut B) {
        if let Some(geometry) = self.geometry {
            backend.destroy_buffer(geometry.buffer);
        }
        for texture in self.textures.resident() {
            backend.destroy_texture(texture.id);
        }
    }
}

#[derive(Default)]
struct UploadObjects {
    staging: Option<BufferId>,
    geometry: Option<BufferId>,
    textures: Vec<TextureId>,
}

impl UploadObjects {
    fn destroy<B: Backend>(self, backend: &mut B) {
        if let Some(staging) = self.staging {
            backend.destroy_buffer(staging);
        }
        if let Some(geometry) = self.geometry {
            backend.destroy_buffer(geometry);
        }
        for texture in self.textures {
            backend.destroy_texture(texture);
        }
    }
}

struct Slot {
    generation: u32,
    pool: Option<ResourcePool>,
}

/// Owns every pool. Slots of destroyed pools are reused with a new generation.
pub struct PoolArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    max_textures: usize,
}

impl PoolArena {
    pub fn new(max_textures: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            max_textures,
        }
    }

    pub fn create(&mut self) -> PoolId {
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation += 1;
                PoolId { index, generation: slot.generation }
            }
            None => {
                self.slots.push(Slot { generation: 0, pool: None });
                PoolId {
                    index: self.slots.len() as u32 - 1,
                    generation: 0,
                }
            }
        };
        self.slots[id.index as usize].pool = Some(ResourcePool::new(id, self.max_textures));
        log::debug!("created resource pool {:?}", id);
        id
    }

    fn slot(&self, id: PoolId) -> RenderResult<&Slot> {
        let slot = self
            .slots
            .get(id.index as usize)
            .ok_or(RenderError::InvalidPool(id))?;
        if slot.generation != id.generation || slot.pool.is_none() {
            return Err(RenderError::StalePool(id));
        }
        Ok(slot)
    }

    pub fn get(&self, id: PoolId) -> RenderResult<&ResourcePool> {
        self.slot(id)?.pool.as_ref().ok_or(RenderError::StalePool(id))
    }

    pub fn get_mut(&mut self, id: PoolId) -> RenderResult<&mut ResourcePool> {
        self.slot(id)?;
        self.slots[id.index as usize]
            .pool
            .as_mut()
            .ok_or(RenderError::StalePool(id))
    }

    /// Detaches the pool so its device objects can be destroyed
    pub fn remove(&mut self, id: PoolId) -> RenderResult<ResourcePool> {
        self.slot(id)?;
        let pool = self.slots[id.index as usize]
            .pool
            .take()
            .ok_or(RenderError::StalePool(id))?;
        self.free.push(id.index);
        Ok(pool)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourcePool> {
        self.slots.iter().filter_map(|s| s.pool.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ResourcePool> {
        self.slots.iter_mut().filter_map(|s| s.pool.as_mut())
    }

    pub fn drain(&mut self) -> Vec<ResourcePool> {
        self.free.clear();
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.pool.take().map(|p| (i, p)))
            .map(|(i, p)| {
                self.free.push(i as u32);
                p
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::headless::{HeadlessBackend, ObjectKind};
    use crate::renderer::backend::Extent2D;
    use crate::renderer::error::DeviceError;
    use crate::renderer::resources::import::{FileImporter, MeshDescription};

    fn triangle_scene() -> SceneDescription {
        SceneDescription {
            meshes: vec![MeshDescription {
                positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                indices: vec![0, 1, 2],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn stale_handles_are_detected() {
        let mut arena = PoolArena::new(16);
        let first = arena.create();
        arena.remove(first).unwrap();
        let second = arena.create();

        assert_eq!(second.index, first.index);
        assert_ne!(second.generation, first.generation);
        assert!(matches!(arena.get(first), Err(RenderError::StalePool(_))));
        assert!(arena.get(second).is_ok());
        let bogus = PoolId { index: 9, generation: 0 };
        assert!(matches!(arena.get(bogus), Err(RenderError::InvalidPool(_))));
    }

    #[test]
    fn loading_after_upload_fails() {
        let mut backend = HeadlessBackend::new(Extent2D::new(64, 64));
        let mut arena = PoolArena::new(16);
        let id = arena.create();
        let pool = arena.get_mut(id).unwrap();
        pool.load_model_from_scene(ModelKind::Static3D, &triangle_scene()).unwrap();
        pool.upload(&mut backend).unwrap();

        assert_eq!(pool.state(), PoolState::Resident);
        assert!(matches!(
            pool.load_texture(Path::new("x.png")),
            Err(RenderError::AlreadyFinalized(p)) if p == id
        ));
        assert!(matches!(
            pool.upload(&mut backend),
            Err(RenderError::AlreadyFinalized(_))
        ));
    }

    #[test]
    fn upload_uses_one_transfer_and_frees_staging() {
        let mut backend = HeadlessBackend::new(Extent2D::new(64, 64));
        let mut arena = PoolArena::new(16);
        let id = arena.create();
        let pool = arena.get_mut(id).unwrap();
        pool.load_texture_from_rgba("red", 1, 1, vec![255, 0, 0, 255]).unwrap();
        pool.load_model_from_scene(ModelKind::Static3D, &triangle_scene()).unwrap();
        pool.upload(&mut backend).unwrap();

        assert_eq!(backend.transfers(), 1);
        assert_eq!(backend.live_count(ObjectKind::Buffer), 1);
        // the red texture plus the fallback used by the untextured mesh
        assert_eq!(backend.live_count(ObjectKind::Texture), 2);
        let ids = pool.texture_ids();
        assert_eq!(backend.texture_data(ids[0]).unwrap(), &[255, 0, 0, 255]);
        assert_eq!(pool.model(0).unwrap().meshes[0].index_count, 3);

        let pool = arena.remove(id).unwrap();
        pool.destroy(&mut backend);
        assert_eq!(backend.live_count(ObjectKind::Buffer), 0);
        assert_eq!(backend.live_count(ObjectKind::Texture), 0);
    }

    #[test]
    fn empty_pool_uploads_nothing() {
        let mut backend = HeadlessBackend::new(Extent2D::new(64, 64));
        let mut arena = PoolArena::new(16);
        let id = arena.create();
        let pool = arena.get_mut(id).unwrap();
        pool.upload(&mut backend).unwrap();

        assert_eq!(pool.model_count(), 0);
        assert!(pool.geometry().is_none());
        assert_eq!(backend.transfers(), 0);
        assert_eq!(backend.live_count(ObjectKind::Buffer), 0);
    }

    #[test]
    fn failed_upload_releases_everything() {
        let mut backend = HeadlessBackend::new(Extent2D::new(64, 64));
        let mut arena = PoolArena::new(16);
        let id = arena.create();
        let pool = arena.get_mut(id).unwrap();
        pool.load_model_from_scene(ModelKind::Static3D, &triangle_scene()).unwrap();
        // staging succeeds, the geometry buffer fails
        backend.fail_buffer_allocation_after(1);

        let result = pool.upload(&mut backend);
        assert!(matches!(
            result,
            Err(RenderError::Device(DeviceError::OutOfDeviceMemory))
        ));
        assert_eq!(pool.state(), PoolState::Staging);
        assert_eq!(backend.live_count(ObjectKind::Buffer), 0);
        assert_eq!(backend.live_count(ObjectKind::Texture), 0);
    }

    #[test]
    fn missing_model_file_stages_an_empty_model() {
        let mut arena = PoolArena::new(16);
        let id = arena.create();
        let pool = arena.get_mut(id).unwrap();
        let (model, animations) = pool
            .load_model(ModelKind::Animated3D, Path::new("missing.gltf"), &FileImporter)
            .unwrap();
        assert_eq!(model.kind, ModelKind::Animated3D);
        assert!(animations.is_empty());
        assert_eq!(pool.model_count(), 1);
    }

    #[test]
    fn animated_scene_without_clips_degrades_to_static() {
        let mut arena = PoolArena::new(16);
        let id = arena.create();
        let pool = arena.get_mut(id).unwrap();
        let (model, _) = pool
            .load_model_from_scene(ModelKind::Animated3D, &triangle_scene())
            .unwrap();
        assert_eq!(model.kind, ModelKind::Static3D);
    }
}
