use std::collections::HashMap;
use std::path::{Path, PathBuf};
use crate::renderer::backend::TextureId;
use crate::renderer::error::{AssetLoadError, RenderError, RenderResult};
use crate::renderer::resources::{PoolId, Texture};

const FALLBACK_KEY: &str = "<fallback white>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedTexture {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidentTexture {
    pub id: TextureId,
    pub width: u32,
    pub height: u32,
}

/// Decodes an image file into tightly packed RGBA8 texels
pub fn decode_rgba(path: &Path) -> Result<StagedTexture, AssetLoadError> {
    if !path.exists() {
        return Err(AssetLoadError::NotFound(path.to_path_buf()));
    }
    let image = image::open(path).map_err(|e| AssetLoadError::Decode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let image = image.to_rgba8();
    let (width, height) = image.dimensions();
    Ok(StagedTexture {
        width,
        height,
        rgba: image.into_raw(),
    })
}

/// Stages textures of one pool, deduplicated by source key
#[derive(Debug)]
pub struct TextureLoader {
    max_textures: usize,
    by_key: HashMap<PathBuf, u32>,
    staged: Vec<StagedTexture>,
    resident: Vec<ResidentTexture>,
}

impl TextureLoader {
    pub fn new(max_textures: usize) -> Self {
        Self {
            max_textures,
            by_key: HashMap::new(),
            staged: Vec::new(),
            resident: Vec::new(),
        }
    }

    /// Loads the image at `path`, or returns the texture already staged for it.
    /// Unreadable images resolve to the pool's white fallback.
    pub fn load(&mut self, pool: PoolId, path: &Path) -> RenderResult<Texture> {
        if let Some(&index) = self.by_key.get(path) {
            return Ok(Texture { pool, index });
        }
        match decode_rgba(path) {
            Ok(staged) => {
                let index = self.stage(path.to_path_buf(), staged)?;
                log::debug!("staged texture {:?} as {}", path, index);
                Ok(Texture { pool, index })
            }
            Err(e) => {
                log::warn!("{e}, using fallback texture");
                self.fallback(pool)
            }
        }
    }

    pub fn load_rgba(
        &mut self,
        pool: PoolId,
        name: &str,
        width: u32,
        height: u32,
        rgba: Vec<u8>,
    ) -> RenderResult<Texture> {
        let key = PathBuf::from(name);
        if let Some(&index) = self.by_key.get(&key) {
            return Ok(Texture { pool, index });
        }
        if width == 0 || height == 0 || rgba.len() != width as usize * height as usize * 4 {
            log::warn!(
                "texture '{name}' has {} bytes for {width}x{height} texels, using fallback texture",
                rgba.len()
            );
            return self.fallback(pool);
        }
        let index = self.stage(key, StagedTexture { width, height, rgba })?;
        Ok(Texture { pool, index })
    }

    /// 1x1 white texture, staged at most once per pool
    pub fn fallback(&mut self, pool: PoolId) -> RenderResult<Texture> {
        let key = PathBuf::from(FALLBACK_KEY);
        if let Some(&index) = self.by_key.get(&key) {
            return Ok(Texture { pool, index });
        }
        let index = self.stage(
            key,
            StagedTexture {
                width: 1,
                height: 1,
                rgba: vec![255; 4],
            },
        )?;
        Ok(Texture { pool, index })
    }

    fn stage(&mut self, key: PathBuf, texture: StagedTexture) -> RenderResult<u32> {
        if self.staged.len() >= self.max_textures {
            return Err(RenderError::TextureLimitReached(self.max_textures));
        }
        let index = self.staged.len() as u32;
        self.staged.push(texture);
        self.by_key.insert(key, index);
        Ok(index)
    }

    pub fn staged(&self) -> &[StagedTexture] {
        &self.staged
    }

    /// Moves the loader to its resident state. `ids[i]` backs texture `i`.
    pub fn make_resident(&mut self, ids: Vec<TextureId>) {
        self.resident = self
            .staged
            .drain(..)
            .zip(ids)
            .map(|(staged, id)| ResidentTexture {
                id,
                width: staged.width,
                height: staged.height,
            })
            .collect();
    }

    pub fn resident(&self) -> &[ResidentTexture] {
        &self.resident
    }

    pub fn get(&self, index: u32) -> Option<&ResidentTexture> {
        self.resident.get(index as usize)
    }

    pub fn count(&self) -> usize {
        self.staged.len().max(self.resident.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POOL: PoolId = PoolId { index: 0, generation: 0 };

    fn write_png(dir: &Path, name: &str, size: u32) -> PathBuf {
        let path = dir.join(name);
        image::RgbaImage::from_pixel(size, size, image::Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn same_path_returns_same_texture() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_png(dir.path(), "a.png", 2);
        let b = write_png(dir.path(), "b.png", 4);
        let mut loader = TextureLoader::new(8);

        let first = loader.load(POOL, &a).unwrap();
        let other = loader.load(POOL, &b).unwrap();
        let again = loader.load(POOL, &a).unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(loader.count(), 2);
        assert_eq!(loader.staged()[other.index as usize].width, 4);
        assert_eq!(loader.staged()[first.index as usize].rgba[..4], [10, 20, 30, 255]);
    }

    #[test]
    fn missing_files_share_one_fallback() {
        let mut loader = TextureLoader::new(8);
        let a = loader.load(POOL, Path::new("does/not/exist.png")).unwrap();
        let b = loader.load(POOL, Path::new("also/missing.jpg")).unwrap();
        assert_eq!(a, b);
        assert_eq!(loader.count(), 1);
        assert_eq!(loader.staged()[0].rgba, vec![255; 4]);
    }

    #[test]
    fn bad_rgba_length_falls_back() {
        let mut loader = TextureLoader::new(8);
        let tex = loader.load_rgba(POOL, "short", 2, 2, vec![0; 3]).unwrap();
        assert_eq!(loader.staged()[tex.index as usize].width, 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut loader = TextureLoader::new(1);
        loader.load_rgba(POOL, "one", 1, 1, vec![0; 4]).unwrap();
        assert!(matches!(
            loader.load_rgba(POOL, "two", 1, 1, vec![0; 4]),
            Err(RenderError::TextureLimitReached(1))
        ));
    }
}
