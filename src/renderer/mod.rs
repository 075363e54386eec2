pub mod backend;
pub mod batch;
pub mod config;
pub mod descriptors;
pub mod error;
pub mod frame;
pub mod frame_resources;
pub mod resources;
pub mod shader_data;
pub mod util;

use std::path::Path;
use glam::{Mat4, Vec2, Vec3, Vec4};
use crate::renderer::backend::{
    Backend, ClearValue, DrawIndexed, Extent2D, FrameSyncId, PipelineId,
};
use crate::renderer::batch::{BatchFlush, BatchKey, DrawBatcher, DrawPhase, FrameStats, Instance2D, PushOutcome};
use crate::renderer::config::RenderConfig;
use crate::renderer::error::{DeviceError, RenderError, RenderResult};
use crate::renderer::frame::{FrameRing, FrameStart};
use crate::renderer::frame_resources::{FrameResourceState, FrameResources, SetLayouts, TextureTable};
use crate::renderer::resources::animation::ModelAnimation;
use crate::renderer::resources::import::{FileImporter, MeshDescription, SceneDescription, SceneImporter};
use crate::renderer::resources::pool::{PoolArena, PoolState, ResourcePool};
use crate::renderer::resources::vertex;
use crate::renderer::resources::{Font, Model, ModelKind, PoolId, Texture};
use crate::renderer::shader_data::{
    Bones, DrawPushConstants, Frag2DData, Lighting, PerInstance3D, ShaderSet, TimeData,
    ViewProjection, MAX_TEXTURES,
};

/// Holds the renderer's own white texture and the quad every textured 2D draw uses
const BUILTIN_POOL: PoolId = PoolId { index: u32::MAX, generation: u32::MAX };

struct Builtin {
    pool: ResourcePool,
    quad: Model,
}

/// The frame being recorded between the first `begin_*_draw` and `end_draw`
#[derive(Debug, Clone, Copy)]
struct ActiveFrame {
    slot: usize,
    sync: FrameSyncId,
    image_index: u32,
}

#[derive(Debug, Clone, Copy)]
struct SceneUniforms {
    view_3d: Mat4,
    fov: f32,
    view_2d: Mat4,
    scale_2d: f32,
    lighting: Lighting,
    time: f32,
}

impl Default for SceneUniforms {
    fn default() -> Self {
        Self {
            view_3d: Mat4::IDENTITY,
            fov: 45.0,
            view_2d: Mat4::IDENTITY,
            scale_2d: 1.0,
            lighting: Lighting::default(),
            time: 0.0,
        }
    }
}

/// Renderer context. Owns the backend, every resource pool and the frame resources.
pub struct Renderer<B: Backend> {
    backend: B,
    config: RenderConfig,
    importer: Box<dyn SceneImporter>,

    layouts: Option<SetLayouts>,
    ring: Option<FrameRing>,
    frame_resources: FrameResources,
    builtin: Option<Builtin>,
    pools: PoolArena,
    default_pool: PoolId,
    /// Pools referenced by the current frame resources
    pools_in_use: Vec<PoolId>,

    batcher: DrawBatcher,
    frame: Option<ActiveFrame>,
    uniforms: SceneUniforms,
    rebuild_requested: bool,
    /// Set by the first `use_loaded_resources`, even when the build itself was deferred
    activated: bool,
}

impl<B: Backend> Renderer<B> {
    /// Creates the device-lifetime objects and the default pool. Frame resources are
    /// built by the first `use_loaded_resources`.
    pub fn new(backend: B, config: RenderConfig) -> RenderResult<Self> {
        let frames = config.frames_in_flight.max(1);
        let mut renderer = Self {
            backend,
            importer: Box::new(FileImporter),
            layouts: None,
            ring: None,
            frame_resources: FrameResources::new(frames),
            builtin: None,
            // slot 0 of the global table is the white texture
            pools: PoolArena::new(MAX_TEXTURES as usize - 1),
            default_pool: BUILTIN_POOL,
            pools_in_use: Vec::new(),
            batcher: DrawBatcher::new(),
            frame: None,
            uniforms: SceneUniforms::default(),
            rebuild_requested: false,
            activated: false,
            config,
        };
        // Drop releases whatever was created if a later step fails
        renderer.layouts = Some(SetLayouts::new(&mut renderer.backend)?);
        renderer.ring = Some(FrameRing::new(&mut renderer.backend, frames)?);
        renderer.builtin = Some(Self::create_builtin(&mut renderer.backend)?);
        renderer.default_pool = renderer.pools.create();
        log::info!("renderer created with {frames} frames in flight");
        Ok(renderer)
    }

    fn create_builtin(backend: &mut B) -> RenderResult<Builtin> {
        let mut pool = ResourcePool::new(BUILTIN_POOL, 1);
        let (vertices, indices) = vertex::quad();
        let scene = SceneDescription {
            meshes: vec![MeshDescription {
                positions: vertices.iter().map(|v| v.position.to_array()).collect(),
                tex_coords: vertices.iter().map(|v| v.texcoord.to_array()).collect(),
                indices,
                ..Default::default()
            }],
            ..Default::default()
        };
        let (quad, _) = pool.load_model_from_scene(ModelKind::Flat2D, &scene)?;
        pool.upload(backend)?;
        Ok(Builtin { pool, quad })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn set_scene_importer(&mut self, importer: Box<dyn SceneImporter>) {
        self.importer = importer;
    }

    pub fn frame_resource_state(&self) -> FrameResourceState {
        self.frame_resources.state()
    }

    /// Counters of the last finished frame, or of the frame being recorded
    pub fn frame_stats(&self) -> FrameStats {
        self.batcher.stats()
    }

    // Resource pools

    pub fn default_pool(&self) -> PoolId {
        self.default_pool
    }

    pub fn create_resource_pool(&mut self) -> PoolId {
        self.pools.create()
    }

    pub fn resource_pool_state(&self, pool: PoolId) -> RenderResult<PoolState> {
        Ok(self.pools.get(pool)?.state())
    }

    /// Destroys `pool`. If the current frame resources reference it they are torn
    /// down first and rebuilt without it.
    pub fn destroy_resource_pool(&mut self, pool: PoolId) -> RenderResult<()> {
        self.ensure_no_frame("destroy_resource_pool")?;
        self.pools.get(pool)?;
        if self.pools_in_use.contains(&pool) && self.frame_resources.is_ready() {
            log::debug!("pool {pool:?} is in use, rebuilding frame resources without it");
            self.frame_resources.release(&mut self.backend)?;
            self.pools.remove(pool)?.destroy(&mut self.backend);
            self.pools_in_use.retain(|p| *p != pool);
            self.rebuild_frame_resources(false)
        } else {
            self.pools.remove(pool)?.destroy(&mut self.backend);
            self.pools_in_use.retain(|p| *p != pool);
            Ok(())
        }
    }

    /// Whether the next `use_loaded_resources` includes `pool`
    pub fn set_resource_pool_in_use(&mut self, pool: PoolId, in_use: bool) -> RenderResult<()> {
        self.pools.get_mut(pool)?.use_gpu_resources = in_use;
        Ok(())
    }

    pub fn model_count(&self, pool: PoolId) -> RenderResult<usize> {
        Ok(self.pools.get(pool)?.model_count())
    }

    pub fn texture_count(&self, pool: PoolId) -> RenderResult<usize> {
        Ok(self.pools.get(pool)?.texture_count())
    }

    // Loading

    pub fn load_texture(&mut self, path: impl AsRef<Path>) -> RenderResult<Texture> {
        self.load_texture_in(self.default_pool, path)
    }

    pub fn load_texture_in(&mut self, pool: PoolId, path: impl AsRef<Path>) -> RenderResult<Texture> {
        self.pools.get_mut(pool)?.load_texture(path.as_ref())
    }

    pub fn load_texture_from_rgba(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        rgba: Vec<u8>,
    ) -> RenderResult<Texture> {
        self.load_texture_from_rgba_in(self.default_pool, name, width, height, rgba)
    }

    pub fn load_texture_from_rgba_in(
        &mut self,
        pool: PoolId,
        name: &str,
        width: u32,
        height: u32,
        rgba: Vec<u8>,
    ) -> RenderResult<Texture> {
        self.pools
            .get_mut(pool)?
            .load_texture_from_rgba(name, width, height, rgba)
    }

    pub fn load_font(&mut self, path: impl AsRef<Path>) -> RenderResult<Font> {
        self.load_font_in(self.default_pool, path)
    }

    pub fn load_font_in(&mut self, pool: PoolId, path: impl AsRef<Path>) -> RenderResult<Font> {
        self.pools.get_mut(pool)?.load_font(path.as_ref())
    }

    pub fn load_2d_model(&mut self, path: impl AsRef<Path>) -> RenderResult<Model> {
        Ok(self.load_model_in(self.default_pool, ModelKind::Flat2D, path)?.0)
    }

    pub fn load_3d_model(&mut self, path: impl AsRef<Path>) -> RenderResult<Model> {
        Ok(self.load_model_in(self.default_pool, ModelKind::Static3D, path)?.0)
    }

    /// Loads a skinned model with one [`ModelAnimation`] per clip in the file.
    /// Files without animations load as static 3D models.
    pub fn load_animated_model(
        &mut self,
        path: impl AsRef<Path>,
    ) -> RenderResult<(Model, Vec<ModelAnimation>)> {
        self.load_model_in(self.default_pool, ModelKind::Animated3D, path)
    }

    pub fn load_model_in(
        &mut self,
        pool: PoolId,
        kind: ModelKind,
        path: impl AsRef<Path>,
    ) -> RenderResult<(Model, Vec<ModelAnimation>)> {
        let importer = self.importer.as_ref();
        self.pools
            .get_mut(pool)?
            .load_model(kind, path.as_ref(), importer)
    }

    pub fn load_2d_model_from_scene(&mut self, scene: &SceneDescription) -> RenderResult<Model> {
        Ok(self.load_model_from_scene_in(self.default_pool, ModelKind::Flat2D, scene)?.0)
    }

    pub fn load_3d_model_from_scene(&mut self, scene: &SceneDescription) -> RenderResult<Model> {
        Ok(self.load_model_from_scene_in(self.default_pool, ModelKind::Static3D, scene)?.0)
    }

    pub fn load_animated_model_from_scene(
        &mut self,
        scene: &SceneDescription,
    ) -> RenderResult<(Model, Vec<ModelAnimation>)> {
        self.load_model_from_scene_in(self.default_pool, ModelKind::Animated3D, scene)
    }

    pub fn load_model_from_scene_in(
        &mut self,
        pool: PoolId,
        kind: ModelKind,
        scene: &SceneDescription,
    ) -> RenderResult<(Model, Vec<ModelAnimation>)> {
        self.pools.get_mut(pool)?.load_model_from_scene(kind, scene)
    }

    /// Uploads every pool that is still staging
    pub fn load_resources_to_gpu(&mut self) -> RenderResult<()> {
        for pool in self.pools.iter_mut() {
            if pool.state() == PoolState::Staging {
                pool.upload(&mut self.backend)?;
            }
        }
        Ok(())
    }

    pub fn load_pool_to_gpu(&mut self, pool: PoolId) -> RenderResult<()> {
        self.pools.get_mut(pool)?.upload(&mut self.backend)
    }

    /// Builds the frame resources over every resident pool marked in use
    pub fn use_loaded_resources(&mut self) -> RenderResult<()> {
        self.ensure_no_frame("use_loaded_resources")?;
        self.activated = true;
        match self.rebuild_frame_resources(false) {
            Err(RenderError::ZeroExtent) => {
                log::debug!("surface has no area, frame resources are built on the first frame");
                self.rebuild_requested = true;
                Err(RenderError::ZeroExtent)
            }
            result => result,
        }
    }

    fn rebuild_frame_resources(&mut self, surface_invalidated: bool) -> RenderResult<()> {
        if self.layouts.is_none() {
            return Err(RenderError::NotReady);
        }
        let Some(white) = self
            .builtin
            .as_ref()
            .and_then(|b| b.pool.texture_ids().first().copied())
        else {
            return Err(RenderError::NotReady);
        };

        let mut in_use = Vec::new();
        let mut textures = Vec::new();
        for pool in self.pools.iter() {
            match (pool.use_gpu_resources, pool.state()) {
                (true, PoolState::Resident) => {
                    in_use.push(pool.id());
                    textures.push((pool.id(), pool.texture_ids()));
                }
                (true, PoolState::Staging) => {
                    log::warn!("pool {:?} is in use but was never loaded to the gpu", pool.id());
                }
                (false, _) => {}
            }
        }
        let table = TextureTable::build(white, &textures)?;
        self.resize_ring()?;

        let Some(layouts) = self.layouts.as_ref() else {
            return Err(RenderError::NotReady);
        };
        self.frame_resources.rebuild(
            &mut self.backend,
            layouts,
            &self.config,
            table,
            surface_invalidated,
        )?;
        self.pools_in_use = in_use;
        self.rebuild_requested = false;
        Ok(())
    }

    /// Recreates the frame ring when `frames_in_flight` changed. The per-frame objects
    /// follow in the rebuild that comes next.
    fn resize_ring(&mut self) -> RenderResult<()> {
        let frames = self.config.frames_in_flight.max(1);
        let Some(ring) = self.ring.take_if(|ring| ring.frame_count() != frames) else {
            return Ok(());
        };
        log::debug!("frames in flight {} -> {frames}", ring.frame_count());
        let idle = self.backend.wait_idle();
        ring.destroy(&mut self.backend);
        idle?;
        self.ring = Some(FrameRing::new(&mut self.backend, frames)?);
        self.frame_resources.set_frame_count(frames);
        Ok(())
    }

    // Configuration

    pub fn render_config(&self) -> &RenderConfig {
        &self.config
    }

    /// Replaces the config. Frame resources are rebuilt before the next frame.
    pub fn set_render_config(&mut self, config: RenderConfig) {
        if config != self.config {
            self.config = config;
            self.rebuild_requested = true;
        }
    }

    pub fn set_target_resolution(&mut self, resolution: Option<[u32; 2]>) {
        if resolution != self.config.target_resolution {
            self.config.target_resolution = resolution;
            self.rebuild_requested = true;
        }
    }

    /// Size of the offscreen target the scene is drawn into
    pub fn target_resolution(&self) -> Extent2D {
        match self.config.target_resolution {
            Some([w, h]) if w > 0 && h > 0 => Extent2D::new(w, h),
            _ if self.frame_resources.is_ready() => self.frame_resources.offscreen_extent(),
            _ => self.backend.surface_extent(),
        }
    }

    pub fn set_vsync(&mut self, vsync: bool) {
        if vsync != self.config.vsync {
            self.config.vsync = vsync;
            self.rebuild_requested = true;
        }
    }

    pub fn vsync(&self) -> bool {
        self.config.vsync
    }

    /// Notifies the renderer that the window changed size
    pub fn framebuffer_resize(&mut self) {
        self.rebuild_requested = true;
    }

    // Per-frame shader data

    pub fn set_3d_view_matrix_and_fov(&mut self, view: Mat4, fov_deg: f32, camera_position: Vec3) {
        self.uniforms.view_3d = view;
        self.uniforms.fov = fov_deg;
        self.uniforms.lighting.cam_pos = camera_position.extend(1.0);
    }

    pub fn set_2d_view_matrix_and_scale(&mut self, view: Mat4, scale: f32) {
        self.uniforms.view_2d = view;
        self.uniforms.scale_2d = scale;
    }

    pub fn set_light_direction(&mut self, direction: Vec3) {
        self.uniforms.lighting.direction = direction.extend(0.0);
    }

    pub fn set_time(&mut self, time: f32) {
        self.uniforms.time = time;
    }

    // Drawing

    pub fn begin_3d_draw(&mut self) -> RenderResult<()> {
        self.begin_phase(DrawPhase::Draw3D)
    }

    pub fn begin_anim_3d_draw(&mut self) -> RenderResult<()> {
        self.begin_phase(DrawPhase::DrawAnim3D)
    }

    pub fn begin_2d_draw(&mut self) -> RenderResult<()> {
        self.begin_phase(DrawPhase::Draw2D)
    }

    fn begin_phase(&mut self, phase: DrawPhase) -> RenderResult<()> {
        if self.frame.is_none() {
            self.start_frame()?;
        }
        if let Some(flush) = self.batcher.begin_phase(phase) {
            self.record_flush(&flush)?;
        }
        self.bind_phase(phase)
    }

    /// Waits for the next ring slot, acquires an image and begins the offscreen pass.
    /// A surface reported out of date is rebuilt once before giving up.
    fn start_frame(&mut self) -> RenderResult<()> {
        if !self.activated {
            return Err(RenderError::NotReady);
        }
        if self.rebuild_requested || !self.frame_resources.is_ready() {
            self.rebuild_frame_resources(false)?;
        }

        let mut retried = false;
        let started = loop {
            let (Some(ring), Some(swapchain)) = (self.ring.as_mut(), self.frame_resources.swapchain())
            else {
                return Err(RenderError::NotReady);
            };
            match ring.start_frame(&mut self.backend, swapchain)? {
                FrameStart::Ready { slot, frame, image_index, suboptimal } => {
                    if suboptimal {
                        log::warn!("swapchain is suboptimal, rebuilding after this frame");
                        self.rebuild_requested = true;
                    }
                    break ActiveFrame { slot, sync: frame, image_index };
                }
                FrameStart::SurfaceInvalidated if !retried => {
                    log::info!("surface out of date on acquire, rebuilding");
                    retried = true;
                    self.rebuild_frame_resources(true)?;
                }
                FrameStart::SurfaceInvalidated => {
                    return Err(RenderError::Device(DeviceError::SurfaceLost));
                }
            }
        };

        self.batcher.begin_frame();
        self.frame = Some(started);
        self.write_frame_uniforms(started.slot)?;

        let (Some((offscreen, _)), Some(framebuffer)) = (
            self.frame_resources.render_passes(),
            self.frame_resources.offscreen_framebuffer(started.slot),
        ) else {
            return Err(RenderError::NotReady);
        };
        let colour = ClearValue::Colour(self.config.clear_colour);
        let mut clear = vec![colour, ClearValue::Depth(1.0)];
        if self.frame_resources.samples() > 1 {
            clear.push(colour);
        }
        self.backend.cmd_begin_render_pass(
            started.sync,
            offscreen,
            framebuffer,
            self.frame_resources.offscreen_extent(),
            &clear,
        );
        Ok(())
    }

    fn write_frame_uniforms(&mut self, slot: usize) -> RenderResult<()> {
        let Some(buffer) = self.frame_resources.shader_buffer() else {
            return Err(RenderError::NotReady);
        };
        let extent = self.frame_resources.offscreen_extent();
        let u = &self.uniforms;
        let vp_3d = ViewProjection {
            view: u.view_3d,
            proj: util::perspective(u.fov, extent, self.config.depth_range_3d),
        };
        let vp_2d = ViewProjection {
            view: u.view_2d,
            proj: util::orthographic(extent, u.scale_2d, self.config.depth_range_2d),
        };
        let backend = &mut self.backend;
        buffer.store(backend, ShaderSet::ViewProjection3D.index(), 0, slot, &vp_3d, 0, 0)?;
        buffer.store(backend, ShaderSet::ViewProjection3D.index(), 1, slot, &TimeData::new(u.time), 0, 0)?;
        buffer.store(backend, ShaderSet::ViewProjection2D.index(), 0, slot, &vp_2d, 0, 0)?;
        buffer.store(backend, ShaderSet::Lighting.index(), 0, slot, &u.lighting, 0, 0)?;
        buffer.store(
            backend,
            ShaderSet::OffscreenTransform.index(),
            0,
            slot,
            &self.frame_resources.offscreen_transform(),
            0,
            0,
        )?;
        Ok(())
    }

    /// Binds the pipeline of `phase` and the sets that stay fixed for the whole phase
    fn bind_phase(&mut self, phase: DrawPhase) -> RenderResult<()> {
        let frame = self.active_frame()?;
        let (Some(pipelines), Some(sets)) =
            (self.frame_resources.pipelines(), self.frame_resources.descriptor_sets())
        else {
            return Err(RenderError::NotReady);
        };
        let (pipeline, fixed): (PipelineId, &[(u32, ShaderSet)]) = match phase {
            DrawPhase::Idle => return Ok(()),
            DrawPhase::Draw3D => (
                pipelines.static_3d,
                &[
                    (0, ShaderSet::ViewProjection3D),
                    (2, ShaderSet::Empty),
                    (3, ShaderSet::Textures),
                    (4, ShaderSet::Lighting),
                ],
            ),
            DrawPhase::DrawAnim3D => (
                pipelines.animated_3d,
                &[
                    (0, ShaderSet::ViewProjection3D),
                    (3, ShaderSet::Textures),
                    (4, ShaderSet::Lighting),
                ],
            ),
            DrawPhase::Draw2D => (
                pipelines.flat,
                &[(0, ShaderSet::ViewProjection2D), (2, ShaderSet::Textures)],
            ),
        };
        self.backend.cmd_bind_pipeline(frame.sync, pipeline);
        for (index, set) in fixed {
            self.backend.cmd_bind_descriptor_set(
                frame.sync,
                pipeline,
                *index,
                sets.get(set.index(), frame.slot),
                &[],
            );
        }
        Ok(())
    }

    fn active_frame(&self) -> RenderResult<ActiveFrame> {
        self.frame.ok_or(RenderError::DrawNotStarted)
    }

    fn ensure_phase(&self, phases: &[DrawPhase], operation: &'static str) -> RenderResult<()> {
        if !self.frame_resources.is_ready() {
            return Err(RenderError::NotReady);
        }
        if self.frame.is_none() {
            return Err(RenderError::DrawNotStarted);
        }
        if !phases.contains(&self.batcher.phase()) {
            return Err(RenderError::WrongDrawPhase { operation });
        }
        Ok(())
    }

    fn ensure_no_frame(&self, operation: &'static str) -> RenderResult<()> {
        match self.frame {
            Some(_) => Err(RenderError::WrongDrawPhase { operation }),
            None => Ok(()),
        }
    }

    fn pool(&self, id: PoolId) -> RenderResult<&ResourcePool> {
        match &self.builtin {
            Some(builtin) if id == BUILTIN_POOL => Ok(&builtin.pool),
            _ => self.pools.get(id),
        }
    }

    fn texture_slot(&self, pool: PoolId, index: u32) -> RenderResult<u32> {
        self.frame_resources
            .textures()
            .base(pool)
            .map(|base| base + index)
            .ok_or(RenderError::PoolNotResident(pool))
    }

    /// Draws `model` with `transform`. In a 3D phase `colour` tints every mesh, a zero
    /// colour keeps each mesh's own diffuse colour. In the 2D phase the model is drawn
    /// with the texture of its first mesh.
    pub fn draw_model(&mut self, model: Model, colour: Vec4, transform: Mat4) -> RenderResult<()> {
        self.ensure_phase(&[DrawPhase::Draw3D, DrawPhase::Draw2D], "draw_model")?;
        let pool = self.pool(model.pool)?;
        if !self.pools_in_use.contains(&model.pool) {
            return Err(RenderError::PoolNotResident(model.pool));
        }
        let outcome = match (self.batcher.phase(), model.kind) {
            (DrawPhase::Draw3D, ModelKind::Static3D) => {
                let instance = PerInstance3D {
                    model: transform,
                    normal: util::normal_matrix(transform),
                };
                self.batcher.push_model(BatchKey::Model { model, colour }, instance)
            }
            (DrawPhase::Draw2D, ModelKind::Flat2D) => {
                let texture = pool
                    .model(model.id)
                    .and_then(|m| m.meshes.first())
                    .map_or(0, |mesh| mesh.texture);
                let slot = self.texture_slot(model.pool, texture)?;
                let frag = Frag2DData::new(colour, Vec4::new(0.0, 0.0, 1.0, 1.0), slot);
                self.batcher.push_2d(BatchKey::Model2D(model), Instance2D { model: transform, frag })
            }
            _ => {
                return Err(RenderError::WrongDrawPhase {
                    operation: "draw_model with a model of another kind",
                });
            }
        };
        self.record_outcome(outcome)
    }

    /// Draws an animated model in the pose last evaluated by `animation.update`
    pub fn draw_anim_model(
        &mut self,
        model: Model,
        colour: Vec4,
        transform: Mat4,
        animation: &ModelAnimation,
    ) -> RenderResult<()> {
        self.ensure_phase(&[DrawPhase::DrawAnim3D], "draw_anim_model")?;
        self.pool(model.pool)?;
        if model.kind != ModelKind::Animated3D {
            return Err(RenderError::WrongDrawPhase {
                operation: "draw_anim_model with a model that is not animated",
            });
        }
        if !self.pools_in_use.contains(&model.pool) {
            return Err(RenderError::PoolNotResident(model.pool));
        }
        let frame = self.active_frame()?;
        let instance = PerInstance3D {
            model: transform,
            normal: util::normal_matrix(transform),
        };
        let (outcome, bones_slot) = self.batcher.push_anim(BatchKey::Model { model, colour }, instance);
        if let PushOutcome::Queued(_) = outcome {
            let mut bones = Bones::default();
            for (dst, src) in bones.matrices.iter_mut().zip(animation.current_bones()) {
                *dst = *src;
            }
            let Some(buffer) = self.frame_resources.shader_buffer() else {
                return Err(RenderError::NotReady);
            };
            buffer.store(
                &mut self.backend,
                ShaderSet::Bones.index(),
                0,
                frame.slot,
                &bones,
                0,
                bones_slot,
            )?;
        }
        self.record_outcome(outcome)
    }

    pub fn draw_quad(&mut self, texture: Texture, transform: Mat4) -> RenderResult<()> {
        self.draw_quad_tinted(texture, transform, Vec4::ONE)
    }

    pub fn draw_quad_tinted(&mut self, texture: Texture, transform: Mat4, colour: Vec4) -> RenderResult<()> {
        self.push_quad(texture, transform, colour, Vec4::new(0.0, 0.0, 1.0, 1.0))
    }

    /// Draws the pixel `region` `(x, y, width, height)` of `texture`
    pub fn draw_quad_region(
        &mut self,
        texture: Texture,
        transform: Mat4,
        colour: Vec4,
        region: Vec4,
    ) -> RenderResult<()> {
        let (w, h) = self
            .pool(texture.pool)?
            .texture_size(texture.index)
            .ok_or(RenderError::PoolNotResident(texture.pool))?;
        let uv = util::texture_region(Vec2::new(w as f32, h as f32), region);
        self.push_quad(texture, transform, colour, uv)
    }

    fn push_quad(&mut self, texture: Texture, transform: Mat4, colour: Vec4, uv: Vec4) -> RenderResult<()> {
        self.ensure_phase(&[DrawPhase::Draw2D], "draw_quad")?;
        self.pool(texture.pool)?;
        let slot = self.texture_slot(texture.pool, texture.index)?;
        let instance = Instance2D {
            model: transform,
            frag: Frag2DData::new(colour, uv, slot),
        };
        let outcome = self.batcher.push_2d(BatchKey::Quad, instance);
        self.record_outcome(outcome)
    }

    /// Draws `text` with its top left corner at `position`, `size` pixels high
    #[allow(clippy::too_many_arguments)]
    pub fn draw_string(
        &mut self,
        font: Font,
        text: &str,
        position: Vec2,
        size: f32,
        depth: f32,
        colour: Vec4,
        rotate: f32,
    ) -> RenderResult<()> {
        self.ensure_phase(&[DrawPhase::Draw2D], "draw_string")?;
        let pool = self.pool(font.pool)?;
        let Some(bitmap) = pool.font(font.id) else {
            return Err(RenderError::InvalidPool(font.pool));
        };
        let texture = Texture { pool: font.pool, index: bitmap.texture };
        let glyphs = bitmap.layout(text);
        for glyph in glyphs {
            let rect = Vec4::new(
                position.x + glyph.offset.x * size,
                position.y + glyph.offset.y * size,
                glyph.size.x * size,
                glyph.size.y * size,
            );
            self.push_quad(texture, util::rect_matrix(rect, rotate, depth), colour, glyph.region)?;
        }
        Ok(())
    }

    /// Width of `text` drawn `size` pixels high
    pub fn measure_string(&self, font: Font, text: &str, size: f32) -> RenderResult<f32> {
        let bitmap = self
            .pool(font.pool)?
            .font(font.id)
            .ok_or(RenderError::InvalidPool(font.pool))?;
        Ok(bitmap.measure(text) * size)
    }

    fn record_outcome(&mut self, outcome: PushOutcome) -> RenderResult<()> {
        if let PushOutcome::Queued(flushes) = outcome {
            for flush in &flushes {
                self.record_flush(flush)?;
            }
        }
        Ok(())
    }

    /// Records one instanced draw per mesh of the flushed model
    fn record_flush(&mut self, flush: &BatchFlush) -> RenderResult<()> {
        let frame = self.active_frame()?;
        let (Some(pipelines), Some(sets), Some(buffer)) = (
            self.frame_resources.pipelines(),
            self.frame_resources.descriptor_sets(),
            self.frame_resources.shader_buffer(),
        ) else {
            return Err(RenderError::NotReady);
        };

        let (pipeline, model, colour) = match (flush.phase, flush.key) {
            (DrawPhase::Draw3D, BatchKey::Model { model, colour }) => (pipelines.static_3d, model, colour),
            (DrawPhase::DrawAnim3D, BatchKey::Model { model, colour }) => (pipelines.animated_3d, model, colour),
            (DrawPhase::Draw2D, BatchKey::Model2D(model)) => (pipelines.flat, model, Vec4::ONE),
            (DrawPhase::Draw2D, BatchKey::Quad) => match &self.builtin {
                Some(builtin) => (pipelines.flat, builtin.quad, Vec4::ONE),
                None => return Err(RenderError::NotReady),
            },
            (phase, key) => panic!("flush of {key:?} recorded in phase {phase:?}"),
        };

        let instance_sets: &[(u32, ShaderSet)] = match flush.phase {
            DrawPhase::Draw2D => &[(1, ShaderSet::Instances2DVert), (3, ShaderSet::Instances2DFrag)],
            _ => &[(1, ShaderSet::Instances3D)],
        };
        for (index, set) in instance_sets {
            let offset = buffer.dynamic_offset(set.index(), 0, flush.block);
            self.backend.cmd_bind_descriptor_set(
                frame.sync,
                pipeline,
                *index,
                sets.get(set.index(), frame.slot),
                &[offset],
            );
        }
        if let Some(bones) = flush.bones_slot {
            let offset = buffer.dynamic_offset(ShaderSet::Bones.index(), 0, bones);
            self.backend.cmd_bind_descriptor_set(
                frame.sync,
                pipeline,
                2,
                sets.get(ShaderSet::Bones.index(), frame.slot),
                &[offset],
            );
        }

        let pool = match &self.builtin {
            Some(builtin) if model.pool == BUILTIN_POOL => &builtin.pool,
            _ => self.pools.get(model.pool)?,
        };
        let (Some(gpu), Some(geometry)) = (pool.model(model.id), pool.geometry()) else {
            // empty model
            return Ok(());
        };
        self.backend.cmd_bind_geometry(
            frame.sync,
            geometry.buffer,
            geometry.vertex_offset(model.kind),
            geometry.index_offset,
        );
        let texture_base = self.frame_resources.textures().base(model.pool).unwrap_or(0);
        let is_3d = flush.phase != DrawPhase::Draw2D;
        for mesh in &gpu.meshes {
            if is_3d {
                let colour = if colour == Vec4::ZERO { mesh.diffuse } else { colour };
                let push = DrawPushConstants::new(colour, texture_base);
                self.backend.cmd_push_constants(frame.sync, pipeline, bytemuck::bytes_of(&push));
            }
            self.backend.cmd_draw_indexed(
                frame.sync,
                DrawIndexed {
                    index_count: mesh.index_count,
                    instance_count: flush.instance_count,
                    first_index: mesh.first_index,
                    vertex_offset: mesh.vertex_offset,
                    first_instance: flush.first_instance,
                },
            );
        }
        self.batcher.record_draw_calls(gpu.meshes.len() as u32);
        Ok(())
    }

    /// Flushes the last batch, composites the offscreen image onto the swapchain,
    /// submits and presents. A surface reported out of date or suboptimal is
    /// rebuilt here.
    pub fn end_draw(&mut self) -> RenderResult<()> {
        let frame = self.active_frame()?;
        if let Some(flush) = self.batcher.finish_frame() {
            self.record_flush(&flush)?;
        }
        self.write_instances(frame.slot)?;

        let (Some(pipelines), Some(sets), Some((_, final_pass)), Some(framebuffer), Some(extent)) = (
            self.frame_resources.pipelines(),
            self.frame_resources.descriptor_sets(),
            self.frame_resources.render_passes(),
            self.frame_resources.final_framebuffer(frame.image_index),
            self.frame_resources.swapchain_extent(),
        ) else {
            return Err(RenderError::NotReady);
        };
        self.backend.cmd_end_render_pass(frame.sync);
        self.backend.cmd_begin_render_pass(
            frame.sync,
            final_pass,
            framebuffer,
            extent,
            &[ClearValue::Colour(self.config.scaled_border_colour)],
        );
        self.backend.cmd_bind_pipeline(frame.sync, pipelines.final_pass);
        for (index, set) in [(0, ShaderSet::OffscreenTransform), (1, ShaderSet::OffscreenTexture)] {
            self.backend.cmd_bind_descriptor_set(
                frame.sync,
                pipelines.final_pass,
                index,
                sets.get(set.index(), frame.slot),
                &[],
            );
        }
        self.backend.cmd_draw(frame.sync, 3, 1);
        self.backend.cmd_end_render_pass(frame.sync);

        self.frame = None;
        self.backend.submit_commands(frame.sync)?;
        let Some(swapchain) = self.frame_resources.swapchain() else {
            return Err(RenderError::NotReady);
        };
        let status = self.backend.present(swapchain, frame.sync, frame.image_index)?;
        if status.needs_rebuild() {
            log::info!("present reported {status:?}, rebuilding");
        }

        if status.needs_rebuild() || self.rebuild_requested {
            match self.rebuild_frame_resources(status.needs_rebuild()) {
                Ok(()) => {}
                Err(RenderError::ZeroExtent) => {
                    log::debug!("surface has no area, rebuild deferred");
                    self.rebuild_requested = true;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn write_instances(&mut self, slot: usize) -> RenderResult<()> {
        let Some(buffer) = self.frame_resources.shader_buffer() else {
            return Err(RenderError::NotReady);
        };
        let backend = &mut self.backend;
        for (block, instances) in self.batcher.blocks_3d() {
            buffer.store_array(backend, ShaderSet::Instances3D.index(), 0, slot, instances, 0, block)?;
        }
        for (block, instances) in self.batcher.blocks_2d() {
            let models: Vec<Mat4> = instances.iter().map(|i| i.model).collect();
            let frags: Vec<Frag2DData> = instances.iter().map(|i| i.frag).collect();
            buffer.store_array(backend, ShaderSet::Instances2DVert.index(), 0, slot, &models, 0, block)?;
            buffer.store_array(backend, ShaderSet::Instances2DFrag.index(), 0, slot, &frags, 0, block)?;
        }
        Ok(())
    }

    /// Releases every device object. Called on drop; afterwards only the backend accessors are useful.
    pub fn destroy(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            log::error!("wait idle before teardown failed: {e}");
        }
        self.frame = None;
        self.activated = false;
        self.frame_resources.destroy(&mut self.backend);
        for pool in self.pools.drain() {
            pool.destroy(&mut self.backend);
        }
        self.pools_in_use.clear();
        if let Some(builtin) = self.builtin.take() {
            builtin.pool.destroy(&mut self.backend);
        }
        if let Some(ring) = self.ring.take() {
            ring.destroy(&mut self.backend);
        }
        if let Some(layouts) = self.layouts.take() {
            layouts.destroy(&mut self.backend);
        }
    }
}

impl<B: Backend> Drop for Renderer<B> {
    fn drop(&mut self) {
        self.destroy();
    }
}
