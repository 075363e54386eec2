//! Everything that depends on the surface size or the render config: swapchain,
//! render passes, offscreen attachments, framebuffers, descriptor sets, the
//! shader buffer and the pipelines.

use std::collections::HashMap;
use glam::Mat4;
use crate::renderer::backend::{
    AttachmentImageDesc, AttachmentRole, AttachmentUsage, Backend, Extent2D, FinalLayout,
    Format, FramebufferId, ImageId, ImageRef, MemoryId, MemoryRequirements, PassAttachment,
    PipelineDesc, PipelineId, RenderPassDesc, RenderPassId, SamplerDesc, SamplerId,
    SetLayoutId, SwapchainId, SwapchainInfo, SwapchainRequest, TextureId, VertexLayout,
    DescriptorResource, DescriptorWrite,
};
use crate::renderer::config::RenderConfig;
use crate::renderer::descriptors::{align_up, BufferLayout, DescriptorSets, SetDecl, ShaderBuffer};
use crate::renderer::error::{DeviceResult, RenderError, RenderResult};
use crate::renderer::resources::PoolId;
use crate::renderer::shader_data::{
    set_declarations, DrawPushConstants, ShaderSet, MAX_TEXTURES,
};
use crate::renderer::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameResourceState {
    Uninitialized,
    BuildingSwapchain,
    ResourcesReady,
    /// Torn down, waiting to be rebuilt
    Resizing,
    Destroyed,
}

/// Set layouts of every declared set. They never change, so they outlive rebuilds.
pub struct SetLayouts {
    decls: Vec<SetDecl>,
    ids: Vec<SetLayoutId>,
}

impl SetLayouts {
    pub fn new<B: Backend>(backend: &mut B) -> DeviceResult<Self> {
        let decls = set_declarations();
        let mut ids = Vec::with_capacity(decls.len());
        for decl in &decls {
            match backend.create_set_layout(&decl.layout_bindings()) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    ids.into_iter().for_each(|id| backend.destroy_set_layout(id));
                    return Err(e);
                }
            }
        }
        Ok(Self { decls, ids })
    }

    pub fn id(&self, set: ShaderSet) -> SetLayoutId {
        self.ids[set.index()]
    }

    pub fn decl(&self, set: ShaderSet) -> &SetDecl {
        &self.decls[set.index()]
    }

    fn ids_of(&self, sets: &[ShaderSet]) -> Vec<SetLayoutId> {
        sets.iter().map(|s| self.id(*s)).collect()
    }

    pub fn destroy<B: Backend>(self, backend: &mut B) {
        for id in self.ids {
            backend.destroy_set_layout(id);
        }
    }
}

/// Global texture slots. Slot 0 is the white texture, each pool gets a contiguous range.
#[derive(Debug, Clone, Default)]
pub struct TextureTable {
    bases: HashMap<PoolId, u32>,
    slots: Vec<TextureId>,
}

impl TextureTable {
    pub fn build(white: TextureId, pools: &[(PoolId, Vec<TextureId>)]) -> RenderResult<Self> {
        let mut slots = vec![white];
        let mut bases = HashMap::new();
        for (pool, textures) in pools {
            if slots.len() + textures.len() > MAX_TEXTURES as usize {
                return Err(RenderError::TextureLimitReached(MAX_TEXTURES as usize));
            }
            bases.insert(*pool, slots.len() as u32);
            slots.extend_from_slice(textures);
        }
        Ok(Self { bases, slots })
    }

    pub fn base(&self, pool: PoolId) -> Option<u32> {
        self.bases.get(&pool).copied()
    }

    /// Texture bound at `slot`, unused slots resolve to slot 0
    pub fn image(&self, slot: u32) -> TextureId {
        self.slots.get(slot as usize).copied().unwrap_or(self.slots[0])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SwapchainKey {
    extent: Extent2D,
    vsync: bool,
    srgb: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PassKey {
    colour: Format,
    depth: Format,
    samples: u32,
}

#[derive(Debug)]
struct RenderPasses {
    key: PassKey,
    offscreen: RenderPassId,
    final_pass: RenderPassId,
}

/// Attachments of the offscreen pass for one frame-in-flight
#[derive(Debug, Clone, Copy)]
struct OffscreenTarget {
    /// Multisampled colour, resolved into `resolve`
    multisampled: Option<ImageId>,
    resolve: ImageId,
    depth: ImageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pipelines {
    pub flat: PipelineId,
    pub static_3d: PipelineId,
    pub animated_3d: PipelineId,
    pub final_pass: PipelineId,
}

/// Objects recreated on every rebuild
#[derive(Debug, Default)]
struct Built {
    images: Vec<ImageId>,
    memory: Option<MemoryId>,
    targets: Vec<OffscreenTarget>,
    offscreen_framebuffers: Vec<FramebufferId>,
    final_framebuffers: Vec<FramebufferId>,
    descriptor_sets: Option<DescriptorSets>,
    shader_buffer: Option<ShaderBuffer>,
    pipelines: Vec<PipelineId>,
}

impl Built {
    /// Reverse creation order
    fn destroy<B: Backend>(self, backend: &mut B) {
        for pipeline in self.pipelines {
            backend.destroy_pipeline(pipeline);
        }
        if let Some(buffer) = self.shader_buffer {
            buffer.destroy(backend);
        }
        if let Some(sets) = self.descriptor_sets {
            sets.destroy(backend);
        }
        for framebuffer in self.final_framebuffers.into_iter().chain(self.offscreen_framebuffers) {
            backend.destroy_framebuffer(framebuffer);
        }
        for image in self.images {
            backend.destroy_attachment_image(image);
        }
        if let Some(memory) = self.memory {
            backend.free_memory(memory);
        }
    }
}

pub struct FrameResources {
    state: FrameResourceState,
    frame_count: usize,
    swapchain: Option<(SwapchainKey, SwapchainInfo)>,
    passes: Option<RenderPasses>,
    texture_sampler: Option<(bool, SamplerId)>,
    offscreen_sampler: Option<SamplerId>,
    built: Option<Built>,
    pipelines: Option<Pipelines>,
    textures: TextureTable,
    offscreen_extent: Extent2D,
    offscreen_transform: Mat4,
}

impl FrameResources {
    pub fn new(frame_count: usize) -> Self {
        Self {
            state: FrameResourceState::Uninitialized,
            frame_count,
            swapchain: None,
            passes: None,
            texture_sampler: None,
            offscreen_sampler: None,
            built: None,
            pipelines: None,
            textures: TextureTable::default(),
            offscreen_extent: Extent2D::default(),
            offscreen_transform: Mat4::IDENTITY,
        }
    }

    pub fn state(&self) -> FrameResourceState {
        self.state
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Takes effect at the next rebuild
    pub fn set_frame_count(&mut self, frame_count: usize) {
        self.frame_count = frame_count.max(1);
    }

    pub fn is_ready(&self) -> bool {
        self.state == FrameResourceState::ResourcesReady
    }

    /// Tears down the per-build objects and rebuilds them for the current surface.
    /// The swapchain and render passes are only recreated when their inputs changed
    /// or `surface_invalidated` is set. Fails with `ZeroExtent` while the surface
    /// has no area, leaving the current resources untouched.
    pub fn rebuild<B: Backend>(
        &mut self,
        backend: &mut B,
        layouts: &SetLayouts,
        config: &RenderConfig,
        textures: TextureTable,
        surface_invalidated: bool,
    ) -> RenderResult<()> {
        let window = backend.surface_extent();
        if window.is_zero() {
            return Err(RenderError::ZeroExtent);
        }

        if let Some(built) = self.built.take() {
            log::debug!("tearing down frame resources");
            self.state = FrameResourceState::Resizing;
            backend.wait_idle()?;
            self.pipelines = None;
            built.destroy(backend);
        }

        self.state = FrameResourceState::BuildingSwapchain;
        let result = self.build(backend, layouts, config, textures, window, surface_invalidated);
        match &result {
            Ok(()) => {
                self.state = FrameResourceState::ResourcesReady;
                log::debug!(
                    "frame resources ready: offscreen {}x{}, swapchain {:?}",
                    self.offscreen_extent.width,
                    self.offscreen_extent.height,
                    self.swapchain_extent()
                );
            }
            Err(e) => {
                log::error!("failed to build frame resources: {e}");
                self.state = FrameResourceState::Resizing;
            }
        }
        result
    }

    fn build<B: Backend>(
        &mut self,
        backend: &mut B,
        layouts: &SetLayouts,
        config: &RenderConfig,
        textures: TextureTable,
        window: Extent2D,
        surface_invalidated: bool,
    ) -> RenderResult<()> {
        let swapchain = self.ensure_swapchain(backend, config, window, surface_invalidated)?;
        let caps = backend.capabilities().clone();
        let samples = if config.multisampling { caps.max_samples.max(1) } else { 1 };
        let sample_shading = config.sample_shading && caps.sample_shading && samples > 1;
        let passes = self.ensure_passes(backend, swapchain.format, caps.depth_format, samples)?;
        let texture_sampler = self.ensure_samplers(backend, config.texture_filter_nearest)?;
        let offscreen_sampler = match self.offscreen_sampler {
            Some(sampler) => sampler,
            None => {
                let sampler = backend.create_sampler(&SamplerDesc {
                    nearest: false,
                    clamp_to_edge: true,
                })?;
                self.offscreen_sampler = Some(sampler);
                sampler
            }
        };

        self.offscreen_extent = match config.target_resolution {
            Some([w, h]) if w > 0 && h > 0 => Extent2D::new(w, h),
            _ => swapchain.extent,
        };
        self.offscreen_transform = util::letterbox_transform(self.offscreen_extent, swapchain.extent);
        self.textures = textures;

        let mut built = Built::default();
        let result = self.build_frame_objects(
            backend,
            &mut built,
            layouts,
            &swapchain,
            passes,
            (caps.depth_format, samples, sample_shading),
            (texture_sampler, offscreen_sampler),
            caps.shader_buffer_alignment(),
        );
        match result {
            Ok(pipelines) => {
                self.pipelines = Some(pipelines);
                self.built = Some(built);
                Ok(())
            }
            Err(e) => {
                built.destroy(backend);
                Err(e)
            }
        }
    }

    fn ensure_swapchain<B: Backend>(
        &mut self,
        backend: &mut B,
        config: &RenderConfig,
        window: Extent2D,
        force: bool,
    ) -> RenderResult<SwapchainInfo> {
        let key = SwapchainKey {
            extent: window,
            vsync: config.vsync,
            srgb: config.srgb,
        };
        if let Some((current, info)) = &self.swapchain {
            if *current == key && !force {
                return Ok(info.clone());
            }
        }
        let old = self.swapchain.take().map(|(_, info)| info.id);
        let info = backend.create_swapchain(
            &SwapchainRequest {
                extent: window,
                vsync: config.vsync,
                srgb: config.srgb,
            },
            old,
        )?;
        if info.extent != window {
            log::info!(
                "swapchain extent {}x{} differs from the requested {}x{}",
                info.extent.width,
                info.extent.height,
                window.width,
                window.height
            );
        }
        self.swapchain = Some((key, info.clone()));
        Ok(info)
    }

    fn ensure_passes<B: Backend>(
        &mut self,
        backend: &mut B,
        colour: Format,
        depth: Format,
        samples: u32,
    ) -> RenderResult<(RenderPassId, RenderPassId)> {
        let key = PassKey { colour, depth, samples };
        if let Some(passes) = &self.passes {
            if passes.key == key {
                return Ok((passes.offscreen, passes.final_pass));
            }
        }
        if let Some(old) = self.passes.take() {
            backend.destroy_render_pass(old.offscreen);
            backend.destroy_render_pass(old.final_pass);
        }

        let offscreen_attachments = if samples > 1 {
            vec![
                PassAttachment { format: colour, samples, role: AttachmentRole::Colour(FinalLayout::ShaderRead) },
                PassAttachment { format: depth, samples, role: AttachmentRole::Depth },
                PassAttachment { format: colour, samples: 1, role: AttachmentRole::Resolve(FinalLayout::ShaderRead) },
            ]
        } else {
            vec![
                PassAttachment { format: colour, samples: 1, role: AttachmentRole::Colour(FinalLayout::ShaderRead) },
                PassAttachment { format: depth, samples: 1, role: AttachmentRole::Depth },
            ]
        };
        let offscreen = backend.create_render_pass(&RenderPassDesc {
            label: "offscreen".into(),
            attachments: offscreen_attachments,
        })?;
        let final_pass = match backend.create_render_pass(&RenderPassDesc {
            label: "final".into(),
            attachments: vec![PassAttachment {
                format: colour,
                samples: 1,
                role: AttachmentRole::Colour(FinalLayout::Present),
            }],
        }) {
            Ok(pass) => pass,
            Err(e) => {
                backend.destroy_render_pass(offscreen);
                return Err(e.into());
            }
        };
        log::debug!("render passes created for {colour:?}, {samples} samples");
        self.passes = Some(RenderPasses { key, offscreen, final_pass });
        Ok((offscreen, final_pass))
    }

    fn ensure_samplers<B: Backend>(&mut self, backend: &mut B, nearest: bool) -> RenderResult<SamplerId> {
        if let Some((current, sampler)) = self.texture_sampler {
            if current == nearest {
                return Ok(sampler);
            }
            backend.destroy_sampler(sampler);
            self.texture_sampler = None;
        }
        let sampler = backend.create_sampler(&SamplerDesc {
            nearest,
            clamp_to_edge: false,
        })?;
        self.texture_sampler = Some((nearest, sampler));
        Ok(sampler)
    }

    /// Creates one image per offscreen attachment of every frame and binds them all
    /// into a single memory block at aligned sub-offsets
    fn build_attachments<B: Backend>(
        &self,
        backend: &mut B,
        built: &mut Built,
        colour: Format,
        depth: Format,
        samples: u32,
    ) -> RenderResult<()> {
        let extent = self.offscreen_extent;
        let mut requirements: Vec<(ImageId, MemoryRequirements)> = Vec::new();
        let mut create = |backend: &mut B,
                          built: &mut Built,
                          format: Format,
                          samples: u32,
                          usage: AttachmentUsage|
         -> RenderResult<ImageId> {
            let (image, req) = backend.create_attachment_image(&AttachmentImageDesc {
                extent,
                format,
                samples,
                usage,
            })?;
            built.images.push(image);
            requirements.push((image, req));
            Ok(image)
        };

        for _ in 0..self.frame_count {
            let multisampled = if samples > 1 {
                Some(create(backend, built, colour, samples, AttachmentUsage::TransientColour)?)
            } else {
                None
            };
            let depth = create(backend, built, depth, samples, AttachmentUsage::Depth)?;
            let resolve = create(backend, built, colour, 1, AttachmentUsage::SampledColour)?;
            built.targets.push(OffscreenTarget { multisampled, resolve, depth });
        }

        let mut size = 0;
        let mut alignment = 1;
        let mut type_bits = u32::MAX;
        let mut offsets = Vec::with_capacity(requirements.len());
        for (_, req) in &requirements {
            size = align_up(size, req.alignment);
            offsets.push(size);
            size += req.size;
            alignment = alignment.max(req.alignment);
            type_bits &= req.type_bits;
        }
        let memory = backend.allocate_memory(&MemoryRequirements { size, alignment, type_bits })?;
        built.memory = Some(memory);
        for ((image, _), offset) in requirements.iter().zip(offsets) {
            backend.bind_attachment_memory(*image, memory, offset)?;
        }
        log::debug!("{} attachment images share {} bytes", requirements.len(), size);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_frame_objects<B: Backend>(
        &self,
        backend: &mut B,
        built: &mut Built,
        layouts: &SetLayouts,
        swapchain: &SwapchainInfo,
        (offscreen_pass, final_pass): (RenderPassId, RenderPassId),
        (depth, samples, sample_shading): (Format, u32, bool),
        (texture_sampler, offscreen_sampler): (SamplerId, SamplerId),
        alignment: u64,
    ) -> RenderResult<Pipelines> {
        self.build_attachments(backend, built, swapchain.format, depth, samples)?;

        for target in &built.targets {
            let attachments: Vec<ImageId> = match target.multisampled {
                Some(colour) => vec![colour, target.depth, target.resolve],
                None => vec![target.resolve, target.depth],
            };
            let framebuffer =
                backend.create_framebuffer(offscreen_pass, &attachments, self.offscreen_extent)?;
            built.offscreen_framebuffers.push(framebuffer);
        }
        for image in &swapchain.images {
            let framebuffer = backend.create_framebuffer(final_pass, &[*image], swapchain.extent)?;
            built.final_framebuffers.push(framebuffer);
        }

        let all: Vec<(SetLayoutId, &SetDecl)> = layouts.ids.iter().copied().zip(&layouts.decls).collect();
        built.descriptor_sets = Some(DescriptorSets::build_pool_and_sets(backend, &all, self.frame_count)?);
        let decls: Vec<&SetDecl> = layouts.decls.iter().collect();
        let layout = BufferLayout::compute(&decls, alignment);
        built.shader_buffer = Some(ShaderBuffer::build(backend, layout, self.frame_count)?);

        if let (Some(sets), Some(buffer)) = (&built.descriptor_sets, &built.shader_buffer) {
            self.write_descriptors(backend, layouts, sets, buffer, &built.targets, texture_sampler, offscreen_sampler);
        }

        let mut pipeline = |backend: &mut B,
                            label: &str,
                            shaders: (&'static str, &'static str),
                            vertex_layout: VertexLayout,
                            sets: &[ShaderSet],
                            push_constant_size: u32|
         -> RenderResult<PipelineId> {
            let is_final = vertex_layout == VertexLayout::None;
            let id = backend.create_pipeline(&PipelineDesc {
                label: label.into(),
                vertex_shader: shaders.0,
                fragment_shader: shaders.1,
                vertex_layout,
                set_layouts: layouts.ids_of(sets),
                push_constant_size,
                render_pass: if is_final { final_pass } else { offscreen_pass },
                extent: if is_final { swapchain.extent } else { self.offscreen_extent },
                samples: if is_final { 1 } else { samples },
                sample_shading: !is_final && sample_shading,
                depth_test: !is_final,
                alpha_blend: !is_final,
                cull_back_faces: matches!(vertex_layout, VertexLayout::Static3D | VertexLayout::Animated3D),
            })?;
            built.pipelines.push(id);
            Ok(id)
        };

        use ShaderSet::*;
        let push_size = size_of::<DrawPushConstants>() as u32;
        let static_3d = pipeline(
            backend,
            "3D",
            ("3d.vert.spv", "3d.frag.spv"),
            VertexLayout::Static3D,
            &[ViewProjection3D, Instances3D, Empty, Textures, Lighting],
            push_size,
        )?;
        let animated_3d = pipeline(
            backend,
            "animated 3D",
            ("anim3d.vert.spv", "3d.frag.spv"),
            VertexLayout::Animated3D,
            &[ViewProjection3D, Instances3D, Bones, Textures, Lighting],
            push_size,
        )?;
        let flat = pipeline(
            backend,
            "2D",
            ("flat.vert.spv", "flat.frag.spv"),
            VertexLayout::Flat2D,
            &[ViewProjection2D, Instances2DVert, Textures, Instances2DFrag],
            0,
        )?;
        let final_pass = pipeline(
            backend,
            "final",
            ("final.vert.spv", "final.frag.spv"),
            VertexLayout::None,
            &[OffscreenTransform, OffscreenTexture],
            0,
        )?;
        Ok(Pipelines { flat, static_3d, animated_3d, final_pass })
    }

    #[allow(clippy::too_many_arguments)]
    fn write_descriptors<B: Backend>(
        &self,
        backend: &mut B,
        layouts: &SetLayouts,
        sets: &DescriptorSets,
        buffer: &ShaderBuffer,
        targets: &[OffscreenTarget],
        texture_sampler: SamplerId,
        offscreen_sampler: SamplerId,
    ) {
        for frame in 0..self.frame_count {
            for (index, decl) in layouts.decls.iter().enumerate() {
                let writes = buffer.buffer_writes(index, decl, frame);
                if !writes.is_empty() {
                    backend.write_descriptor_set(sets.get(index, frame), &writes);
                }
            }

            let mut writes = vec![DescriptorWrite {
                binding: 0,
                element: 0,
                resource: DescriptorResource::Sampler(texture_sampler),
            }];
            writes.extend((0..MAX_TEXTURES).map(|slot| DescriptorWrite {
                binding: 1,
                element: slot,
                resource: DescriptorResource::Image(ImageRef::Texture(self.textures.image(slot))),
            }));
            backend.write_descriptor_set(sets.get(ShaderSet::Textures.index(), frame), &writes);

            backend.write_descriptor_set(
                sets.get(ShaderSet::OffscreenTexture.index(), frame),
                &[
                    DescriptorWrite {
                        binding: 0,
                        element: 0,
                        resource: DescriptorResource::Sampler(offscreen_sampler),
                    },
                    DescriptorWrite {
                        binding: 1,
                        element: 0,
                        resource: DescriptorResource::Image(ImageRef::Attachment(targets[frame].resolve)),
                    },
                ],
            );
        }
    }

    /// Destroys every object, including the swapchain and render passes
    pub fn destroy<B: Backend>(&mut self, backend: &mut B) {
        if self.state == FrameResourceState::Destroyed {
            return;
        }
        if let Some(built) = self.built.take() {
            built.destroy(backend);
        }
        self.pipelines = None;
        if let Some(passes) = self.passes.take() {
            backend.destroy_render_pass(passes.offscreen);
            backend.destroy_render_pass(passes.final_pass);
        }
        if let Some((_, sampler)) = self.texture_sampler.take() {
            backend.destroy_sampler(sampler);
        }
        if let Some(sampler) = self.offscreen_sampler.take() {
            backend.destroy_sampler(sampler);
        }
        if let Some((_, info)) = self.swapchain.take() {
            backend.destroy_swapchain(info.id);
        }
        self.state = FrameResourceState::Destroyed;
    }

    /// Drops the per-build objects but keeps the swapchain, so a rebuild can follow
    pub fn release<B: Backend>(&mut self, backend: &mut B) -> RenderResult<()> {
        if let Some(built) = self.built.take() {
            backend.wait_idle()?;
            built.destroy(backend);
            self.pipelines = None;
            self.state = FrameResourceState::Resizing;
        }
        Ok(())
    }

    pub fn swapchain(&self) -> Option<SwapchainId> {
        self.swapchain.as_ref().map(|(_, info)| info.id)
    }

    pub fn swapchain_extent(&self) -> Option<Extent2D> {
        self.swapchain.as_ref().map(|(_, info)| info.extent)
    }

    pub fn offscreen_extent(&self) -> Extent2D {
        self.offscreen_extent
    }

    pub fn offscreen_transform(&self) -> Mat4 {
        self.offscreen_transform
    }

    pub fn textures(&self) -> &TextureTable {
        &self.textures
    }

    pub fn pipelines(&self) -> Option<Pipelines> {
        self.pipelines
    }

    pub fn render_passes(&self) -> Option<(RenderPassId, RenderPassId)> {
        self.passes.as_ref().map(|p| (p.offscreen, p.final_pass))
    }

    pub fn offscreen_framebuffer(&self, slot: usize) -> Option<FramebufferId> {
        self.built.as_ref()?.offscreen_framebuffers.get(slot).copied()
    }

    pub fn final_framebuffer(&self, image_index: u32) -> Option<FramebufferId> {
        self.built.as_ref()?.final_framebuffers.get(image_index as usize).copied()
    }

    pub fn descriptor_sets(&self) -> Option<&DescriptorSets> {
        self.built.as_ref()?.descriptor_sets.as_ref()
    }

    pub fn shader_buffer(&self) -> Option<&ShaderBuffer> {
        self.built.as_ref()?.shader_buffer.as_ref()
    }

    /// Samples used by the offscreen pass of the current build
    pub fn samples(&self) -> u32 {
        self.passes.as_ref().map_or(1, |p| p.key.samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::headless::{HeadlessBackend, ObjectKind};
    use crate::renderer::backend::TextureDesc;

    fn setup() -> (HeadlessBackend, SetLayouts, TextureId) {
        let mut backend = HeadlessBackend::new(Extent2D::new(800, 600));
        let layouts = SetLayouts::new(&mut backend).unwrap();
        let white = backend
            .create_texture(&TextureDesc {
                label: "white".into(),
                width: 1,
                height: 1,
                format: Format::Rgba8Srgb,
            })
            .unwrap();
        (backend, layouts, white)
    }

    fn table(white: TextureId) -> TextureTable {
        TextureTable::build(white, &[]).unwrap()
    }

    #[test]
    fn rebuild_with_same_inputs_does_not_leak() {
        let (mut backend, layouts, white) = setup();
        let config = RenderConfig::default();
        let mut resources = FrameResources::new(2);
        resources.rebuild(&mut backend, &layouts, &config, table(white), false).unwrap();
        assert!(resources.is_ready());
        let after_first = backend.live_objects();
        let swapchain = resources.swapchain();
        let passes = resources.render_passes();

        backend.reset_peak();
        resources.rebuild(&mut backend, &layouts, &config, table(white), false).unwrap();
        assert_eq!(resources.state(), FrameResourceState::ResourcesReady);
        assert_eq!(backend.live_objects(), after_first);
        // everything from the first build is gone before the second allocates
        assert_eq!(backend.peak_live_objects(), after_first);
        assert_eq!(resources.swapchain(), swapchain);
        assert_eq!(resources.render_passes(), passes);
    }

    #[test]
    fn attachments_share_one_memory_block() {
        let (mut backend, layouts, white) = setup();
        let mut resources = FrameResources::new(2);
        resources
            .rebuild(&mut backend, &layouts, &RenderConfig::default(), table(white), false)
            .unwrap();
        assert_eq!(backend.live_count(ObjectKind::Memory), 1);
        // msaa colour, depth and resolve per frame
        assert_eq!(backend.live_count(ObjectKind::AttachmentImage), 6);
        assert_eq!(backend.live_count(ObjectKind::Framebuffer), 2 + 3);
        assert_eq!(backend.live_count(ObjectKind::Pipeline), 4);
    }

    #[test]
    fn sample_count_change_recreates_render_passes() {
        let (mut backend, layouts, white) = setup();
        let mut config = RenderConfig::default();
        let mut resources = FrameResources::new(2);
        resources.rebuild(&mut backend, &layouts, &config, table(white), false).unwrap();
        let passes = resources.render_passes();
        let swapchain = resources.swapchain();

        config.multisampling = false;
        resources.rebuild(&mut backend, &layouts, &config, table(white), false).unwrap();
        assert_ne!(resources.render_passes(), passes);
        assert_eq!(resources.swapchain(), swapchain);
        assert_eq!(resources.samples(), 1);
        assert_eq!(backend.live_count(ObjectKind::RenderPass), 2);
        assert_eq!(backend.live_count(ObjectKind::AttachmentImage), 4);
    }

    #[test]
    fn resize_recreates_the_swapchain_and_adopts_the_driver_extent() {
        let (mut backend, layouts, white) = setup();
        let config = RenderConfig::default();
        let mut resources = FrameResources::new(2);
        resources.rebuild(&mut backend, &layouts, &config, table(white), false).unwrap();
        let first = resources.swapchain();

        backend.set_surface_extent(Extent2D::new(1024, 768));
        backend.set_max_swapchain_extent(Some(Extent2D::new(1000, 700)));
        resources.rebuild(&mut backend, &layouts, &config, table(white), false).unwrap();
        assert_ne!(resources.swapchain(), first);
        assert_eq!(resources.swapchain_extent(), Some(Extent2D::new(1000, 700)));
        assert_eq!(resources.offscreen_extent(), Extent2D::new(1000, 700));
        assert_eq!(backend.live_count(ObjectKind::Swapchain), 1);
    }

    #[test]
    fn target_resolution_sets_the_offscreen_extent() {
        let (mut backend, layouts, white) = setup();
        let config = RenderConfig {
            target_resolution: Some([400, 300]),
            ..Default::default()
        };
        let mut resources = FrameResources::new(2);
        resources.rebuild(&mut backend, &layouts, &config, table(white), false).unwrap();
        assert_eq!(resources.offscreen_extent(), Extent2D::new(400, 300));
        assert_eq!(resources.offscreen_transform(), Mat4::IDENTITY);
    }

    #[test]
    fn zero_extent_keeps_current_resources() {
        let (mut backend, layouts, white) = setup();
        let config = RenderConfig::default();
        let mut resources = FrameResources::new(2);
        resources.rebuild(&mut backend, &layouts, &config, table(white), false).unwrap();
        let live = backend.live_objects();

        backend.set_surface_extent(Extent2D::new(0, 600));
        assert!(matches!(
            resources.rebuild(&mut backend, &layouts, &config, table(white), false),
            Err(RenderError::ZeroExtent)
        ));
        assert!(resources.is_ready());
        assert_eq!(backend.live_objects(), live);
    }

    #[test]
    fn destroy_releases_everything() {
        let (mut backend, layouts, white) = setup();
        let mut resources = FrameResources::new(3);
        resources
            .rebuild(&mut backend, &layouts, &RenderConfig::default(), table(white), false)
            .unwrap();
        resources.destroy(&mut backend);
        layouts.destroy(&mut backend);
        backend.destroy_texture(white);
        assert_eq!(backend.live_objects(), 0);
        assert_eq!(resources.state(), FrameResourceState::Destroyed);
    }

    #[test]
    fn texture_table_assigns_pool_bases() {
        let white = TextureId(1);
        let a = PoolId { index: 0, generation: 0 };
        let b = PoolId { index: 1, generation: 0 };
        let table = TextureTable::build(
            white,
            &[(a, vec![TextureId(5), TextureId(6)]), (b, vec![TextureId(9)])],
        )
        .unwrap();
        assert_eq!(table.base(a), Some(1));
        assert_eq!(table.base(b), Some(3));
        assert_eq!(table.image(3), TextureId(9));
        assert_eq!(table.image(200), white);

        let too_many = vec![TextureId(2); MAX_TEXTURES as usize];
        assert!(matches!(
            TextureTable::build(white, &[(a, too_many)]),
            Err(RenderError::TextureLimitReached(_))
        ));
    }
}
