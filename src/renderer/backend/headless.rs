//! An in-memory device. Nothing is drawn; every object is tracked and every
//! recorded command is kept so callers can inspect what the renderer did.

use std::collections::{HashMap, HashSet, VecDeque};
use crate::renderer::backend::*;
use crate::renderer::error::{DeviceError, DeviceResult};

const SWAPCHAIN_IMAGE_COUNT: u32 = 3;
const ATTACHMENT_ALIGNMENT: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Buffer,
    Texture,
    Sampler,
    SetLayout,
    DescriptorPool,
    Swapchain,
    AttachmentImage,
    Memory,
    RenderPass,
    Framebuffer,
    Pipeline,
    FrameSync,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginRenderPass {
        pass: RenderPassId,
        framebuffer: FramebufferId,
        extent: Extent2D,
    },
    EndRenderPass,
    BindPipeline(PipelineId),
    BindDescriptorSet {
        index: u32,
        set: DescriptorSetId,
        dynamic_offsets: Vec<u32>,
    },
    BindGeometry {
        buffer: BufferId,
        vertex_offset: u64,
        index_offset: u64,
    },
    PushConstants(Vec<u8>),
    DrawIndexed(DrawIndexed),
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
}

#[derive(Debug)]
struct HeadlessBuffer {
    usage: BufferUsage,
    data: Vec<u8>,
}

#[derive(Debug)]
struct HeadlessTexture {
    desc: TextureDesc,
    data: Vec<u8>,
}

#[derive(Debug)]
struct HeadlessPool {
    remaining: DescriptorCounts,
    sets_remaining: u32,
    sets: Vec<u32>,
}

#[derive(Debug)]
struct HeadlessSwapchain {
    info: SwapchainInfo,
    requested: Extent2D,
    next_image: u32,
}

#[derive(Debug)]
struct HeadlessAttachment {
    desc: AttachmentImageDesc,
    size: u64,
    bound: bool,
}

#[derive(Debug, Default)]
struct HeadlessFrame {
    recording: bool,
    in_flight: bool,
}

pub struct HeadlessBackend {
    capabilities: Capabilities,
    surface_extent: Extent2D,
    max_swapchain_extent: Option<Extent2D>,

    next_id: u32,
    live: HashSet<(ObjectKind, u32)>,
    peak_live: usize,

    buffers: HashMap<u32, HeadlessBuffer>,
    textures: HashMap<u32, HeadlessTexture>,
    set_layouts: HashMap<u32, Vec<LayoutBinding>>,
    pools: HashMap<u32, HeadlessPool>,
    descriptor_sets: HashMap<u32, Vec<DescriptorWrite>>,
    swapchains: HashMap<u32, HeadlessSwapchain>,
    attachments: HashMap<u32, HeadlessAttachment>,
    memories: HashMap<u32, u64>,
    frames: HashMap<u32, HeadlessFrame>,

    acquire_overrides: VecDeque<SurfaceStatus>,
    present_overrides: VecDeque<PresentStatus>,
    /// Buffer creations left before one reports memory exhaustion
    buffer_failure_in: Option<usize>,

    commands: Vec<Command>,
    submissions: usize,
    presents: usize,
    transfers: usize,
}

impl HeadlessBackend {
    pub fn new(surface_extent: Extent2D) -> Self {
        Self::with_capabilities(
            surface_extent,
            Capabilities {
                min_uniform_alignment: 256,
                min_storage_alignment: 64,
                max_samples: 4,
                depth_format: Format::Depth32,
                sample_shading: true,
            },
        )
    }

    pub fn with_capabilities(surface_extent: Extent2D, capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            surface_extent,
            max_swapchain_extent: None,
            next_id: 1,
            live: HashSet::new(),
            peak_live: 0,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            set_layouts: HashMap::new(),
            pools: HashMap::new(),
            descriptor_sets: HashMap::new(),
            swapchains: HashMap::new(),
            attachments: HashMap::new(),
            memories: HashMap::new(),
            frames: HashMap::new(),
            acquire_overrides: VecDeque::new(),
            present_overrides: VecDeque::new(),
            buffer_failure_in: None,
            commands: Vec::new(),
            submissions: 0,
            presents: 0,
            transfers: 0,
        }
    }

    /// Simulates the window being resized
    pub fn set_surface_extent(&mut self, extent: Extent2D) {
        self.surface_extent = extent;
    }

    /// Swapchains are clamped to this size, like a driver that cannot honour the request
    pub fn set_max_swapchain_extent(&mut self, extent: Option<Extent2D>) {
        self.max_swapchain_extent = extent;
    }

    pub fn queue_acquire_status(&mut self, status: SurfaceStatus) {
        self.acquire_overrides.push_back(status);
    }

    pub fn queue_present_status(&mut self, status: PresentStatus) {
        self.present_overrides.push_back(status);
    }

    /// After `successes` more buffer creations, the next one reports device memory exhaustion
    pub fn fail_buffer_allocation_after(&mut self, successes: usize) {
        self.buffer_failure_in = Some(successes);
    }

    pub fn live_objects(&self) -> usize {
        self.live.len()
    }

    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.live.iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn peak_live_objects(&self) -> usize {
        self.peak_live
    }

    pub fn reset_peak(&mut self) {
        self.peak_live = self.live.len();
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub fn submissions(&self) -> usize {
        self.submissions
    }

    pub fn presents(&self) -> usize {
        self.presents
    }

    pub fn transfers(&self) -> usize {
        self.transfers
    }

    pub fn texture_data(&self, texture: TextureId) -> Option<&[u8]> {
        self.textures.get(&texture.0).map(|t| t.data.as_slice())
    }

    pub fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)> {
        self.textures.get(&texture.0).map(|t| (t.desc.width, t.desc.height))
    }

    pub fn buffer_size(&self, buffer: BufferId) -> Option<u64> {
        self.buffers.get(&buffer.0).map(|b| b.data.len() as u64)
    }

    pub fn descriptor_writes(&self, set: DescriptorSetId) -> Option<&[DescriptorWrite]> {
        self.descriptor_sets.get(&set.0).map(|w| w.as_slice())
    }

    pub fn swapchain_info(&self, swapchain: SwapchainId) -> Option<&SwapchainInfo> {
        self.swapchains.get(&swapchain.0).map(|s| &s.info)
    }

    pub fn attachment_desc(&self, image: ImageId) -> Option<AttachmentImageDesc> {
        self.attachments.get(&image.0).map(|a| a.desc)
    }

    fn track(&mut self, kind: ObjectKind) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert((kind, id));
        self.peak_live = self.peak_live.max(self.live.len());
        id
    }

    fn untrack(&mut self, kind: ObjectKind, id: u32) -> bool {
        self.live.remove(&(kind, id))
    }

    fn record(&mut self, frame: FrameSyncId, command: Command) {
        let recording = self.frames.get(&frame.0).is_some_and(|f| f.recording);
        assert!(recording, "command recorded outside of begin_commands/submit_commands");
        self.commands.push(command);
    }

    fn surface_changed(&self, swapchain: SwapchainId) -> bool {
        self.swapchains
            .get(&swapchain.0)
            .is_some_and(|s| s.requested != self.surface_extent)
    }
}

fn bytes_per_pixel(format: Format) -> u64 {
    match format {
        Format::Depth32Stencil8 => 8,
        _ => 4,
    }
}

impl Backend for HeadlessBackend {
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn surface_extent(&self) -> Extent2D {
        self.surface_extent
    }

    fn wait_idle(&mut self) -> DeviceResult<()> {
        self.frames.values_mut().for_each(|f| f.in_flight = false);
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferId> {
        match self.buffer_failure_in {
            Some(0) => {
                self.buffer_failure_in = None;
                return Err(DeviceError::OutOfDeviceMemory);
            }
            Some(n) => self.buffer_failure_in = Some(n - 1),
            None => {}
        }
        let id = self.track(ObjectKind::Buffer);
        self.buffers.insert(
            id,
            HeadlessBuffer {
                usage: desc.usage,
                data: vec![0; desc.size as usize],
            },
        );
        Ok(BufferId(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if self.untrack(ObjectKind::Buffer, buffer.0) {
            self.buffers.remove(&buffer.0);
        }
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let buf = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| DeviceError::Api(format!("unknown buffer {buffer:?}")))?;
        if buf.usage == BufferUsage::Geometry {
            return Err(DeviceError::Api("geometry buffers are not host visible".into()));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > buf.data.len() {
            return Err(DeviceError::Api(format!(
                "write of {} bytes at {offset} overflows buffer of {} bytes",
                data.len(),
                buf.data.len()
            )));
        }
        buf.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> DeviceResult<Vec<u8>> {
        let buf = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| DeviceError::Api(format!("unknown buffer {buffer:?}")))?;
        let start = offset as usize;
        let end = start + len as usize;
        buf.data
            .get(start..end)
            .map(|s| s.to_vec())
            .ok_or_else(|| DeviceError::Api("read out of bounds".into()))
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> DeviceResult<TextureId> {
        let id = self.track(ObjectKind::Texture);
        let size = desc.width as usize * desc.height as usize * 4;
        self.textures.insert(
            id,
            HeadlessTexture {
                desc: desc.clone(),
                data: vec![0; size],
            },
        );
        Ok(TextureId(id))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if self.untrack(ObjectKind::Texture, texture.0) {
            self.textures.remove(&texture.0);
        }
    }

    fn submit_transfer(&mut self, staging: BufferId, copies: &[TransferCopy]) -> DeviceResult<()> {
        let src = self
            .buffers
            .get(&staging.0)
            .map(|b| b.data.clone())
            .ok_or_else(|| DeviceError::Api(format!("unknown staging buffer {staging:?}")))?;
        for copy in copies {
            match *copy {
                TransferCopy::Buffer { src_offset, dst, dst_offset, size } => {
                    let dst = self
                        .buffers
                        .get_mut(&dst.0)
                        .ok_or_else(|| DeviceError::Api(format!("unknown buffer {dst:?}")))?;
                    let (s, d, n) = (src_offset as usize, dst_offset as usize, size as usize);
                    if s + n > src.len() || d + n > dst.data.len() {
                        return Err(DeviceError::Api("buffer copy out of bounds".into()));
                    }
                    dst.data[d..d + n].copy_from_slice(&src[s..s + n]);
                }
                TransferCopy::Texture { src_offset, dst } => {
                    let tex = self
                        .textures
                        .get_mut(&dst.0)
                        .ok_or_else(|| DeviceError::Api(format!("unknown texture {dst:?}")))?;
                    let (s, n) = (src_offset as usize, tex.data.len());
                    if s + n > src.len() {
                        return Err(DeviceError::Api("texture copy out of bounds".into()));
                    }
                    tex.data.copy_from_slice(&src[s..s + n]);
                }
            }
        }
        self.transfers += 1;
        Ok(())
    }

    fn create_sampler(&mut self, _desc: &SamplerDesc) -> DeviceResult<SamplerId> {
        Ok(SamplerId(self.track(ObjectKind::Sampler)))
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        self.untrack(ObjectKind::Sampler, sampler.0);
    }

    fn create_set_layout(&mut self, bindings: &[LayoutBinding]) -> DeviceResult<SetLayoutId> {
        let id = self.track(ObjectKind::SetLayout);
        self.set_layouts.insert(id, bindings.to_vec());
        Ok(SetLayoutId(id))
    }

    fn destroy_set_layout(&mut self, layout: SetLayoutId) {
        if self.untrack(ObjectKind::SetLayout, layout.0) {
            self.set_layouts.remove(&layout.0);
        }
    }

    fn create_descriptor_pool(
        &mut self,
        counts: &DescriptorCounts,
        max_sets: u32,
    ) -> DeviceResult<DescriptorPoolId> {
        let id = self.track(ObjectKind::DescriptorPool);
        self.pools.insert(
            id,
            HeadlessPool {
                remaining: *counts,
                sets_remaining: max_sets,
                sets: Vec::new(),
            },
        );
        Ok(DescriptorPoolId(id))
    }

    fn destroy_descriptor_pool(&mut self, pool: DescriptorPoolId) {
        if self.untrack(ObjectKind::DescriptorPool, pool.0) {
            if let Some(pool) = self.pools.remove(&pool.0) {
                for set in pool.sets {
                    self.descriptor_sets.remove(&set);
                }
            }
        }
    }

    fn allocate_descriptor_sets(
        &mut self,
        pool: DescriptorPoolId,
        layout: SetLayoutId,
        count: u32,
    ) -> DeviceResult<Vec<DescriptorSetId>> {
        let bindings = self
            .set_layouts
            .get(&layout.0)
            .ok_or_else(|| DeviceError::Api(format!("unknown set layout {layout:?}")))?
            .clone();
        let state = self
            .pools
            .get_mut(&pool.0)
            .ok_or_else(|| DeviceError::Api(format!("unknown descriptor pool {pool:?}")))?;
        if state.sets_remaining < count {
            return Err(DeviceError::Api("descriptor pool is out of sets".into()));
        }
        for binding in &bindings {
            let needed = binding.count * count;
            let slot = &mut state.remaining.0[binding.kind.index()];
            if *slot < needed {
                return Err(DeviceError::Api(format!(
                    "descriptor pool is out of {:?} descriptors",
                    binding.kind
                )));
            }
            *slot -= needed;
        }
        state.sets_remaining -= count;

        let mut sets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = self.next_id;
            self.next_id += 1;
            sets.push(DescriptorSetId(id));
        }
        if let Some(state) = self.pools.get_mut(&pool.0) {
            state.sets.extend(sets.iter().map(|s| s.0));
        }
        for set in &sets {
            self.descriptor_sets.insert(set.0, Vec::new());
        }
        Ok(sets)
    }

    fn write_descriptor_set(&mut self, set: DescriptorSetId, writes: &[DescriptorWrite]) {
        if let Some(existing) = self.descriptor_sets.get_mut(&set.0) {
            for write in writes {
                existing.retain(|w| !(w.binding == write.binding && w.element == write.element));
                existing.push(*write);
            }
        }
    }

    fn create_swapchain(
        &mut self,
        request: &SwapchainRequest,
        old: Option<SwapchainId>,
    ) -> DeviceResult<SwapchainInfo> {
        if request.extent.is_zero() {
            return Err(DeviceError::Api("swapchain extent must not be zero".into()));
        }
        let extent = match self.max_swapchain_extent {
            Some(max) => Extent2D::new(
                request.extent.width.min(max.width),
                request.extent.height.min(max.height),
            ),
            None => request.extent,
        };
        let id = self.track(ObjectKind::Swapchain);
        let images = (0..SWAPCHAIN_IMAGE_COUNT)
            .map(|_| {
                let image = self.next_id;
                self.next_id += 1;
                ImageId(image)
            })
            .collect();
        let info = SwapchainInfo {
            id: SwapchainId(id),
            extent,
            format: if request.srgb { Format::Bgra8Srgb } else { Format::Bgra8Unorm },
            images,
        };
        self.swapchains.insert(
            id,
            HeadlessSwapchain {
                info: info.clone(),
                requested: request.extent,
                next_image: 0,
            },
        );
        if let Some(old) = old {
            self.destroy_swapchain(old);
        }
        Ok(info)
    }

    fn destroy_swapchain(&mut self, swapchain: SwapchainId) {
        if self.untrack(ObjectKind::Swapchain, swapchain.0) {
            self.swapchains.remove(&swapchain.0);
        }
    }

    fn create_attachment_image(
        &mut self,
        desc: &AttachmentImageDesc,
    ) -> DeviceResult<(ImageId, MemoryRequirements)> {
        let id = self.track(ObjectKind::AttachmentImage);
        let size = desc.extent.width as u64
            * desc.extent.height as u64
            * bytes_per_pixel(desc.format)
            * desc.samples.max(1) as u64;
        self.attachments.insert(
            id,
            HeadlessAttachment {
                desc: *desc,
                size,
                bound: false,
            },
        );
        Ok((
            ImageId(id),
            MemoryRequirements {
                size,
                alignment: ATTACHMENT_ALIGNMENT,
                type_bits: 0b1,
            },
        ))
    }

    fn allocate_memory(&mut self, requirements: &MemoryRequirements) -> DeviceResult<MemoryId> {
        if requirements.type_bits == 0 {
            return Err(DeviceError::Api("no memory type satisfies the requirements".into()));
        }
        let id = self.track(ObjectKind::Memory);
        self.memories.insert(id, requirements.size);
        Ok(MemoryId(id))
    }

    fn free_memory(&mut self, memory: MemoryId) {
        if self.untrack(ObjectKind::Memory, memory.0) {
            self.memories.remove(&memory.0);
        }
    }

    fn bind_attachment_memory(
        &mut self,
        image: ImageId,
        memory: MemoryId,
        offset: u64,
    ) -> DeviceResult<()> {
        let memory_size = *self
            .memories
            .get(&memory.0)
            .ok_or_else(|| DeviceError::Api(format!("unknown memory {memory:?}")))?;
        let attachment = self
            .attachments
            .get_mut(&image.0)
            .ok_or_else(|| DeviceError::Api(format!("unknown attachment {image:?}")))?;
        if offset % ATTACHMENT_ALIGNMENT != 0 {
            return Err(DeviceError::Api("attachment offset is misaligned".into()));
        }
        if offset + attachment.size > memory_size {
            return Err(DeviceError::Api("attachment does not fit in its memory block".into()));
        }
        attachment.bound = true;
        Ok(())
    }

    fn destroy_attachment_image(&mut self, image: ImageId) {
        if self.untrack(ObjectKind::AttachmentImage, image.0) {
            self.attachments.remove(&image.0);
        }
    }

    fn create_render_pass(&mut self, _desc: &RenderPassDesc) -> DeviceResult<RenderPassId> {
        Ok(RenderPassId(self.track(ObjectKind::RenderPass)))
    }

    fn destroy_render_pass(&mut self, pass: RenderPassId) {
        self.untrack(ObjectKind::RenderPass, pass.0);
    }

    fn create_framebuffer(
        &mut self,
        pass: RenderPassId,
        attachments: &[ImageId],
        _extent: Extent2D,
    ) -> DeviceResult<FramebufferId> {
        if !self.live.contains(&(ObjectKind::RenderPass, pass.0)) {
            return Err(DeviceError::Api(format!("unknown render pass {pass:?}")));
        }
        let unbound = attachments.iter().any(|image| {
            self.attachments.get(&image.0).is_some_and(|a| !a.bound)
        });
        if unbound {
            return Err(DeviceError::Api("framebuffer attachment has no memory bound".into()));
        }
        Ok(FramebufferId(self.track(ObjectKind::Framebuffer)))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.untrack(ObjectKind::Framebuffer, framebuffer.0);
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> DeviceResult<PipelineId> {
        if !self.live.contains(&(ObjectKind::RenderPass, desc.render_pass.0)) {
            return Err(DeviceError::Api(format!("unknown render pass {:?}", desc.render_pass)));
        }
        Ok(PipelineId(self.track(ObjectKind::Pipeline)))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        self.untrack(ObjectKind::Pipeline, pipeline.0);
    }

    fn create_frame_sync(&mut self) -> DeviceResult<FrameSyncId> {
        let id = self.track(ObjectKind::FrameSync);
        self.frames.insert(id, HeadlessFrame::default());
        Ok(FrameSyncId(id))
    }

    fn destroy_frame_sync(&mut self, frame: FrameSyncId) {
        if self.untrack(ObjectKind::FrameSync, frame.0) {
            self.frames.remove(&frame.0);
        }
    }

    fn wait_for_frame(&mut self, frame: FrameSyncId) -> DeviceResult<()> {
        let state = self
            .frames
            .get_mut(&frame.0)
            .ok_or_else(|| DeviceError::Api(format!("unknown frame {frame:?}")))?;
        state.in_flight = false;
        Ok(())
    }

    fn acquire_image(
        &mut self,
        swapchain: SwapchainId,
        _frame: FrameSyncId,
    ) -> DeviceResult<SurfaceStatus> {
        if let Some(status) = self.acquire_overrides.pop_front() {
            return Ok(status);
        }
        if self.surface_changed(swapchain) {
            return Ok(SurfaceStatus::OutOfDate);
        }
        let chain = self
            .swapchains
            .get_mut(&swapchain.0)
            .ok_or_else(|| DeviceError::Api(format!("unknown swapchain {swapchain:?}")))?;
        let image_index = chain.next_image;
        chain.next_image = (chain.next_image + 1) % chain.info.images.len() as u32;
        Ok(SurfaceStatus::Ready {
            image_index,
            suboptimal: false,
        })
    }

    fn begin_commands(&mut self, frame: FrameSyncId) -> DeviceResult<()> {
        let state = self
            .frames
            .get_mut(&frame.0)
            .ok_or_else(|| DeviceError::Api(format!("unknown frame {frame:?}")))?;
        if state.in_flight {
            return Err(DeviceError::Api("frame reused while still in flight".into()));
        }
        state.recording = true;
        Ok(())
    }

    fn submit_commands(&mut self, frame: FrameSyncId) -> DeviceResult<()> {
        let state = self
            .frames
            .get_mut(&frame.0)
            .ok_or_else(|| DeviceError::Api(format!("unknown frame {frame:?}")))?;
        if !state.recording {
            return Err(DeviceError::Api("submitted a frame that is not recording".into()));
        }
        state.recording = false;
        state.in_flight = true;
        self.submissions += 1;
        Ok(())
    }

    fn present(
        &mut self,
        swapchain: SwapchainId,
        _frame: FrameSyncId,
        _image_index: u32,
    ) -> DeviceResult<PresentStatus> {
        self.presents += 1;
        if let Some(status) = self.present_overrides.pop_front() {
            return Ok(status);
        }
        if self.surface_changed(swapchain) {
            return Ok(PresentStatus::OutOfDate);
        }
        Ok(PresentStatus::Optimal)
    }

    fn cmd_begin_render_pass(
        &mut self,
        frame: FrameSyncId,
        pass: RenderPassId,
        framebuffer: FramebufferId,
        extent: Extent2D,
        _clear_values: &[ClearValue],
    ) {
        self.record(frame, Command::BeginRenderPass { pass, framebuffer, extent });
    }

    fn cmd_end_render_pass(&mut self, frame: FrameSyncId) {
        self.record(frame, Command::EndRenderPass);
    }

    fn cmd_bind_pipeline(&mut self, frame: FrameSyncId, pipeline: PipelineId) {
        self.record(frame, Command::BindPipeline(pipeline));
    }

    fn cmd_bind_descriptor_set(
        &mut self,
        frame: FrameSyncId,
        _pipeline: PipelineId,
        index: u32,
        set: DescriptorSetId,
        dynamic_offsets: &[u32],
    ) {
        self.record(
            frame,
            Command::BindDescriptorSet {
                index,
                set,
                dynamic_offsets: dynamic_offsets.to_vec(),
            },
        );
    }

    fn cmd_bind_geometry(
        &mut self,
        frame: FrameSyncId,
        buffer: BufferId,
        vertex_offset: u64,
        index_offset: u64,
    ) {
        self.record(
            frame,
            Command::BindGeometry {
                buffer,
                vertex_offset,
                index_offset,
            },
        );
    }

    fn cmd_push_constants(&mut self, frame: FrameSyncId, _pipeline: PipelineId, data: &[u8]) {
        self.record(frame, Command::PushConstants(data.to_vec()));
    }

    fn cmd_draw_indexed(&mut self, frame: FrameSyncId, draw: DrawIndexed) {
        self.record(frame, Command::DrawIndexed(draw));
    }

    fn cmd_draw(&mut self, frame: FrameSyncId, vertex_count: u32, instance_count: u32) {
        self.record(
            frame,
            Command::Draw {
                vertex_count,
                instance_count,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_live_objects_and_peak() {
        let mut backend = HeadlessBackend::new(Extent2D::new(64, 64));
        let a = backend
            .create_buffer(&BufferDesc { label: "a".into(), size: 16, usage: BufferUsage::Shader })
            .unwrap();
        let s = backend.create_sampler(&SamplerDesc { nearest: true, clamp_to_edge: false }).unwrap();
        assert_eq!(backend.live_objects(), 2);
        backend.destroy_buffer(a);
        backend.destroy_buffer(a);
        backend.destroy_sampler(s);
        assert_eq!(backend.live_objects(), 0);
        assert_eq!(backend.peak_live_objects(), 2);
    }

    #[test]
    fn descriptor_pool_enforces_its_budget() {
        let mut backend = HeadlessBackend::new(Extent2D::new(64, 64));
        let layout = backend
            .create_set_layout(&[LayoutBinding {
                binding: 0,
                kind: DescriptorKind::UniformBuffer,
                count: 1,
                stages: ShaderStages::Vertex,
            }])
            .unwrap();
        let mut counts = DescriptorCounts::default();
        counts.add(DescriptorKind::UniformBuffer, 2);
        let pool = backend.create_descriptor_pool(&counts, 2).unwrap();
        assert_eq!(backend.allocate_descriptor_sets(pool, layout, 2).unwrap().len(), 2);
        assert!(backend.allocate_descriptor_sets(pool, layout, 1).is_err());
    }

    #[test]
    fn resized_surface_reports_out_of_date() {
        let mut backend = HeadlessBackend::new(Extent2D::new(64, 64));
        let chain = backend
            .create_swapchain(
                &SwapchainRequest { extent: Extent2D::new(64, 64), vsync: true, srgb: true },
                None,
            )
            .unwrap();
        let frame = backend.create_frame_sync().unwrap();
        assert!(matches!(
            backend.acquire_image(chain.id, frame).unwrap(),
            SurfaceStatus::Ready { image_index: 0, .. }
        ));
        backend.set_surface_extent(Extent2D::new(32, 32));
        assert_eq!(backend.acquire_image(chain.id, frame).unwrap(), SurfaceStatus::OutOfDate);
    }
}
