//! The device seam of the renderer.
//!
//! Everything above this module speaks in terms of opaque handles and plain
//! descriptions. A [`Backend`] turns those into objects of an explicit GPU api.

pub mod headless;
pub mod vulkan;

use crate::renderer::error::DeviceResult;

macro_rules! handles {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u32);
        )*
    };
}

handles!(
    BufferId,
    /// Sampled, device-local image with a view
    TextureId,
    SamplerId,
    SetLayoutId,
    DescriptorPoolId,
    DescriptorSetId,
    SwapchainId,
    /// Attachment image or swapchain image, usable as a framebuffer attachment
    ImageId,
    MemoryId,
    RenderPassId,
    FramebufferId,
    PipelineId,
    /// Command buffer, fence and semaphores of one frame-in-flight
    FrameSyncId,
);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Bgra8Srgb,
    Bgra8Unorm,
    Rgba8Srgb,
    Rgba8Unorm,
    Depth32,
    Depth32Stencil8,
    Depth24Stencil8,
}

/// Limits and features of the selected device the core needs to lay out its resources
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub min_uniform_alignment: u64,
    pub min_storage_alignment: u64,
    /// Highest sample count usable for both colour and depth attachments
    pub max_samples: u32,
    pub depth_format: Format,
    pub sample_shading: bool,
}

impl Capabilities {
    pub fn shader_buffer_alignment(&self) -> u64 {
        self.min_uniform_alignment.max(self.min_storage_alignment).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Host-visible transfer source
    Staging,
    /// Device-local vertex and index data, filled through a transfer
    Geometry,
    /// Host-visible uniform and storage data, written every frame
    Shader,
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferCopy {
    Buffer {
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    },
    /// Copies tightly packed texels covering the whole texture
    Texture { src_offset: u64, dst: TextureId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerDesc {
    pub nearest: bool,
    pub clamp_to_edge: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    UniformBufferDynamic,
    StorageBuffer,
    StorageBufferDynamic,
    Sampler,
    SampledImage,
}

impl DescriptorKind {
    pub const COUNT: usize = 6;

    pub fn index(self) -> usize {
        match self {
            Self::UniformBuffer => 0,
            Self::UniformBufferDynamic => 1,
            Self::StorageBuffer => 2,
            Self::StorageBufferDynamic => 3,
            Self::Sampler => 4,
            Self::SampledImage => 5,
        }
    }

    pub fn is_dynamic(self) -> bool {
        matches!(self, Self::UniformBufferDynamic | Self::StorageBufferDynamic)
    }

    pub fn is_buffer(self) -> bool {
        !matches!(self, Self::Sampler | Self::SampledImage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStages {
    Vertex,
    Fragment,
    VertexFragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    pub stages: ShaderStages,
}

/// Number of descriptors of each kind a descriptor pool must hold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorCounts(pub [u32; DescriptorKind::COUNT]);

impl DescriptorCounts {
    pub fn add(&mut self, kind: DescriptorKind, count: u32) {
        self.0[kind.index()] += count;
    }

    pub fn get(&self, kind: DescriptorKind) -> u32 {
        self.0[kind.index()]
    }

    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRef {
    Texture(TextureId),
    Attachment(ImageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer {
        buffer: BufferId,
        offset: u64,
        range: u64,
    },
    Sampler(SamplerId),
    Image(ImageRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub element: u32,
    pub resource: DescriptorResource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainRequest {
    pub extent: Extent2D,
    pub vsync: bool,
    pub srgb: bool,
}

/// What the driver actually gave us, which may differ from the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub id: SwapchainId,
    pub extent: Extent2D,
    pub format: Format,
    pub images: Vec<ImageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentUsage {
    /// Colour target that is later sampled by another pass
    SampledColour,
    /// Multisampled colour that is only resolved, never stored
    TransientColour,
    Depth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentImageDesc {
    pub extent: Extent2D,
    pub format: Format,
    pub samples: u32,
    pub usage: AttachmentUsage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub type_bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalLayout {
    ShaderRead,
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentRole {
    Colour(FinalLayout),
    Resolve(FinalLayout),
    Depth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassAttachment {
    pub format: Format,
    pub samples: u32,
    pub role: AttachmentRole,
}

/// Single subpass render pass. Attachments are cleared on load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPassDesc {
    pub label: String,
    pub attachments: Vec<PassAttachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexLayout {
    /// Vertices are generated in the shader
    None,
    Flat2D,
    Static3D,
    Animated3D,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDesc {
    pub label: String,
    pub vertex_shader: &'static str,
    pub fragment_shader: &'static str,
    pub vertex_layout: VertexLayout,
    pub set_layouts: Vec<SetLayoutId>,
    pub push_constant_size: u32,
    pub render_pass: RenderPassId,
    pub extent: Extent2D,
    pub samples: u32,
    pub sample_shading: bool,
    pub depth_test: bool,
    pub alpha_blend: bool,
    pub cull_back_faces: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Colour([f32; 4]),
    Depth(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawIndexed {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// Result of acquiring a swapchain image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    Ready { image_index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    Suboptimal,
    OutOfDate,
}

impl PresentStatus {
    pub fn needs_rebuild(self) -> bool {
        !matches!(self, Self::Optimal)
    }
}

/// An explicit GPU api, driven from a single thread.
///
/// `destroy_*` calls on handles the backend does not know are ignored, so
/// teardown paths can run unconditionally.
pub trait Backend {
    fn capabilities(&self) -> &Capabilities;
    /// Current pixel size of the presentation surface
    fn surface_extent(&self) -> Extent2D;
    fn wait_idle(&mut self) -> DeviceResult<()>;

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferId>;
    fn destroy_buffer(&mut self, buffer: BufferId);
    /// Writes into a host-visible buffer
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()>;
    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> DeviceResult<Vec<u8>>;

    fn create_texture(&mut self, desc: &TextureDesc) -> DeviceResult<TextureId>;
    fn destroy_texture(&mut self, texture: TextureId);
    /// Records the copies into a one-shot command buffer and blocks until the queue finished them
    fn submit_transfer(&mut self, staging: BufferId, copies: &[TransferCopy]) -> DeviceResult<()>;

    fn create_sampler(&mut self, desc: &SamplerDesc) -> DeviceResult<SamplerId>;
    fn destroy_sampler(&mut self, sampler: SamplerId);

    fn create_set_layout(&mut self, bindings: &[LayoutBinding]) -> DeviceResult<SetLayoutId>;
    fn destroy_set_layout(&mut self, layout: SetLayoutId);
    fn create_descriptor_pool(
        &mut self,
        counts: &DescriptorCounts,
        max_sets: u32,
    ) -> DeviceResult<DescriptorPoolId>;
    /// Also frees every set allocated from the pool
    fn destroy_descriptor_pool(&mut self, pool: DescriptorPoolId);
    fn allocate_descriptor_sets(
        &mut self,
        pool: DescriptorPoolId,
        layout: SetLayoutId,
        count: u32,
    ) -> DeviceResult<Vec<DescriptorSetId>>;
    fn write_descriptor_set(&mut self, set: DescriptorSetId, writes: &[DescriptorWrite]);

    fn create_swapchain(
        &mut self,
        request: &SwapchainRequest,
        old: Option<SwapchainId>,
    ) -> DeviceResult<SwapchainInfo>;
    fn destroy_swapchain(&mut self, swapchain: SwapchainId);

    fn create_attachment_image(
        &mut self,
        desc: &AttachmentImageDesc,
    ) -> DeviceResult<(ImageId, MemoryRequirements)>;
    fn allocate_memory(&mut self, requirements: &MemoryRequirements) -> DeviceResult<MemoryId>;
    fn free_memory(&mut self, memory: MemoryId);
    /// Binds the image at `offset` inside `memory` and creates its view
    fn bind_attachment_memory(
        &mut self,
        image: ImageId,
        memory: MemoryId,
        offset: u64,
    ) -> DeviceResult<()>;
    fn destroy_attachment_image(&mut self, image: ImageId);

    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> DeviceResult<RenderPassId>;
    fn destroy_render_pass(&mut self, pass: RenderPassId);
    fn create_framebuffer(
        &mut self,
        pass: RenderPassId,
        attachments: &[ImageId],
        extent: Extent2D,
    ) -> DeviceResult<FramebufferId>;
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId);
    fn create_pipeline(&mut self, desc: &PipelineDesc) -> DeviceResult<PipelineId>;
    fn destroy_pipeline(&mut self, pipeline: PipelineId);

    fn create_frame_sync(&mut self) -> DeviceResult<FrameSyncId>;
    fn destroy_frame_sync(&mut self, frame: FrameSyncId);
    /// Blocks until the last submission of `frame` finished
    fn wait_for_frame(&mut self, frame: FrameSyncId) -> DeviceResult<()>;
    /// Signals the image-ready semaphore of `frame`
    fn acquire_image(
        &mut self,
        swapchain: SwapchainId,
        frame: FrameSyncId,
    ) -> DeviceResult<SurfaceStatus>;
    /// Resets the fence and command pool of `frame` and begins recording
    fn begin_commands(&mut self, frame: FrameSyncId) -> DeviceResult<()>;
    /// Ends recording and submits, waiting on image-ready and signalling render-finished
    fn submit_commands(&mut self, frame: FrameSyncId) -> DeviceResult<()>;
    fn present(
        &mut self,
        swapchain: SwapchainId,
        frame: FrameSyncId,
        image_index: u32,
    ) -> DeviceResult<PresentStatus>;

    fn cmd_begin_render_pass(
        &mut self,
        frame: FrameSyncId,
        pass: RenderPassId,
        framebuffer: FramebufferId,
        extent: Extent2D,
        clear_values: &[ClearValue],
    );
    fn cmd_end_render_pass(&mut self, frame: FrameSyncId);
    fn cmd_bind_pipeline(&mut self, frame: FrameSyncId, pipeline: PipelineId);
    fn cmd_bind_descriptor_set(
        &mut self,
        frame: FrameSyncId,
        pipeline: PipelineId,
        index: u32,
        set: DescriptorSetId,
        dynamic_offsets: &[u32],
    );
    fn cmd_bind_geometry(
        &mut self,
        frame: FrameSyncId,
        buffer: BufferId,
        vertex_offset: u64,
        index_offset: u64,
    );
    fn cmd_push_constants(&mut self, frame: FrameSyncId, pipeline: PipelineId, data: &[u8]);
    fn cmd_draw_indexed(&mut self, frame: FrameSyncId, draw: DrawIndexed);
    fn cmd_draw(&mut self, frame: FrameSyncId, vertex_count: u32, instance_count: u32);
}
