//! [`Backend`] over Vulkan.
//!
//! Objects live in per-kind maps keyed by the `u32` inside their handle. Memory
//! comes from `gpu-allocator`, descriptor sets from `gpu-descriptor`, and a
//! single queue does graphics, uploads and presentation.

mod convert;
mod device;
mod instance;
mod pipeline;
mod swapchain;
mod transfer;

use std::collections::HashMap;
use std::fmt::Debug;
use std::mem::ManuallyDrop;
use std::path::PathBuf;
use std::sync::Arc;
use ash::vk;
use color_eyre::Result;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use gpu_descriptor::{DescriptorAllocator, DescriptorSetLayoutCreateFlags, DescriptorTotalCount};
use winit::window::Window;
use crate::renderer::backend::*;
use crate::renderer::config::RenderConfig;
use crate::renderer::error::{DeviceError, DeviceResult};
use device::{DescriptorAshDevice, Device};
use instance::Instance;
use swapchain::Swapchain;
use transfer::TransferContext;

struct VkBuffer {
    raw: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct VkTexture {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Allocation,
    extent: vk::Extent3D,
}

struct VkAttachment {
    image: vk::Image,
    format: Format,
    view: Option<vk::ImageView>,
}

struct VkSetLayout {
    raw: vk::DescriptorSetLayout,
    bindings: Vec<LayoutBinding>,
    total: DescriptorTotalCount,
}

struct VkDescriptorSet {
    set: gpu_descriptor::DescriptorSet<vk::DescriptorSet>,
    layout: SetLayoutId,
}

struct VkSwapchain {
    chain: Swapchain,
    image_ids: Vec<u32>,
}

struct VkPipeline {
    raw: vk::Pipeline,
    layout: vk::PipelineLayout,
}

#[derive(Default)]
struct VkFrame {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    in_flight: vk::Fence,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
}

enum PendingCopy {
    Buffer {
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
    Texture {
        image: vk::Image,
        extent: vk::Extent3D,
        src_offset: u64,
    },
}

fn unknown(what: &str, handle: impl Debug) -> DeviceError {
    DeviceError::Api(format!("unknown {what} {handle:?}"))
}

fn ids<V>(map: &HashMap<u32, V>) -> Vec<u32> {
    map.keys().copied().collect()
}

pub struct VulkanBackend {
    window: Arc<Window>,
    shader_dir: PathBuf,
    next_id: u32,

    buffers: HashMap<u32, VkBuffer>,
    textures: HashMap<u32, VkTexture>,
    samplers: HashMap<u32, vk::Sampler>,
    set_layouts: HashMap<u32, VkSetLayout>,
    descriptor_pools: HashMap<u32, Vec<u32>>,
    descriptor_sets: HashMap<u32, VkDescriptorSet>,
    swapchains: HashMap<u32, VkSwapchain>,
    swapchain_views: HashMap<u32, vk::ImageView>,
    attachments: HashMap<u32, VkAttachment>,
    memories: HashMap<u32, Allocation>,
    render_passes: HashMap<u32, vk::RenderPass>,
    framebuffers: HashMap<u32, vk::Framebuffer>,
    pipelines: HashMap<u32, VkPipeline>,
    frames: HashMap<u32, VkFrame>,

    descriptor_allocator: DescriptorAllocator<vk::DescriptorPool, vk::DescriptorSet>,
    descriptor_device: DescriptorAshDevice,
    allocator: ManuallyDrop<Allocator>,
    transfer: TransferContext,
    swapchain_loader: ash::khr::swapchain::Device,
    device: Device,
    instance: Instance,
}

impl VulkanBackend {
    pub fn new(window: Arc<Window>, config: &RenderConfig) -> Result<Self> {
        let mut instance = Instance::new(&window)?;
        let mut device = Device::new(&instance).inspect_err(|_| unsafe { instance.destroy() })?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: (*device.logical).clone(),
            physical_device: device.physical,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe {
                    device.destroy();
                    instance.destroy();
                }
                return Err(e.into());
            }
        };

        let transfer = match TransferContext::new(&device) {
            Ok(transfer) => transfer,
            Err(e) => {
                drop(allocator);
                unsafe {
                    device.destroy();
                    instance.destroy();
                }
                return Err(e.into());
            }
        };

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance.instance, &device.logical);
        let descriptor_device = device.descriptor_device();

        Ok(Self {
            window,
            shader_dir: config.shader_dir.clone(),
            next_id: 1,

            buffers: HashMap::new(),
            textures: HashMap::new(),
            samplers: HashMap::new(),
            set_layouts: HashMap::new(),
            descriptor_pools: HashMap::new(),
            descriptor_sets: HashMap::new(),
            swapchains: HashMap::new(),
            swapchain_views: HashMap::new(),
            attachments: HashMap::new(),
            memories: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            pipelines: HashMap::new(),
            frames: HashMap::new(),

            descriptor_allocator: DescriptorAllocator::new(0),
            descriptor_device,
            allocator: ManuallyDrop::new(allocator),
            transfer,
            swapchain_loader,
            device,
            instance,
        })
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn logical(&self) -> &ash::Device {
        &self.device.logical
    }

    fn free_allocation(&mut self, allocation: Allocation) {
        if let Err(e) = self.allocator.free(allocation) {
            log::error!("Failed to free allocation: {e}");
        }
    }

    fn create_view(
        &self,
        image: vk::Image,
        format: Format,
    ) -> DeviceResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(convert::format(format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: convert::aspect(format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        Ok(unsafe { self.logical().create_image_view(&info, None)? })
    }

    fn attachment_view(&self, image: ImageId) -> Option<vk::ImageView> {
        self.attachments
            .get(&image.0)
            .and_then(|a| a.view)
            .or_else(|| self.swapchain_views.get(&image.0).copied())
    }

    /// Command buffer of a frame that is recording. Unknown frames are a caller bug.
    fn recording(&self, frame: FrameSyncId) -> vk::CommandBuffer {
        match self.frames.get(&frame.0) {
            Some(state) => state.command_buffer,
            None => panic!("recording into unknown frame {frame:?}"),
        }
    }

    fn pipeline_layout(&self, pipeline: PipelineId) -> vk::PipelineLayout {
        match self.pipelines.get(&pipeline.0) {
            Some(state) => state.layout,
            None => panic!("unknown pipeline {pipeline:?}"),
        }
    }

    fn create_frame(&self) -> DeviceResult<VkFrame> {
        let logical = self.logical();
        let mut frame = VkFrame::default();
        let result = (|| -> DeviceResult<()> {
            unsafe {
                frame.command_pool = logical.create_command_pool(
                    &vk::CommandPoolCreateInfo::default()
                        .queue_family_index(self.device.queue_family)
                        .flags(vk::CommandPoolCreateFlags::TRANSIENT),
                    None,
                )?;
                frame.command_buffer = logical.allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::default()
                        .command_pool(frame.command_pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1),
                )?[0];
                // Signalled so the first wait does not block
                frame.in_flight = logical.create_fence(
                    &vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED),
                    None,
                )?;
                frame.image_available = logical.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?;
                frame.render_finished = logical.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => Ok(frame),
            Err(e) => {
                unsafe { Self::destroy_frame(logical, &frame) };
                Err(e)
            }
        }
    }

    unsafe fn destroy_frame(logical: &ash::Device, frame: &VkFrame) {
        unsafe {
            logical.destroy_semaphore(frame.render_finished, None);
            logical.destroy_semaphore(frame.image_available, None);
            logical.destroy_fence(frame.in_flight, None);
            logical.destroy_command_pool(frame.command_pool, None);
        }
    }
}

/// Transitions a whole single-mip colour image between layouts
fn image_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    (old_layout, src_access, src_stage): (vk::ImageLayout, vk::AccessFlags, vk::PipelineStageFlags),
    (new_layout, dst_access, dst_stage): (vk::ImageLayout, vk::AccessFlags, vk::PipelineStageFlags),
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

impl Backend for VulkanBackend {
    fn capabilities(&self) -> &Capabilities {
        &self.device.capabilities
    }

    fn surface_extent(&self) -> Extent2D {
        let size = self.window.inner_size();
        Extent2D::new(size.width, size.height)
    }

    fn wait_idle(&mut self) -> DeviceResult<()> {
        unsafe { self.logical().device_wait_idle()? };
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferId> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size.max(1))
            .usage(convert::buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = unsafe { self.logical().create_buffer(&info, None)? };
        let requirements = unsafe { self.logical().get_buffer_memory_requirements(raw) };

        let allocation = self.allocator.allocate(&AllocationCreateDesc {
            name: &desc.label,
            requirements,
            location: convert::memory_location(desc.usage),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.logical().destroy_buffer(raw, None) };
                return Err(e.into());
            }
        };
        if let Err(e) = unsafe {
            self.logical()
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())
        } {
            self.free_allocation(allocation);
            unsafe { self.logical().destroy_buffer(raw, None) };
            return Err(e.into());
        }

        let id = self.next_id();
        self.buffers.insert(id, VkBuffer { raw, allocation, size: desc.size });
        Ok(BufferId(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if let Some(state) = self.buffers.remove(&buffer.0) {
            self.free_allocation(state.allocation);
            unsafe { self.logical().destroy_buffer(state.raw, None) };
        }
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let state = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| unknown("buffer", buffer))?;
        if offset + data.len() as u64 > state.size {
            return Err(DeviceError::Api(format!(
                "write of {} bytes at {offset} overruns {buffer:?}",
                data.len()
            )));
        }
        let mut slab = state
            .allocation
            .try_as_mapped_slab()
            .ok_or_else(|| DeviceError::Api(format!("{buffer:?} is not host visible")))?;
        presser::copy_from_slice_to_offset(data, &mut slab, offset as usize)
            .map_err(|e| DeviceError::Api(format!("buffer write failed: {e:?}")))?;
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> DeviceResult<Vec<u8>> {
        let state = self.buffers.get(&buffer.0).ok_or_else(|| unknown("buffer", buffer))?;
        let mapped = state
            .allocation
            .mapped_slice()
            .ok_or_else(|| DeviceError::Api(format!("{buffer:?} is not host visible")))?;
        let (start, end) = (offset as usize, (offset + len) as usize);
        mapped
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| DeviceError::Api(format!("read overruns {buffer:?}")))
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> DeviceResult<TextureId> {
        let extent = vk::Extent3D {
            width: desc.width.max(1),
            height: desc.height.max(1),
            depth: 1,
        };
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert::format(desc.format))
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.logical().create_image(&info, None)? };
        let requirements = unsafe { self.logical().get_image_memory_requirements(image) };

        let allocation = match self.allocator.allocate(&AllocationCreateDesc {
            name: &desc.label,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.logical().destroy_image(image, None) };
                return Err(e.into());
            }
        };
        let bound = unsafe {
            self.logical()
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .map_err(DeviceError::from)
        .and_then(|()| self.create_view(image, desc.format));
        let view = match bound {
            Ok(view) => view,
            Err(e) => {
                self.free_allocation(allocation);
                unsafe { self.logical().destroy_image(image, None) };
                return Err(e);
            }
        };

        let id = self.next_id();
        self.textures.insert(id, VkTexture { image, view, allocation, extent });
        Ok(TextureId(id))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if let Some(state) = self.textures.remove(&texture.0) {
            unsafe {
                self.logical().destroy_image_view(state.view, None);
                self.logical().destroy_image(state.image, None);
            }
            self.free_allocation(state.allocation);
        }
    }

    fn submit_transfer(&mut self, staging: BufferId, copies: &[TransferCopy]) -> DeviceResult<()> {
        let src = self
            .buffers
            .get(&staging.0)
            .ok_or_else(|| unknown("staging buffer", staging))?
            .raw;
        let pending = copies
            .iter()
            .map(|copy| -> DeviceResult<PendingCopy> {
                match *copy {
                    TransferCopy::Buffer { src_offset, dst, dst_offset, size } => {
                        let dst = self.buffers.get(&dst.0).ok_or_else(|| unknown("buffer", dst))?;
                        Ok(PendingCopy::Buffer {
                            dst: dst.raw,
                            region: vk::BufferCopy { src_offset, dst_offset, size },
                        })
                    }
                    TransferCopy::Texture { src_offset, dst } => {
                        let texture = self.textures.get(&dst.0).ok_or_else(|| unknown("texture", dst))?;
                        Ok(PendingCopy::Texture {
                            image: texture.image,
                            extent: texture.extent,
                            src_offset,
                        })
                    }
                }
            })
            .collect::<DeviceResult<Vec<_>>>()?;

        self.transfer.immediate_submit(&self.device, |cmd, device| {
            for copy in &pending {
                match copy {
                    PendingCopy::Buffer { dst, region } => unsafe {
                        device.cmd_copy_buffer(cmd, src, *dst, std::slice::from_ref(region));
                    },
                    PendingCopy::Texture { image, extent, src_offset } => {
                        image_barrier(
                            device,
                            cmd,
                            *image,
                            (vk::ImageLayout::UNDEFINED, vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
                            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER),
                        );
                        let region = vk::BufferImageCopy::default()
                            .buffer_offset(*src_offset)
                            .image_subresource(vk::ImageSubresourceLayers {
                                aspect_mask: vk::ImageAspectFlags::COLOR,
                                mip_level: 0,
                                base_array_layer: 0,
                                layer_count: 1,
                            })
                            .image_extent(*extent);
                        unsafe {
                            device.cmd_copy_buffer_to_image(
                                cmd,
                                src,
                                *image,
                                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                                &[region],
                            );
                        }
                        image_barrier(
                            device,
                            cmd,
                            *image,
                            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER),
                            (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::AccessFlags::SHADER_READ, vk::PipelineStageFlags::FRAGMENT_SHADER),
                        );
                    }
                }
            }
        })?;
        log::debug!("Transferred {} copies from {staging:?}", copies.len());
        Ok(())
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> DeviceResult<SamplerId> {
        let filter = if desc.nearest { vk::Filter::NEAREST } else { vk::Filter::LINEAR };
        let address_mode = if desc.clamp_to_edge {
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        } else {
            vk::SamplerAddressMode::REPEAT
        };
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { self.logical().create_sampler(&info, None)? };
        let id = self.next_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerId(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        if let Some(raw) = self.samplers.remove(&sampler.0) {
            unsafe { self.logical().destroy_sampler(raw, None) };
        }
    }

    fn create_set_layout(&mut self, bindings: &[LayoutBinding]) -> DeviceResult<SetLayoutId> {
        let raw_bindings = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(convert::descriptor_type(b.kind))
                    .descriptor_count(b.count)
                    .stage_flags(convert::stages(b.stages))
            })
            .collect::<Vec<_>>();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&raw_bindings);
        let raw = unsafe { self.logical().create_descriptor_set_layout(&info, None)? };
        let id = self.next_id();
        self.set_layouts.insert(
            id,
            VkSetLayout {
                raw,
                bindings: bindings.to_vec(),
                total: convert::total_count(bindings),
            },
        );
        Ok(SetLayoutId(id))
    }

    fn destroy_set_layout(&mut self, layout: SetLayoutId) {
        if let Some(state) = self.set_layouts.remove(&layout.0) {
            unsafe { self.logical().destroy_descriptor_set_layout(state.raw, None) };
        }
    }

    fn create_descriptor_pool(
        &mut self,
        counts: &DescriptorCounts,
        max_sets: u32,
    ) -> DeviceResult<DescriptorPoolId> {
        // The descriptor allocator sizes the real pools; this only groups sets for freeing
        log::debug!("Descriptor group for {max_sets} sets, {} descriptors", counts.total());
        let id = self.next_id();
        self.descriptor_pools.insert(id, Vec::new());
        Ok(DescriptorPoolId(id))
    }

    fn destroy_descriptor_pool(&mut self, pool: DescriptorPoolId) {
        let Some(set_ids) = self.descriptor_pools.remove(&pool.0) else {
            return;
        };
        let sets = set_ids
            .iter()
            .filter_map(|id| self.descriptor_sets.remove(id))
            .map(|state| state.set)
            .collect::<Vec<_>>();
        unsafe {
            self.descriptor_allocator.free(&self.descriptor_device, sets);
            self.descriptor_allocator.cleanup(&self.descriptor_device);
        }
    }

    fn allocate_descriptor_sets(
        &mut self,
        pool: DescriptorPoolId,
        layout: SetLayoutId,
        count: u32,
    ) -> DeviceResult<Vec<DescriptorSetId>> {
        if !self.descriptor_pools.contains_key(&pool.0) {
            return Err(unknown("descriptor pool", pool));
        }
        let state = self.set_layouts.get(&layout.0).ok_or_else(|| unknown("set layout", layout))?;
        let sets = unsafe {
            self.descriptor_allocator.allocate(
                &self.descriptor_device,
                &state.raw,
                DescriptorSetLayoutCreateFlags::empty(),
                &state.total,
                count,
            )?
        };

        let mut handles = Vec::with_capacity(sets.len());
        for set in sets {
            let id = self.next_id();
            self.descriptor_sets.insert(id, VkDescriptorSet { set, layout });
            handles.push(DescriptorSetId(id));
        }
        if let Some(group) = self.descriptor_pools.get_mut(&pool.0) {
            group.extend(handles.iter().map(|h| h.0));
        }
        Ok(handles)
    }

    fn write_descriptor_set(&mut self, set: DescriptorSetId, writes: &[DescriptorWrite]) {
        enum Info {
            Buffer(vk::DescriptorBufferInfo),
            Image(vk::DescriptorImageInfo),
        }

        let state = match self.descriptor_sets.get(&set.0) {
            Some(state) => state,
            None => panic!("writing unknown descriptor set {set:?}"),
        };
        let raw = *state.set.raw();
        let bindings = match self.set_layouts.get(&state.layout.0) {
            Some(layout) => &layout.bindings,
            None => panic!("descriptor set {set:?} outlived its layout"),
        };

        let infos = writes
            .iter()
            .map(|write| {
                let binding = bindings.iter().find(|b| b.binding == write.binding);
                let Some(binding) = binding.filter(|b| write.element < b.count) else {
                    panic!("descriptor write {}[{}] is out of range", write.binding, write.element);
                };
                let info = match write.resource {
                    DescriptorResource::Buffer { buffer, offset, range } => {
                        let Some(state) = self.buffers.get(&buffer.0) else {
                            panic!("descriptor write references unknown {buffer:?}");
                        };
                        Info::Buffer(vk::DescriptorBufferInfo {
                            buffer: state.raw,
                            offset,
                            range,
                        })
                    }
                    DescriptorResource::Sampler(sampler) => {
                        let Some(raw) = self.samplers.get(&sampler.0) else {
                            panic!("descriptor write references unknown {sampler:?}");
                        };
                        Info::Image(vk::DescriptorImageInfo::default().sampler(*raw))
                    }
                    DescriptorResource::Image(image) => {
                        let view = match image {
                            ImageRef::Texture(texture) => self.textures.get(&texture.0).map(|t| t.view),
                            ImageRef::Attachment(image) => self.attachment_view(image),
                        };
                        let Some(view) = view else {
                            panic!("descriptor write references unknown {image:?}");
                        };
                        Info::Image(
                            vk::DescriptorImageInfo::default()
                                .image_view(view)
                                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
                        )
                    }
                };
                (write, convert::descriptor_type(binding.kind), info)
            })
            .collect::<Vec<_>>();

        let raw_writes = infos
            .iter()
            .map(|(write, ty, info)| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(raw)
                    .dst_binding(write.binding)
                    .dst_array_element(write.element)
                    .descriptor_type(*ty);
                match info {
                    Info::Buffer(info) => base.buffer_info(std::slice::from_ref(info)),
                    Info::Image(info) => base.image_info(std::slice::from_ref(info)),
                }
            })
            .collect::<Vec<_>>();
        unsafe { self.logical().update_descriptor_sets(&raw_writes, &[]) };
    }

    fn create_swapchain(
        &mut self,
        request: &SwapchainRequest,
        old: Option<SwapchainId>,
    ) -> DeviceResult<SwapchainInfo> {
        let old_raw = old
            .and_then(|old| self.swapchains.get(&old.0))
            .map_or(vk::SwapchainKHR::null(), |s| s.chain.handle);
        let chain = Swapchain::new(&self.instance, &self.device, &self.swapchain_loader, request, old_raw)?;

        let image_ids = chain
            .image_views
            .iter()
            .map(|view| {
                let id = self.next_id();
                self.swapchain_views.insert(id, *view);
                id
            })
            .collect::<Vec<_>>();
        let id = self.next_id();
        let info = SwapchainInfo {
            id: SwapchainId(id),
            extent: chain.extent(),
            format: chain.format,
            images: image_ids.iter().copied().map(ImageId).collect(),
        };
        self.swapchains.insert(id, VkSwapchain { chain, image_ids });

        if let Some(old) = old {
            self.destroy_swapchain(old);
        }
        Ok(info)
    }

    fn destroy_swapchain(&mut self, swapchain: SwapchainId) {
        if let Some(state) = self.swapchains.remove(&swapchain.0) {
            for id in &state.image_ids {
                self.swapchain_views.remove(id);
            }
            unsafe { state.chain.destroy(&self.device, &self.swapchain_loader) };
        }
    }

    fn create_attachment_image(
        &mut self,
        desc: &AttachmentImageDesc,
    ) -> DeviceResult<(ImageId, MemoryRequirements)> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert::format(desc.format))
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(convert::samples(desc.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert::attachment_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.logical().create_image(&info, None)? };
        let requirements = unsafe { self.logical().get_image_memory_requirements(image) };

        let id = self.next_id();
        self.attachments.insert(
            id,
            VkAttachment {
                image,
                format: desc.format,
                view: None,
            },
        );
        Ok((
            ImageId(id),
            MemoryRequirements {
                size: requirements.size,
                alignment: requirements.alignment,
                type_bits: requirements.memory_type_bits,
            },
        ))
    }

    fn allocate_memory(&mut self, requirements: &MemoryRequirements) -> DeviceResult<MemoryId> {
        let allocation = self.allocator.allocate(&AllocationCreateDesc {
            name: "attachments",
            requirements: vk::MemoryRequirements {
                size: requirements.size,
                alignment: requirements.alignment,
                memory_type_bits: requirements.type_bits,
            },
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        let id = self.next_id();
        self.memories.insert(id, allocation);
        Ok(MemoryId(id))
    }

    fn free_memory(&mut self, memory: MemoryId) {
        if let Some(allocation) = self.memories.remove(&memory.0) {
            self.free_allocation(allocation);
        }
    }

    fn bind_attachment_memory(
        &mut self,
        image: ImageId,
        memory: MemoryId,
        offset: u64,
    ) -> DeviceResult<()> {
        let allocation = self.memories.get(&memory.0).ok_or_else(|| unknown("memory", memory))?;
        let attachment = self
            .attachments
            .get(&image.0)
            .ok_or_else(|| unknown("attachment", image))?;
        let (raw, format) = (attachment.image, attachment.format);
        unsafe {
            self.logical()
                .bind_image_memory(raw, allocation.memory(), allocation.offset() + offset)?
        };
        let view = self.create_view(raw, format)?;
        if let Some(attachment) = self.attachments.get_mut(&image.0) {
            attachment.view = Some(view);
        }
        Ok(())
    }

    fn destroy_attachment_image(&mut self, image: ImageId) {
        if let Some(state) = self.attachments.remove(&image.0) {
            unsafe {
                if let Some(view) = state.view {
                    self.logical().destroy_image_view(view, None);
                }
                self.logical().destroy_image(state.image, None);
            }
        }
    }

    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> DeviceResult<RenderPassId> {
        let raw = pipeline::create_render_pass(self.logical(), desc)?;
        let id = self.next_id();
        self.render_passes.insert(id, raw);
        log::debug!("Created render pass {}", desc.label);
        Ok(RenderPassId(id))
    }

    fn destroy_render_pass(&mut self, pass: RenderPassId) {
        if let Some(raw) = self.render_passes.remove(&pass.0) {
            unsafe { self.logical().destroy_render_pass(raw, None) };
        }
    }

    fn create_framebuffer(
        &mut self,
        pass: RenderPassId,
        attachments: &[ImageId],
        extent: Extent2D,
    ) -> DeviceResult<FramebufferId> {
        let render_pass = *self
            .render_passes
            .get(&pass.0)
            .ok_or_else(|| unknown("render pass", pass))?;
        let views = attachments
            .iter()
            .map(|image| {
                self.attachment_view(*image)
                    .ok_or_else(|| DeviceError::Api(format!("{image:?} has no view bound")))
            })
            .collect::<DeviceResult<Vec<_>>>()?;
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let raw = unsafe { self.logical().create_framebuffer(&info, None)? };
        let id = self.next_id();
        self.framebuffers.insert(id, raw);
        Ok(FramebufferId(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId) {
        if let Some(raw) = self.framebuffers.remove(&framebuffer.0) {
            unsafe { self.logical().destroy_framebuffer(raw, None) };
        }
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> DeviceResult<PipelineId> {
        let render_pass = *self
            .render_passes
            .get(&desc.render_pass.0)
            .ok_or_else(|| unknown("render pass", desc.render_pass))?;
        let set_layouts = desc
            .set_layouts
            .iter()
            .map(|layout| {
                self.set_layouts
                    .get(&layout.0)
                    .map(|l| l.raw)
                    .ok_or_else(|| unknown("set layout", layout))
            })
            .collect::<DeviceResult<Vec<_>>>()?;
        let (raw, layout) =
            pipeline::create_pipeline(self.logical(), &self.shader_dir, desc, &set_layouts, render_pass)?;
        let id = self.next_id();
        self.pipelines.insert(id, VkPipeline { raw, layout });
        log::debug!("Created pipeline {}", desc.label);
        Ok(PipelineId(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        if let Some(state) = self.pipelines.remove(&pipeline.0) {
            unsafe {
                self.logical().destroy_pipeline(state.raw, None);
                self.logical().destroy_pipeline_layout(state.layout, None);
            }
        }
    }

    fn create_frame_sync(&mut self) -> DeviceResult<FrameSyncId> {
        let frame = self.create_frame()?;
        let id = self.next_id();
        self.frames.insert(id, frame);
        Ok(FrameSyncId(id))
    }

    fn destroy_frame_sync(&mut self, frame: FrameSyncId) {
        if let Some(state) = self.frames.remove(&frame.0) {
            unsafe { Self::destroy_frame(self.logical(), &state) };
        }
    }

    fn wait_for_frame(&mut self, frame: FrameSyncId) -> DeviceResult<()> {
        let state = self.frames.get(&frame.0).ok_or_else(|| unknown("frame", frame))?;
        unsafe { self.logical().wait_for_fences(&[state.in_flight], true, u64::MAX)? };
        Ok(())
    }

    fn acquire_image(
        &mut self,
        swapchain: SwapchainId,
        frame: FrameSyncId,
    ) -> DeviceResult<SurfaceStatus> {
        let chain = self
            .swapchains
            .get(&swapchain.0)
            .ok_or_else(|| unknown("swapchain", swapchain))?;
        let state = self.frames.get(&frame.0).ok_or_else(|| unknown("frame", frame))?;
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                chain.chain.handle,
                u64::MAX,
                state.image_available,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(SurfaceStatus::Ready { image_index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SurfaceStatus::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn begin_commands(&mut self, frame: FrameSyncId) -> DeviceResult<()> {
        let state = self.frames.get(&frame.0).ok_or_else(|| unknown("frame", frame))?;
        let logical = self.logical();
        unsafe {
            logical.reset_fences(&[state.in_flight])?;
            logical.reset_command_pool(state.command_pool, vk::CommandPoolResetFlags::empty())?;
            logical.begin_command_buffer(
                state.command_buffer,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }
        Ok(())
    }

    fn submit_commands(&mut self, frame: FrameSyncId) -> DeviceResult<()> {
        let state = self.frames.get(&frame.0).ok_or_else(|| unknown("frame", frame))?;
        let logical = self.logical();
        let wait_semaphores = [state.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [state.command_buffer];
        let signal_semaphores = [state.render_finished];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            logical.end_command_buffer(state.command_buffer)?;
            logical.queue_submit(self.device.queue, &[submit], state.in_flight)?;
        }
        Ok(())
    }

    fn present(
        &mut self,
        swapchain: SwapchainId,
        frame: FrameSyncId,
        image_index: u32,
    ) -> DeviceResult<PresentStatus> {
        let chain = self
            .swapchains
            .get(&swapchain.0)
            .ok_or_else(|| unknown("swapchain", swapchain))?;
        let state = self.frames.get(&frame.0).ok_or_else(|| unknown("frame", frame))?;
        let wait_semaphores = [state.render_finished];
        let swapchains = [chain.chain.handle];
        let image_indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        match unsafe { self.swapchain_loader.queue_present(self.device.queue, &info) } {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn cmd_begin_render_pass(
        &mut self,
        frame: FrameSyncId,
        pass: RenderPassId,
        framebuffer: FramebufferId,
        extent: Extent2D,
        clear_values: &[ClearValue],
    ) {
        let cmd = self.recording(frame);
        let (Some(pass), Some(framebuffer)) = (
            self.render_passes.get(&pass.0),
            self.framebuffers.get(&framebuffer.0),
        ) else {
            panic!("beginning unknown render pass {pass:?} or framebuffer {framebuffer:?}");
        };
        let clear_values = clear_values.iter().map(convert::clear_value).collect::<Vec<_>>();
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(*pass)
            .framebuffer(*framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: convert::extent(extent),
            })
            .clear_values(&clear_values);
        unsafe {
            self.logical()
                .cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE)
        };
    }

    fn cmd_end_render_pass(&mut self, frame: FrameSyncId) {
        let cmd = self.recording(frame);
        unsafe { self.logical().cmd_end_render_pass(cmd) };
    }

    fn cmd_bind_pipeline(&mut self, frame: FrameSyncId, pipeline: PipelineId) {
        let cmd = self.recording(frame);
        let Some(state) = self.pipelines.get(&pipeline.0) else {
            panic!("binding unknown pipeline {pipeline:?}");
        };
        unsafe {
            self.logical()
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, state.raw)
        };
    }

    fn cmd_bind_descriptor_set(
        &mut self,
        frame: FrameSyncId,
        pipeline: PipelineId,
        index: u32,
        set: DescriptorSetId,
        dynamic_offsets: &[u32],
    ) {
        let cmd = self.recording(frame);
        let layout = self.pipeline_layout(pipeline);
        let Some(state) = self.descriptor_sets.get(&set.0) else {
            panic!("binding unknown descriptor set {set:?}");
        };
        unsafe {
            self.logical().cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                index,
                &[*state.set.raw()],
                dynamic_offsets,
            )
        };
    }

    fn cmd_bind_geometry(
        &mut self,
        frame: FrameSyncId,
        buffer: BufferId,
        vertex_offset: u64,
        index_offset: u64,
    ) {
        let cmd = self.recording(frame);
        let Some(state) = self.buffers.get(&buffer.0) else {
            panic!("binding unknown geometry buffer {buffer:?}");
        };
        unsafe {
            self.logical()
                .cmd_bind_vertex_buffers(cmd, 0, &[state.raw], &[vertex_offset]);
            self.logical()
                .cmd_bind_index_buffer(cmd, state.raw, index_offset, vk::IndexType::UINT32);
        }
    }

    fn cmd_push_constants(&mut self, frame: FrameSyncId, pipeline: PipelineId, data: &[u8]) {
        let cmd = self.recording(frame);
        let layout = self.pipeline_layout(pipeline);
        unsafe {
            self.logical()
                .cmd_push_constants(cmd, layout, pipeline::push_constant_stages(), 0, data)
        };
    }

    fn cmd_draw_indexed(&mut self, frame: FrameSyncId, draw: DrawIndexed) {
        let cmd = self.recording(frame);
        unsafe {
            self.logical().cmd_draw_indexed(
                cmd,
                draw.index_count,
                draw.instance_count,
                draw.first_index,
                draw.vertex_offset,
                draw.first_instance,
            )
        };
    }

    fn cmd_draw(&mut self, frame: FrameSyncId, vertex_count: u32, instance_count: u32) {
        let cmd = self.recording(frame);
        unsafe {
            self.logical()
                .cmd_draw(cmd, vertex_count, instance_count, 0, 0)
        };
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.logical().device_wait_idle() } {
            log::error!("Failed to wait for the device before teardown: {e}");
        }

        let leftover = self.framebuffers.len() + self.pipelines.len() + self.buffers.len() + self.textures.len();
        if leftover > 0 {
            log::warn!("Destroying {leftover} objects the renderer did not release");
        }
        for id in ids(&self.framebuffers) {
            self.destroy_framebuffer(FramebufferId(id));
        }
        for id in ids(&self.pipelines) {
            self.destroy_pipeline(PipelineId(id));
        }
        for id in ids(&self.render_passes) {
            self.destroy_render_pass(RenderPassId(id));
        }
        for id in ids(&self.descriptor_pools) {
            self.destroy_descriptor_pool(DescriptorPoolId(id));
        }
        for id in ids(&self.set_layouts) {
            self.destroy_set_layout(SetLayoutId(id));
        }
        for id in ids(&self.samplers) {
            self.destroy_sampler(SamplerId(id));
        }
        for id in ids(&self.textures) {
            self.destroy_texture(TextureId(id));
        }
        for id in ids(&self.buffers) {
            self.destroy_buffer(BufferId(id));
        }
        for id in ids(&self.attachments) {
            self.destroy_attachment_image(ImageId(id));
        }
        for id in ids(&self.memories) {
            self.free_memory(MemoryId(id));
        }
        for id in ids(&self.swapchains) {
            self.destroy_swapchain(SwapchainId(id));
        }
        for id in ids(&self.frames) {
            self.destroy_frame_sync(FrameSyncId(id));
        }

        unsafe {
            self.descriptor_allocator.cleanup(&self.descriptor_device);
            self.transfer.destroy(&self.device);
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy();
            self.instance.destroy();
        }
    }
}
