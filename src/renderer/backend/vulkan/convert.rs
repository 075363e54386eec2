use ash::vk;
use gpu_descriptor::DescriptorTotalCount;
use crate::renderer::backend::{
    AttachmentUsage, BufferUsage, ClearValue, DescriptorKind, FinalLayout, Format, LayoutBinding,
    ShaderStages,
};
use crate::renderer::error::DeviceError;

impl From<vk::Result> for DeviceError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            other => Self::Api(other.to_string()),
        }
    }
}

impl From<gpu_allocator::AllocationError> for DeviceError {
    fn from(error: gpu_allocator::AllocationError) -> Self {
        match error {
            gpu_allocator::AllocationError::OutOfMemory => Self::OutOfDeviceMemory,
            other => Self::Api(other.to_string()),
        }
    }
}

impl From<gpu_descriptor::AllocationError> for DeviceError {
    fn from(error: gpu_descriptor::AllocationError) -> Self {
        match error {
            gpu_descriptor::AllocationError::OutOfDeviceMemory => Self::OutOfDeviceMemory,
            gpu_descriptor::AllocationError::OutOfHostMemory => Self::OutOfHostMemory,
            other => Self::Api(format!("descriptor allocation failed: {other:?}")),
        }
    }
}

pub fn format(format: Format) -> vk::Format {
    match format {
        Format::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Depth32 => vk::Format::D32_SFLOAT,
        Format::Depth32Stencil8 => vk::Format::D32_SFLOAT_S8_UINT,
        Format::Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
    }
}

pub fn format_from_vk(format: vk::Format) -> Option<Format> {
    match format {
        vk::Format::B8G8R8A8_SRGB => Some(Format::Bgra8Srgb),
        vk::Format::B8G8R8A8_UNORM => Some(Format::Bgra8Unorm),
        vk::Format::R8G8B8A8_SRGB => Some(Format::Rgba8Srgb),
        vk::Format::R8G8B8A8_UNORM => Some(Format::Rgba8Unorm),
        vk::Format::D32_SFLOAT => Some(Format::Depth32),
        vk::Format::D32_SFLOAT_S8_UINT => Some(Format::Depth32Stencil8),
        vk::Format::D24_UNORM_S8_UINT => Some(Format::Depth24Stencil8),
        _ => None,
    }
}

pub fn is_depth(format: Format) -> bool {
    matches!(format, Format::Depth32 | Format::Depth32Stencil8 | Format::Depth24Stencil8)
}

pub fn aspect(format: Format) -> vk::ImageAspectFlags {
    if is_depth(format) {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub fn samples(count: u32) -> vk::SampleCountFlags {
    match count {
        0 | 1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        32 => vk::SampleCountFlags::TYPE_32,
        _ => vk::SampleCountFlags::TYPE_64,
    }
}

/// Highest single sample count contained in `flags`
pub fn max_sample_count(flags: vk::SampleCountFlags) -> u32 {
    [
        (vk::SampleCountFlags::TYPE_64, 64),
        (vk::SampleCountFlags::TYPE_32, 32),
        (vk::SampleCountFlags::TYPE_16, 16),
        (vk::SampleCountFlags::TYPE_8, 8),
        (vk::SampleCountFlags::TYPE_4, 4),
        (vk::SampleCountFlags::TYPE_2, 2),
    ]
    .into_iter()
    .find(|(flag, _)| flags.contains(*flag))
    .map_or(1, |(_, count)| count)
}

pub fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorKind::StorageBufferDynamic => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
    }
}

pub fn stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    match stages {
        ShaderStages::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStages::Fragment => vk::ShaderStageFlags::FRAGMENT,
        ShaderStages::VertexFragment => vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
    }
}

/// What the descriptor allocator must reserve for one set of this layout
pub fn total_count(bindings: &[LayoutBinding]) -> DescriptorTotalCount {
    let mut total = DescriptorTotalCount::default();
    for binding in bindings {
        let slot = match binding.kind {
            DescriptorKind::UniformBuffer => &mut total.uniform_buffer,
            DescriptorKind::UniformBufferDynamic => &mut total.uniform_buffer_dynamic,
            DescriptorKind::StorageBuffer => &mut total.storage_buffer,
            DescriptorKind::StorageBufferDynamic => &mut total.storage_buffer_dynamic,
            DescriptorKind::Sampler => &mut total.sampler,
            DescriptorKind::SampledImage => &mut total.sampled_image,
        };
        *slot += binding.count;
    }
    total
}

pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    match usage {
        BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        BufferUsage::Geometry => {
            vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST
        }
        BufferUsage::Shader => {
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER
        }
    }
}

pub fn memory_location(usage: BufferUsage) -> gpu_allocator::MemoryLocation {
    match usage {
        BufferUsage::Geometry => gpu_allocator::MemoryLocation::GpuOnly,
        BufferUsage::Staging | BufferUsage::Shader => gpu_allocator::MemoryLocation::CpuToGpu,
    }
}

pub fn attachment_usage(usage: AttachmentUsage) -> vk::ImageUsageFlags {
    match usage {
        AttachmentUsage::SampledColour => {
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
        }
        AttachmentUsage::TransientColour => {
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
        }
        AttachmentUsage::Depth => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
    }
}

pub fn final_layout(layout: FinalLayout) -> vk::ImageLayout {
    match layout {
        FinalLayout::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        FinalLayout::Present => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

pub fn clear_value(value: &ClearValue) -> vk::ClearValue {
    match *value {
        ClearValue::Colour(float32) => vk::ClearValue {
            color: vk::ClearColorValue { float32 },
        },
        ClearValue::Depth(depth) => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
        },
    }
}

pub fn extent(extent: crate::renderer::backend::Extent2D) -> vk::Extent2D {
    vk::Extent2D {
        width: extent.width,
        height: extent.height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_highest_sample_count() {
        let flags = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_8;
        assert_eq!(max_sample_count(flags), 8);
        assert_eq!(max_sample_count(vk::SampleCountFlags::TYPE_1), 1);
    }

    #[test]
    fn descriptor_totals_follow_the_bindings() {
        let bindings = [
            LayoutBinding {
                binding: 0,
                kind: DescriptorKind::Sampler,
                count: 1,
                stages: ShaderStages::Fragment,
            },
            LayoutBinding {
                binding: 1,
                kind: DescriptorKind::SampledImage,
                count: 256,
                stages: ShaderStages::Fragment,
            },
        ];
        let total = total_count(&bindings);
        assert_eq!(total.sampler, 1);
        assert_eq!(total.sampled_image, 256);
        assert_eq!(total.uniform_buffer, 0);
    }

    #[test]
    fn surface_loss_maps_to_its_own_error() {
        assert!(matches!(
            DeviceError::from(vk::Result::ERROR_SURFACE_LOST_KHR),
            DeviceError::SurfaceLost
        ));
        assert!(matches!(
            DeviceError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            DeviceError::Api(_)
        ));
    }
}
