use std::fs::File;
use std::mem::{offset_of, size_of};
use std::path::Path;
use ash::vk;
use crate::renderer::backend::vulkan::convert;
use crate::renderer::backend::{AttachmentRole, PipelineDesc, RenderPassDesc, VertexLayout};
use crate::renderer::error::{DeviceError, DeviceResult};
use crate::renderer::resources::vertex::{Vertex2D, Vertex3D, VertexAnim3D};

pub fn create_render_pass(device: &ash::Device, desc: &RenderPassDesc) -> DeviceResult<vk::RenderPass> {
    let resolves = desc
        .attachments
        .iter()
        .any(|a| matches!(a.role, AttachmentRole::Resolve(_)));

    let attachments = desc
        .attachments
        .iter()
        .map(|attachment| {
            let base = vk::AttachmentDescription::default()
                .format(convert::format(attachment.format))
                .samples(convert::samples(attachment.samples))
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED);
            match attachment.role {
                // Multisampled colour only lives until it is resolved
                AttachmentRole::Colour(_) if resolves => base
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
                AttachmentRole::Colour(layout) => base
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .final_layout(convert::final_layout(layout)),
                AttachmentRole::Resolve(layout) => base
                    .load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .final_layout(convert::final_layout(layout)),
                AttachmentRole::Depth => base
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            }
        })
        .collect::<Vec<_>>();

    let reference = |index: usize, layout: vk::ImageLayout| vk::AttachmentReference {
        attachment: index as u32,
        layout,
    };
    let mut colour_refs = Vec::new();
    let mut resolve_refs = Vec::new();
    let mut depth_ref = None;
    for (i, attachment) in desc.attachments.iter().enumerate() {
        match attachment.role {
            AttachmentRole::Colour(_) => {
                colour_refs.push(reference(i, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
            }
            AttachmentRole::Resolve(_) => {
                resolve_refs.push(reference(i, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
            }
            AttachmentRole::Depth => {
                depth_ref = Some(reference(i, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL))
            }
        }
    }

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&colour_refs);
    if !resolve_refs.is_empty() {
        subpass = subpass.resolve_attachments(&resolve_refs);
    }
    if let Some(depth_ref) = depth_ref.as_ref() {
        subpass = subpass.depth_stencil_attachment(depth_ref);
    }

    let dependencies = [
        vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::FRAGMENT_SHADER,
            )
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
        // The offscreen result is sampled by the next pass
        vk::SubpassDependency::default()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
            .dst_access_mask(vk::AccessFlags::SHADER_READ),
    ];

    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(&dependencies);

    let pass = unsafe { device.create_render_pass(&info, None)? };
    Ok(pass)
}

fn load_shader(device: &ash::Device, dir: &Path, name: &str) -> DeviceResult<vk::ShaderModule> {
    let path = dir.join(name);
    let code = File::open(&path)
        .and_then(|mut file| ash::util::read_spv(&mut file))
        .map_err(|e| DeviceError::ShaderLoad {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    let info = vk::ShaderModuleCreateInfo::default().code(&code);
    Ok(unsafe { device.create_shader_module(&info, None)? })
}

struct VertexInput {
    binding: Option<vk::VertexInputBindingDescription>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
}

fn attribute(location: u32, format: vk::Format, offset: usize) -> vk::VertexInputAttributeDescription {
    vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset: offset as u32,
    }
}

fn binding<T>() -> Option<vk::VertexInputBindingDescription> {
    Some(vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<T>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    })
}

fn vertex_input(layout: VertexLayout) -> VertexInput {
    const VEC2: vk::Format = vk::Format::R32G32_SFLOAT;
    const VEC3: vk::Format = vk::Format::R32G32B32_SFLOAT;
    match layout {
        VertexLayout::None => VertexInput {
            binding: None,
            attributes: Vec::new(),
        },
        VertexLayout::Flat2D => VertexInput {
            binding: binding::<Vertex2D>(),
            attributes: vec![
                attribute(0, VEC3, offset_of!(Vertex2D, position)),
                attribute(1, VEC2, offset_of!(Vertex2D, texcoord)),
            ],
        },
        VertexLayout::Static3D => VertexInput {
            binding: binding::<Vertex3D>(),
            attributes: vec![
                attribute(0, VEC3, offset_of!(Vertex3D, position)),
                attribute(1, VEC3, offset_of!(Vertex3D, normal)),
                attribute(2, VEC2, offset_of!(Vertex3D, texcoord)),
                attribute(3, vk::Format::R32_UINT, offset_of!(Vertex3D, tex_id)),
            ],
        },
        VertexLayout::Animated3D => VertexInput {
            binding: binding::<VertexAnim3D>(),
            attributes: vec![
                attribute(0, VEC3, offset_of!(VertexAnim3D, position)),
                attribute(1, VEC3, offset_of!(VertexAnim3D, normal)),
                attribute(2, VEC2, offset_of!(VertexAnim3D, texcoord)),
                attribute(3, vk::Format::R32_UINT, offset_of!(VertexAnim3D, tex_id)),
                attribute(4, vk::Format::R32G32B32A32_UINT, offset_of!(VertexAnim3D, bone_ids)),
                attribute(5, vk::Format::R32G32B32A32_SFLOAT, offset_of!(VertexAnim3D, weights)),
            ],
        },
    }
}

pub fn push_constant_stages() -> vk::ShaderStageFlags {
    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
}

/// Builds the pipeline and its layout. Shader modules only live for the duration of the call.
pub fn create_pipeline(
    device: &ash::Device,
    shader_dir: &Path,
    desc: &PipelineDesc,
    set_layouts: &[vk::DescriptorSetLayout],
    render_pass: vk::RenderPass,
) -> DeviceResult<(vk::Pipeline, vk::PipelineLayout)> {
    let push_ranges = [vk::PushConstantRange {
        stage_flags: push_constant_stages(),
        offset: 0,
        size: desc.push_constant_size,
    }];
    let mut layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
    if desc.push_constant_size > 0 {
        layout_info = layout_info.push_constant_ranges(&push_ranges);
    }
    let layout = unsafe { device.create_pipeline_layout(&layout_info, None)? };

    let vertex = match load_shader(device, shader_dir, desc.vertex_shader) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            return Err(e);
        }
    };
    let fragment = match load_shader(device, shader_dir, desc.fragment_shader) {
        Ok(module) => module,
        Err(e) => {
            unsafe {
                device.destroy_shader_module(vertex, None);
                device.destroy_pipeline_layout(layout, None);
            }
            return Err(e);
        }
    };

    let result = build_pipeline(device, desc, layout, render_pass, vertex, fragment);
    unsafe {
        device.destroy_shader_module(vertex, None);
        device.destroy_shader_module(fragment, None);
    }
    match result {
        Ok(pipeline) => Ok((pipeline, layout)),
        Err(e) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(e)
        }
    }
}

fn build_pipeline(
    device: &ash::Device,
    desc: &PipelineDesc,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
    vertex: vk::ShaderModule,
    fragment: vk::ShaderModule,
) -> DeviceResult<vk::Pipeline> {
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment)
            .name(c"main"),
    ];

    let input = vertex_input(desc.vertex_layout);
    let bindings = input.binding.as_slice();
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(bindings)
        .vertex_attribute_descriptions(&input.attributes);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewports = [vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: desc.extent.width as f32,
        height: desc.extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }];
    let scissors = [vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: convert::extent(desc.extent),
    }];
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewports(&viewports)
        .scissors(&scissors);

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(if desc.cull_back_faces {
            vk::CullModeFlags::BACK
        } else {
            vk::CullModeFlags::NONE
        })
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(desc.sample_shading && desc.samples > 1)
        .min_sample_shading(1.0)
        .rasterization_samples(convert::samples(desc.samples));

    let colour_blend_attachment = if desc.alpha_blend {
        vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
    } else {
        vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
    };
    let colour_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(std::slice::from_ref(&colour_blend_attachment));

    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_test)
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

    let info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .color_blend_state(&colour_blend_state)
        .depth_stencil_state(&depth_stencil_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&info), None)
            .map_err(|(_, e)| e)?
    };
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| DeviceError::Api(format!("no pipeline created for {}", desc.label)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_attributes_cover_every_field() {
        let input = vertex_input(VertexLayout::Animated3D);
        assert_eq!(input.attributes.len(), 6);
        assert_eq!(input.binding.map(|b| b.stride), Some(size_of::<VertexAnim3D>() as u32));
        assert_eq!(input.attributes[5].offset as usize, 52);
    }

    #[test]
    fn generated_vertices_have_no_input() {
        let input = vertex_input(VertexLayout::None);
        assert!(input.binding.is_none());
        assert!(input.attributes.is_empty());
    }
}
