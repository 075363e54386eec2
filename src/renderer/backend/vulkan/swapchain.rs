use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::backend::vulkan::convert;
use crate::renderer::backend::vulkan::device::Device;
use crate::renderer::backend::vulkan::instance::Instance;
use crate::renderer::backend::{Extent2D, Format, SwapchainRequest};
use crate::renderer::error::{DeviceError, DeviceResult};

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
    pub format: Format,
}

impl Swapchain {
    pub fn new(
        instance: &Instance,
        device: &Device,
        loader: &ash::khr::swapchain::Device,
        request: &SwapchainRequest,
        old: vk::SwapchainKHR,
    ) -> DeviceResult<Self> {
        let surface_capabilities = unsafe {
            instance
                .surface_loader
                .get_physical_device_surface_capabilities(device.physical, instance.surface)?
        };
        let surface_format = Self::choose_surface_format(instance, device, request.srgb)?;
        let format = convert::format_from_vk(surface_format.format)
            .ok_or_else(|| DeviceError::MissingCapability(format!("surface format {:?}", surface_format.format)))?;
        let present_mode = Self::choose_present_mode(instance, device, request.vsync)?;

        let image_extent = if surface_capabilities.current_extent.width != u32::MAX {
            surface_capabilities.current_extent
        } else {
            vk::Extent2D {
                width: request.extent.width.clamp(
                    surface_capabilities.min_image_extent.width,
                    surface_capabilities.max_image_extent.width,
                ),
                height: request.extent.height.clamp(
                    surface_capabilities.min_image_extent.height,
                    surface_capabilities.max_image_extent.height,
                ),
            }
        };
        if image_extent.width == 0 || image_extent.height == 0 {
            return Err(DeviceError::Api("swapchain extent must not be zero".into()));
        }

        // One more image than the minimum so acquiring does not wait on the driver
        let min_image_count = {
            let min = surface_capabilities.min_image_count;
            let max = surface_capabilities.max_image_count;
            if max > 0 && min + 1 > max { max } else { min + 1 }
        };
        let pre_transform = if surface_capabilities
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            surface_capabilities.current_transform
        };

        let swapchain_info = vk::SwapchainCreateInfoKHR::default()
            .surface(instance.surface)
            .min_image_count(min_image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(image_extent)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(old);

        let handle = unsafe { loader.create_swapchain(&swapchain_info, None)? };
        let (images, image_views) = match Self::create_image_views(device, loader, handle, surface_format.format) {
            Ok(views) => views,
            Err(e) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(e.into());
            }
        };

        log::info!(
            "Created swapchain {}x{} {:?} {:?} with {} images",
            image_extent.width,
            image_extent.height,
            surface_format.format,
            present_mode,
            images.len()
        );

        Ok(Self {
            handle,
            images,
            image_views,
            extent: image_extent,
            format,
        })
    }

    pub fn extent(&self) -> Extent2D {
        Extent2D::new(self.extent.width, self.extent.height)
    }

    fn choose_surface_format(
        instance: &Instance,
        device: &Device,
        srgb: bool,
    ) -> DeviceResult<vk::SurfaceFormatKHR> {
        let formats = unsafe {
            instance
                .surface_loader
                .get_physical_device_surface_formats(device.physical, instance.surface)?
        };
        let preferred = if srgb {
            [vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB]
        } else {
            [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM]
        };
        preferred
            .iter()
            .find_map(|wanted| {
                formats.iter().copied().find(|f| {
                    f.format == *wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
            })
            .or_else(|| {
                formats
                    .iter()
                    .copied()
                    .find(|f| convert::format_from_vk(f.format).is_some())
            })
            .ok_or_else(|| DeviceError::MissingCapability("no usable surface format".into()))
    }

    fn choose_present_mode(
        instance: &Instance,
        device: &Device,
        vsync: bool,
    ) -> DeviceResult<vk::PresentModeKHR> {
        if vsync {
            return Ok(vk::PresentModeKHR::FIFO);
        }
        let modes = unsafe {
            instance
                .surface_loader
                .get_physical_device_surface_present_modes(device.physical, instance.surface)?
        };
        Ok([vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
            .into_iter()
            .find(|mode| modes.contains(mode))
            .unwrap_or(vk::PresentModeKHR::FIFO))
    }

    fn create_image_views(
        device: &Device,
        loader: &ash::khr::swapchain::Device,
        swapchain: vk::SwapchainKHR,
        format: vk::Format,
    ) -> VkResult<(Vec<vk::Image>, Vec<vk::ImageView>)> {
        let images = unsafe { loader.get_swapchain_images(swapchain)? };
        let mut views = Vec::with_capacity(images.len());
        for image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .components(vk::ComponentMapping::default())
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image(*image);
            match unsafe { device.logical.create_image_view(&view_info, None) } {
                Ok(view) => views.push(view),
                Err(e) => {
                    for view in views {
                        unsafe { device.logical.destroy_image_view(view, None) };
                    }
                    return Err(e);
                }
            }
        }
        Ok((images, views))
    }

    pub unsafe fn destroy(self, device: &Device, loader: &ash::khr::swapchain::Device) {
        unsafe {
            for view in self.image_views {
                device.logical.destroy_image_view(view, None);
            }
            loader.destroy_swapchain(self.handle, None);
        }
    }
}
