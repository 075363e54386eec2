use std::ffi::{c_char, CStr};
use std::sync::Arc;
use ash::vk;
use color_eyre::eyre::OptionExt;
use color_eyre::Result;
use gpu_descriptor::{
    CreatePoolError, DescriptorDevice, DescriptorPoolCreateFlags, DescriptorTotalCount,
    DeviceAllocationError,
};
use crate::renderer::backend::vulkan::convert;
use crate::renderer::backend::vulkan::instance::Instance;
use crate::renderer::backend::{Capabilities, Format};

/// Logical device plus the single queue used for graphics, transfer and presentation
pub struct Device {
    pub logical: Arc<ash::Device>,
    pub physical: vk::PhysicalDevice,
    pub queue_family: u32,
    pub queue: vk::Queue,
    pub capabilities: Capabilities,
}

impl Device {
    pub fn new(instance: &Instance) -> Result<Self> {
        let (physical, queue_family) = Self::select_physical_device(instance)?;
        let capabilities = Self::query_capabilities(&instance.instance, physical)?;
        let logical = Self::create_logical_device(
            &instance.instance,
            physical,
            queue_family,
            capabilities.sample_shading,
        )?;
        let queue = unsafe { logical.get_device_queue(queue_family, 0) };

        Ok(Self {
            logical: Arc::new(logical),
            physical,
            queue_family,
            queue,
            capabilities,
        })
    }

    pub fn descriptor_device(&self) -> DescriptorAshDevice {
        DescriptorAshDevice::from(self.logical.clone())
    }

    fn select_physical_device(instance: &Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let required = Self::required_device_extensions();
        let (device, family) = unsafe {
            instance
                .instance
                .enumerate_physical_devices()?
                .into_iter()
                // Filter out devices that do not contain the required device extensions
                .filter(|device| {
                    let supported = instance
                        .instance
                        .enumerate_device_extension_properties(*device)
                        .unwrap_or_default();
                    required.iter().all(|req| {
                        let found = supported
                            .iter()
                            .any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == *req));
                        if !found {
                            log::warn!("Device extension not supported: {req:?}");
                        }
                        found
                    })
                })
                // The graphics queue must also be able to present
                .filter_map(|device| {
                    instance
                        .instance
                        .get_physical_device_queue_family_properties(device)
                        .iter()
                        .enumerate()
                        .position(|(i, q)| {
                            let graphics = q.queue_flags.contains(vk::QueueFlags::GRAPHICS);
                            let present = instance
                                .surface_loader
                                .get_physical_device_surface_support(device, i as u32, instance.surface)
                                .unwrap_or(false);
                            graphics && present
                        })
                        .map(|family| (device, family as u32))
                })
                .min_by_key(|(device, _)| {
                    let props = instance.instance.get_physical_device_properties(*device);
                    match props.device_type {
                        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
                        vk::PhysicalDeviceType::CPU => 3,
                        vk::PhysicalDeviceType::OTHER => 4,
                        _ => 5,
                    }
                })
                .ok_or_eyre("No suitable physical device found")?
        };

        let props = unsafe { instance.instance.get_physical_device_properties(device) };
        log::info!(
            "Selected device {:?} ({:?})",
            props.device_name_as_c_str().unwrap_or(c"unknown"),
            props.device_type
        );
        Ok((device, family))
    }

    fn query_capabilities(
        instance: &ash::Instance,
        physical: vk::PhysicalDevice,
    ) -> Result<Capabilities> {
        let (props, features) = unsafe {
            (
                instance.get_physical_device_properties(physical),
                instance.get_physical_device_features(physical),
            )
        };
        let limits = props.limits;
        let depth_format = [Format::Depth32, Format::Depth32Stencil8, Format::Depth24Stencil8]
            .into_iter()
            .find(|format| {
                let props = unsafe {
                    instance.get_physical_device_format_properties(physical, convert::format(*format))
                };
                props
                    .optimal_tiling_features
                    .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            })
            .ok_or_eyre("No supported depth format")?;

        Ok(Capabilities {
            min_uniform_alignment: limits.min_uniform_buffer_offset_alignment,
            min_storage_alignment: limits.min_storage_buffer_offset_alignment,
            max_samples: convert::max_sample_count(
                limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts,
            ),
            depth_format,
            sample_shading: features.sample_rate_shading == vk::TRUE,
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical: vk::PhysicalDevice,
        queue_family: u32,
        sample_shading: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)];
        let enabled_extension_names = Self::required_device_extensions()
            .iter()
            .map(|ext| ext.as_ptr())
            .collect::<Vec<*const c_char>>();
        let enabled_features = vk::PhysicalDeviceFeatures::default().sample_rate_shading(sample_shading);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&enabled_extension_names)
            .enabled_features(&enabled_features);

        Ok(unsafe { instance.create_device(physical, &device_create_info, None)? })
    }

    fn required_device_extensions() -> Vec<&'static CStr> {
        vec![
            ash::khr::swapchain::NAME,
            #[cfg(target_os = "macos")]
            ash::khr::portability_subset::NAME,
        ]
    }

    pub unsafe fn destroy(&mut self) {
        unsafe { self.logical.destroy_device(None) };
    }
}

/// Lets `gpu-descriptor` create pools and sets on an ash device
pub struct DescriptorAshDevice(pub Arc<ash::Device>);

impl From<Arc<ash::Device>> for DescriptorAshDevice {
    fn from(device: Arc<ash::Device>) -> Self {
        Self(device)
    }
}

impl DescriptorDevice<vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet>
    for DescriptorAshDevice
{
    unsafe fn create_descriptor_pool(
        &self,
        descriptor_count: &DescriptorTotalCount,
        max_sets: u32,
        flags: DescriptorPoolCreateFlags,
    ) -> Result<vk::DescriptorPool, CreatePoolError> {
        let sizes = [
            (vk::DescriptorType::SAMPLER, descriptor_count.sampler),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, descriptor_count.combined_image_sampler),
            (vk::DescriptorType::SAMPLED_IMAGE, descriptor_count.sampled_image),
            (vk::DescriptorType::STORAGE_IMAGE, descriptor_count.storage_image),
            (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, descriptor_count.uniform_texel_buffer),
            (vk::DescriptorType::STORAGE_TEXEL_BUFFER, descriptor_count.storage_texel_buffer),
            (vk::DescriptorType::UNIFORM_BUFFER, descriptor_count.uniform_buffer),
            (vk::DescriptorType::STORAGE_BUFFER, descriptor_count.storage_buffer),
            (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, descriptor_count.uniform_buffer_dynamic),
            (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, descriptor_count.storage_buffer_dynamic),
            (vk::DescriptorType::INPUT_ATTACHMENT, descriptor_count.input_attachment),
        ]
        .into_iter()
        .filter(|(_, count)| *count != 0)
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
        .collect::<smallvec::SmallVec<[_; 11]>>();

        let mut ash_flags = vk::DescriptorPoolCreateFlags::empty();
        if flags.contains(DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET) {
            ash_flags |= vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET;
        }
        if flags.contains(DescriptorPoolCreateFlags::UPDATE_AFTER_BIND) {
            ash_flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }

        let result = unsafe {
            self.0.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(max_sets)
                    .pool_sizes(&sizes)
                    .flags(ash_flags),
                None,
            )
        };

        match result {
            Ok(pool) => Ok(pool),
            Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => Err(CreatePoolError::OutOfHostMemory),
            Err(vk::Result::ERROR_FRAGMENTATION) => Err(CreatePoolError::Fragmentation),
            Err(_) => Err(CreatePoolError::OutOfDeviceMemory),
        }
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.0.destroy_descriptor_pool(pool, None) }
    }

    unsafe fn alloc_descriptor_sets<'a>(
        &self,
        pool: &mut vk::DescriptorPool,
        layouts: impl ExactSizeIterator<Item = &'a vk::DescriptorSetLayout>,
        sets: &mut impl Extend<vk::DescriptorSet>,
    ) -> Result<(), DeviceAllocationError> {
        let set_layouts: smallvec::SmallVec<[_; 16]> = layouts.copied().collect();

        let result = unsafe {
            self.0.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .set_layouts(&set_layouts)
                    .descriptor_pool(*pool),
            )
        };
        match result {
            Ok(allocated) => {
                sets.extend(allocated);
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => Err(DeviceAllocationError::OutOfHostMemory),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Err(DeviceAllocationError::OutOfDeviceMemory),
            Err(vk::Result::ERROR_FRAGMENTED_POOL) => Err(DeviceAllocationError::FragmentedPool),
            Err(_) => Err(DeviceAllocationError::OutOfPoolMemory),
        }
    }

    unsafe fn dealloc_descriptor_sets(
        &self,
        pool: &mut vk::DescriptorPool,
        sets: impl Iterator<Item = vk::DescriptorSet>,
    ) {
        let sets: smallvec::SmallVec<[_; 16]> = sets.collect();
        if let Err(e) = unsafe { self.0.free_descriptor_sets(*pool, &sets) } {
            log::error!("Failed to free descriptor sets: {e}");
        }
    }
}
