use ash::vk;
use crate::renderer::backend::vulkan::device::Device;
use crate::renderer::error::DeviceResult;

/// One-shot command buffer for uploads outside the frame loop
pub struct TransferContext {
    fence: vk::Fence,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
}

impl TransferContext {
    pub fn new(device: &Device) -> DeviceResult<Self> {
        let logical = &device.logical;
        let fence = unsafe { logical.create_fence(&vk::FenceCreateInfo::default(), None)? };

        let command_pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool = match unsafe { logical.create_command_pool(&command_pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { logical.destroy_fence(fence, None) };
                return Err(e.into());
            }
        };

        let command_buffer_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .command_buffer_count(1)
            .level(vk::CommandBufferLevel::PRIMARY);
        let command_buffer = match unsafe { logical.allocate_command_buffers(&command_buffer_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe {
                    logical.destroy_command_pool(command_pool, None);
                    logical.destroy_fence(fence, None);
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            fence,
            command_pool,
            command_buffer,
        })
    }

    /// Records `func` and blocks until the queue executed it
    pub fn immediate_submit<F>(&self, device: &Device, func: F) -> DeviceResult<()>
    where
        F: FnOnce(vk::CommandBuffer, &ash::Device),
    {
        let logical = &device.logical;
        let cmd = self.command_buffer;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { logical.begin_command_buffer(cmd, &begin_info)? };

        func(cmd, logical);

        let command_buffers = [cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
        unsafe {
            logical.end_command_buffer(cmd)?;
            logical.queue_submit(device.queue, &[submit], self.fence)?;
            logical.wait_for_fences(&[self.fence], true, u64::MAX)?;
            logical.reset_fences(&[self.fence])?;
            logical.reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())?;
        }

        Ok(())
    }

    pub unsafe fn destroy(&mut self, device: &Device) {
        unsafe {
            device.logical.destroy_command_pool(self.command_pool, None);
            device.logical.destroy_fence(self.fence, None);
        }
    }
}
