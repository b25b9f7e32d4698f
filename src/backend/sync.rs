// Synchronization primitives
//
// Per-frame semaphores and fence for the acquire -> render -> present loop.
// The fence is what the swapchain waits on before reusing an image.

use anyhow::Result;
use ash::vk;

use super::device::VulkanDevice;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        Ok(Self {
            image_available: device.create_semaphore()?,
            render_finished: device.create_semaphore()?,
            // Start signaled
            in_flight_fence: device.create_fence(true)?,
        })
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
