// Bootstrap - one-call construction of the presentation stack
//
// VulkanDevice -> Device -> Vram -> Swapchain, torn down in reverse.

use anyhow::{Context, Result};
use ash::vk;
use glam::UVec2;
use std::sync::Arc;

use super::device::{DeviceCreateInfo, VulkanDevice};
use super::gpu::{Device, Gpu};
use super::swapchain::{Swapchain, SwapchainCreateInfo};
use super::vram::{Vram, VramCreateInfo};

#[derive(Debug, Clone, Default)]
pub struct BootstrapCreateInfo {
    pub device: DeviceCreateInfo,
    pub vram: VramCreateInfo,
    pub swapchain: SwapchainCreateInfo,
    /// Frames a deferred destruction waits (0 = default)
    pub defer_frames: u32,
}

/// Field order is drop order
pub struct Bootstrap<G: Gpu + 'static = VulkanDevice> {
    pub swapchain: Swapchain,
    pub vram: Arc<Vram>,
    pub device: Arc<Device>,
    pub gpu: Arc<G>,
}

impl Bootstrap<VulkanDevice> {
    /// `make_surface` receives the freshly created instance
    pub fn new(
        info: &BootstrapCreateInfo,
        make_surface: impl FnOnce(&ash::Entry, &ash::Instance) -> Result<vk::SurfaceKHR>,
        framebuffer: UVec2,
    ) -> Result<Self> {
        let vulkan = VulkanDevice::new(&info.device, make_surface)?;
        Self::with_gpu(vulkan, info, framebuffer)
    }
}

impl<G: Gpu + 'static> Bootstrap<G> {
    pub fn with_gpu(gpu: Arc<G>, info: &BootstrapCreateInfo, framebuffer: UVec2) -> Result<Self> {
        let device = Device::new(gpu.clone(), info.defer_frames);
        let vram =
            Vram::new(device.clone(), info.vram.clone()).context("Failed to construct VRAM")?;
        let swapchain = Swapchain::new(vram.clone(), info.swapchain.clone(), framebuffer)?;

        log::info!("Vulkan bootstrapped [{}] [{}]", std::env::consts::OS, std::env::consts::ARCH);
        Ok(Self { swapchain, vram, device, gpu })
    }
}

impl<G: Gpu + 'static> Drop for Bootstrap<G> {
    fn drop(&mut self) {
        self.device.wait_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockGpu;

    #[test]
    fn builds_the_stack_and_tears_it_down() {
        let gpu = MockGpu::new();
        let info = BootstrapCreateInfo::default();
        let boot = Bootstrap::with_gpu(gpu.clone(), &info, UVec2::new(800, 600)).unwrap();
        assert_eq!(boot.swapchain.extent(), vk::Extent2D { width: 800, height: 600 });
        assert_eq!(boot.device.default_defer(), crate::backend::deferred::DEFAULT_DEFER);
        assert_eq!(gpu.live_swapchains(), 1);

        let vram = boot.vram.clone();
        let buffer = vram.create_bo("ubo", 16, vk::BufferUsageFlags::UNIFORM_BUFFER, true).unwrap();
        vram.defer_buffer(buffer, Some(100));

        drop(boot);
        // Pending deferred entries are flushed on the way down
        assert!(!vram.memory().contains_buffer(buffer));
        assert_eq!(gpu.live_swapchains(), 0);
        assert_eq!(gpu.live_views(), 0);
    }

    #[test]
    fn zero_area_surface_fails_construction() {
        let gpu = MockGpu::new();
        gpu.surface(|s| s.caps.current_extent = vk::Extent2D { width: u32::MAX, height: u32::MAX });
        assert!(Bootstrap::with_gpu(gpu, &BootstrapCreateInfo::default(), UVec2::ZERO).is_err());
    }
}
