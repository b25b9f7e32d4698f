// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Layering: queue/deferred -> gpu (Device) -> memory -> transfer/vram -> swapchain/texture
//
// Everything above `device` talks to the GPU through the `Gpu` trait.

pub mod bootstrap;
pub mod deferred;
pub mod device;
pub mod future;
pub mod gpu;
pub mod memory;
pub mod queue;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod transfer;
pub mod vram;

#[cfg(test)]
pub mod mock;

pub use bootstrap::{Bootstrap, BootstrapCreateInfo};
pub use device::{DeviceCreateInfo, VulkanDevice};
pub use future::{Future, FutureState};
pub use gpu::{Device, Gpu};
pub use memory::{BufferHandle, ImageHandle, Memory};
pub use queue::{QueueFlags, QueueMultiplex, QueueRole, QueueSelect};
pub use swapchain::{Swapchain, SwapchainCreateInfo, SwapchainFlags};
pub use texture::{Texture, TextureCreateInfo, TextureData};
pub use vram::Vram;
