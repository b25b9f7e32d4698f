// gpu-core - GPU resource management and presentation on Vulkan
//
// backend/ holds the device layer (queues, memory, uploads, swapchain);
// config.rs maps config.toml onto its create-infos.

pub mod backend;
pub mod config;
