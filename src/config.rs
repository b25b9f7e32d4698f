// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::backend::bootstrap::BootstrapCreateInfo;
use crate::backend::device::DeviceCreateInfo;
use crate::backend::queue::QueueSelect;
use crate::backend::swapchain::SwapchainCreateInfo;
use crate::backend::transfer::TransferConfig;
use crate::backend::vram::VramCreateInfo;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub transfer: TransferSection,
    pub device: DeviceConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "gpu-core".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Most preferred first
    pub present_modes: Vec<String>,
    pub image_count: u32,
    pub frames_in_flight: usize,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_modes: vec!["mailbox".to_string(), "fifo".to_string()],
            image_count: 2,
            frames_in_flight: 2,
            clear_color: [0.1, 0.2, 0.8, 1.0],
        }
    }
}

/// Transfer worker settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    /// Staging buffer sizes (bytes) allocated at start-up
    pub reserve: Vec<u64>,
    pub poll_ms: u64,
    pub max_idle_stages: usize,
}

impl Default for TransferSection {
    fn default() -> Self {
        let defaults = TransferConfig::default();
        Self {
            reserve: defaults.reserve,
            poll_ms: defaults.poll.as_millis() as u64,
            max_idle_stages: defaults.max_idle_stages,
        }
    }
}

/// Device settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub queue_select: QueueSelect,
    pub log_allocations: bool,
    /// Frames a deferred destruction waits
    pub defer_frames: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            queue_select: QueueSelect::Auto,
            log_allocations: true,
            defer_frames: 3,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: true,
            log_file: "gpu_core.log".to_string(),
            show_fps: true,
        }
    }
}

fn present_mode(name: &str) -> Option<vk::PresentModeKHR> {
    match name.to_lowercase().as_str() {
        "immediate" => Some(vk::PresentModeKHR::IMMEDIATE),
        "mailbox" => Some(vk::PresentModeKHR::MAILBOX),
        "fifo" => Some(vk::PresentModeKHR::FIFO),
        "fifo_relaxed" => Some(vk::PresentModeKHR::FIFO_RELAXED),
        _ => None,
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Present mode preferences as Vulkan enums; unknown names are skipped
    pub fn present_modes(&self) -> Vec<vk::PresentModeKHR> {
        let modes: Vec<vk::PresentModeKHR> = self
            .graphics
            .present_modes
            .iter()
            .filter_map(|name| {
                let mode = present_mode(name);
                if mode.is_none() {
                    log::warn!("Unknown present mode '{}', ignoring", name);
                }
                mode
            })
            .collect();
        if modes.is_empty() {
            vec![vk::PresentModeKHR::FIFO]
        } else {
            modes
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            reserve: self.transfer.reserve.clone(),
            poll: Duration::from_millis(self.transfer.poll_ms.max(1)),
            max_idle_stages: self.transfer.max_idle_stages,
        }
    }

    pub fn swapchain_info(&self) -> SwapchainCreateInfo {
        SwapchainCreateInfo {
            present_modes: self.present_modes(),
            image_count: self.graphics.image_count,
            ..Default::default()
        }
    }

    /// Everything `Bootstrap` needs except the window system's extensions
    pub fn bootstrap_info(&self) -> BootstrapCreateInfo {
        BootstrapCreateInfo {
            device: DeviceCreateInfo {
                app_name: self.window.title.clone(),
                // Validation only in debug builds
                validation: cfg!(debug_assertions) && self.debug.validation_layers,
                queue_select: self.device.queue_select,
                surface_extensions: Vec::new(),
            },
            vram: VramCreateInfo {
                transfer: self.transfer_config(),
                log_allocations: self.device.log_allocations,
            },
            swapchain: self.swapchain_info(),
            defer_frames: self.device.defer_frames,
        }
    }
}
