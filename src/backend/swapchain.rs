// Swapchain - Window presentation
//
// Acquire/present state machine over the presentation engine:
// - Paused and OutOfDate block acquisition until `reconstruct`
// - Suboptimal is sticky and only advisory
// - Rotated tracks axis-swapping surface transforms relative to the
//   transform seen at first construction
//
// Reconstruction retires the previous swapchain; its images, views and
// depth buffer are released through the deferred queue.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use glam::UVec2;
use std::sync::Arc;

use super::gpu::{Gpu, ViewDesc};
use super::memory::{ImageCreateInfo, ImageHandle, Memory, MemoryUsage, Sharing};
use super::queue::QueueFlags;
use super::vram::Vram;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SwapchainFlags: u8 {
        /// Zero-area surface; nothing to render into
        const PAUSED = 1 << 0;
        const OUT_OF_DATE = 1 << 1;
        const SUBOPTIMAL = 1 << 2;
        /// Surface transform swapped axes since first construction
        const ROTATED = 1 << 3;
    }
}

/// Everything `Presenter::create_swapchain` needs besides the surface
#[derive(Debug, Clone)]
pub struct SwapchainDesc {
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub sharing: Sharing,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
    pub old_swapchain: vk::SwapchainKHR,
}

/// Presentation engine access for the device's surface
pub trait Presenter {
    fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR>;
    fn surface_formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>>;
    fn surface_present_modes(&self) -> Result<Vec<vk::PresentModeKHR>>;
    /// Optimal tiling supports depth/stencil attachment for `format`
    fn supports_depth_format(&self, format: vk::Format) -> bool;
    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// Ok((index, suboptimal))
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    /// Ok(suboptimal); submitted under the present queue's lock
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool>;
}

/// Creation preferences, most preferred first
#[derive(Debug, Clone, PartialEq)]
pub struct SwapchainCreateInfo {
    pub colour_spaces: Vec<vk::ColorSpaceKHR>,
    pub colour_formats: Vec<vk::Format>,
    pub depth_formats: Vec<vk::Format>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub image_count: u32,
}

impl Default for SwapchainCreateInfo {
    fn default() -> Self {
        Self {
            colour_spaces: vec![vk::ColorSpaceKHR::SRGB_NONLINEAR],
            colour_formats: vec![vk::Format::B8G8R8A8_SRGB],
            depth_formats: vec![
                vk::Format::D32_SFLOAT_S8_UINT,
                vk::Format::D32_SFLOAT,
                vk::Format::D24_UNORM_S8_UINT,
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO],
            image_count: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attachment {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

/// What the renderer draws into for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameTarget {
    pub colour: Attachment,
    pub depth: Attachment,
    pub extent: vk::Extent2D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Display {
    pub extent: vk::Extent2D,
    pub transform: vk::SurfaceTransformFlagsKHR,
}

#[derive(Debug, Clone, Copy, Default)]
struct Frame {
    target: FrameTarget,
    drawn: vk::Fence,
}

#[derive(Default)]
struct Storage {
    swapchain: vk::SwapchainKHR,
    depth: Option<(ImageHandle, vk::ImageView)>,
    frames: Vec<Frame>,
    image_index: u32,
    current: Display,
    flags: SwapchainFlags,
}

/// Position of `value` in a preference list (list length when absent)
fn rank<T: PartialEq>(list: &[T], value: T) -> usize {
    list.iter().position(|x| *x == value).unwrap_or(list.len())
}

/// Resolved creation parameters for one construction
struct Selection {
    colour: vk::SurfaceFormatKHR,
    depth: vk::Format,
    present_mode: vk::PresentModeKHR,
    composite_alpha: vk::CompositeAlphaFlagsKHR,
    image_count: u32,
}

impl Selection {
    fn new(
        info: &SwapchainCreateInfo,
        caps: &vk::SurfaceCapabilitiesKHR,
        formats: &[vk::SurfaceFormatKHR],
        modes: &[vk::PresentModeKHR],
        supports_depth: impl Fn(vk::Format) -> bool,
    ) -> Result<Self> {
        let colour = formats
            .iter()
            .copied()
            .min_by_key(|f| {
                rank(&info.colour_spaces, f.color_space) + rank(&info.colour_formats, f.format)
            })
            .context("Surface reports no colour formats")?;

        let depth = info
            .depth_formats
            .iter()
            .copied()
            .find(|&format| supports_depth(format))
            .unwrap_or(vk::Format::D16_UNORM);

        let present_mode = info
            .present_modes
            .iter()
            .copied()
            .find(|mode| modes.contains(mode))
            .or_else(|| modes.first().copied())
            .context("Surface reports no present modes")?;

        let composite_alpha = [
            vk::CompositeAlphaFlagsKHR::OPAQUE,
            vk::CompositeAlphaFlagsKHR::INHERIT,
            vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        ]
        .into_iter()
        .find(|&alpha| caps.supported_composite_alpha.contains(alpha))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED);

        let mut image_count = info.image_count.max(caps.min_image_count + 1);
        if caps.max_image_count > 0 {
            image_count = image_count.min(caps.max_image_count);
        }

        Ok(Self { colour, depth, present_mode, composite_alpha, image_count })
    }
}

/// Framebuffer sizes with zero area cannot be presented
pub fn valid(framebuffer: UVec2) -> bool {
    framebuffer.x > 0 && framebuffer.y > 0
}

/// Surface extent, or the clamped framebuffer size when the surface leaves
/// it to the application (current extent of u32::MAX)
fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, framebuffer: UVec2) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else if valid(framebuffer) {
        vk::Extent2D {
            width: framebuffer.x.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: framebuffer.y.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    } else {
        vk::Extent2D::default()
    }
}

fn swaps_axes(transform: vk::SurfaceTransformFlagsKHR) -> bool {
    transform.intersects(
        vk::SurfaceTransformFlagsKHR::ROTATE_90
            | vk::SurfaceTransformFlagsKHR::ROTATE_270
            | vk::SurfaceTransformFlagsKHR::HORIZONTAL_MIRROR_ROTATE_90
            | vk::SurfaceTransformFlagsKHR::HORIZONTAL_MIRROR_ROTATE_270,
    )
}

pub fn present_mode_name(mode: vk::PresentModeKHR) -> &'static str {
    match mode {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO Relaxed",
        vk::PresentModeKHR::IMMEDIATE => "Immediate",
        vk::PresentModeKHR::MAILBOX => "Mailbox",
        _ => "Other",
    }
}

pub struct Swapchain {
    storage: Storage,
    info: SwapchainCreateInfo,
    retired: vk::SwapchainKHR,
    original: Option<Display>,
    present_mode: vk::PresentModeKHR,
    available_modes: Vec<vk::PresentModeKHR>,
    colour_format: vk::Format,
    depth_format: vk::Format,
    gpu: Arc<dyn Gpu>,
    vram: Arc<Vram>,
}

impl Swapchain {
    pub fn new(vram: Arc<Vram>, info: SwapchainCreateInfo, framebuffer: UVec2) -> Result<Self> {
        let gpu = vram.device().gpu().clone();
        let mut swapchain = Self {
            storage: Storage::default(),
            info,
            retired: vk::SwapchainKHR::null(),
            original: None,
            present_mode: vk::PresentModeKHR::FIFO,
            available_modes: Vec::new(),
            colour_format: vk::Format::UNDEFINED,
            depth_format: vk::Format::UNDEFINED,
            gpu,
            vram,
        };
        if !swapchain.construct(framebuffer)? {
            anyhow::bail!("Failed to construct Vulkan swapchain: surface has zero area");
        }

        let extent = swapchain.extent();
        log::info!(
            "Vulkan swapchain constructed [{}x{}] [{}]",
            extent.width,
            extent.height,
            present_mode_name(swapchain.present_mode)
        );
        Ok(swapchain)
    }

    /// Build a fresh storage; Ok(false) when the surface has zero area
    fn construct(&mut self, framebuffer: UVec2) -> Result<bool> {
        self.storage = Storage::default();
        let gpu = self.gpu.clone();

        let caps = gpu.surface_capabilities().context("Failed to query surface capabilities")?;
        let formats = gpu.surface_formats().context("Failed to query surface formats")?;
        let modes = gpu.surface_present_modes().context("Failed to query present modes")?;
        let selection = Selection::new(&self.info, &caps, &formats, &modes, |f| {
            gpu.supports_depth_format(f)
        })?;
        self.available_modes = modes;

        let extent = choose_extent(&caps, framebuffer);
        if extent.width == 0 || extent.height == 0 {
            self.storage.flags.insert(SwapchainFlags::PAUSED);
            return Ok(false);
        }

        let display = Display { extent, transform: caps.current_transform };
        let desc = SwapchainDesc {
            min_image_count: selection.image_count,
            format: selection.colour,
            extent,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            sharing: self.vram.device().sharing(
                QueueFlags::GRAPHICS | QueueFlags::PRESENT,
                vk::SharingMode::CONCURRENT,
            ),
            pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            composite_alpha: selection.composite_alpha,
            present_mode: selection.present_mode,
            old_swapchain: self.retired,
        };
        self.storage.swapchain = gpu.create_swapchain(&desc).context("Failed to create swapchain")?;
        self.storage.current = display;
        self.retired = vk::SwapchainKHR::null();
        self.present_mode = selection.present_mode;
        self.colour_format = selection.colour.format;
        self.depth_format = selection.depth;
        self.original.get_or_insert(display);

        // Step 2: Depth buffer, shared by every frame
        let depth_image = self.vram.memory().construct_image(&ImageCreateInfo {
            name: "swapchain/depth".into(),
            extent: vk::Extent3D { width: extent.width, height: extent.height, depth: 1 },
            format: selection.depth,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            tiling: vk::ImageTiling::OPTIMAL,
            layers: 1,
            memory: MemoryUsage::GpuOnly,
            queue_flags: QueueFlags::GRAPHICS,
            ..Default::default()
        })?;
        let depth = self
            .vram
            .memory()
            .image(depth_image)
            .context("Depth image vanished during construction")?;
        let depth_view = match gpu.create_image_view(&ViewDesc {
            image: depth.image,
            format: selection.depth,
            aspect: vk::ImageAspectFlags::DEPTH,
            view_type: vk::ImageViewType::TYPE_2D,
            layers: 1,
        }) {
            Ok(view) => view,
            Err(e) => {
                self.vram.memory().destroy_image(depth_image);
                return Err(e.context("Failed to create depth view"));
            }
        };
        self.storage.depth = Some((depth_image, depth_view));

        // Step 3: Colour views, one frame per image
        let images = gpu.swapchain_images(self.storage.swapchain)?;
        for image in images {
            let view = gpu.create_image_view(&ViewDesc {
                image,
                format: selection.colour.format,
                aspect: vk::ImageAspectFlags::COLOR,
                view_type: vk::ImageViewType::TYPE_2D,
                layers: 1,
            })?;
            self.storage.frames.push(Frame {
                target: FrameTarget {
                    colour: Attachment { image, view },
                    depth: Attachment { image: depth.image, view: depth_view },
                    extent,
                },
                drawn: vk::Fence::null(),
            });
        }
        if self.storage.frames.is_empty() {
            anyhow::bail!("Swapchain has no images");
        }
        Ok(true)
    }

    /// Next image to render into, signalling `signal` when it is ready.
    ///
    /// None while Paused/OutOfDate or when the presentation engine refuses.
    pub fn acquire_next_image(&mut self, signal: vk::Semaphore) -> Option<FrameTarget> {
        self.orient_check();
        if self.blocked() {
            return None;
        }

        let index = match self.gpu.acquire_next_image(self.storage.swapchain, signal) {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    self.set_flags(vk::Result::SUBOPTIMAL_KHR);
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.set_flags(vk::Result::ERROR_OUT_OF_DATE_KHR);
                log::warn!("Swapchain failed to acquire next image [out of date]");
                return None;
            }
            Err(e) => {
                log::warn!("Swapchain failed to acquire next image [{:?}]", e);
                return None;
            }
        };
        let Some(frame) = self.storage.frames.get(index as usize).copied() else {
            log::error!(
                "Presentation engine returned image {} of {}",
                index,
                self.storage.frames.len()
            );
            return None;
        };

        self.storage.image_index = index;
        // Never run further ahead of the GPU than there are images
        self.vram.device().wait_for(frame.drawn);
        Some(frame.target)
    }

    /// Present the acquired image once `wait` is signalled. `drawn` is the
    /// fence that signals when this frame's rendering completes.
    pub fn present(&mut self, wait: vk::Semaphore, drawn: vk::Fence) -> bool {
        if self.blocked() {
            return false;
        }
        let index = self.storage.image_index;
        match self.gpu.queue_present(self.storage.swapchain, index, wait) {
            Ok(suboptimal) => {
                if suboptimal {
                    self.set_flags(vk::Result::SUBOPTIMAL_KHR);
                }
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.set_flags(vk::Result::ERROR_OUT_OF_DATE_KHR);
                log::warn!("Swapchain failed to present image [out of date]");
                return false;
            }
            Err(e) => {
                log::warn!("Swapchain failed to present image [{:?}]", e);
                return false;
            }
        }

        if let Some(frame) = self.storage.frames.get_mut(index as usize) {
            frame.drawn = drawn;
        }
        // The surface may have rotated between acquire and present
        self.orient_check();
        true
    }

    /// Rebuild against a new framebuffer size (and optionally new present
    /// mode preferences). False when the surface has zero area.
    pub fn reconstruct(
        &mut self,
        framebuffer: UVec2,
        present_modes: &[vk::PresentModeKHR],
    ) -> bool {
        if !present_modes.is_empty() {
            self.info.present_modes = present_modes.to_vec();
        }

        let retired = std::mem::take(&mut self.storage);
        self.retired = retired.swapchain;
        let result = self.construct(framebuffer);
        let extent = self.extent();
        let ok = match result {
            Ok(true) => {
                log::info!(
                    "Vulkan swapchain reconstructed [{}x{}] [{}]",
                    extent.width,
                    extent.height,
                    present_mode_name(self.present_mode)
                );
                true
            }
            Ok(false) => {
                log::debug!("Vulkan swapchain paused (zero-area surface)");
                false
            }
            Err(e) => {
                log::error!("Vulkan swapchain reconstruction failed! {e:#}");
                // Drop whatever was half built and stay blocked until the next reconstruct
                let partial = std::mem::take(&mut self.storage);
                self.release(partial);
                self.storage.flags.insert(SwapchainFlags::OUT_OF_DATE);
                false
            }
        };

        self.release(retired);
        self.retired = vk::SwapchainKHR::null();
        ok
    }

    fn blocked(&self) -> bool {
        self.storage.swapchain == vk::SwapchainKHR::null()
            || self.storage.flags.intersects(SwapchainFlags::PAUSED | SwapchainFlags::OUT_OF_DATE)
    }

    fn set_flags(&mut self, result: vk::Result) {
        let flag = match result {
            vk::Result::SUBOPTIMAL_KHR => SwapchainFlags::SUBOPTIMAL,
            vk::Result::ERROR_OUT_OF_DATE_KHR => SwapchainFlags::OUT_OF_DATE,
            _ => return,
        };
        if !self.storage.flags.contains(flag) {
            log::debug!("Vulkan swapchain is {:?}", flag);
        }
        self.storage.flags.insert(flag);
    }

    fn orient_check(&mut self) {
        let caps = match self.gpu.surface_capabilities() {
            Ok(caps) => caps,
            Err(e) => {
                log::warn!("Surface query failed: {e:#}");
                return;
            }
        };

        let transform = caps.current_transform;
        if transform != self.storage.current.transform {
            if let Some(original) = self.original {
                let rotated = swaps_axes(original.transform) != swaps_axes(transform);
                self.storage.flags.set(SwapchainFlags::ROTATED, rotated);
            }
            self.storage.current.transform = transform;
        }
        let defined = caps.current_extent.width != u32::MAX;
        if defined && caps.current_extent != self.storage.current.extent {
            self.set_flags(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
    }

    /// Hand a retired storage to the deferred queue
    fn release(&self, storage: Storage) {
        if storage.swapchain == vk::SwapchainKHR::null()
            && storage.depth.is_none()
            && storage.frames.is_empty()
        {
            return;
        }
        let gpu = self.gpu.clone();
        let memory = Arc::downgrade(self.vram.memory());
        self.vram.device().defer(move || {
            if let Some(memory) = memory.upgrade() {
                destroy_storage(gpu.as_ref(), &memory, storage);
            } else {
                destroy_views(gpu.as_ref(), storage);
            }
        });
    }

    pub fn flags(&self) -> SwapchainFlags {
        self.storage.flags
    }

    pub fn suboptimal(&self) -> bool {
        self.storage.flags.contains(SwapchainFlags::SUBOPTIMAL)
    }

    pub fn paused(&self) -> bool {
        self.storage.flags.contains(SwapchainFlags::PAUSED)
    }

    pub fn out_of_date(&self) -> bool {
        self.storage.flags.contains(SwapchainFlags::OUT_OF_DATE)
    }

    pub fn rotated(&self) -> bool {
        self.storage.flags.contains(SwapchainFlags::ROTATED)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.storage.current.extent
    }

    pub fn display(&self) -> Display {
        self.storage.current
    }

    pub fn image_count(&self) -> u32 {
        self.storage.frames.len() as u32
    }

    pub fn image_index(&self) -> u32 {
        self.storage.image_index
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn available_modes(&self) -> &[vk::PresentModeKHR] {
        &self.available_modes
    }

    pub fn colour_format(&self) -> vk::Format {
        self.colour_format
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.storage.swapchain
    }
}

fn destroy_views(gpu: &dyn Gpu, storage: Storage) {
    for frame in &storage.frames {
        gpu.destroy_image_view(frame.target.colour.view);
    }
    if let Some((_, view)) = storage.depth {
        gpu.destroy_image_view(view);
    }
    if storage.swapchain != vk::SwapchainKHR::null() {
        gpu.destroy_swapchain(storage.swapchain);
    }
}

fn destroy_storage(gpu: &dyn Gpu, memory: &Memory, storage: Storage) {
    let depth = storage.depth.map(|(image, _)| image);
    destroy_views(gpu, storage);
    if let Some(image) = depth {
        memory.destroy_image(image);
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // Flushes retired storages too
        self.vram.device().wait_idle();
        if self.storage.swapchain != vk::SwapchainKHR::null() {
            log::info!("Vulkan swapchain destroyed");
        }
        let storage = std::mem::take(&mut self.storage);
        destroy_storage(self.gpu.as_ref(), self.vram.memory(), storage);
    }
}

#[cfg(test)]
#[path = "swapchain_tests.rs"]
mod tests;
