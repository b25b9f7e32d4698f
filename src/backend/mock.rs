// Host-memory GPU for unit tests
//
// Buffers and images are byte arrays, transfer commands execute on the
// host at submit time, and the surface is fully scriptable.

use anyhow::Result;
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use super::gpu::{Device, Gpu, ViewDesc};
use super::memory::{
    AllocInfo, AllocationBlock, Allocator, BufferCreateInfo, ImageCreateInfo, Memory, RawBuffer,
    RawImage, Sharing,
};
use super::queue::{select, QueueFamily, QueueFlags, QueueMultiplex, QueueRole};
use super::swapchain::{Presenter, SwapchainDesc};
use super::transfer::{TransferConfig, TransferOp, TransferQueue};
use super::vram::{Vram, VramCreateInfo};

const BYTES_PER_TEXEL: usize = 4;

struct HostBuffer {
    data: NonNull<u8>,
    len: usize,
}

// Only touched through raw pointers, under the state lock or by Memory's
// own mapping rules
unsafe impl Send for HostBuffer {}

impl HostBuffer {
    fn new(len: usize) -> Self {
        let boxed = vec![0u8; len.max(1)].into_boxed_slice();
        let data = NonNull::new(Box::into_raw(boxed) as *mut u8).unwrap();
        Self { data, len }
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.data.as_ptr(), self.len.max(1));
        drop(unsafe { Box::from_raw(slice) });
    }
}

struct HostImage {
    data: Vec<u8>,
    layer_size: usize,
    layout: vk::ImageLayout,
}

/// Scriptable presentation surface
pub struct MockSurface {
    pub caps: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub modes: Vec<vk::PresentModeKHR>,
    pub depth_formats: Vec<vk::Format>,
    /// Consumed front to back; round-robin success once empty
    pub acquire: VecDeque<VkResult<(u32, bool)>>,
    pub present: VecDeque<VkResult<bool>>,
}

impl Default for MockSurface {
    fn default() -> Self {
        Self {
            caps: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 3,
                current_extent: vk::Extent2D { width: 800, height: 600 },
                min_image_extent: vk::Extent2D { width: 1, height: 1 },
                max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
                max_image_array_layers: 1,
                supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY
                    | vk::SurfaceTransformFlagsKHR::ROTATE_90,
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE
                    | vk::CompositeAlphaFlagsKHR::INHERIT,
                supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_DST,
            },
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            depth_formats: vec![vk::Format::D32_SFLOAT],
            acquire: VecDeque::new(),
            present: VecDeque::new(),
        }
    }
}

#[derive(Default)]
struct State {
    next_handle: u64,
    buffers: HashMap<u64, HostBuffer>,
    images: HashMap<u64, HostImage>,
    views: HashSet<u64>,
    map_calls: usize,
    commands: HashMap<u64, Vec<TransferOp>>,
    fences: HashMap<u64, bool>,
    stall: bool,
    fail_submit: bool,
    submissions: usize,
    waited: Vec<vk::Fence>,
    idle_waits: usize,
    errors: Vec<String>,
    surface: MockSurface,
    swapchains: HashMap<u64, Vec<vk::Image>>,
    created: Vec<SwapchainDesc>,
    destroyed_swapchains: Vec<vk::SwapchainKHR>,
    next_image: u32,
    presented: Vec<(vk::SwapchainKHR, u32)>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn execute(&mut self, op: &TransferOp) {
        match op {
            TransferOp::CopyBuffer { src, dst, size } => {
                let size = *size as usize;
                let source = self.buffers.get(&src.as_raw());
                let Some(bytes) = source.map(|b| b.bytes()[..size.min(b.len)].to_vec()) else {
                    self.errors.push(format!("copy from unknown buffer {:?}", src));
                    return;
                };
                match self.buffers.get_mut(&dst.as_raw()) {
                    Some(dst) if dst.len >= size && bytes.len() == size => {
                        dst.bytes_mut()[..size].copy_from_slice(&bytes)
                    }
                    _ => self.errors.push(format!("bad copy of {} bytes into {:?}", size, dst)),
                }
            }
            TransferOp::Barrier { image, old_layout, new_layout, .. } => {
                let Some(img) = self.images.get_mut(&image.as_raw()) else {
                    self.errors.push(format!("barrier on unknown image {:?}", image));
                    return;
                };
                if *old_layout != vk::ImageLayout::UNDEFINED && *old_layout != img.layout {
                    self.errors.push(format!(
                        "barrier expected {:?}, image is {:?}",
                        old_layout, img.layout
                    ));
                }
                img.layout = *new_layout;
            }
            TransferOp::CopyBufferToImage { src, dst, regions } => {
                let Some(bytes) = self.buffers.get(&src.as_raw()).map(|b| b.bytes().to_vec()) else {
                    self.errors.push(format!("image copy from unknown buffer {:?}", src));
                    return;
                };
                let Some(img) = self.images.get_mut(&dst.as_raw()) else {
                    self.errors.push(format!("image copy into unknown image {:?}", dst));
                    return;
                };
                if img.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
                    self.errors.push(format!("image copy while in {:?}", img.layout));
                }
                for region in regions {
                    let extent = region.image_extent;
                    let len =
                        (extent.width * extent.height * extent.depth) as usize * BYTES_PER_TEXEL;
                    let from = region.buffer_offset as usize;
                    let to = region.image_subresource.base_array_layer as usize * img.layer_size;
                    if from + len > bytes.len() || to + len > img.data.len() {
                        self.errors.push("image copy region out of range".to_string());
                        continue;
                    }
                    img.data[to..to + len].copy_from_slice(&bytes[from..from + len]);
                }
            }
        }
    }
}

pub struct MockGpu {
    queues: QueueMultiplex,
    state: Mutex<State>,
}

impl MockGpu {
    /// One family, one queue: every role aliases
    pub fn new() -> Arc<Self> {
        Self::with_families(vec![QueueFamily::new(0, QueueFlags::all(), 1)])
    }

    /// Graphics/present and transfer on separate families
    pub fn split() -> Arc<Self> {
        Self::with_families(vec![
            QueueFamily::new(0, QueueFlags::all(), 1),
            QueueFamily::new(1, QueueFlags::TRANSFER, 1),
        ])
    }

    pub fn with_families(families: Vec<QueueFamily>) -> Arc<Self> {
        let selection = select(families.clone()).unwrap();
        let queues = QueueMultiplex::new(&selection, &families, |family, index| {
            vk::Queue::from_raw(0x1000 + (family as u64) * 16 + index as u64)
        });
        Arc::new(Self { queues, state: Mutex::new(State::default()) })
    }

    pub fn device() -> (Arc<Self>, Arc<Device>) {
        Self::device_with_defer(2)
    }

    pub fn device_with_defer(frames: u32) -> (Arc<Self>, Arc<Device>) {
        let gpu = Self::new();
        let device = Device::new(gpu.clone(), frames);
        (gpu, device)
    }

    pub fn memory() -> (Arc<Self>, Arc<Memory>) {
        Self::memory_with_families(false)
    }

    pub fn memory_with_families(split: bool) -> (Arc<Self>, Arc<Memory>) {
        let gpu = if split { Self::split() } else { Self::new() };
        let device = Device::new(gpu.clone(), 2);
        (gpu, Memory::new(device, true))
    }

    pub fn vram() -> (Arc<Self>, Arc<Vram>) {
        Self::vram_on(Self::new())
    }

    pub fn vram_on(gpu: Arc<Self>) -> (Arc<Self>, Arc<Vram>) {
        let device = Device::new(gpu.clone(), 2);
        let info = VramCreateInfo {
            transfer: TransferConfig {
                reserve: vec![256],
                poll: Duration::from_millis(1),
                max_idle_stages: 4,
            },
            log_allocations: true,
        };
        let vram = Vram::new(device, info).unwrap();
        (gpu, vram)
    }

    pub fn surface(&self, edit: impl FnOnce(&mut MockSurface)) {
        edit(&mut self.state.lock().surface);
    }

    /// Hold new transfer fences unsignalled until released
    pub fn stall(&self, stall: bool) {
        self.state.lock().stall = stall;
    }

    pub fn fail_submits(&self, fail: bool) {
        self.state.lock().fail_submit = fail;
    }

    pub fn signal(&self, fence: vk::Fence) {
        if let Some(signalled) = self.state.lock().fences.get_mut(&fence.as_raw()) {
            *signalled = true;
        }
    }

    pub fn signal_all(&self) {
        for signalled in self.state.lock().fences.values_mut() {
            *signalled = true;
        }
    }

    pub fn unsignalled_fences(&self) -> Vec<vk::Fence> {
        let mut fences: Vec<u64> =
            self.state.lock().fences.iter().filter(|(_, s)| !**s).map(|(f, _)| *f).collect();
        fences.sort_unstable();
        fences.into_iter().map(vk::Fence::from_raw).collect()
    }

    pub fn create_fence(&self, signalled: bool) -> vk::Fence {
        let mut state = self.state.lock();
        let handle = state.handle();
        state.fences.insert(handle, signalled);
        vk::Fence::from_raw(handle)
    }

    pub fn map_calls(&self) -> usize {
        self.state.lock().map_calls
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn live_views(&self) -> usize {
        self.state.lock().views.len()
    }

    pub fn live_commands(&self) -> usize {
        self.state.lock().commands.len()
    }

    pub fn live_swapchains(&self) -> usize {
        self.state.lock().swapchains.len()
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().submissions
    }

    pub fn idle_waits(&self) -> usize {
        self.state.lock().idle_waits
    }

    pub fn waited_fences(&self) -> Vec<vk::Fence> {
        self.state.lock().waited.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.state.lock().errors.clone()
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer.as_raw()).map(|b| b.bytes().to_vec())
    }

    pub fn image_contents(&self, image: vk::Image) -> Option<Vec<u8>> {
        self.state.lock().images.get(&image.as_raw()).map(|i| i.data.clone())
    }

    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.state.lock().images.get(&image.as_raw()).map(|i| i.layout)
    }

    pub fn created_swapchains(&self) -> Vec<SwapchainDesc> {
        self.state.lock().created.clone()
    }

    pub fn destroyed_swapchains(&self) -> Vec<vk::SwapchainKHR> {
        self.state.lock().destroyed_swapchains.clone()
    }

    pub fn presented(&self) -> Vec<(vk::SwapchainKHR, u32)> {
        self.state.lock().presented.clone()
    }
}

impl Allocator for MockGpu {
    fn create_buffer(&self, info: &BufferCreateInfo, _sharing: &Sharing) -> Result<RawBuffer> {
        if info.size == 0 {
            anyhow::bail!("zero sized buffer");
        }
        let mut state = self.state.lock();
        let handle = state.handle();
        state.buffers.insert(handle, HostBuffer::new(info.size as usize));
        Ok(RawBuffer {
            buffer: vk::Buffer::from_raw(handle),
            info: AllocInfo {
                memory: vk::DeviceMemory::from_raw(handle),
                offset: 0,
                actual_size: info.size,
            },
            block: AllocationBlock::new(()),
        })
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        self.state.lock().buffers.remove(&buffer.buffer.as_raw());
    }

    fn map_buffer(&self, buffer: &RawBuffer) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        state.map_calls += 1;
        state.buffers.get(&buffer.buffer.as_raw()).map(|b| b.data)
    }

    fn create_image(&self, info: &ImageCreateInfo, _sharing: &Sharing) -> Result<RawImage> {
        let layers = info.layers.max(1) as usize;
        let extent = info.extent;
        let layer_size =
            (extent.width * extent.height * extent.depth.max(1)) as usize * BYTES_PER_TEXEL;
        let mut state = self.state.lock();
        let handle = state.handle();
        state.images.insert(
            handle,
            HostImage {
                data: vec![0; layer_size * layers],
                layer_size,
                layout: vk::ImageLayout::UNDEFINED,
            },
        );
        Ok(RawImage {
            image: vk::Image::from_raw(handle),
            info: AllocInfo {
                memory: vk::DeviceMemory::from_raw(handle),
                offset: 0,
                actual_size: (layer_size * layers) as u64,
            },
            block: AllocationBlock::new(()),
        })
    }

    fn destroy_image(&self, image: RawImage) {
        self.state.lock().images.remove(&image.image.as_raw());
    }
}

impl TransferQueue for MockGpu {
    fn alloc_commands(&self) -> Result<vk::CommandBuffer> {
        let mut state = self.state.lock();
        let handle = state.handle();
        state.commands.insert(handle, Vec::new());
        Ok(vk::CommandBuffer::from_raw(handle))
    }

    fn free_commands(&self, command: vk::CommandBuffer) {
        self.state.lock().commands.remove(&command.as_raw());
    }

    fn begin_commands(&self, command: vk::CommandBuffer) -> Result<()> {
        match self.state.lock().commands.get_mut(&command.as_raw()) {
            Some(ops) => {
                ops.clear();
                Ok(())
            }
            None => anyhow::bail!("unknown command buffer"),
        }
    }

    fn record(&self, command: vk::CommandBuffer, op: &TransferOp) {
        if let Some(ops) = self.state.lock().commands.get_mut(&command.as_raw()) {
            ops.push(op.clone());
        }
    }

    fn end_commands(&self, _command: vk::CommandBuffer) -> Result<()> {
        Ok(())
    }

    fn submit_transfer(&self, commands: &[vk::CommandBuffer]) -> Result<vk::Fence> {
        let _lock = self.queues.lock(QueueRole::Transfer);
        let mut state = self.state.lock();
        if state.fail_submit {
            anyhow::bail!("mock submit failure");
        }
        for command in commands {
            let ops = state.commands.get(&command.as_raw()).cloned().unwrap_or_default();
            for op in &ops {
                state.execute(op);
            }
        }
        state.submissions += 1;
        let handle = state.handle();
        let signalled = !state.stall;
        state.fences.insert(handle, signalled);
        Ok(vk::Fence::from_raw(handle))
    }

    fn fence_signalled(&self, fence: vk::Fence) -> Result<bool> {
        Ok(self.state.lock().fences.get(&fence.as_raw()).copied().unwrap_or(true))
    }

    fn release_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence.as_raw());
    }
}

impl Presenter for MockGpu {
    fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        Ok(self.state.lock().surface.caps)
    }

    fn surface_formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.state.lock().surface.formats.clone())
    }

    fn surface_present_modes(&self) -> Result<Vec<vk::PresentModeKHR>> {
        Ok(self.state.lock().surface.modes.clone())
    }

    fn supports_depth_format(&self, format: vk::Format) -> bool {
        self.state.lock().surface.depth_formats.contains(&format)
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        let handle = state.handle();
        let images =
            (0..desc.min_image_count).map(|_| vk::Image::from_raw(state.handle())).collect();
        state.swapchains.insert(handle, images);
        state.created.push(desc.clone());
        Ok(vk::SwapchainKHR::from_raw(handle))
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        match self.state.lock().swapchains.get(&swapchain.as_raw()) {
            Some(images) => Ok(images.clone()),
            None => anyhow::bail!("unknown swapchain"),
        }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.swapchains.remove(&swapchain.as_raw());
        state.destroyed_swapchains.push(swapchain);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        if let Some(result) = state.surface.acquire.pop_front() {
            return result;
        }
        let count = state.swapchains.get(&swapchain.as_raw()).map_or(0, |i| i.len() as u32);
        if count == 0 {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        let index = state.next_image % count;
        state.next_image += 1;
        Ok((index, false))
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        index: u32,
        _wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let _lock = self.queues.lock(QueueRole::Present);
        let mut state = self.state.lock();
        let result = state.surface.present.pop_front().unwrap_or(Ok(false));
        if result.is_ok() {
            state.presented.push((swapchain, index));
        }
        result
    }
}

impl Gpu for MockGpu {
    fn queues(&self) -> &QueueMultiplex {
        &self.queues
    }

    fn wait_fences(&self, fences: &[vk::Fence], _timeout_ns: u64) -> Result<bool> {
        let mut state = self.state.lock();
        state.waited.extend_from_slice(fences);
        Ok(fences.iter().all(|f| state.fences.get(&f.as_raw()).copied().unwrap_or(true)))
    }

    fn wait_idle(&self) -> Result<()> {
        self.state.lock().idle_waits += 1;
        Ok(())
    }

    fn create_image_view(&self, _desc: &ViewDesc) -> Result<vk::ImageView> {
        let mut state = self.state.lock();
        let handle = state.handle();
        state.views.insert(handle);
        Ok(vk::ImageView::from_raw(handle))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().views.remove(&view.as_raw());
    }
}
