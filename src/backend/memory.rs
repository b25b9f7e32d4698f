// GPU memory - buffer and image registries
//
// Responsibilities:
// - Allocate buffers/images through the backend allocator
// - Track every live resource under a generation-checked handle
// - Host-visible writes (lazily mapped, mapping kept for the buffer's lifetime)
//
// One mutex guards both registries and the allocation counters; the render
// thread and the transfer worker allocate concurrently.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::any::Any;
use std::ptr::NonNull;
use std::sync::Arc;

use super::gpu::Device;
use super::queue::QueueFlags;

slotmap::new_key_type! {
    /// Handle to a buffer owned by `Memory`
    pub struct BufferHandle;
    /// Handle to an image owned by `Memory`
    pub struct ImageHandle;
}

/// Where the allocation lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryUsage {
    /// Host visible + coherent, written directly by the CPU
    CpuToGpu,
    /// Device local, only reachable through transfers
    #[default]
    GpuOnly,
}

impl MemoryUsage {
    pub fn location(self) -> gpu_allocator::MemoryLocation {
        match self {
            MemoryUsage::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
            MemoryUsage::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
        }
    }
}

/// Device memory backing a resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocInfo {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub actual_size: u64,
}

/// Backend-specific allocation state (a gpu-allocator `Allocation` for Vulkan)
pub struct AllocationBlock(Box<dyn Any + Send + Sync>);

impl AllocationBlock {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Box::new(value))
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn take<T: Any>(self) -> Option<T> {
        self.0.downcast().ok().map(|b| *b)
    }
}

impl std::fmt::Debug for AllocationBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AllocationBlock")
    }
}

/// A buffer exactly as the backend handed it out
#[derive(Debug)]
pub struct RawBuffer {
    pub buffer: vk::Buffer,
    pub info: AllocInfo,
    pub block: AllocationBlock,
}

#[derive(Debug)]
pub struct RawImage {
    pub image: vk::Image,
    pub info: AllocInfo,
    pub block: AllocationBlock,
}

/// Resolved sharing mode plus the queue families involved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sharing {
    pub mode: vk::SharingMode,
    pub families: Vec<u32>,
}

impl Sharing {
    /// Family list to hand to Vulkan (ignored unless concurrent)
    pub fn indices(&self) -> &[u32] {
        match self.mode {
            vk::SharingMode::CONCURRENT => &self.families,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BufferCreateInfo {
    pub name: String,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub properties: vk::MemoryPropertyFlags,
    pub memory: MemoryUsage,
    pub queue_flags: QueueFlags,
    /// Requested mode; downgraded to EXCLUSIVE when one family is involved
    pub share: vk::SharingMode,
    /// Skip allocation logging (staging traffic)
    pub silent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ImageCreateInfo {
    pub name: String,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
    pub tiling: vk::ImageTiling,
    pub layers: u32,
    pub memory: MemoryUsage,
    pub queue_flags: QueueFlags,
    pub share: vk::SharingMode,
}

/// Backend allocation primitives
pub trait Allocator {
    fn create_buffer(&self, info: &BufferCreateInfo, sharing: &Sharing) -> Result<RawBuffer>;
    fn destroy_buffer(&self, buffer: RawBuffer);
    /// Host pointer to the start of the allocation, if host visible
    fn map_buffer(&self, buffer: &RawBuffer) -> Option<NonNull<u8>>;
    fn create_image(&self, info: &ImageCreateInfo, sharing: &Sharing) -> Result<RawImage>;
    fn destroy_image(&self, image: RawImage);
}

/// Snapshot of a registered buffer
#[derive(Debug, Clone)]
pub struct Buffer {
    pub guid: u64,
    pub name: String,
    pub buffer: vk::Buffer,
    pub info: AllocInfo,
    /// Capacity requested at allocation
    pub size: u64,
    /// Meaningful byte length, at most `size`
    pub write_size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryUsage,
    pub queue_flags: QueueFlags,
    pub sharing: vk::SharingMode,
}

impl Buffer {
    pub fn host_visible(&self) -> bool {
        self.memory == MemoryUsage::CpuToGpu
    }
}

/// Snapshot of a registered image
#[derive(Debug, Clone)]
pub struct Image {
    pub guid: u64,
    pub name: String,
    pub image: vk::Image,
    pub info: AllocInfo,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub layer_count: u32,
    pub queue_flags: QueueFlags,
    pub sharing: vk::SharingMode,
}

#[derive(Clone, Copy)]
struct MappedPtr(NonNull<u8>);

// Points into a persistently mapped allocation owned by the registry entry
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

struct BufferEntry {
    view: Buffer,
    raw: RawBuffer,
    properties: vk::MemoryPropertyFlags,
    silent: bool,
    mapped: Option<MappedPtr>,
}

struct ImageEntry {
    view: Image,
    raw: RawImage,
}

#[derive(Default)]
struct Registry {
    buffers: SlotMap<BufferHandle, BufferEntry>,
    images: SlotMap<ImageHandle, ImageEntry>,
    next_guid: u64,
    buffer_bytes: u64,
    image_bytes: u64,
}

impl Registry {
    fn next_guid(&mut self) -> u64 {
        self.next_guid += 1;
        self.next_guid
    }

    fn log_count(&self) -> String {
        let (buffers, buffer_unit) = friendly_size(self.buffer_bytes);
        let (images, image_unit) = friendly_size(self.image_bytes);
        format!("Buffers: [{:.2}{}]; Images: [{:.2}{}]", buffers, buffer_unit, images, image_unit)
    }
}

/// Human readable byte count
pub fn friendly_size(bytes: u64) -> (f64, &'static str) {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit + 1 < UNITS.len() {
        size /= 1024.0;
        unit += 1;
    }
    (size, UNITS[unit])
}

/// Allocator facade owning every buffer and image
pub struct Memory {
    device: Arc<Device>,
    registry: Mutex<Registry>,
    log_allocs: bool,
}

impl Memory {
    pub fn new(device: Arc<Device>, log_allocs: bool) -> Arc<Self> {
        log::info!("Memory constructed");
        Arc::new(Self { device, registry: Mutex::new(Registry::default()), log_allocs })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn construct_buffer(&self, info: &BufferCreateInfo) -> Result<BufferHandle> {
        let sharing = self.device.sharing(info.queue_flags, info.share);
        let raw = self
            .device
            .gpu()
            .create_buffer(info, &sharing)
            .with_context(|| {
                format!("Failed to allocate buffer [{}] ({} bytes)", info.name, info.size)
            })?;

        let mut registry = self.registry.lock();
        let view = Buffer {
            guid: registry.next_guid(),
            name: info.name.clone(),
            buffer: raw.buffer,
            info: raw.info,
            size: info.size,
            write_size: info.size,
            usage: info.usage,
            memory: info.memory,
            queue_flags: info.queue_flags,
            sharing: sharing.mode,
        };
        registry.buffer_bytes += info.size;
        if self.log_allocs && !info.silent {
            let (size, unit) = friendly_size(info.size);
            log::debug!(
                "== Buffer [{}] allocated: [{:.2}{}] | {}",
                info.name,
                size,
                unit,
                registry.log_count()
            );
        }
        Ok(registry.buffers.insert(BufferEntry {
            view,
            raw,
            properties: info.properties,
            silent: info.silent,
            mapped: None,
        }))
    }

    pub fn construct_image(&self, info: &ImageCreateInfo) -> Result<ImageHandle> {
        let sharing = self.device.sharing(info.queue_flags, info.share);
        let raw = self
            .device
            .gpu()
            .create_image(info, &sharing)
            .with_context(|| format!("Failed to allocate image [{}]", info.name))?;

        let mut registry = self.registry.lock();
        let view = Image {
            guid: registry.next_guid(),
            name: info.name.clone(),
            image: raw.image,
            info: raw.info,
            extent: info.extent,
            format: info.format,
            layer_count: info.layers.max(1),
            queue_flags: info.queue_flags,
            sharing: sharing.mode,
        };
        registry.image_bytes += raw.info.actual_size;
        if self.log_allocs {
            let (size, unit) = friendly_size(raw.info.actual_size);
            log::debug!(
                "== Image [{}] allocated: [{:.2}{}] | {}",
                info.name,
                size,
                unit,
                registry.log_count()
            );
        }
        Ok(registry.images.insert(ImageEntry { view, raw }))
    }

    /// Free a buffer immediately. False if the handle is stale.
    pub fn destroy_buffer(&self, handle: BufferHandle) -> bool {
        let entry = {
            let mut registry = self.registry.lock();
            let Some(entry) = registry.buffers.remove(handle) else {
                return false;
            };
            registry.buffer_bytes -= entry.view.size;
            if self.log_allocs && !entry.silent {
                let (size, unit) = friendly_size(entry.view.size);
                log::debug!(
                    "-- Buffer [{}] released: [{:.2}{}] | {}",
                    entry.view.name,
                    size,
                    unit,
                    registry.log_count()
                );
            }
            entry
        };
        self.device.gpu().destroy_buffer(entry.raw);
        true
    }

    /// Free an image immediately. False if the handle is stale.
    pub fn destroy_image(&self, handle: ImageHandle) -> bool {
        let entry = {
            let mut registry = self.registry.lock();
            let Some(entry) = registry.images.remove(handle) else {
                return false;
            };
            registry.image_bytes -= entry.raw.info.actual_size;
            if self.log_allocs {
                let (size, unit) = friendly_size(entry.raw.info.actual_size);
                log::debug!(
                    "-- Image [{}] released: [{:.2}{}] | {}",
                    entry.view.name,
                    size,
                    unit,
                    registry.log_count()
                );
            }
            entry
        };
        self.device.gpu().destroy_image(entry.raw);
        true
    }

    /// Copy `data` into a host-visible buffer at `offset`
    pub fn write(&self, handle: BufferHandle, data: &[u8], offset: u64) -> bool {
        let mut registry = self.registry.lock();
        let Some(entry) = registry.buffers.get_mut(handle) else {
            log::error!("Attempt to write to stale buffer handle");
            return false;
        };
        let Some(ptr) = self.host_ptr(entry, offset, data.len() as u64) else {
            return false;
        };
        // Safety: range validated against the allocation by host_ptr
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len()) };
        true
    }

    /// Read back `len` bytes of a host-visible buffer
    pub fn read(&self, handle: BufferHandle, offset: u64, len: u64) -> Option<Vec<u8>> {
        let mut registry = self.registry.lock();
        let entry = registry.buffers.get_mut(handle)?;
        let ptr = self.host_ptr(entry, offset, len)?;
        let mut out = vec![0u8; len as usize];
        // Safety: as in write
        unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), out.as_mut_ptr(), out.len()) };
        Some(out)
    }

    fn host_ptr(&self, entry: &mut BufferEntry, offset: u64, len: u64) -> Option<NonNull<u8>> {
        if entry.view.memory != MemoryUsage::CpuToGpu {
            log::error!("Attempt to write to GPU-only Buffer [{}]!", entry.view.name);
            return None;
        }
        if offset.checked_add(len).map_or(true, |end| end > entry.view.size) {
            log::error!(
                "Out of range access on Buffer [{}]: {}+{} > {}",
                entry.view.name,
                offset,
                len,
                entry.view.size
            );
            return None;
        }
        if entry.mapped.is_none() {
            entry.mapped = self.device.gpu().map_buffer(&entry.raw).map(MappedPtr);
        }
        let Some(MappedPtr(base)) = entry.mapped else {
            log::error!("Failed to map Buffer [{}]", entry.view.name);
            return None;
        };
        // Safety: offset < size of the mapped allocation
        NonNull::new(unsafe { base.as_ptr().add(offset as usize) })
    }

    /// Grow (or shrink the meaningful size of) a buffer in place.
    ///
    /// When the new size exceeds the allocation a fresh one is substituted
    /// under the same handle and the previous allocation is returned; the
    /// caller decides when it is safe to free it.
    pub fn resize(&self, handle: BufferHandle, size: u64) -> Result<Option<RawBuffer>> {
        let info = {
            let mut registry = self.registry.lock();
            let entry = registry.buffers.get_mut(handle).context("Resize of stale buffer handle")?;
            if size <= entry.view.size {
                entry.view.write_size = size;
                return Ok(None);
            }
            BufferCreateInfo {
                name: entry.view.name.clone(),
                size,
                usage: entry.view.usage,
                properties: entry.properties,
                memory: entry.view.memory,
                queue_flags: entry.view.queue_flags,
                share: entry.view.sharing,
                silent: entry.silent,
            }
        };

        let sharing = self.device.sharing(info.queue_flags, info.share);
        let raw = self
            .device
            .gpu()
            .create_buffer(&info, &sharing)
            .with_context(|| format!("Failed to grow buffer [{}] to {} bytes", info.name, size))?;

        let mut registry = self.registry.lock();
        let Some(entry) = registry.buffers.get_mut(handle) else {
            drop(registry);
            self.device.gpu().destroy_buffer(raw);
            anyhow::bail!("Buffer [{}] destroyed while resizing", info.name);
        };
        let old_size = entry.view.size;
        entry.view.buffer = raw.buffer;
        entry.view.info = raw.info;
        entry.view.size = size;
        entry.view.write_size = size;
        entry.mapped = None;
        let old = std::mem::replace(&mut entry.raw, raw);
        registry.buffer_bytes = registry.buffer_bytes - old_size + size;
        if self.log_allocs {
            let (new, unit) = friendly_size(size);
            log::debug!(
                "== Buffer [{}] resized: [{:.2}{}] | {}",
                info.name,
                new,
                unit,
                registry.log_count()
            );
        }
        Ok(Some(old))
    }

    pub fn buffer(&self, handle: BufferHandle) -> Option<Buffer> {
        self.registry.lock().buffers.get(handle).map(|e| e.view.clone())
    }

    pub fn image(&self, handle: ImageHandle) -> Option<Image> {
        self.registry.lock().images.get(handle).map(|e| e.view.clone())
    }

    pub fn contains_buffer(&self, handle: BufferHandle) -> bool {
        self.registry.lock().buffers.contains_key(handle)
    }

    pub fn contains_image(&self, handle: ImageHandle) -> bool {
        self.registry.lock().images.contains_key(handle)
    }

    /// Live (buffers, images)
    pub fn counts(&self) -> (usize, usize) {
        let registry = self.registry.lock();
        (registry.buffers.len(), registry.images.len())
    }

    /// Allocated (buffer bytes, image bytes)
    pub fn allocated_bytes(&self) -> (u64, u64) {
        let registry = self.registry.lock();
        (registry.buffer_bytes, registry.image_bytes)
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        let registry = std::mem::take(&mut *self.registry.lock());
        let gpu = self.device.gpu();
        for (_, entry) in registry.buffers {
            gpu.destroy_buffer(entry.raw);
        }
        for (_, entry) in registry.images {
            gpu.destroy_image(entry.raw);
        }
        log::info!("Memory destroyed");
    }
}
