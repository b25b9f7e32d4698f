// GPU context - backend seam + per-device services
//
// `Gpu` is everything the resource layer needs from a device. `Device`
// wraps one together with the deferred destruction queue and is passed
// explicitly to every constructor that needs it.

use anyhow::Result;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::deferred::{DeferQueue, DEFAULT_DEFER};
use super::memory::{Allocator, Sharing};
use super::queue::{QueueFlags, QueueMultiplex};
use super::swapchain::Presenter;
use super::transfer::TransferQueue;

/// Fence wait bound in debug builds; a hang there is almost always a bug
const DEBUG_FENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Image view parameters
#[derive(Debug, Clone, Copy)]
pub struct ViewDesc {
    pub image: vk::Image,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub view_type: vk::ImageViewType,
    pub layers: u32,
}

/// Device operations used by the resource layer
pub trait Gpu: Allocator + TransferQueue + Presenter + Send + Sync {
    fn queues(&self) -> &QueueMultiplex;

    /// Wait for all `fences`. Ok(false) on timeout.
    fn wait_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<bool>;

    fn wait_idle(&self) -> Result<()>;

    fn create_image_view(&self, desc: &ViewDesc) -> Result<vk::ImageView>;

    fn destroy_image_view(&self, view: vk::ImageView);
}

/// Explicit device context
pub struct Device {
    gpu: Arc<dyn Gpu>,
    deferred: Mutex<DeferQueue>,
    default_defer: u32,
}

impl Device {
    pub fn new(gpu: Arc<dyn Gpu>, default_defer: u32) -> Arc<Self> {
        Arc::new(Self {
            gpu,
            deferred: Mutex::new(DeferQueue::new()),
            default_defer: if default_defer == 0 { DEFAULT_DEFER } else { default_defer },
        })
    }

    pub fn gpu(&self) -> &Arc<dyn Gpu> {
        &self.gpu
    }

    pub fn queues(&self) -> &QueueMultiplex {
        self.gpu.queues()
    }

    /// Sharing mode and families for a resource touched by `flags`
    pub fn sharing(&self, flags: QueueFlags, desired: vk::SharingMode) -> Sharing {
        let queues = self.queues();
        Sharing {
            mode: queues.sharing_mode(flags, desired),
            families: queues.family_indices(flags),
        }
    }

    pub fn default_defer(&self) -> u32 {
        self.default_defer
    }

    /// Run `callback` after the default number of frames
    pub fn defer(&self, callback: impl FnOnce() + Send + 'static) {
        self.defer_for(callback, self.default_defer);
    }

    pub fn defer_for(&self, callback: impl FnOnce() + Send + 'static, frames: u32) {
        self.deferred.lock().defer(callback, frames);
    }

    /// Frame tick: count down deferred entries and run the expired ones
    pub fn decrement_deferred(&self) {
        let expired = self.deferred.lock().tick();
        for callback in expired {
            callback();
        }
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    fn fence_timeout() -> u64 {
        if cfg!(debug_assertions) {
            DEBUG_FENCE_TIMEOUT.as_nanos() as u64
        } else {
            u64::MAX
        }
    }

    /// Block until `fence` signals. Null fences count as signalled.
    pub fn wait_for(&self, fence: vk::Fence) -> bool {
        self.wait_all(&[fence])
    }

    pub fn wait_all(&self, fences: &[vk::Fence]) -> bool {
        let fences: Vec<vk::Fence> =
            fences.iter().copied().filter(|f| *f != vk::Fence::null()).collect();
        if fences.is_empty() {
            return true;
        }
        match self.gpu.wait_fences(&fences, Self::fence_timeout()) {
            Ok(true) => true,
            Ok(false) => {
                log::error!("Fence wait timed out ({} fences)", fences.len());
                false
            }
            Err(e) => {
                log::error!("Fence wait failed: {e:#}");
                false
            }
        }
    }

    /// Wait for the GPU to drain, then flush every deferred entry
    pub fn wait_idle(&self) {
        if let Err(e) = self.gpu.wait_idle() {
            log::error!("Device wait idle failed: {e:#}");
        }
        let pending = self.deferred.lock().drain();
        if !pending.is_empty() {
            log::debug!("Flushing {} deferred entries", pending.len());
        }
        for callback in pending {
            callback();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.wait_idle();
    }
}
