// VRAM - asynchronous uploads on top of Memory
//
// Every upload returns a Future resolved by the transfer thread. Source
// data is snapshotted before the call returns, so callers may reuse their
// buffers immediately.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::future::Future;
use super::gpu::Device;
use super::memory::{BufferCreateInfo, BufferHandle, ImageHandle, Memory, MemoryUsage};
use super::queue::{QueueFlags, QueueRole};
use super::transfer::{Transfer, TransferConfig, TransferOp};

/// (old, new) image layouts bracketing an image upload
pub type LayoutTransition = (vk::ImageLayout, vk::ImageLayout);

#[derive(Debug, Clone, Default)]
pub struct VramCreateInfo {
    pub transfer: TransferConfig,
    pub log_allocations: bool,
}

/// Extra destination scope for the final upload barrier
#[derive(Debug, Clone, Copy, Default)]
struct PostBarrier {
    stages: vk::PipelineStageFlags,
    access: vk::AccessFlags,
}

pub struct Vram {
    // Joins the worker before the registries go away
    transfer: Transfer,
    memory: Arc<Memory>,
    post: PostBarrier,
}

impl Vram {
    pub fn new(device: Arc<Device>, info: VramCreateInfo) -> Result<Arc<Self>> {
        let transfer_flags = device.queues().queue(QueueRole::Transfer).flags;
        let post = if transfer_flags.contains(QueueFlags::GRAPHICS) {
            PostBarrier {
                stages: vk::PipelineStageFlags::FRAGMENT_SHADER,
                access: vk::AccessFlags::SHADER_READ,
            }
        } else {
            PostBarrier::default()
        };
        let memory = Memory::new(device, info.log_allocations);
        let transfer =
            Transfer::new(memory.clone(), info.transfer).context("Failed to start transfer")?;

        log::info!("VRAM constructed");
        Ok(Arc::new(Self { transfer, memory, post }))
    }

    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    pub fn device(&self) -> &Arc<Device> {
        self.memory.device()
    }

    /// Buffer object: host-visible (written directly) or device-local
    /// (filled through `stage`/`copy`)
    pub fn create_bo(
        &self,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> Result<BufferHandle> {
        let info = if host_visible {
            BufferCreateInfo {
                properties: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                memory: MemoryUsage::CpuToGpu,
                queue_flags: QueueFlags::GRAPHICS,
                share: vk::SharingMode::EXCLUSIVE,
                ..Default::default()
            }
        } else {
            BufferCreateInfo {
                properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                memory: MemoryUsage::GpuOnly,
                queue_flags: QueueFlags::GRAPHICS | QueueFlags::TRANSFER,
                share: vk::SharingMode::CONCURRENT,
                ..Default::default()
            }
        };
        self.memory.construct_buffer(&BufferCreateInfo {
            name: name.to_string(),
            size,
            usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
            ..info
        })
    }

    /// Device-side buffer to buffer copy. `size == 0` copies the source's
    /// write size.
    pub fn copy(&self, src: BufferHandle, dst: BufferHandle, size: u64) -> Future {
        let (Some(s), Some(d)) = (self.memory.buffer(src), self.memory.buffer(dst)) else {
            log::error!("Copy requested on a stale buffer handle");
            return Future::invalid();
        };
        let size = if size == 0 { s.write_size } else { size };
        if !s.queue_flags.contains(QueueFlags::TRANSFER)
            || !d.queue_flags.contains(QueueFlags::TRANSFER)
        {
            log::error!(
                "Source/destination buffers missing QueueFlags::TRANSFER! [{}] -> [{}]",
                s.name,
                d.name
            );
            return Future::invalid();
        }
        if d.write_size < size || s.size < size {
            log::error!("Copy of {} bytes does not fit [{}] -> [{}]", size, s.name, d.name);
            return Future::invalid();
        }

        self.transfer.enqueue(move |worker| {
            let memory = worker.memory();
            let s = memory.buffer(src).context("Copy source destroyed before transfer")?;
            let d = memory.buffer(dst).context("Copy destination destroyed before transfer")?;
            let stage = worker.new_stage(0)?;
            worker.record(stage, &[TransferOp::CopyBuffer { src: s.buffer, dst: d.buffer, size }])
        })
    }

    /// Upload `data` into a device buffer
    pub fn stage(&self, dst: BufferHandle, data: &[u8]) -> Future {
        let Some(d) = self.memory.buffer(dst) else {
            log::error!("Stage requested on a stale buffer handle");
            return Future::invalid();
        };
        if !d.queue_flags.contains(QueueFlags::TRANSFER) {
            log::error!("Invalid queue flags on destination buffer [{}]!", d.name);
            return Future::invalid();
        }
        if data.is_empty() || data.len() as u64 > d.size {
            log::error!("Cannot stage {} bytes into [{}] ({} bytes)", data.len(), d.name, d.size);
            return Future::invalid();
        }

        let data = data.to_vec();
        self.transfer.enqueue(move |worker| {
            let size = data.len() as u64;
            let d = worker
                .memory()
                .buffer(dst)
                .context("Stage destination destroyed before transfer")?;
            let stage = worker.new_stage(size)?;
            let staging =
                stage.staging().and_then(|h| worker.memory().buffer(h).map(|b| (h, b.buffer)));
            let Some((handle, buffer)) = staging else {
                worker.recycle(stage);
                anyhow::bail!("Transfer stage lost its staging buffer");
            };
            if !worker.memory().write(handle, &data, 0) {
                worker.recycle(stage);
                anyhow::bail!("Error staging data for [{}]", d.name);
            }
            worker.record(stage, &[TransferOp::CopyBuffer { src: buffer, dst: d.buffer, size }])
        })
    }

    /// Upload equally sized pixel layers (1 for 2D, 6 for cube) into `dst`,
    /// transitioning `layouts.0 -> TRANSFER_DST -> layouts.1`
    pub fn copy_image(
        &self,
        layers: &[&[u8]],
        dst: ImageHandle,
        layouts: LayoutTransition,
    ) -> Future {
        let Some(image) = self.memory.image(dst) else {
            log::error!("Image copy requested on a stale image handle");
            return Future::invalid();
        };
        let layer_size = layers.first().map_or(0, |l| l.len());
        if layer_size == 0 || layers.iter().any(|l| l.len() != layer_size) {
            log::error!(
                "Invalid image data for [{}]: layers must be non-empty and equally sized",
                image.name
            );
            return Future::invalid();
        }
        if layers.len() as u32 != image.layer_count {
            log::error!(
                "Image [{}] has {} layers, got {}",
                image.name,
                image.layer_count,
                layers.len()
            );
            return Future::invalid();
        }

        let pixels = layers.concat();
        let post = self.post;
        self.transfer.enqueue(move |worker| {
            let image = worker.memory().image(dst).context("Image destroyed before transfer")?;
            let stage = worker.new_stage(pixels.len() as u64)?;
            let staging =
                stage.staging().and_then(|h| worker.memory().buffer(h).map(|b| (h, b.buffer)));
            let Some((handle, buffer)) = staging else {
                worker.recycle(stage);
                anyhow::bail!("Transfer stage lost its staging buffer");
            };
            if !worker.memory().write(handle, &pixels, 0) {
                worker.recycle(stage);
                anyhow::bail!("Memory map failed for [{}]", image.name);
            }

            let regions = (0..image.layer_count)
                .map(|layer| vk::BufferImageCopy {
                    buffer_offset: layer as u64 * layer_size as u64,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: layer,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D::default(),
                    image_extent: image.extent,
                })
                .collect();
            let ops = [
                TransferOp::Barrier {
                    image: image.image,
                    layers: image.layer_count,
                    old_layout: layouts.0,
                    new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    src_access: vk::AccessFlags::empty(),
                    dst_access: vk::AccessFlags::TRANSFER_WRITE,
                    src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                    dst_stage: vk::PipelineStageFlags::TRANSFER,
                },
                TransferOp::CopyBufferToImage { src: buffer, dst: image.image, regions },
                TransferOp::Barrier {
                    image: image.image,
                    layers: image.layer_count,
                    old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    new_layout: layouts.1,
                    src_access: vk::AccessFlags::TRANSFER_WRITE,
                    dst_access: post.access,
                    src_stage: vk::PipelineStageFlags::TRANSFER,
                    dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE | post.stages,
                },
            ];
            worker.record(stage, &ops)
        })
    }

    /// Destroy `handle` after `frames` ticks (default delay when None)
    pub fn defer_buffer(&self, handle: BufferHandle, frames: Option<u32>) {
        let memory = Arc::downgrade(&self.memory);
        let device = self.device();
        device.defer_for(
            move || {
                if let Some(memory) = memory.upgrade() {
                    memory.destroy_buffer(handle);
                }
            },
            frames.unwrap_or(device.default_defer()),
        );
    }

    pub fn defer_image(&self, handle: ImageHandle, frames: Option<u32>) {
        let memory = Arc::downgrade(&self.memory);
        let device = self.device();
        device.defer_for(
            move || {
                if let Some(memory) = memory.upgrade() {
                    memory.destroy_image(handle);
                }
            },
            frames.unwrap_or(device.default_defer()),
        );
    }

    /// Grow a buffer; the replaced allocation is released through the
    /// deferred queue
    pub fn resize(&self, handle: BufferHandle, size: u64) -> Result<()> {
        if let Some(old) = self.memory.resize(handle, size)? {
            let gpu = self.device().gpu().clone();
            self.device().defer(move || gpu.destroy_buffer(old));
        }
        Ok(())
    }

    /// Wait on several futures; true if all of them succeeded
    pub fn wait<'a>(&self, futures: impl IntoIterator<Item = &'a Future>) -> bool {
        futures.into_iter().fold(true, |ok, future| future.wait() && ok)
    }

    /// Block until the transfer queue has drained
    pub fn wait_idle(&self) {
        self.transfer.wait_idle();
    }

    pub fn outstanding(&self) -> usize {
        self.transfer.outstanding()
    }
}

impl Drop for Vram {
    fn drop(&mut self) {
        log::info!("VRAM destroyed");
    }
}

#[cfg(test)]
#[path = "vram_tests.rs"]
mod tests;
