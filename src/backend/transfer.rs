// Transfer worker - background upload/copy queue
//
// Architecture:
// - Callers enqueue jobs over a crossbeam channel and get a Future back
// - One named thread drains the channel, records each job into a stage
//   (staging buffer + command buffer) and submits everything recorded so
//   far as one batch guarded by one fence
// - Batches are polled while in flight; a signalled fence fulfils every
//   promise in its batch and returns the stages to the idle pool
//
// Jobs are never cancelled: once enqueued they run to completion or fail.

use anyhow::{Context, Result};
use ash::vk;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::future::{Future, Promise};
use super::gpu::Gpu;
use super::memory::{BufferCreateInfo, BufferHandle, Memory, MemoryUsage};
use super::queue::QueueFlags;

/// One command recorded into a transfer command buffer
#[derive(Debug, Clone)]
pub enum TransferOp {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        size: u64,
    },
    Barrier {
        image: vk::Image,
        layers: u32,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        regions: Vec<vk::BufferImageCopy>,
    },
}

/// Command-level access to the transfer queue.
///
/// Only the worker thread records; submission takes the transfer role's
/// queue lock.
pub trait TransferQueue {
    fn alloc_commands(&self) -> Result<vk::CommandBuffer>;
    fn free_commands(&self, command: vk::CommandBuffer);
    /// Begin a one-time-submit recording (implicitly resets `command`)
    fn begin_commands(&self, command: vk::CommandBuffer) -> Result<()>;
    fn record(&self, command: vk::CommandBuffer, op: &TransferOp);
    fn end_commands(&self, command: vk::CommandBuffer) -> Result<()>;
    /// Submit as one batch; the returned fence signals when all complete
    fn submit_transfer(&self, commands: &[vk::CommandBuffer]) -> Result<vk::Fence>;
    fn fence_signalled(&self, fence: vk::Fence) -> Result<bool>;
    fn release_fence(&self, fence: vk::Fence);
}

/// Worker tuning
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    /// Staging buffer sizes allocated up front
    pub reserve: Vec<u64>,
    /// Batch poll interval while submissions are in flight
    pub poll: Duration,
    /// Idle stages kept around for reuse
    pub max_idle_stages: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            reserve: vec![1 << 16, 1 << 16, 1 << 20, 1 << 20],
            poll: Duration::from_millis(5),
            max_idle_stages: 8,
        }
    }
}

/// Staging buffer + command buffer used by one job
pub struct Stage {
    pub buffer: Option<(BufferHandle, u64)>,
    pub command: vk::CommandBuffer,
}

impl Stage {
    pub fn staging(&self) -> Option<BufferHandle> {
        self.buffer.map(|(handle, _)| handle)
    }
}

struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Keeps `Pending::count` raised until dropped
struct Ticket(Arc<Pending>);

impl Ticket {
    fn new(pending: &Arc<Pending>) -> Self {
        *pending.count.lock() += 1;
        Self(pending.clone())
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// Promise for a job plus its slot in the outstanding count
struct Completion {
    promise: Promise,
    _ticket: Ticket,
}

impl Completion {
    fn complete(self) {
        self.promise.fulfil();
    }

    fn fail(self) {
        self.promise.fail();
    }
}

type Job = Box<dyn FnOnce(&mut Worker) + Send>;

struct Batch {
    fence: vk::Fence,
    entries: Vec<(Stage, Completion)>,
}

/// State owned by the transfer thread
pub struct Worker {
    memory: Arc<Memory>,
    gpu: Arc<dyn Gpu>,
    config: TransferConfig,
    idle: Vec<Stage>,
    recorded: Vec<(Stage, Completion)>,
    batches: Vec<Batch>,
}

impl Worker {
    fn new(memory: Arc<Memory>, config: TransferConfig) -> Self {
        let gpu = memory.device().gpu().clone();
        let mut worker = Self {
            memory,
            gpu,
            config,
            idle: Vec::new(),
            recorded: Vec::new(),
            batches: Vec::new(),
        };
        for size in worker.config.reserve.clone() {
            match worker.create_stage(size) {
                Ok(stage) => worker.idle.push(stage),
                Err(e) => log::warn!("Failed to reserve transfer stage: {e:#}"),
            }
        }
        worker
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Stage with at least `size` bytes of staging memory (none when 0)
    pub fn new_stage(&mut self, size: u64) -> Result<Stage> {
        let fits = |stage: &Stage| match stage.buffer {
            Some((_, capacity)) => capacity >= size,
            None => size == 0,
        };
        if let Some(index) = self.idle.iter().position(fits) {
            return Ok(self.idle.swap_remove(index));
        }
        if size == 0 {
            if let Some(stage) = self.idle.pop() {
                return Ok(stage);
            }
            return self.create_stage(0);
        }
        match self.idle.pop() {
            Some(mut stage) => {
                if let Some((old, _)) = stage.buffer.take() {
                    self.memory.destroy_buffer(old);
                }
                match self.create_staging_buffer(size) {
                    Ok(buffer) => {
                        stage.buffer = Some((buffer, size));
                        Ok(stage)
                    }
                    Err(e) => {
                        self.idle.push(stage);
                        Err(e)
                    }
                }
            }
            None => self.create_stage(size),
        }
    }

    /// Record `ops` into the stage's command buffer.
    /// On failure the stage goes back to the idle pool.
    pub fn record(&mut self, stage: Stage, ops: &[TransferOp]) -> Result<Stage> {
        let recorded = self.gpu.begin_commands(stage.command).and_then(|()| {
            for op in ops {
                self.gpu.record(stage.command, op);
            }
            self.gpu.end_commands(stage.command)
        });
        match recorded {
            Ok(()) => Ok(stage),
            Err(e) => {
                self.recycle(stage);
                Err(e)
            }
        }
    }

    /// Return an unused stage to the idle pool
    pub fn recycle(&mut self, stage: Stage) {
        self.idle.push(stage);
    }

    fn create_staging_buffer(&self, size: u64) -> Result<BufferHandle> {
        self.memory.construct_buffer(&BufferCreateInfo {
            name: "transfer/stage".into(),
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            properties: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            memory: MemoryUsage::CpuToGpu,
            queue_flags: QueueFlags::TRANSFER,
            share: vk::SharingMode::EXCLUSIVE,
            silent: true,
        })
    }

    fn create_stage(&self, size: u64) -> Result<Stage> {
        let command =
            self.gpu.alloc_commands().context("Failed to allocate transfer command buffer")?;
        let buffer = if size > 0 {
            match self.create_staging_buffer(size) {
                Ok(buffer) => Some((buffer, size)),
                Err(e) => {
                    self.gpu.free_commands(command);
                    return Err(e);
                }
            }
        } else {
            None
        };
        Ok(Stage { buffer, command })
    }

    fn destroy_stage(&self, stage: Stage) {
        if let Some((buffer, _)) = stage.buffer {
            self.memory.destroy_buffer(buffer);
        }
        self.gpu.free_commands(stage.command);
    }

    fn run_job<F>(&mut self, job: F, completion: Completion)
    where
        F: FnOnce(&mut Worker) -> Result<Stage>,
    {
        match job(self) {
            Ok(stage) => self.recorded.push((stage, completion)),
            Err(e) => {
                log::error!("Transfer job failed: {e:#}");
                completion.fail();
            }
        }
    }

    fn submit_pending(&mut self) {
        if self.recorded.is_empty() {
            return;
        }
        let entries = std::mem::take(&mut self.recorded);
        let commands: Vec<vk::CommandBuffer> =
            entries.iter().map(|(stage, _)| stage.command).collect();
        match self.gpu.submit_transfer(&commands) {
            Ok(fence) => {
                log::trace!("Submitted transfer batch of {} stages", entries.len());
                self.batches.push(Batch { fence, entries });
            }
            Err(e) => {
                log::error!("Transfer submit failed: {e:#}");
                for (stage, completion) in entries {
                    completion.fail();
                    self.idle.push(stage);
                }
            }
        }
    }

    /// Resolve every batch whose fence has signalled
    fn poll_batches(&mut self) {
        let mut index = 0;
        while index < self.batches.len() {
            let (done, succeeded) = match self.gpu.fence_signalled(self.batches[index].fence) {
                Ok(signalled) => (signalled, true),
                Err(e) => {
                    log::error!("Transfer fence query failed: {e:#}");
                    (true, false)
                }
            };
            if done {
                let batch = self.batches.swap_remove(index);
                self.gpu.release_fence(batch.fence);
                for (stage, completion) in batch.entries {
                    if succeeded {
                        completion.complete();
                    } else {
                        completion.fail();
                    }
                    self.idle.push(stage);
                }
            } else {
                index += 1;
            }
        }
        self.trim_idle();
    }

    fn trim_idle(&mut self) {
        while self.idle.len() > self.config.max_idle_stages {
            let stage = self.idle.remove(0);
            self.destroy_stage(stage);
        }
    }

    fn run(mut self, receiver: Receiver<Job>) {
        loop {
            let next = if self.batches.is_empty() {
                receiver.recv().map_err(|_| RecvTimeoutError::Disconnected)
            } else {
                receiver.recv_timeout(self.config.poll)
            };
            match next {
                Ok(job) => job(&mut self),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            while let Ok(job) = receiver.try_recv() {
                job(&mut self);
            }
            self.submit_pending();
            self.poll_batches();
        }

        // Channel closed: finish whatever is still in flight
        self.submit_pending();
        let fences: Vec<vk::Fence> = self.batches.iter().map(|b| b.fence).collect();
        if !fences.is_empty() {
            if let Err(e) = self.gpu.wait_fences(&fences, u64::MAX) {
                log::error!("Transfer drain failed: {e:#}");
            }
        }
        self.poll_batches();
        for batch in std::mem::take(&mut self.batches) {
            self.gpu.release_fence(batch.fence);
        }
        for stage in std::mem::take(&mut self.idle) {
            self.destroy_stage(stage);
        }
    }
}

/// Handle to the transfer thread
pub struct Transfer {
    sender: Option<Sender<Job>>,
    thread: Option<thread::JoinHandle<()>>,
    pending: Arc<Pending>,
}

impl Transfer {
    pub fn new(memory: Arc<Memory>, config: TransferConfig) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        // Reserve stages on the calling thread so start-up is deterministic
        let worker = Worker::new(memory, config);
        let thread = thread::Builder::new()
            .name("transfer".to_string())
            .spawn(move || worker.run(receiver))
            .context("Failed to spawn transfer thread")?;

        log::info!("Transfer thread started");
        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
            pending: Arc::new(Pending { count: Mutex::new(0), idle: Condvar::new() }),
        })
    }

    /// Queue a job; `job` runs on the worker and returns the recorded stage
    pub fn enqueue<F>(&self, work: F) -> Future
    where
        F: FnOnce(&mut Worker) -> Result<Stage> + Send + 'static,
    {
        let (promise, future) = Promise::new();
        let completion = Completion { promise, _ticket: Ticket::new(&self.pending) };
        let job: Job = Box::new(move |worker: &mut Worker| worker.run_job(work, completion));
        match &self.sender {
            Some(sender) => {
                if let Err(e) = sender.send(job) {
                    log::error!("Transfer thread gone, dropping job: {}", e);
                }
            }
            None => log::error!("Transfer queue closed"),
        }
        future
    }

    /// Jobs enqueued but not yet completed
    pub fn outstanding(&self) -> usize {
        *self.pending.count.lock()
    }

    /// Block until every enqueued job has completed or failed
    pub fn wait_idle(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.idle.wait(&mut count);
        }
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop; join would block otherwise
        self.sender = None;

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Failed to join transfer thread");
            }
        }
        log::info!("Transfer thread stopped");
    }
}
