//! Command buffer management and submission.
//!
//! A [`CommandContext`] owns a pool of reusable command buffers, a shared
//! submission counter, and the synchronization objects needed to turn a
//! batch of recorded buffers into one queue submission: a timeline
//! semaphore signaled at the counter's value on every submission, an
//! optional binary semaphore for consumers that cannot wait on timelines
//! (presentation engines), and a fence for callers that want to block.

use crate::error::Result;
use crate::registry::ResourceRegistry;
use crate::sync::{SharedCounter, SubmitSync, TimelineSemaphore, WaitPoint};
use ash::vk;
use std::sync::Arc;

/// A queue handle paired with its family index.
#[derive(Clone, Copy, Debug)]
pub struct QueueData {
    pub index: u32,
    pub queue: vk::Queue,
}

/// Owns command buffers and submission state for one queue.
pub struct CommandContext {
    registry: ResourceRegistry,
    device: Arc<ash::Device>,
    queue: QueueData,
    pool: vk::CommandPool,
    owns_pool: bool,
    free: Vec<vk::CommandBuffer>,
    used: Vec<vk::CommandBuffer>,
    submit_count: SharedCounter,
    timeline: TimelineSemaphore,
    binary_signal: vk::Semaphore,
    fence: vk::Fence,
    target_stages: vk::PipelineStageFlags,
    waits: Vec<WaitPoint>,
}

impl CommandContext {
    /// Create a context with its own command pool.
    pub fn new(
        device: Arc<ash::Device>,
        queue: QueueData,
        target_stages: vk::PipelineStageFlags,
        starting_submit_count: u64,
    ) -> Result<Self> {
        let mut registry = ResourceRegistry::new(device.clone());
        let pool = registry.make_command_pool(queue.index, vk::CommandPoolCreateFlags::empty())?;
        Self::build(
            registry,
            device,
            queue,
            pool,
            true,
            target_stages,
            starting_submit_count,
        )
    }

    /// Create a context recording against an externally owned pool.
    ///
    /// The pool must have been created with
    /// `vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER`, since this
    /// context resets only the buffers it used, never the whole pool.
    pub fn with_external_pool(
        device: Arc<ash::Device>,
        queue: QueueData,
        pool: vk::CommandPool,
        target_stages: vk::PipelineStageFlags,
        starting_submit_count: u64,
    ) -> Result<Self> {
        let registry = ResourceRegistry::new(device.clone());
        Self::build(
            registry,
            device,
            queue,
            pool,
            false,
            target_stages,
            starting_submit_count,
        )
    }

    fn build(
        mut registry: ResourceRegistry,
        device: Arc<ash::Device>,
        queue: QueueData,
        pool: vk::CommandPool,
        owns_pool: bool,
        target_stages: vk::PipelineStageFlags,
        starting_submit_count: u64,
    ) -> Result<Self> {
        let submit_count = SharedCounter::new(starting_submit_count);
        let timeline = TimelineSemaphore::new(device.clone(), submit_count.clone())?;
        let binary_signal = registry.make_semaphore()?;
        let fence = registry.make_fence(false)?;

        Ok(Self {
            registry,
            device,
            queue,
            pool,
            owns_pool,
            free: Vec::new(),
            used: Vec::new(),
            submit_count,
            timeline,
            binary_signal,
            fence,
            target_stages,
            waits: Vec::new(),
        })
    }

    /// Draw a command buffer for recording. Reuses the free list, falling
    /// back to a pool allocation. The buffer joins the used list and will
    /// be part of the next submission.
    pub fn record_new(&mut self) -> Result<vk::CommandBuffer> {
        let cmd = if let Some(cmd) = self.free.pop() {
            cmd
        } else {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info)? };
            buffers[0]
        };
        self.used.push(cmd);
        Ok(cmd)
    }

    /// Return used buffers to the free list, resetting the whole pool if
    /// it is internally owned, or buffer-by-buffer otherwise.
    pub fn reset(&mut self) -> Result<()> {
        if self.owns_pool {
            unsafe {
                self.device
                    .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
            }
        } else {
            for &cmd in &self.used {
                unsafe {
                    self.device
                        .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
                }
            }
        }
        self.free.append(&mut self.used);
        Ok(())
    }

    /// Attach wait dependencies to the next submission.
    pub fn depends_on(&mut self, waits: Vec<WaitPoint>) {
        self.waits.extend(waits);
    }

    /// Attach wait dependencies on other contexts' main timeline signals.
    pub fn depends_on_contexts(&mut self, contexts: &[&Self]) {
        for ctx in contexts {
            self.waits.push(ctx.timeline_signal());
        }
    }

    /// Drop all attached wait dependencies.
    pub fn clear_depends(&mut self) {
        self.waits.clear();
    }

    /// Hand externally recorded buffers to the free list.
    pub fn add_free_buffers(&mut self, buffers: Vec<vk::CommandBuffer>) {
        self.free.extend(buffers);
    }

    /// Submit every used command buffer to the bound queue.
    ///
    /// The submission always signals the timeline semaphore at the
    /// submission counter's value; `use_binary_signal` additionally
    /// signals the binary semaphore. Timeline waits are always included;
    /// binary waits only with `use_binary_waits`. With `wait` the calling
    /// thread blocks on the context's fence, which is reset afterwards.
    ///
    /// Timeline values must strictly increase: pass
    /// `increment_submit_count = false` only when the counter was already
    /// advanced for this submission via [`Self::increment_submit_count`].
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn execute(
        &mut self,
        increment_submit_count: bool,
        wait: bool,
        use_binary_signal: bool,
        use_binary_waits: bool,
    ) -> Result<()> {
        if increment_submit_count {
            self.submit_count.increment();
        }

        let mut sync = SubmitSync::new();
        for point in &self.waits {
            if point.is_timeline() || use_binary_waits {
                sync.wait(point, self.target_stages);
            }
        }
        sync.signal_timeline(self.timeline.handle(), self.submit_count.get());
        if use_binary_signal {
            sync.signal_binary(self.binary_signal);
        }

        let fence = if wait { self.fence } else { vk::Fence::null() };
        unsafe {
            sync.submit(&self.device, self.queue.queue, &self.used, fence)?;
            if wait {
                self.device.wait_for_fences(&[self.fence], true, u64::MAX)?;
                self.device.reset_fences(&[self.fence])?;
            }
        }
        Ok(())
    }

    /// Poll whether the latest submission has retired.
    pub fn is_finished(&self) -> Result<bool> {
        self.timeline.signaled()
    }

    /// Block until the latest submission retires.
    pub fn wait(&self) -> Result<()> {
        self.timeline.wait()
    }

    /// Read the current submission count.
    pub fn submit_count(&self) -> u64 {
        self.submit_count.get()
    }

    /// Get a clone of the shared submission counter cell. This is what
    /// sectors, transfers, and descriptor bindings observe for staleness.
    pub fn counter(&self) -> SharedCounter {
        self.submit_count.clone()
    }

    /// Bump the submission counter without submitting.
    pub fn increment_submit_count(&mut self) {
        self.submit_count.increment();
    }

    /// Wait descriptor for this context's main timeline signal at its
    /// live counter value.
    pub fn timeline_signal(&self) -> WaitPoint {
        self.timeline.wait_point(self.target_stages)
    }

    /// The binary semaphore signaled when `use_binary_signal` is passed
    /// to [`Self::execute`].
    pub fn binary_signal(&self) -> vk::Semaphore {
        self.binary_signal
    }

    /// The queue this context submits to.
    pub fn queue(&self) -> QueueData {
        self.queue
    }

    /// The pipeline stages a dependent submission should wait at.
    pub fn target_stages(&self) -> vk::PipelineStageFlags {
        self.target_stages
    }

    /// The registry owning this context's pool and sync objects.
    pub fn registry_mut(&mut self) -> &mut ResourceRegistry {
        &mut self.registry
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    unsafe {
        device.begin_command_buffer(cmd, &begin_info)?;
    }
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    unsafe {
        device.end_command_buffer(cmd)?;
    }
    Ok(())
}
