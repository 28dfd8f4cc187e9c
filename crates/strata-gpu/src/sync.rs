//! Synchronization primitives.
//!
//! The central type here is [`SharedCounter`]: a reference-counted,
//! monotonically increasing submission counter. Every [`crate::command::CommandContext`]
//! owns one and bumps it once per submission; sectors, transfer requests,
//! and descriptor bindings keep clones of the counter cell and compare
//! remembered values against it to decide whether they are stale. The
//! counter doubles as the signal value of the context's timeline
//! semaphore, so "wait until value N" and "the buffer has been submitted
//! N times" are the same statement.

use crate::error::Result;
use ash::vk;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A shared, monotonically increasing 64-bit submission counter.
///
/// Cloning shares the underlying cell. This is scoped sharing, not global
/// state: the cell lives exactly as long as the contexts and observers
/// holding it.
#[derive(Clone, Debug)]
pub struct SharedCounter(Arc<AtomicU64>);

impl SharedCounter {
    /// Create a counter starting at `value`.
    pub fn new(value: u64) -> Self {
        Self(Arc::new(AtomicU64::new(value)))
    }

    /// Read the current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Increment and return the new value.
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Overwrite the value. Used only when a timeline semaphore is reset.
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Release);
    }
}

/// A single wait dependency for a queue submission.
///
/// `value` distinguishes the semaphore kind: `Some` means a timeline
/// semaphore waited at the counter's value as read at submission time,
/// `None` means a binary semaphore.
#[derive(Clone)]
pub struct WaitPoint {
    pub semaphore: vk::Semaphore,
    pub value: Option<SharedCounter>,
    pub stage: vk::PipelineStageFlags,
}

impl WaitPoint {
    /// Timeline wait at the counter's live value.
    pub fn timeline(
        semaphore: vk::Semaphore,
        value: SharedCounter,
        stage: vk::PipelineStageFlags,
    ) -> Self {
        Self {
            semaphore,
            value: Some(value),
            stage,
        }
    }

    /// Binary semaphore wait.
    pub fn binary(semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        Self {
            semaphore,
            value: None,
            stage,
        }
    }

    pub fn is_timeline(&self) -> bool {
        self.value.is_some()
    }
}

/// Append `point` unless a wait on the same semaphore is already present.
///
/// Transfer recording produces one wait per movable endpoint; many
/// endpoints share a buffer manager, so the raw list is full of
/// duplicates. Submissions must not wait on the same semaphore twice.
pub fn push_unique_wait(waits: &mut Vec<WaitPoint>, point: WaitPoint) {
    if !waits.iter().any(|w| w.semaphore == point.semaphore) {
        waits.push(point);
    }
}

/// Wait and signal lists merged into one queue submission.
///
/// Timeline values are read at the moment a wait or signal is added, so
/// build this immediately before submitting.
#[derive(Default)]
pub struct SubmitSync {
    wait_semaphores: Vec<vk::Semaphore>,
    wait_stages: Vec<vk::PipelineStageFlags>,
    wait_values: Vec<u64>,
    signal_semaphores: Vec<vk::Semaphore>,
    signal_values: Vec<u64>,
}

impl SubmitSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a wait. Timeline waits read the counter's live value; binary
    /// waits get a placeholder value the driver ignores. A point with an
    /// empty stage mask waits at `default_stage`.
    pub fn wait(&mut self, point: &WaitPoint, default_stage: vk::PipelineStageFlags) {
        self.wait_semaphores.push(point.semaphore);
        self.wait_stages.push(if point.stage.is_empty() {
            default_stage
        } else {
            point.stage
        });
        self.wait_values
            .push(point.value.as_ref().map_or(0, SharedCounter::get));
    }

    /// Add a timeline signal at `value`.
    pub fn signal_timeline(&mut self, semaphore: vk::Semaphore, value: u64) {
        self.signal_semaphores.push(semaphore);
        self.signal_values.push(value);
    }

    /// Add a binary signal.
    pub fn signal_binary(&mut self, semaphore: vk::Semaphore) {
        self.signal_semaphores.push(semaphore);
        self.signal_values.push(0);
    }

    /// Submit `command_buffers` on `queue` with the collected waits and
    /// signals, optionally signaling `fence`.
    ///
    /// # Safety
    /// All handles must be valid and the queue externally synchronized.
    pub unsafe fn submit(
        &self,
        device: &ash::Device,
        queue: vk::Queue,
        command_buffers: &[vk::CommandBuffer],
        fence: vk::Fence,
    ) -> Result<()> {
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&self.wait_values)
            .signal_semaphore_values(&self.signal_values);
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&self.wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(&self.signal_semaphores)
            .push_next(&mut timeline_info);
        unsafe {
            device.queue_submit(queue, std::slice::from_ref(&submit_info), fence)?;
        }
        Ok(())
    }
}

/// A timeline semaphore paired with its [`SharedCounter`].
///
/// The semaphore's signaled value tracks the counter: each submission
/// signals the counter's post-increment value, so waiting for
/// `counter.get()` blocks until the latest submission retires.
pub struct TimelineSemaphore {
    device: Arc<ash::Device>,
    semaphore: vk::Semaphore,
    value: SharedCounter,
}

impl TimelineSemaphore {
    /// Create a timeline semaphore whose initial value is the counter's
    /// current value.
    pub fn new(device: Arc<ash::Device>, value: SharedCounter) -> Result<Self> {
        let semaphore = unsafe { create_timeline_semaphore(&device, value.get())? };
        Ok(Self {
            device,
            semaphore,
            value,
        })
    }

    /// Get the raw semaphore handle.
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Get a clone of the counter cell.
    pub fn counter(&self) -> SharedCounter {
        self.value.clone()
    }

    /// Produce a wait on this semaphore at the counter's live value.
    pub fn wait_point(&self, stage: vk::PipelineStageFlags) -> WaitPoint {
        WaitPoint::timeline(self.semaphore, self.value.clone(), stage)
    }

    /// Block until the semaphore reaches the counter's current value.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self) -> Result<()> {
        self.wait_for(self.value.get(), u64::MAX)?;
        Ok(())
    }

    /// Block until the semaphore reaches `value`, up to `timeout_ns`.
    pub fn wait_for(&self, value: u64, timeout_ns: u64) -> Result<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe {
            self.device.wait_semaphores(&wait_info, timeout_ns)?;
        }
        Ok(())
    }

    /// Poll whether the counter's current value has been reached.
    pub fn signaled(&self) -> Result<bool> {
        let semaphores = [self.semaphore];
        let values = [self.value.get()];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        match unsafe { self.device.wait_semaphores(&wait_info, 0) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Destroy and recreate the semaphore at `starting_value`, rewinding
    /// the counter to match. The old semaphore must not be in use.
    pub fn reset(&mut self, starting_value: u64) -> Result<()> {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
            self.semaphore = create_timeline_semaphore(&self.device, starting_value)?;
        }
        self.value.set(starting_value);
        Ok(())
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Create a raw timeline semaphore.
///
/// # Safety
/// The device must be valid.
unsafe fn create_timeline_semaphore(
    device: &ash::Device,
    initial_value: u64,
) -> Result<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(initial_value);
    let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
    let semaphore = unsafe { device.create_semaphore(&create_info, None)? };
    Ok(semaphore)
}

/// Block on a timeline semaphore independent of a [`TimelineSemaphore`]
/// wrapper. Used by deferred read-backs, which hold only a [`WaitPoint`].
pub fn wait_on_point(device: &ash::Device, point: &WaitPoint, timeout_ns: u64) -> Result<()> {
    let value = point.value.as_ref().map_or(0, SharedCounter::get);
    let semaphores = [point.semaphore];
    let values = [value];
    let wait_info = vk::SemaphoreWaitInfo::default()
        .semaphores(&semaphores)
        .values(&values);
    unsafe {
        device.wait_semaphores(&wait_info, timeout_ns)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn counter_is_shared_and_monotonic() {
        let counter = SharedCounter::new(3);
        let observer = counter.clone();

        assert_eq!(counter.increment(), 4);
        assert_eq!(observer.get(), 4);
        assert_eq!(observer.increment(), 5);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn wait_dedup_by_semaphore_handle() {
        let sem_a = vk::Semaphore::from_raw(1);
        let sem_b = vk::Semaphore::from_raw(2);
        let counter = SharedCounter::new(0);

        let mut waits = Vec::new();
        push_unique_wait(
            &mut waits,
            WaitPoint::timeline(sem_a, counter.clone(), vk::PipelineStageFlags::TRANSFER),
        );
        push_unique_wait(
            &mut waits,
            WaitPoint::timeline(sem_a, counter.clone(), vk::PipelineStageFlags::TRANSFER),
        );
        push_unique_wait(
            &mut waits,
            WaitPoint::binary(sem_b, vk::PipelineStageFlags::TRANSFER),
        );

        assert_eq!(waits.len(), 2);
        assert_eq!(waits[0].semaphore, sem_a);
        assert_eq!(waits[1].semaphore, sem_b);
    }
}
