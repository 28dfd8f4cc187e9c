//! Transfer scheduling.
//!
//! A [`MemoryOps`] accepts a declarative list of transfer requests and
//! batches them into the minimum number of dependency-respecting
//! submissions. Requests are grouped into [`TransferStep`]s at enqueue
//! time: a request joins the most recent step unless that step already
//! writes the request's source (a read-after-write hazard), in which case
//! a new step is opened. Steps are recorded in order with a memory
//! barrier between them, so only operations with a true data dependency
//! pay for a pipeline stall.
//!
//! At execute time, a request is re-recorded only if one of its movable
//! endpoints is stale: each request remembers the submission count of its
//! endpoints' buffers as of its last recording, and a buffer repack bumps
//! that count. An execute where nothing is stale skips recording entirely
//! but still submits, so queue ordering and the scheduler's own counter
//! keep advancing.

use crate::allocator::GpuAllocator;
use crate::buffer::{SectorBuffer, SectorHandle, SectorKey};
use crate::capabilities::GpuCapabilities;
use crate::command::{begin_command_buffer, end_command_buffer, CommandContext, QueueData};
use crate::error::Result;
use crate::sync::{self, push_unique_wait, WaitPoint};
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

/// One movable end of a transfer, as seen by the dependency scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferEndpoint {
    Sector(SectorKey),
    Image(vk::Image),
}

/// A batch of transfers recordable without an intervening barrier.
pub struct TransferStep {
    writes: Vec<TransferEndpoint>,
    ops: Vec<usize>,
}

impl TransferStep {
    /// Indices into the scheduler's request list, in enqueue order.
    pub fn ops(&self) -> &[usize] {
        &self.ops
    }

    fn writes_endpoint(&self, endpoint: TransferEndpoint) -> bool {
        self.writes.contains(&endpoint)
    }
}

/// Place a request into the most recent step whose destination set does
/// not contain the request's source, opening a new step otherwise.
/// Returns the chosen step index.
fn assign_step(
    steps: &mut Vec<TransferStep>,
    op_index: usize,
    source: TransferEndpoint,
    dest: TransferEndpoint,
) -> usize {
    if let Some(last) = steps.last_mut() {
        if !last.writes_endpoint(source) {
            last.ops.push(op_index);
            last.writes.push(dest);
            return steps.len() - 1;
        }
    }
    steps.push(TransferStep {
        writes: vec![dest],
        ops: vec![op_index],
    });
    steps.len() - 1
}

/// One enqueued transfer request.
///
/// The `*_version` fields remember the submission count of the endpoint's
/// buffer as of the last recording; `None` means never recorded.
pub enum TransferOp {
    SectorToSector {
        src: SectorHandle,
        dst: SectorHandle,
        size: u64,
        src_version: Option<u64>,
        dst_version: Option<u64>,
    },
    SectorToImage {
        src: SectorHandle,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        copy: vk::BufferImageCopy,
        range: vk::ImageSubresourceRange,
        src_version: Option<u64>,
    },
    ImageToSector {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: SectorHandle,
        copy: vk::BufferImageCopy,
        range: vk::ImageSubresourceRange,
        dst_version: Option<u64>,
    },
    ImageToImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        copy: vk::ImageCopy,
        range: vk::ImageSubresourceRange,
    },
}

impl TransferOp {
    fn source(&self) -> TransferEndpoint {
        match self {
            Self::SectorToSector { src, .. } | Self::SectorToImage { src, .. } => {
                TransferEndpoint::Sector(src.key())
            }
            Self::ImageToSector { src, .. } | Self::ImageToImage { src, .. } => {
                TransferEndpoint::Image(*src)
            }
        }
    }

    fn dest(&self) -> TransferEndpoint {
        match self {
            Self::SectorToSector { dst, .. } | Self::ImageToSector { dst, .. } => {
                TransferEndpoint::Sector(dst.key())
            }
            Self::SectorToImage { dst, .. } | Self::ImageToImage { dst, .. } => {
                TransferEndpoint::Image(*dst)
            }
        }
    }

    /// Whether a movable endpoint's buffer has been resubmitted since
    /// this request was last recorded.
    pub fn needs_recording(&self) -> bool {
        match self {
            Self::SectorToSector {
                src,
                dst,
                src_version,
                dst_version,
                ..
            } => {
                *src_version != Some(src.owner().version())
                    || *dst_version != Some(dst.owner().version())
            }
            Self::SectorToImage {
                src, src_version, ..
            } => *src_version != Some(src.owner().version()),
            Self::ImageToSector {
                dst, dst_version, ..
            } => *dst_version != Some(dst.owner().version()),
            // Images never move; once recorded the copy stays valid.
            Self::ImageToImage { .. } => false,
        }
    }

    /// Record this request into `cmd`, resolving live buffer handles and
    /// offsets now, and stamp the recorded versions. Returns the wait
    /// points the submission must honor for the endpoints touched.
    fn record(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) -> Result<Vec<WaitPoint>> {
        match self {
            Self::SectorToSector {
                src,
                dst,
                size,
                src_version,
                dst_version,
            } => {
                *src_version = Some(src.owner().version());
                *dst_version = Some(dst.owner().version());

                let src_range = src.resolve()?;
                let dst_range = dst.resolve()?;
                let copy = vk::BufferCopy::default()
                    .src_offset(src_range.offset)
                    .dst_offset(dst_range.offset)
                    .size(*size);
                unsafe {
                    device.cmd_copy_buffer(cmd, src_range.buffer, dst_range.buffer, &[copy]);
                }

                Ok(vec![
                    src.owner().ready_signal(),
                    dst.owner().ready_signal(),
                ])
            }
            Self::SectorToImage {
                src,
                dst,
                dst_layout,
                copy,
                range,
                src_version,
            } => {
                *src_version = Some(src.owner().version());

                let src_range = src.resolve()?;
                // The caller's buffer offset is relative to the sector;
                // the sector's live offset is resolved only now.
                let mut region = *copy;
                region.buffer_offset = src_range.offset + copy.buffer_offset;

                unsafe {
                    transition_image(
                        device,
                        cmd,
                        &[image_barrier(
                            *dst,
                            *dst_layout,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            vk::AccessFlags::NONE,
                            vk::AccessFlags::TRANSFER_WRITE,
                            *range,
                        )],
                    );
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        src_range.buffer,
                        *dst,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                    transition_image(
                        device,
                        cmd,
                        &[image_barrier(
                            *dst,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            *dst_layout,
                            vk::AccessFlags::TRANSFER_WRITE,
                            vk::AccessFlags::NONE,
                            *range,
                        )],
                    );
                }

                Ok(vec![src.owner().ready_signal()])
            }
            Self::ImageToSector {
                src,
                src_layout,
                dst,
                copy,
                range,
                dst_version,
            } => {
                *dst_version = Some(dst.owner().version());

                let dst_range = dst.resolve()?;
                let mut region = *copy;
                region.buffer_offset = dst_range.offset + copy.buffer_offset;

                unsafe {
                    transition_image(
                        device,
                        cmd,
                        &[image_barrier(
                            *src,
                            *src_layout,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            vk::AccessFlags::NONE,
                            vk::AccessFlags::TRANSFER_READ,
                            *range,
                        )],
                    );
                    device.cmd_copy_image_to_buffer(
                        cmd,
                        *src,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_range.buffer,
                        &[region],
                    );
                    transition_image(
                        device,
                        cmd,
                        &[image_barrier(
                            *src,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            *src_layout,
                            vk::AccessFlags::TRANSFER_READ,
                            vk::AccessFlags::NONE,
                            *range,
                        )],
                    );
                }

                Ok(vec![dst.owner().ready_signal()])
            }
            Self::ImageToImage {
                src,
                src_layout,
                dst,
                dst_layout,
                copy,
                range,
            } => {
                unsafe {
                    transition_image(
                        device,
                        cmd,
                        &[
                            image_barrier(
                                *src,
                                *src_layout,
                                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                                vk::AccessFlags::NONE,
                                vk::AccessFlags::TRANSFER_READ,
                                *range,
                            ),
                            image_barrier(
                                *dst,
                                *dst_layout,
                                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                                vk::AccessFlags::NONE,
                                vk::AccessFlags::TRANSFER_WRITE,
                                *range,
                            ),
                        ],
                    );
                    device.cmd_copy_image(
                        cmd,
                        *src,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        *dst,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[*copy],
                    );
                    transition_image(
                        device,
                        cmd,
                        &[
                            image_barrier(
                                *src,
                                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                                *src_layout,
                                vk::AccessFlags::TRANSFER_READ,
                                vk::AccessFlags::NONE,
                                *range,
                            ),
                            image_barrier(
                                *dst,
                                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                                *dst_layout,
                                vk::AccessFlags::TRANSFER_WRITE,
                                vk::AccessFlags::NONE,
                                *range,
                            ),
                        ],
                    );
                }
                Ok(Vec::new())
            }
        }
    }
}

fn image_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    range: vk::ImageSubresourceRange,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
}

/// # Safety
/// The device and command buffer must be valid and recording.
unsafe fn transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    barriers: &[vk::ImageMemoryBarrier],
) {
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            barriers,
        );
    }
}

fn non_empty_buffer_image_copy(copy: &vk::BufferImageCopy) -> bool {
    copy.image_extent.width > 0 && copy.image_extent.height > 0 && copy.image_extent.depth > 0
}

fn non_empty_image_copy(copy: &vk::ImageCopy) -> bool {
    copy.extent.width > 0 && copy.extent.height > 0 && copy.extent.depth > 0
}

/// Deferred GPU→host read.
///
/// The mapped read from the staging sector is only valid once the
/// scheduler's submission has completed on the GPU, so the copy into
/// host memory is split out: call [`Self::execute`] after the owning
/// [`MemoryOps::execute`].
pub struct RamReadback {
    device: Arc<ash::Device>,
    staging: SectorHandle,
    wait: WaitPoint,
}

impl RamReadback {
    /// Block until the scheduler's submission retires, then copy the
    /// staged bytes into `dst`.
    pub fn execute(&self, dst: &mut [u8]) -> Result<()> {
        sync::wait_on_point(&self.device, &self.wait, u64::MAX)?;
        self.staging.read_bytes(dst)
    }
}

/// Batches heterogeneous transfer requests into dependency-respecting
/// submissions, re-recording only what is stale.
pub struct MemoryOps {
    device: Arc<ash::Device>,
    ctx: CommandContext,
    staging: Arc<SectorBuffer>,
    ops: Vec<TransferOp>,
    steps: Vec<TransferStep>,
}

impl MemoryOps {
    /// Create a scheduler submitting on `transfer_queue`, with an
    /// internal CPU-visible staging buffer for RAM transfers.
    pub fn new(
        device: Arc<ash::Device>,
        allocator: Arc<Mutex<GpuAllocator>>,
        capabilities: &GpuCapabilities,
        transfer_queue: QueueData,
    ) -> Result<Self> {
        let ctx = CommandContext::new(
            device.clone(),
            transfer_queue,
            vk::PipelineStageFlags::TRANSFER,
            0,
        )?;
        let staging = SectorBuffer::new(
            device.clone(),
            allocator,
            capabilities,
            transfer_queue,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::CpuToGpu,
            "strata staging",
        )?;
        Ok(Self {
            device,
            ctx,
            staging,
            ops: Vec::new(),
            steps: Vec::new(),
        })
    }

    fn push(&mut self, op: TransferOp) {
        let index = self.ops.len();
        assign_step(&mut self.steps, index, op.source(), op.dest());
        self.ops.push(op);
    }

    /// Stage `src` into the internal staging buffer (mapped write) and
    /// enqueue a staging→`dst` copy, growing `dst` if needed.
    pub fn ram_to_sector(&mut self, src: &[u8], dst: &SectorHandle) -> Result<()> {
        let size = src.len() as u64;
        let stage = self.staging.sector();
        stage.set_size(size);
        self.staging.update(true)?;
        stage.write_bytes(src)?;

        dst.grow_to(size);
        self.push(TransferOp::SectorToSector {
            src: stage,
            dst: dst.clone(),
            size,
            src_version: None,
            dst_version: None,
        });
        Ok(())
    }

    /// Enqueue a `src`→staging copy and return the deferred executor
    /// that reads the staged bytes back once the submission completes.
    pub fn sector_to_ram(&mut self, src: &SectorHandle) -> Result<RamReadback> {
        let size = src.needed_size();
        let stage = self.staging.sector();
        stage.set_size(size);
        self.staging.update(true)?;

        self.push(TransferOp::SectorToSector {
            src: src.clone(),
            dst: stage.clone(),
            size,
            src_version: None,
            dst_version: None,
        });
        Ok(RamReadback {
            device: self.device.clone(),
            staging: stage,
            wait: self.ctx.timeline_signal(),
        })
    }

    /// Enqueue a sector→sector copy, growing `dst` if needed.
    pub fn sector_to_sector(&mut self, src: &SectorHandle, dst: &SectorHandle, size: u64) {
        dst.grow_to(size);
        self.push(TransferOp::SectorToSector {
            src: src.clone(),
            dst: dst.clone(),
            size,
            src_version: None,
            dst_version: None,
        });
    }

    /// Enqueue a sector→image copy. The recording inserts the layout
    /// transitions around the copy and restores `dst_layout` after.
    pub fn sector_to_image(
        &mut self,
        src: &SectorHandle,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        copy: vk::BufferImageCopy,
        range: vk::ImageSubresourceRange,
    ) {
        assert!(
            non_empty_buffer_image_copy(&copy),
            "image transfer requires a non-empty copy region"
        );
        self.push(TransferOp::SectorToImage {
            src: src.clone(),
            dst,
            dst_layout,
            copy,
            range,
            src_version: None,
        });
    }

    /// Enqueue an image→sector copy, growing `dst` to the image's memory
    /// requirements.
    pub fn image_to_sector(
        &mut self,
        src: vk::Image,
        dst: &SectorHandle,
        src_layout: vk::ImageLayout,
        copy: vk::BufferImageCopy,
        range: vk::ImageSubresourceRange,
    ) {
        assert!(
            non_empty_buffer_image_copy(&copy),
            "image transfer requires a non-empty copy region"
        );
        let requirements = unsafe { self.device.get_image_memory_requirements(src) };
        dst.grow_to(requirements.size);
        self.push(TransferOp::ImageToSector {
            src,
            src_layout,
            dst: dst.clone(),
            copy,
            range,
            dst_version: None,
        });
    }

    /// Enqueue an image→image copy.
    pub fn image_to_image(
        &mut self,
        src: vk::Image,
        dst: vk::Image,
        src_layout: vk::ImageLayout,
        dst_layout: vk::ImageLayout,
        copy: vk::ImageCopy,
        range: vk::ImageSubresourceRange,
    ) {
        assert!(
            non_empty_image_copy(&copy),
            "image transfer requires a non-empty copy region"
        );
        self.push(TransferOp::ImageToImage {
            src,
            src_layout,
            dst,
            dst_layout,
            copy,
            range,
        });
    }

    /// Stage `src` and enqueue a staging→image copy.
    pub fn ram_to_image(
        &mut self,
        src: &[u8],
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        copy: vk::BufferImageCopy,
        range: vk::ImageSubresourceRange,
    ) -> Result<()> {
        assert!(
            non_empty_buffer_image_copy(&copy),
            "image transfer requires a non-empty copy region"
        );
        let stage = self.staging.sector();
        stage.set_size(src.len() as u64);
        self.staging.update(true)?;
        stage.write_bytes(src)?;

        self.push(TransferOp::SectorToImage {
            src: stage,
            dst,
            dst_layout,
            copy,
            range,
            src_version: None,
        });
        Ok(())
    }

    /// Enqueue an image→staging copy and return the deferred executor
    /// for the host-side read.
    pub fn image_to_ram(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        copy: vk::BufferImageCopy,
        range: vk::ImageSubresourceRange,
    ) -> Result<RamReadback> {
        assert!(
            non_empty_buffer_image_copy(&copy),
            "image transfer requires a non-empty copy region"
        );
        let requirements = unsafe { self.device.get_image_memory_requirements(src) };
        let stage = self.staging.sector();
        stage.set_size(requirements.size);
        self.staging.update(true)?;

        self.push(TransferOp::ImageToSector {
            src,
            src_layout,
            dst: stage.clone(),
            copy,
            range,
            dst_version: None,
        });
        Ok(RamReadback {
            device: self.device.clone(),
            staging: stage,
            wait: self.ctx.timeline_signal(),
        })
    }

    /// Attach an external wait to the next submission.
    pub fn depends_on(&mut self, wait: WaitPoint) {
        self.ctx.depends_on(vec![wait]);
    }

    /// Whether any enqueued request is stale and would be re-recorded by
    /// the next [`Self::execute`].
    pub fn needs_recording(&self) -> bool {
        self.ops.iter().any(TransferOp::needs_recording)
    }

    /// Record what is stale and submit.
    ///
    /// If no request needs re-recording, the previously recorded command
    /// buffers are resubmitted as-is; the submission still happens so
    /// queue ordering holds and the counter advances. Otherwise the pool
    /// is reset and all steps are re-recorded in order, separated by
    /// memory barriers, and the union of the recorded requests' wait
    /// points (deduplicated by semaphore) joins the submission together
    /// with `transient_waits`.
    pub fn execute(
        &mut self,
        transient_waits: Vec<WaitPoint>,
        wait: bool,
        use_binary_signal: bool,
        use_binary_waits: bool,
    ) -> Result<()> {
        let needs_recording = self.needs_recording();

        let mut submit_waits: Vec<WaitPoint> = Vec::new();
        if needs_recording {
            tracing::trace!(
                transfers = self.ops.len(),
                steps = self.steps.len(),
                "recording transfer steps"
            );
            self.ctx.reset()?;
            let cmd = self.ctx.record_new()?;
            unsafe {
                // The buffer is resubmitted as-is on executes where
                // nothing is stale, possibly while still pending.
                begin_command_buffer(
                    &self.device,
                    cmd,
                    vk::CommandBufferUsageFlags::SIMULTANEOUS_USE,
                )?;
            }
            for step_index in 0..self.steps.len() {
                if step_index > 0 {
                    let barrier = vk::MemoryBarrier::default()
                        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                        .dst_access_mask(
                            vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE,
                        );
                    unsafe {
                        self.device.cmd_pipeline_barrier(
                            cmd,
                            vk::PipelineStageFlags::TRANSFER,
                            vk::PipelineStageFlags::TRANSFER,
                            vk::DependencyFlags::empty(),
                            &[barrier],
                            &[],
                            &[],
                        );
                    }
                }
                let op_indices = self.steps[step_index].ops.clone();
                for op_index in op_indices {
                    let waits = self.ops[op_index].record(&self.device, cmd)?;
                    for point in waits {
                        push_unique_wait(&mut submit_waits, point);
                    }
                }
            }
            unsafe {
                end_command_buffer(&self.device, cmd)?;
            }
        }

        submit_waits.extend(transient_waits);
        self.ctx.depends_on(submit_waits);
        self.ctx.execute(true, wait, use_binary_signal, use_binary_waits)?;
        self.ctx.clear_depends();
        Ok(())
    }

    /// Block until the latest submission retires.
    pub fn wait_idle(&self) -> Result<()> {
        self.ctx.wait()
    }

    /// Drop all requests and steps, reset the command context, and clear
    /// the staging buffer. With `free_staging` the staging buffer's
    /// physical allocation is released too.
    pub fn clear(&mut self, free_staging: bool) -> Result<()> {
        self.steps.clear();
        self.ops.clear();
        self.ctx.reset()?;
        self.ctx.clear_depends();
        self.staging.clear();
        if free_staging {
            self.staging.free()?;
        }
        Ok(())
    }

    /// Current submission count of this scheduler.
    pub fn submit_count(&self) -> u64 {
        self.ctx.submit_count()
    }

    /// Wait descriptor satisfied when the latest submission retires.
    pub fn timeline_signal(&self) -> WaitPoint {
        self.ctx.timeline_signal()
    }

    /// The planned steps, in execution order.
    pub fn steps(&self) -> &[TransferStep] {
        &self.steps
    }

    /// Number of enqueued requests.
    pub fn transfer_count(&self) -> usize {
        self.ops.len()
    }
}

impl Drop for MemoryOps {
    fn drop(&mut self) {
        let _ = self.ctx.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferId;
    use ash::vk::Handle;

    fn sector(buffer: u64, index: usize) -> TransferEndpoint {
        TransferEndpoint::Sector(SectorKey {
            buffer: BufferId::from_raw(buffer),
            index,
        })
    }

    fn image(raw: u64) -> TransferEndpoint {
        TransferEndpoint::Image(vk::Image::from_raw(raw))
    }

    #[test]
    fn chain_of_dependent_transfers_gets_one_step_each() {
        // A→B, B→C, C→D: each source is the previous destination.
        let (a, b, c, d) = (sector(1, 0), sector(1, 1), sector(1, 2), sector(1, 3));
        let mut steps = Vec::new();

        assert_eq!(assign_step(&mut steps, 0, a, b), 0);
        assert_eq!(assign_step(&mut steps, 1, b, c), 1);
        assert_eq!(assign_step(&mut steps, 2, c, d), 2);

        assert_eq!(steps.len(), 3);
        for (i, step) in steps.iter().enumerate() {
            assert_eq!(step.ops(), &[i]);
        }
    }

    #[test]
    fn independent_transfers_share_a_step() {
        let mut steps = Vec::new();
        assign_step(&mut steps, 0, sector(1, 0), sector(1, 1));
        assign_step(&mut steps, 1, sector(2, 0), sector(2, 1));
        assign_step(&mut steps, 2, sector(3, 0), sector(3, 1));

        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].ops(), &[0, 1, 2]);
    }

    #[test]
    fn same_key_in_other_buffer_is_independent() {
        // Index 0 of buffer 2 is not index 0 of buffer 1.
        let mut steps = Vec::new();
        assign_step(&mut steps, 0, sector(1, 0), sector(1, 1));
        assign_step(&mut steps, 1, sector(2, 1), sector(2, 2));

        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn image_write_blocks_image_read() {
        let mut steps = Vec::new();
        // sector → image A, then image A → sector: read-after-write.
        assign_step(&mut steps, 0, sector(1, 0), image(7));
        assign_step(&mut steps, 1, image(7), sector(1, 1));

        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn later_transfer_joins_most_recent_step() {
        // After a chain forces a second step, an unrelated transfer joins
        // the most recent step, not the first.
        let mut steps = Vec::new();
        assign_step(&mut steps, 0, sector(1, 0), sector(1, 1));
        assign_step(&mut steps, 1, sector(1, 1), sector(1, 2));
        let chosen = assign_step(&mut steps, 2, sector(9, 0), sector(9, 1));

        assert_eq!(steps.len(), 2);
        assert_eq!(chosen, 1);
        assert_eq!(steps[1].ops(), &[1, 2]);
    }
}
