//! Sector-based buffer management.
//!
//! A [`SectorBuffer`] owns one physically-backed buffer divided into
//! logical sectors, packed in declaration order. Sectors grow between
//! frames; when any sector outgrows its allocation the whole buffer is
//! reallocated, every sector gets a new offset, and previously populated
//! sectors are carried forward in one batched copy submission.
//!
//! Consumers hold [`SectorHandle`]s, (owning manager, arena index)
//! pairs, and must re-resolve the current buffer handle and offset at
//! the moment they record or write. A sector's backing buffer and offset
//! are liable to change on any frame in which any sibling sector grew;
//! nothing outside the owning manager may cache them.

use crate::allocator::GpuAllocator;
use crate::capabilities::GpuCapabilities;
use crate::command::{begin_command_buffer, end_command_buffer, CommandContext, QueueData};
use crate::error::{GpuError, Result};
use crate::layout::{self, SectorSlot};
use crate::registry::ResourceRegistry;
use crate::sync::{SharedCounter, WaitPoint};
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`SectorBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Construct a key from a raw value. Only useful for tests that
    /// exercise scheduling logic without a device.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identity of one sector: owning buffer plus arena index. This is what
/// the transfer scheduler's dependency scan compares.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SectorKey {
    pub buffer: BufferId,
    pub index: usize,
}

/// The live buffer handle, offset, and logical size of a sector at one
/// moment in time. Never cache this across an `update`.
#[derive(Clone, Copy, Debug)]
pub struct BufferRange {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
}

#[derive(Default)]
struct Sector {
    needed: u64,
    allocated: u64,
    offset: u64,
    live: bool,
}

struct Inner {
    sectors: Vec<Sector>,
    buffer: Option<crate::allocator::GpuBuffer>,
    repack_ctx: CommandContext,
    registry: ResourceRegistry,
}

/// Manages one physically-backed buffer divided into logical sectors.
pub struct SectorBuffer {
    id: BufferId,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
    alignment: u64,
    name: String,
    version: SharedCounter,
    timeline: vk::Semaphore,
    device: Arc<ash::Device>,
    inner: Mutex<Inner>,
}

impl SectorBuffer {
    /// Create a sector buffer for the given usage class.
    ///
    /// The alignment policy is fixed at construction from the device
    /// limits for the declared usage. The buffer itself is not allocated
    /// until the first [`Self::update`].
    pub fn new(
        device: Arc<ash::Device>,
        allocator: Arc<Mutex<GpuAllocator>>,
        capabilities: &GpuCapabilities,
        transfer_queue: QueueData,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let alignment = capabilities.buffer_alignment(usage);
        let repack_ctx = CommandContext::new(
            device.clone(),
            transfer_queue,
            vk::PipelineStageFlags::TRANSFER,
            0,
        )?;
        let version = repack_ctx.counter();
        let timeline = repack_ctx.timeline_signal().semaphore;
        let registry = ResourceRegistry::with_allocator(device.clone(), allocator);

        Ok(Arc::new(Self {
            id: BufferId::next(),
            usage,
            location,
            alignment,
            name: name.into(),
            version,
            timeline,
            device,
            inner: Mutex::new(Inner {
                sectors: Vec::new(),
                buffer: None,
                repack_ctx,
                registry,
            }),
        }))
    }

    /// This buffer's process-unique identity.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// The declared usage class.
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// The offset alignment applied when packing sectors.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Current submission count of the repack context. This is the
    /// version transfers and descriptors compare against: it bumps
    /// exactly when the backing buffer is repacked.
    pub fn version(&self) -> u64 {
        self.version.get()
    }

    /// Clone of the shared version counter cell.
    pub fn version_counter(&self) -> SharedCounter {
        self.version.clone()
    }

    /// Wait descriptor that is satisfied once the latest repack of this
    /// buffer has completed on the GPU.
    pub fn ready_signal(&self) -> WaitPoint {
        WaitPoint::timeline(
            self.timeline,
            self.version.clone(),
            vk::PipelineStageFlags::TRANSFER,
        )
    }

    /// Allocate a new logical sector with zero size, appended to the
    /// sector list. The manager stays the authoritative owner of the
    /// backing buffer; the caller owns the handle.
    pub fn sector(self: &Arc<Self>) -> SectorHandle {
        let mut inner = self.inner.lock();
        inner.sectors.push(Sector {
            live: true,
            ..Sector::default()
        });
        SectorHandle {
            buffer: Arc::clone(self),
            index: inner.sectors.len() - 1,
        }
    }

    /// Detach one sector from the set. Its slot is skipped by subsequent
    /// packs; outstanding handles to it read as empty.
    pub fn remove_sector(&self, handle: &SectorHandle) {
        debug_assert_eq!(handle.buffer.id, self.id);
        let mut inner = self.inner.lock();
        if let Some(sector) = inner.sectors.get_mut(handle.index) {
            sector.live = false;
            sector.needed = 0;
            sector.allocated = 0;
        }
    }

    /// Reconcile sector sizes with the physical buffer.
    ///
    /// On the first call (no buffer yet) all sectors are packed by prefix
    /// sum of their alignment-rounded sizes and the buffer is allocated
    /// once. On later calls, if any sector's needed size exceeds its
    /// allocation, a new packed layout is computed for *all* sectors, a
    /// new buffer is allocated, and every previously populated sector's
    /// contents are carried forward in one batched copy submission
    /// (incrementing this buffer's version). The old buffer is retired
    /// only after that copy is submitted. Sector offsets are rewritten as
    /// part of repacking, invalidating any offset cached outside this
    /// manager.
    pub fn update(&self, wait: bool) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match inner.buffer.take() {
            None => {
                let needs: Vec<u64> = inner
                    .sectors
                    .iter()
                    .map(|s| if s.live { s.needed } else { 0 })
                    .collect();
                let (extents, total) = layout::plan_pack(&needs, self.alignment);
                for (sector, extent) in inner.sectors.iter_mut().zip(&extents) {
                    sector.offset = extent.offset;
                    sector.allocated = extent.size;
                }
                if total > 0 {
                    inner.buffer = Some(inner.registry.create_buffer(
                        total,
                        self.usage,
                        self.location,
                        &self.name,
                    )?);
                }
                Ok(())
            }
            Some(old) => {
                let slots: Vec<SectorSlot> = inner
                    .sectors
                    .iter()
                    .map(|s| SectorSlot {
                        needed: if s.live { s.needed } else { 0 },
                        allocated: if s.live { s.allocated } else { 0 },
                        offset: s.offset,
                    })
                    .collect();

                if !layout::needs_repack(&slots) {
                    inner.buffer = Some(old);
                    return Ok(());
                }

                let plan = layout::plan_repack(&slots, self.alignment);
                tracing::trace!(
                    buffer = %self.name,
                    old_size = old.size,
                    new_size = plan.total_size,
                    copies = plan.copies.len(),
                    "repacking sector buffer"
                );

                let new_buffer = inner.registry.create_buffer(
                    plan.total_size,
                    self.usage,
                    self.location,
                    &self.name,
                )?;
                for (sector, extent) in inner.sectors.iter_mut().zip(&plan.extents) {
                    sector.offset = extent.offset;
                    sector.allocated = extent.size;
                }

                if !plan.copies.is_empty() {
                    let copies: Vec<vk::BufferCopy> = plan
                        .copies
                        .iter()
                        .map(|c| {
                            vk::BufferCopy::default()
                                .src_offset(c.src_offset)
                                .dst_offset(c.dst_offset)
                                .size(c.size)
                        })
                        .collect();

                    inner.repack_ctx.reset()?;
                    let cmd = inner.repack_ctx.record_new()?;
                    unsafe {
                        begin_command_buffer(
                            &self.device,
                            cmd,
                            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                        )?;
                        self.device
                            .cmd_copy_buffer(cmd, old.buffer, new_buffer.buffer, &copies);
                        end_command_buffer(&self.device, cmd)?;
                    }
                    inner.repack_ctx.execute(true, wait, false, false)?;
                }

                inner.registry.retire_buffer(old);
                inner.buffer = Some(new_buffer);
                Ok(())
            }
        }
    }

    /// Drop all sectors without touching the physical buffer. Used to
    /// reset staging state between transfer batches.
    pub fn clear(&self) {
        self.inner.lock().sectors.clear();
    }

    /// Drop all sectors, reset size tracking, and release the physical
    /// buffer for destruction. Waits for this buffer's own repack
    /// submissions first; the caller must ensure no other queue still
    /// reads the buffer.
    pub fn free(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.sectors.clear();
        if let Some(buffer) = inner.buffer.take() {
            inner.repack_ctx.wait()?;
            inner.registry.retire_buffer(buffer);
        }
        inner.registry.destroy_buffers();
        Ok(())
    }

    fn with_sector<T>(&self, index: usize, f: impl FnOnce(&Sector) -> T) -> Option<T> {
        let inner = self.inner.lock();
        inner.sectors.get(index).filter(|s| s.live).map(f)
    }
}

impl Drop for SectorBuffer {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(buffer) = inner.buffer.take() {
            inner.registry.retire_buffer(buffer);
        }
    }
}

/// Shared handle to one sector of a [`SectorBuffer`].
///
/// The handle never caches the buffer handle or offset; every resolve
/// reads the owner's current state.
#[derive(Clone)]
pub struct SectorHandle {
    buffer: Arc<SectorBuffer>,
    index: usize,
}

impl SectorHandle {
    /// The owning buffer manager.
    pub fn owner(&self) -> &Arc<SectorBuffer> {
        &self.buffer
    }

    /// This sector's identity key.
    pub fn key(&self) -> SectorKey {
        SectorKey {
            buffer: self.buffer.id,
            index: self.index,
        }
    }

    /// Set the logical size requested for the next `update`.
    pub fn set_size(&self, needed: u64) {
        let mut inner = self.buffer.inner.lock();
        if let Some(sector) = inner.sectors.get_mut(self.index) {
            sector.needed = needed;
        }
    }

    /// Reset the logical size to zero.
    pub fn reset_size(&self) {
        self.set_size(0);
    }

    /// Grow the logical size to at least `needed`.
    pub fn grow_to(&self, needed: u64) {
        let mut inner = self.buffer.inner.lock();
        if let Some(sector) = inner.sectors.get_mut(self.index) {
            sector.needed = sector.needed.max(needed);
        }
    }

    /// The logical size requested for this sector.
    pub fn needed_size(&self) -> u64 {
        self.buffer
            .with_sector(self.index, |s| s.needed)
            .unwrap_or(0)
    }

    /// The size actually reserved, a multiple of the owner's alignment.
    pub fn allocated_size(&self) -> u64 {
        self.buffer
            .with_sector(self.index, |s| s.allocated)
            .unwrap_or(0)
    }

    /// The byte offset within the backing buffer.
    pub fn offset(&self) -> u64 {
        self.buffer
            .with_sector(self.index, |s| s.offset)
            .unwrap_or(0)
    }

    /// Resolve the sector's current backing buffer, offset, and logical
    /// size. Fails until the owner has allocated its buffer.
    pub fn resolve(&self) -> Result<BufferRange> {
        let inner = self.buffer.inner.lock();
        let sector = inner
            .sectors
            .get(self.index)
            .filter(|s| s.live)
            .ok_or_else(|| GpuError::InvalidState("Sector was removed".to_string()))?;
        let buffer = inner
            .buffer
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Sector buffer not allocated".to_string()))?;
        Ok(BufferRange {
            buffer: buffer.buffer,
            offset: sector.offset,
            size: sector.needed,
        })
    }

    /// Write bytes into the sector through the mapped pointer. The
    /// owner's buffer must be host-visible and already allocated.
    pub fn write_bytes(&self, data: &[u8]) -> Result<()> {
        let inner = self.buffer.inner.lock();
        let sector = inner
            .sectors
            .get(self.index)
            .filter(|s| s.live)
            .ok_or_else(|| GpuError::InvalidState("Sector was removed".to_string()))?;
        if data.len() as u64 > sector.allocated {
            return Err(GpuError::InvalidState(
                "Write exceeds sector allocation".to_string(),
            ));
        }
        let buffer = inner
            .buffer
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Sector buffer not allocated".to_string()))?;
        buffer.write_bytes(sector.offset, data)
    }

    /// Write typed POD data into the sector through the mapped pointer.
    pub fn write_slice<T: bytemuck::NoUninit>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(bytemuck::cast_slice(data))
    }

    /// Read bytes from the sector through the mapped pointer. The
    /// owner's buffer must be host-visible and already allocated.
    pub fn read_bytes(&self, out: &mut [u8]) -> Result<()> {
        let inner = self.buffer.inner.lock();
        let sector = inner
            .sectors
            .get(self.index)
            .filter(|s| s.live)
            .ok_or_else(|| GpuError::InvalidState("Sector was removed".to_string()))?;
        if out.len() as u64 > sector.allocated {
            return Err(GpuError::InvalidState(
                "Read exceeds sector allocation".to_string(),
            ));
        }
        let buffer = inner
            .buffer
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Sector buffer not allocated".to_string()))?;
        buffer.read_bytes(sector.offset, out)
    }
}
