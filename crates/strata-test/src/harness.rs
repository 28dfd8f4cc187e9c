//! Headless GPU harness.
//!
//! Wraps a [`GpuContext`] and hands out the managers under test. Tests
//! that touch the GPU are marked `#[ignore = "Requires GPU hardware"]`
//! and run with `cargo test -- --ignored` on a machine with a Vulkan
//! 1.2 driver.

use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use strata_gpu::{
    DescriptorSetManager, GpuContext, GpuContextBuilder, MemoryOps, SectorBuffer,
};

use crate::Result;

/// Headless GPU context plus manager constructors for tests.
pub struct GpuTestHarness {
    context: GpuContext,
}

impl GpuTestHarness {
    pub fn new() -> Result<Self> {
        let context = GpuContextBuilder::new()
            .app_name("strata-test")
            .validation(true)
            .build()?;
        tracing::info!("Test GPU: {}", context.capabilities().summary());
        Ok(Self { context })
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    /// A host-visible storage sector buffer (mapped reads and writes work).
    pub fn host_storage_buffer(&self, name: &str) -> Result<Arc<SectorBuffer>> {
        Ok(self.context.sector_buffer(
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::CpuToGpu,
            name,
        )?)
    }

    /// A device-local storage sector buffer.
    pub fn device_storage_buffer(&self, name: &str) -> Result<Arc<SectorBuffer>> {
        Ok(self.context.sector_buffer(
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::GpuOnly,
            name,
        )?)
    }

    pub fn memory_ops(&self) -> Result<MemoryOps> {
        Ok(self.context.memory_ops()?)
    }

    pub fn descriptor_manager(&self) -> DescriptorSetManager {
        self.context.descriptor_manager()
    }
}

/// Deterministic byte pattern for content checks.
pub fn byte_pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::ShaderStageFlags;
    use strata_gpu::layout::align_up;

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn harness_creation() {
        init_logging();
        let harness = GpuTestHarness::new().unwrap();
        assert!(harness.context().capabilities().meets_requirements());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn sector_packing_end_to_end() {
        init_logging();
        let harness = GpuTestHarness::new().unwrap();
        let buffer = harness.device_storage_buffer("packing test").unwrap();
        let align = buffer.alignment();

        let s0 = buffer.sector();
        let s1 = buffer.sector();
        s0.set_size(64);
        s1.set_size(128);
        buffer.update(false).unwrap();

        assert_eq!(s0.offset(), 0);
        assert_eq!(s1.offset(), align_up(64, align));
        assert!(s0.allocated_size() >= 64);
        assert!(s1.allocated_size() >= 128);

        // Growing sector 0 repacks the whole buffer: sector 1 shifts and
        // its prior contents are carried forward in one copy submission.
        s0.set_size(256);
        buffer.update(true).unwrap();

        assert_eq!(s0.offset(), 0);
        assert!(s0.allocated_size() >= 256);
        assert_eq!(s1.offset(), align_up(256, align));
        assert_eq!(buffer.version(), 1);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn repack_preserves_sector_contents() {
        init_logging();
        let harness = GpuTestHarness::new().unwrap();
        let buffer = harness.host_storage_buffer("repack test").unwrap();

        let s0 = buffer.sector();
        let s1 = buffer.sector();
        let p0 = byte_pattern(11, 97);
        let p1 = byte_pattern(173, 193);
        s0.set_size(p0.len() as u64);
        s1.set_size(p1.len() as u64);
        buffer.update(false).unwrap();
        s0.write_bytes(&p0).unwrap();
        s1.write_bytes(&p1).unwrap();

        s0.set_size(4096);
        buffer.update(true).unwrap();

        let mut out0 = vec![0u8; p0.len()];
        let mut out1 = vec![0u8; p1.len()];
        s0.read_bytes(&mut out0).unwrap();
        s1.read_bytes(&mut out1).unwrap();
        assert_eq!(out0, p0);
        assert_eq!(out1, p1);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn execute_is_idempotent_when_nothing_is_stale() {
        init_logging();
        let harness = GpuTestHarness::new().unwrap();
        let mut ops = harness.memory_ops().unwrap();
        let buffer = harness.device_storage_buffer("staleness test").unwrap();
        let dst = buffer.sector();

        let data = byte_pattern(0, 512);
        ops.ram_to_sector(&data, &dst).unwrap();
        buffer.update(true).unwrap();

        assert!(ops.needs_recording());
        ops.execute(vec![], true, false, false).unwrap();
        assert!(!ops.needs_recording());

        // Nothing changed: the second execute must not re-record, but
        // still submits and advances the counter.
        let count = ops.submit_count();
        ops.execute(vec![], true, false, false).unwrap();
        assert!(!ops.needs_recording());
        assert_eq!(ops.submit_count(), count + 1);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn ram_round_trip_through_staging() {
        init_logging();
        let harness = GpuTestHarness::new().unwrap();
        let mut ops = harness.memory_ops().unwrap();
        let buffer = harness.device_storage_buffer("round trip").unwrap();
        let dst = buffer.sector();

        let data: Vec<u32> = (0..256u32).map(|i| i.wrapping_mul(2_654_435_761)).collect();
        let bytes: &[u8] = bytemuck::cast_slice(&data);
        ops.ram_to_sector(bytes, &dst).unwrap();
        buffer.update(true).unwrap();
        ops.execute(vec![], true, false, false).unwrap();

        let readback = ops.sector_to_ram(&dst).unwrap();
        ops.execute(vec![], false, false, false).unwrap();

        let mut out = vec![0u8; bytes.len()];
        readback.execute(&mut out).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn descriptor_rewrite_gated_on_repack() {
        init_logging();
        let harness = GpuTestHarness::new().unwrap();
        let buffer = harness.host_storage_buffer("descriptor test").unwrap();
        let sector = buffer.sector();
        sector.set_size(64);
        buffer.update(true).unwrap();

        let mut manager = harness.descriptor_manager();
        let set = manager.new_set();
        set.lock().add_buffer(&sector, ShaderStageFlags::COMPUTE);

        manager.update().unwrap();
        assert!(!set.lock().needs_rewrite());
        assert_ne!(set.lock().set(), vk::DescriptorSet::null());

        // A forced repack bumps the sector's version: exactly one rewrite
        // on the next update, zero on the one after.
        sector.set_size(256);
        buffer.update(true).unwrap();
        assert!(set.lock().needs_rewrite());
        manager.update().unwrap();
        assert!(!set.lock().needs_rewrite());
        manager.update().unwrap();
        assert!(!set.lock().needs_rewrite());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn dependent_transfers_execute_in_order() {
        init_logging();
        let harness = GpuTestHarness::new().unwrap();
        let mut ops = harness.memory_ops().unwrap();
        let buffer = harness.device_storage_buffer("chain").unwrap();

        // A→B then B→C: the scheduler must barrier between the copies so
        // C observes A's bytes, not B's stale contents.
        let a = buffer.sector();
        let b = buffer.sector();
        let c = buffer.sector();
        let data = byte_pattern(42, 128);
        ops.ram_to_sector(&data, &a).unwrap();
        ops.sector_to_sector(&a, &b, data.len() as u64);
        ops.sector_to_sector(&b, &c, data.len() as u64);
        buffer.update(true).unwrap();
        ops.execute(vec![], true, false, false).unwrap();

        let readback = ops.sector_to_ram(&c).unwrap();
        ops.execute(vec![], false, false, false).unwrap();
        let mut out = vec![0u8; data.len()];
        readback.execute(&mut out).unwrap();
        assert_eq!(out, data);
    }
}
