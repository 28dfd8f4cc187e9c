//! Sector-based Vulkan buffer management and transfer scheduling.
//!
//! This crate provides:
//! - Vulkan instance and device management for headless consumers
//! - GPU capability detection
//! - Memory allocation via gpu-allocator
//! - A sector-based virtual buffer allocator with repack-on-growth
//! - A dependency-aware transfer scheduler with version-gated re-recording
//! - Timeline-semaphore synchronization and command submission
//! - Descriptor set bookkeeping with version-gated rewrites

pub mod allocator;
pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod instance;
pub mod layout;
pub mod registry;
pub mod sync;
pub mod transfer;

pub use allocator::{GpuAllocator, GpuBuffer, GpuImage};
pub use buffer::{BufferId, BufferRange, SectorBuffer, SectorHandle, SectorKey};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{CommandContext, QueueData};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{DescriptorSetData, DescriptorSetManager};
pub use error::{GpuError, Result};
pub use registry::ResourceRegistry;
pub use sync::{SharedCounter, SubmitSync, TimelineSemaphore, WaitPoint};
pub use transfer::{MemoryOps, RamReadback, TransferOp, TransferStep};
