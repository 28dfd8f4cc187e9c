//! Headless test harness for the Strata GPU layer.
//!
//! Provides a GPU context plus constructors for the core managers, so
//! integration tests can exercise sector buffers, transfer scheduling,
//! and descriptor bookkeeping without a display.

pub mod harness;

pub use harness::GpuTestHarness;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] strata_gpu::GpuError),
}

pub type Result<T> = std::result::Result<T, TestError>;
