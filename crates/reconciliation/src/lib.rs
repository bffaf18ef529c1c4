//! Repair machinery that keeps agreements, legacy records, conversations and
//! order snapshots consistent.
//!
//! This crate provides:
//! - [`RetryQueue`]: durable, atomically claimed repair tasks with backoff
//! - [`HandlerRegistry`]: the task type to handler table
//! - [`ReconciliationSweep`]: full sweep, price repair and consistency check

pub mod error;
pub mod handlers;
pub mod retry_queue;
pub mod sweep;

pub use error::{ReconciliationError, Result};
pub use handlers::{HandlerRegistry, TaskHandler};
pub use retry_queue::{DrainReport, RetryQueue};
pub use sweep::{
    ConsistencyReport, PriceRepairMatch, PriceRepairReport, ReconciliationSweep, SweepConfig,
    SweepReport,
};
