//! Order snapshot projection.
//!
//! This crate keeps the read-optimized [`domain::OrderSnapshot`] in step with
//! its agreement:
//! - [`OrderSnapshotProjector`] creates and syncs snapshots, idempotently
//! - [`resolve_participant`] finds the account ids of the two parties across
//!   the agreement, its conversation and its legacy record

pub mod error;
pub mod projector;
pub mod resolver;

pub use error::{ProjectionError, Result};
pub use projector::OrderSnapshotProjector;
pub use resolver::{Resolution, ResolutionContext, ResolutionSource, Role, resolve_participant};
