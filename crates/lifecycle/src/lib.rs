//! Agreement lifecycle services.
//!
//! This crate turns the pure rules of the `domain` crate into persisted,
//! transactional operations:
//! - [`AgreementService`] creates agreements and runs state transitions
//! - [`LegacyAdapter`] migrates legacy pre-contract records onto agreements
//! - [`EscrowService`] holds escrow and cancels a conversation with refund atomically
//! - [`Notifier`] is the outbound port to the chat surface
//!
//! After every committed transition the order snapshot is synced; when that
//! fails a `sync_order_snapshot` retry task is stored instead.

pub mod error;
pub mod escrow;
pub mod legacy;
pub mod notifier;
pub mod service;

pub use error::{LifecycleError, Result};
pub use escrow::{EscrowCancellation, EscrowService, escrow_cancel_key};
pub use legacy::{DualIdentifiers, LegacyAdapter, Migration, MigrationOutcome};
pub use notifier::{InMemoryNotifier, Notifier, ParticipantEvent, SystemMessage, TracingNotifier};
pub use service::{
    ActionContext, AgreementService, CreateAgreement, CreateOutcome, TransitionOutcome,
};
