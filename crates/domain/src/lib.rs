//! Domain layer for the agreement engine.
//!
//! This crate holds the persisted record models and the pure rules that act on them:
//! - `Agreement` aggregate with its status machine and idempotent action history
//! - `LegacyRecord` and its mapping onto agreements
//! - `Conversation`, `OrderSnapshot`, ledger and wallet records
//! - `RetryTask` scheduling with exponential backoff
//!
//! Nothing here performs I/O; persistence lives in the `store` crate.

pub mod agreement;
pub mod conversation;
pub mod ledger;
pub mod legacy;
pub mod money;
pub mod order_snapshot;
pub mod retry_task;

pub use agreement::{
    ActionHistory, ActionHistoryEntry, ActionKind, Agreement, AgreementError, AgreementStatus,
    FinancialSnapshot, KeyLookup, NewAgreement, Parties, PartyMetadata, PartySnapshot,
    PaymentStatus, ProposalSnapshot, RenegotiationData, Transition,
};
pub use conversation::{Conversation, ConversationStatus};
pub use ledger::{
    LedgerDirection, LedgerEntry, LedgerMetadata, LedgerReason, Wallet,
    escrow_refund_operation_id,
};
pub use legacy::{LegacyPrice, LegacyRecord, LegacyRenegotiation, map_legacy_status, migration_key};
pub use money::Money;
pub use order_snapshot::{CancellationRecord, CompletionRecord, OrderSnapshot, ServiceDetails};
pub use retry_task::{
    CLAIM_LEASE_MINUTES, ConversationTaskPayload, DEFAULT_MAX_ATTEMPTS, LegacyTaskPayload, RetryTask,
    SnapshotTaskPayload, TaskStatus, TaskType, backoff,
};
