//! Shared types used across the agreement engine crates.

mod types;
mod version;

pub use types::{
    AgreementId, ConversationId, LedgerEntryId, LegacyRecordId, ProposalId, TaskId, UserId,
};
pub use version::Version;
