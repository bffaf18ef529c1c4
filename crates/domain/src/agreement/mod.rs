//! Agreement aggregate and related types.

mod aggregate;
mod history;
mod status;
mod value_objects;

pub use aggregate::{Agreement, NewAgreement, Transition};
pub use history::{ActionHistory, ActionHistoryEntry, ActionKind, KeyLookup};
pub use status::AgreementStatus;
pub use value_objects::{
    FinancialSnapshot, Parties, PartyMetadata, PartySnapshot, PaymentStatus, ProposalSnapshot,
    RenegotiationData,
};

use common::LegacyRecordId;
use thiserror::Error;

/// Errors raised by agreement transitions.
#[derive(Debug, Error)]
pub enum AgreementError {
    /// The agreement is not in a status that allows the action.
    #[error("Invalid transition: cannot record {action} from {current} status")]
    InvalidTransition {
        current: AgreementStatus,
        action: ActionKind,
    },

    /// The idempotency key was already recorded for a different action.
    #[error("Idempotency key {key} was already used for {recorded}")]
    IdempotencyKeyReused { key: String, recorded: ActionKind },

    /// Prices must be strictly positive.
    #[error("Invalid price: {cents} cents (must be greater than 0)")]
    InvalidPrice { cents: i64 },

    /// A stored price could not be read as an amount.
    #[error("Unparseable price: {value}")]
    UnparseablePrice { value: String },

    /// The agreement already bridges another legacy record.
    #[error("Agreement already linked to legacy record {existing}, cannot link {requested}")]
    LegacyLinkConflict {
        existing: LegacyRecordId,
        requested: LegacyRecordId,
    },
}
