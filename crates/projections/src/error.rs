//! Projection error types.

use common::AgreementId;
use thiserror::Error;

use crate::resolver::Role;

/// Errors that can occur while projecting order snapshots.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// An error occurred in the store.
    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    /// The agreement to project does not exist.
    #[error("Agreement not found: {0}")]
    AgreementNotFound(AgreementId),

    /// No source yielded a usable account id for a party.
    #[error("Cannot resolve {role} of agreement {agreement_id}")]
    UnresolvableParticipant {
        agreement_id: AgreementId,
        role: Role,
    },
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
