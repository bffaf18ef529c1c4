//! Lifecycle error types.

use common::{AgreementId, ConversationId, LegacyRecordId, UserId, Version};
use domain::AgreementError;
use projections::ProjectionError;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur in lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The state machine rejected the action.
    #[error(transparent)]
    Agreement(#[from] AgreementError),

    /// The agreement changed since the caller read it.
    #[error("Version conflict on agreement {agreement_id}: expected {expected}, actual {actual}")]
    VersionConflict {
        agreement_id: AgreementId,
        expected: Version,
        actual: Version,
    },

    /// The conversation already has a non-terminal agreement.
    #[error("Conversation {conversation_id} already has active agreement {agreement_id}")]
    ActiveAgreementExists {
        conversation_id: ConversationId,
        agreement_id: AgreementId,
    },

    #[error("Agreement not found: {0}")]
    AgreementNotFound(AgreementId),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// The conversation has no accepted proposal to create an agreement from.
    #[error("Conversation {0} has no accepted proposal")]
    ConversationNotAccepted(ConversationId),

    #[error("Legacy record not found: {0}")]
    LegacyRecordNotFound(LegacyRecordId),

    /// The caller is neither the client nor the booster.
    #[error("User {user_id} is not a party to agreement {agreement_id}")]
    NotAParty {
        agreement_id: AgreementId,
        user_id: UserId,
    },

    #[error("Wallet not found for user {0}")]
    WalletNotFound(UserId),

    #[error("Insufficient funds for user {user_id}")]
    InsufficientFunds { user_id: UserId },

    /// A multi-record transaction was rolled back.
    #[error("Transaction aborted for conversation {conversation_id}: {cause}")]
    TransactionAborted {
        conversation_id: ConversationId,
        #[source]
        cause: Box<LifecycleError>,
    },

    #[error("Projection error: {0}")]
    Projection(#[from] ProjectionError),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionConflict {
                entity: "agreement",
                id,
                expected,
                actual,
            } => match AgreementId::parse(&id) {
                Some(agreement_id) => LifecycleError::VersionConflict {
                    agreement_id,
                    expected,
                    actual,
                },
                None => LifecycleError::Store(StoreError::VersionConflict {
                    entity: "agreement",
                    id,
                    expected,
                    actual,
                }),
            },
            other => LifecycleError::Store(other),
        }
    }
}

impl LifecycleError {
    /// Returns the innermost error of an aborted transaction.
    pub fn root_cause(&self) -> &LifecycleError {
        match self {
            LifecycleError::TransactionAborted { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_version_conflict_becomes_typed() {
        let id = AgreementId::new();
        let error: LifecycleError = StoreError::VersionConflict {
            entity: "agreement",
            id: id.to_string(),
            expected: Version::new(1),
            actual: Version::new(2),
        }
        .into();
        assert!(matches!(
            error,
            LifecycleError::VersionConflict { agreement_id, .. } if agreement_id == id
        ));
    }

    #[test]
    fn test_root_cause_unwraps_aborts() {
        let conversation_id = ConversationId::new();
        let error = LifecycleError::TransactionAborted {
            conversation_id,
            cause: Box::new(LifecycleError::ConversationNotFound(conversation_id)),
        };
        assert!(matches!(
            error.root_cause(),
            LifecycleError::ConversationNotFound(_)
        ));
    }
}
