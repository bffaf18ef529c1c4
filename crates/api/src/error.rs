//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::AgreementError;
use lifecycle::LifecycleError;
use projections::ProjectionError;
use reconciliation::ReconciliationError;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad request from the client.
    #[error("{0}")]
    BadRequest(String),
    /// Lifecycle operation error.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// Retry queue or sweep error.
    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Lifecycle(err) => (lifecycle_status(&err), err.to_string()),
            ApiError::Reconciliation(err) => (reconciliation_status(&err), err.to_string()),
        };

        if status.is_server_error() {
            tracing::error!(%status, error = %message, "request failed");
        } else if status == StatusCode::UNPROCESSABLE_ENTITY {
            tracing::warn!(%status, error = %message, "request rejected");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn agreement_status(err: &AgreementError) -> StatusCode {
    match err {
        AgreementError::InvalidTransition { .. } | AgreementError::LegacyLinkConflict { .. } => {
            StatusCode::CONFLICT
        }
        AgreementError::IdempotencyKeyReused { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        AgreementError::InvalidPrice { .. } | AgreementError::UnparseablePrice { .. } => {
            StatusCode::BAD_REQUEST
        }
    }
}

fn lifecycle_status(err: &LifecycleError) -> StatusCode {
    match err {
        LifecycleError::Agreement(e) => agreement_status(e),
        LifecycleError::VersionConflict { .. }
        | LifecycleError::ActiveAgreementExists { .. }
        | LifecycleError::Store(store::StoreError::OpenAgreementExists(_)) => StatusCode::CONFLICT,
        LifecycleError::AgreementNotFound(_)
        | LifecycleError::ConversationNotFound(_)
        | LifecycleError::LegacyRecordNotFound(_)
        | LifecycleError::WalletNotFound(_) => StatusCode::NOT_FOUND,
        LifecycleError::NotAParty { .. } => StatusCode::FORBIDDEN,
        LifecycleError::ConversationNotAccepted(_) | LifecycleError::InsufficientFunds { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        LifecycleError::Projection(ProjectionError::UnresolvableParticipant { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        LifecycleError::Projection(ProjectionError::AgreementNotFound(_)) => StatusCode::NOT_FOUND,
        // A rollback caused by the caller's request is a conflict, anything else is ours.
        LifecycleError::TransactionAborted { cause, .. } => match lifecycle_status(cause) {
            StatusCode::NOT_FOUND => StatusCode::NOT_FOUND,
            status if status.is_client_error() => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        LifecycleError::Projection(_) | LifecycleError::Notification(_) | LifecycleError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn reconciliation_status(err: &ReconciliationError) -> StatusCode {
    match err {
        ReconciliationError::Lifecycle(e) => lifecycle_status(e),
        ReconciliationError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        ReconciliationError::TaskNotFailed { .. } => StatusCode::CONFLICT,
        ReconciliationError::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{AgreementId, ConversationId, UserId, Version};
    use domain::{ActionKind, AgreementStatus};

    #[test]
    fn test_transition_errors_map_to_conflict_and_unprocessable() {
        let invalid = LifecycleError::Agreement(AgreementError::InvalidTransition {
            current: AgreementStatus::Completed,
            action: ActionKind::Cancelled,
        });
        assert_eq!(lifecycle_status(&invalid), StatusCode::CONFLICT);

        let reused = LifecycleError::Agreement(AgreementError::IdempotencyKeyReused {
            key: "k1".into(),
            recorded: ActionKind::Completed,
        });
        assert_eq!(lifecycle_status(&reused), StatusCode::UNPROCESSABLE_ENTITY);

        let stale = LifecycleError::VersionConflict {
            agreement_id: AgreementId::new(),
            expected: Version::new(1),
            actual: Version::new(2),
        };
        assert_eq!(lifecycle_status(&stale), StatusCode::CONFLICT);

        let open = LifecycleError::Store(store::StoreError::OpenAgreementExists(
            ConversationId::new(),
        ));
        assert_eq!(lifecycle_status(&open), StatusCode::CONFLICT);
    }

    #[test]
    fn test_not_a_party_is_forbidden() {
        let err = LifecycleError::NotAParty {
            agreement_id: AgreementId::new(),
            user_id: UserId::new(),
        };
        assert_eq!(lifecycle_status(&err), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_aborted_transaction_follows_cause() {
        let conversation_id = ConversationId::new();
        let blocked = LifecycleError::TransactionAborted {
            conversation_id,
            cause: Box::new(LifecycleError::Agreement(AgreementError::InvalidTransition {
                current: AgreementStatus::Completed,
                action: ActionKind::Cancelled,
            })),
        };
        assert_eq!(lifecycle_status(&blocked), StatusCode::CONFLICT);

        let failed = LifecycleError::TransactionAborted {
            conversation_id,
            cause: Box::new(LifecycleError::Store(store::StoreError::Simulated("ledger"))),
        };
        assert_eq!(lifecycle_status(&failed), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
