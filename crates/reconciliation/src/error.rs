//! Reconciliation error types.

use common::TaskId;
use domain::{TaskStatus, TaskType};
use thiserror::Error;

/// Errors that can occur in the retry queue and sweeps.
#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] lifecycle::LifecycleError),

    #[error("Projection error: {0}")]
    Projection(#[from] projections::ProjectionError),

    /// A task payload does not match its task type.
    #[error("Invalid payload for {task_type}: {source}")]
    InvalidPayload {
        task_type: TaskType,
        #[source]
        source: serde_json::Error,
    },

    /// No handler is registered for the task type.
    #[error("No handler registered for {0}")]
    NoHandler(TaskType),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Only failed tasks can be reset.
    #[error("Task {task_id} is {status:?}, not failed")]
    TaskNotFailed { task_id: TaskId, status: TaskStatus },
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconciliationError>;
