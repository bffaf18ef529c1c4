//! Durable retry queue.

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::TaskId;
use domain::{RetryTask, TaskStatus, TaskType};
use serde::Serialize;
use serde_json::Value;
use store::Store;

use crate::error::{ReconciliationError, Result};
use crate::handlers::HandlerRegistry;

/// Counts from one drain of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub claimed: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
    /// Outcomes that could not be written back; the claim lease re-arms those tasks.
    pub write_back_failures: usize,
}

/// Store-backed queue of repair tasks.
///
/// Claiming is a single atomic store operation, so any number of workers can
/// drain the same queue without running a task twice. A handler runs outside
/// any transaction; its outcome is written back in a second one.
#[derive(Clone)]
pub struct RetryQueue<S: Store> {
    store: S,
    handlers: Arc<HandlerRegistry>,
    max_attempts: u32,
}

impl<S: Store + Clone> RetryQueue<S> {
    pub fn new(store: S, handlers: HandlerRegistry) -> Self {
        Self {
            store,
            handlers: Arc::new(handlers),
            max_attempts: domain::DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Sets the attempt limit used when `enqueue` is given none.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Schedules a task due after `delay_seconds`.
    #[tracing::instrument(skip(self, payload))]
    pub async fn enqueue(
        &self,
        task_type: TaskType,
        payload: Value,
        delay_seconds: i64,
        max_attempts: Option<u32>,
    ) -> Result<RetryTask> {
        let task = RetryTask::new(
            task_type,
            payload,
            Duration::seconds(delay_seconds.max(0)),
            max_attempts.unwrap_or(self.max_attempts),
            Utc::now(),
        );
        let mut tx = self.store.begin().await?;
        self.store.insert_task(&mut tx, &task).await?;
        self.store.commit(tx).await?;

        metrics::counter!("retry_tasks_enqueued_total", "task_type" => task_type.as_str())
            .increment(1);
        tracing::debug!(task_id = %task.id, "task enqueued");
        Ok(task)
    }

    /// Schedules a task with a typed payload, due immediately.
    pub async fn enqueue_now<P: Serialize>(&self, task_type: TaskType, payload: &P) -> Result<RetryTask> {
        let payload = serde_json::to_value(payload)
            .map_err(|source| ReconciliationError::InvalidPayload { task_type, source })?;
        self.enqueue(task_type, payload, 0, None).await
    }

    /// Claims and runs up to `batch` due tasks, one at a time.
    #[tracing::instrument(skip(self))]
    pub async fn process_pending_tasks(&self, batch: usize) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        while report.claimed < batch {
            let claimed = {
                let mut tx = self.store.begin().await?;
                let task = self.store.claim_due_task(&mut tx, Utc::now()).await?;
                self.store.commit(tx).await?;
                task
            };
            let Some(mut task) = claimed else {
                break;
            };
            report.claimed += 1;

            let outcome = match self.handlers.get(task.task_type) {
                Some(handler) => handler.handle(&task.payload).await,
                None => Err(ReconciliationError::NoHandler(task.task_type)),
            };

            let now = Utc::now();
            let status = match outcome {
                Ok(()) => {
                    task.mark_completed(now);
                    TaskStatus::Completed
                }
                Err(e) => {
                    let status = task.record_failure(e.to_string(), now);
                    tracing::warn!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        attempts = task.attempts,
                        status = status.as_str(),
                        error = %e,
                        "task attempt failed"
                    );
                    status
                }
            };
            if let Err(e) = self.record_outcome(&task).await {
                report.write_back_failures += 1;
                metrics::counter!("retry_task_write_back_failures_total").increment(1);
                tracing::error!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    error = %e,
                    "task outcome not recorded"
                );
                continue;
            }
            match status {
                TaskStatus::Completed => report.completed += 1,
                TaskStatus::Failed => report.failed += 1,
                _ => report.rescheduled += 1,
            }

            metrics::counter!(
                "retry_tasks_processed_total",
                "task_type" => task.task_type.as_str(),
                "status" => status.as_str()
            )
            .increment(1);
        }

        if report.claimed > 0 {
            tracing::info!(
                claimed = report.claimed,
                completed = report.completed,
                rescheduled = report.rescheduled,
                failed = report.failed,
                write_back_failures = report.write_back_failures,
                "retry queue drained"
            );
        }
        Ok(report)
    }

    async fn record_outcome(&self, task: &RetryTask) -> Result<()> {
        let mut tx = self.store.begin().await?;
        if let Err(e) = self.store.update_task(&mut tx, task).await {
            self.store.abort(tx).await?;
            return Err(e.into());
        }
        self.store.commit(tx).await?;
        Ok(())
    }

    /// Re-arms a failed task for immediate processing.
    #[tracing::instrument(skip(self))]
    pub async fn reset_failed(&self, task_id: TaskId) -> Result<RetryTask> {
        let mut tx = self.store.begin().await?;
        let mut task = match self.store.get_task(&mut tx, task_id).await? {
            Some(task) if task.status == TaskStatus::Failed => task,
            Some(task) => {
                self.store.abort(tx).await?;
                return Err(ReconciliationError::TaskNotFailed {
                    task_id,
                    status: task.status,
                });
            }
            None => {
                self.store.abort(tx).await?;
                return Err(ReconciliationError::TaskNotFound(task_id));
            }
        };
        task.reset(Utc::now());
        self.store.update_task(&mut tx, &task).await?;
        self.store.commit(tx).await?;
        tracing::info!(%task_id, "failed task reset");
        Ok(task)
    }

    /// Returns a task by id.
    pub async fn get(&self, task_id: TaskId) -> Result<RetryTask> {
        let mut tx = self.store.begin().await?;
        let task = self.store.get_task(&mut tx, task_id).await?;
        self.store.abort(tx).await?;
        task.ok_or(ReconciliationError::TaskNotFound(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use store::InMemoryStore;

    use crate::handlers::TaskHandler;

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyHandler {
        calls: Arc<AtomicUsize>,
        failures: usize,
    }

    #[async_trait]
    impl TaskHandler for FlakyHandler {
        async fn handle(&self, _payload: &Value) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ReconciliationError::NoHandler(TaskType::SyncOrderSnapshot))
            } else {
                Ok(())
            }
        }
    }

    fn queue(failures: usize) -> (RetryQueue<InMemoryStore>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            TaskType::SyncOrderSnapshot,
            FlakyHandler {
                calls: calls.clone(),
                failures,
            },
        );
        (RetryQueue::new(InMemoryStore::new(), handlers), calls)
    }

    #[tokio::test]
    async fn test_success_completes_task() {
        let (queue, calls) = queue(0);
        let task = queue
            .enqueue(TaskType::SyncOrderSnapshot, json!({}), 0, None)
            .await
            .unwrap();

        let report = queue.process_pending_tasks(10).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stored = queue.get(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_failure_reschedules_with_backoff() {
        let (queue, _) = queue(usize::MAX);
        let before = Utc::now();
        let task = queue
            .enqueue(TaskType::SyncOrderSnapshot, json!({}), 0, None)
            .await
            .unwrap();

        let report = queue.process_pending_tasks(10).await.unwrap();
        assert_eq!(report.rescheduled, 1);

        let stored = queue.get(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert!(stored.error.is_some());
        assert!(stored.next_attempt >= before + Duration::minutes(2));

        // Not due yet, so a second drain does nothing.
        let report = queue.process_pending_tasks(10).await.unwrap();
        assert_eq!(report.claimed, 0);
    }

    #[tokio::test]
    async fn test_exhausted_task_fails_and_can_be_reset() {
        let (queue, calls) = queue(1);
        let task = queue
            .enqueue(TaskType::SyncOrderSnapshot, json!({}), 0, Some(1))
            .await
            .unwrap();

        let report = queue.process_pending_tasks(10).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(queue.get(task.id).await.unwrap().status, TaskStatus::Failed);

        // Failed tasks are never picked up again.
        assert_eq!(queue.process_pending_tasks(10).await.unwrap().claimed, 0);

        let reset = queue.reset_failed(task.id).await.unwrap();
        assert_eq!(reset.status, TaskStatus::Pending);
        assert_eq!(reset.attempts, 0);

        let report = queue.process_pending_tasks(10).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reset_requires_failed_status() {
        let (queue, _) = queue(0);
        let task = queue
            .enqueue(TaskType::SyncOrderSnapshot, json!({}), 60, None)
            .await
            .unwrap();

        let result = queue.reset_failed(task.id).await;
        assert!(matches!(
            result,
            Err(ReconciliationError::TaskNotFailed {
                status: TaskStatus::Pending,
                ..
            })
        ));
        assert!(matches!(
            queue.reset_failed(TaskId::new()).await,
            Err(ReconciliationError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unregistered_type_is_recorded_as_failure() {
        let queue = RetryQueue::new(InMemoryStore::new(), HandlerRegistry::new());
        let task = queue
            .enqueue(TaskType::CreateAgreementFromLegacy, json!({}), 0, Some(1))
            .await
            .unwrap();

        queue.process_pending_tasks(10).await.unwrap();
        let stored = queue.get(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error.unwrap().contains("No handler"));
    }

    #[tokio::test]
    async fn test_lost_write_back_does_not_stop_the_drain() {
        let store = InMemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            TaskType::SyncOrderSnapshot,
            FlakyHandler {
                calls: calls.clone(),
                failures: 0,
            },
        );
        let queue = RetryQueue::new(store.clone(), handlers);
        for _ in 0..2 {
            queue
                .enqueue(TaskType::SyncOrderSnapshot, json!({}), 0, None)
                .await
                .unwrap();
        }

        store.set_fail_on_task_update(true);
        let report = queue.process_pending_tasks(10).await.unwrap();
        store.set_fail_on_task_update(false);

        assert_eq!(report.claimed, 2);
        assert_eq!(report.write_back_failures, 2);
        assert_eq!(report.completed, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(
            store
                .tasks()
                .await
                .iter()
                .all(|t| t.status == TaskStatus::Processing)
        );

        // Leased until the claim expires, then claimable again.
        assert_eq!(queue.process_pending_tasks(10).await.unwrap().claimed, 0);
        let later = Utc::now() + Duration::minutes(domain::CLAIM_LEASE_MINUTES);
        let mut tx = store.begin().await.unwrap();
        let reclaimed = store.claim_due_task(&mut tx, later).await.unwrap().unwrap();
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn test_batch_limits_claims() {
        let (queue, _) = queue(0);
        for _ in 0..3 {
            queue
                .enqueue(TaskType::SyncOrderSnapshot, json!({}), 0, None)
                .await
                .unwrap();
        }
        assert_eq!(queue.process_pending_tasks(2).await.unwrap().claimed, 2);
        assert_eq!(queue.process_pending_tasks(2).await.unwrap().claimed, 1);
    }
}
