//! Durable repair tasks with exponential backoff.

use chrono::{DateTime, Duration, Utc};
use common::{AgreementId, ConversationId, LegacyRecordId, TaskId};
use serde::{Deserialize, Serialize};

/// Attempts allowed before a task is marked failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// How long a claimed task stays with its worker before it can be claimed again.
pub const CLAIM_LEASE_MINUTES: i64 = 15;

/// Kind of repair a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CreateAgreementFromLegacy,
    CreateAgreementFromConversation,
    SyncOrderSnapshot,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CreateAgreementFromLegacy => "create_agreement_from_legacy",
            TaskType::CreateAgreementFromConversation => "create_agreement_from_conversation",
            TaskType::SyncOrderSnapshot => "sync_order_snapshot",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create_agreement_from_legacy" => Some(TaskType::CreateAgreementFromLegacy),
            "create_agreement_from_conversation" => {
                Some(TaskType::CreateAgreementFromConversation)
            }
            "sync_order_snapshot" => Some(TaskType::SyncOrderSnapshot),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload of a `create_agreement_from_legacy` task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyTaskPayload {
    pub legacy_record_id: LegacyRecordId,
}

/// Payload of a `create_agreement_from_conversation` task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTaskPayload {
    pub conversation_id: ConversationId,
}

/// Payload of a `sync_order_snapshot` task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTaskPayload {
    pub agreement_id: AgreementId,
}

/// Processing status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    /// Attempts exhausted; only an operator reset re-arms it.
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// A scheduled repair operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryTask {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt: DateTime<Utc>,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Delay before the next attempt after `attempts` failures: `2^attempts` minutes.
pub fn backoff(attempts: u32) -> Duration {
    Duration::minutes(1_i64 << attempts.min(30))
}

impl RetryTask {
    /// Creates a pending task due after `delay`.
    pub fn new(
        task_type: TaskType,
        payload: serde_json::Value,
        delay: Duration,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            task_type,
            payload,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            next_attempt: now + delay,
            status: TaskStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the task's next attempt is due.
    ///
    /// A processing task is due again once its claim lease ran out, which
    /// happens when its worker died before writing the outcome back.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Processing)
            && self.next_attempt <= now
    }

    /// Marks the task claimed by a worker, counts the attempt and starts the lease.
    pub fn claim(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Processing;
        self.attempts += 1;
        self.next_attempt = now + Duration::minutes(CLAIM_LEASE_MINUTES);
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.error = None;
        self.updated_at = now;
    }

    /// Records a failed attempt and returns the resulting status.
    ///
    /// The task is rescheduled with exponential backoff until `max_attempts`
    /// is reached, then marked failed.
    pub fn record_failure(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> TaskStatus {
        self.error = Some(error.into());
        self.updated_at = now;
        if self.attempts < self.max_attempts {
            self.status = TaskStatus::Pending;
            self.next_attempt = now + backoff(self.attempts);
        } else {
            self.status = TaskStatus::Failed;
        }
        self.status
    }

    /// Re-arms a failed task for immediate processing.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.attempts = 0;
        self.error = None;
        self.next_attempt = now;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(max_attempts: u32) -> RetryTask {
        RetryTask::new(
            TaskType::SyncOrderSnapshot,
            json!({"agreement_id": "x"}),
            Duration::zero(),
            max_attempts,
            Utc::now(),
        )
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff(1), Duration::minutes(2));
        assert_eq!(backoff(2), Duration::minutes(4));
        assert_eq!(backoff(5), Duration::minutes(32));
    }

    #[test]
    fn test_failure_reschedules_until_exhausted() {
        let now = Utc::now();
        let mut task = task(2);

        task.claim(now);
        assert_eq!(task.record_failure("boom", now), TaskStatus::Pending);
        assert_eq!(task.next_attempt, now + Duration::minutes(2));
        assert!(!task.is_due(now));
        assert!(task.is_due(now + Duration::minutes(2)));

        task.claim(now);
        assert_eq!(task.record_failure("boom again", now), TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom again"));
        assert!(!task.is_due(now + Duration::days(365)));
    }

    #[test]
    fn test_abandoned_claim_is_due_after_lease() {
        let now = Utc::now();
        let mut task = task(3);
        task.claim(now);

        assert!(!task.is_due(now));
        assert!(task.is_due(now + Duration::minutes(CLAIM_LEASE_MINUTES)));
        task.claim(now + Duration::minutes(CLAIM_LEASE_MINUTES));
        assert_eq!(task.attempts, 2);
    }

    #[test]
    fn test_reset_rearms_failed_task() {
        let now = Utc::now();
        let mut task = task(1);
        task.claim(now);
        task.record_failure("boom", now);
        assert_eq!(task.status, TaskStatus::Failed);

        task.reset(now);
        assert_eq!(task.attempts, 0);
        assert!(task.is_due(now));
    }

    #[test]
    fn test_task_type_names() {
        for task_type in [
            TaskType::CreateAgreementFromLegacy,
            TaskType::CreateAgreementFromConversation,
            TaskType::SyncOrderSnapshot,
        ] {
            assert_eq!(TaskType::parse(task_type.as_str()), Some(task_type));
            let json = serde_json::to_value(task_type).unwrap();
            assert_eq!(json, task_type.as_str());
        }
    }
}
