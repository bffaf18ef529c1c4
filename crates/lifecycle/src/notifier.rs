//! Outbound notifications to the chat surface.
//!
//! Message formatting and delivery transports live outside this crate; the
//! services only hand over a structured message or event.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::{AgreementId, ConversationId, UserId};
use serde::Serialize;

use crate::error::{LifecycleError, Result};

/// A system message persisted into a conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemMessage {
    pub conversation_id: ConversationId,
    pub agreement_id: Option<AgreementId>,
    /// Action that produced the message, e.g. `completed`.
    pub action: String,
    pub text: String,
}

/// An event pushed to the conversation's participants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantEvent {
    pub conversation_id: ConversationId,
    pub event: String,
    pub payload: serde_json::Value,
}

/// Trait for notification delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Persists a system message in the conversation.
    async fn post_system_message(&self, message: SystemMessage) -> Result<()>;

    /// Pushes an event to the given users.
    async fn notify_participants(&self, recipients: &[UserId], event: ParticipantEvent)
    -> Result<()>;
}

/// Notifier that only writes structured log lines.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn post_system_message(&self, message: SystemMessage) -> Result<()> {
        tracing::info!(
            conversation_id = %message.conversation_id,
            action = %message.action,
            text = %message.text,
            "system message"
        );
        Ok(())
    }

    async fn notify_participants(
        &self,
        recipients: &[UserId],
        event: ParticipantEvent,
    ) -> Result<()> {
        tracing::info!(
            conversation_id = %event.conversation_id,
            event = %event.event,
            recipients = recipients.len(),
            "participants notified"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RecordedNotifications {
    messages: Vec<SystemMessage>,
    events: Vec<(Vec<UserId>, ParticipantEvent)>,
    fail: bool,
}

/// In-memory notifier for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotifier {
    state: Arc<RwLock<RecordedNotifications>>,
}

impl InMemoryNotifier {
    /// Creates a new in-memory notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures every delivery to fail.
    pub fn set_fail(&self, fail: bool) {
        if let Ok(mut state) = self.state.write() {
            state.fail = fail;
        }
    }

    /// Returns the system messages posted so far.
    pub fn messages(&self) -> Vec<SystemMessage> {
        self.state
            .read()
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// Returns the participant events pushed so far.
    pub fn events(&self) -> Vec<(Vec<UserId>, ParticipantEvent)> {
        self.state
            .read()
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    fn record(&self, apply: impl FnOnce(&mut RecordedNotifications)) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| LifecycleError::Notification("notifier state poisoned".into()))?;
        if state.fail {
            return Err(LifecycleError::Notification("delivery failed".into()));
        }
        apply(&mut state);
        Ok(())
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn post_system_message(&self, message: SystemMessage) -> Result<()> {
        self.record(|state| state.messages.push(message))
    }

    async fn notify_participants(
        &self,
        recipients: &[UserId],
        event: ParticipantEvent,
    ) -> Result<()> {
        let recipients = recipients.to_vec();
        self.record(|state| state.events.push((recipients, event)))
    }
}
