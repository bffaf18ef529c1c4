//! Task handlers keyed by task type.
//!
//! Every handler re-enters the lifecycle or projector entry points and is
//! idempotent, so a task that is retried after a partial success converges.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::{AgreementId, ConversationId};
use domain::{ConversationTaskPayload, LegacyTaskPayload, SnapshotTaskPayload, TaskType};
use lifecycle::{AgreementService, LegacyAdapter, LifecycleError};
use projections::OrderSnapshotProjector;
use serde::de::DeserializeOwned;
use serde_json::Value;
use store::Store;

use crate::error::{ReconciliationError, Result};

/// Executes one kind of task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: &Value) -> Result<()>;
}

/// Table of handlers by task type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handlers for every task type the engine schedules.
    pub fn with_defaults<S: Store + Clone>(service: AgreementService<S>) -> Self {
        let mut registry = Self::new();
        registry.register(
            TaskType::CreateAgreementFromLegacy,
            LegacyHandler {
                adapter: LegacyAdapter::new(service.clone()),
            },
        );
        registry.register(
            TaskType::SyncOrderSnapshot,
            SnapshotHandler {
                projector: service.projector().clone(),
            },
        );
        registry.register(
            TaskType::CreateAgreementFromConversation,
            ConversationHandler { service },
        );
        registry
    }

    /// Registers a handler, replacing any previous one for the type.
    pub fn register(&mut self, task_type: TaskType, handler: impl TaskHandler + 'static) {
        self.handlers.insert(task_type, Arc::new(handler));
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }
}

fn decode<T: DeserializeOwned>(task_type: TaskType, payload: &Value) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|source| ReconciliationError::InvalidPayload { task_type, source })
}

struct LegacyHandler<S: Store> {
    adapter: LegacyAdapter<S>,
}

#[async_trait]
impl<S: Store + Clone> TaskHandler for LegacyHandler<S> {
    async fn handle(&self, payload: &Value) -> Result<()> {
        let LegacyTaskPayload { legacy_record_id } =
            decode(TaskType::CreateAgreementFromLegacy, payload)?;
        self.adapter.ensure(legacy_record_id).await?;
        Ok(())
    }
}

struct ConversationHandler<S: Store> {
    service: AgreementService<S>,
}

impl<S: Store + Clone> ConversationHandler<S> {
    /// Points the conversation at an agreement created through another path.
    async fn link(&self, conversation_id: ConversationId, agreement_id: AgreementId) -> Result<()> {
        let store = self.service.store();
        let mut tx = store.begin().await?;
        let Some(mut conversation) = store.get_conversation(&mut tx, conversation_id).await? else {
            store.abort(tx).await?;
            return Err(LifecycleError::ConversationNotFound(conversation_id).into());
        };
        if conversation.agreement_id.is_none() {
            conversation.link_agreement(agreement_id, Utc::now());
            store.upsert_conversation(&mut tx, &conversation).await?;
        }
        store.commit(tx).await?;
        tracing::info!(%conversation_id, %agreement_id, "conversation linked to existing agreement");
        Ok(())
    }
}

#[async_trait]
impl<S: Store + Clone> TaskHandler for ConversationHandler<S> {
    async fn handle(&self, payload: &Value) -> Result<()> {
        let ConversationTaskPayload { conversation_id } =
            decode(TaskType::CreateAgreementFromConversation, payload)?;
        match self.service.create_from_conversation(conversation_id).await {
            Ok(_) => Ok(()),
            Err(LifecycleError::ActiveAgreementExists { agreement_id, .. }) => {
                self.link(conversation_id, agreement_id).await
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct SnapshotHandler<S: Store> {
    projector: OrderSnapshotProjector<S>,
}

#[async_trait]
impl<S: Store + Clone> TaskHandler for SnapshotHandler<S> {
    async fn handle(&self, payload: &Value) -> Result<()> {
        let SnapshotTaskPayload { agreement_id } = decode(TaskType::SyncOrderSnapshot, payload)?;
        self.projector.sync_by_id(agreement_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifecycle::InMemoryNotifier;
    use serde_json::json;
    use store::InMemoryStore;

    fn registry() -> HandlerRegistry {
        let service = AgreementService::new(InMemoryStore::new(), Arc::new(InMemoryNotifier::new()));
        HandlerRegistry::with_defaults(service)
    }

    #[test]
    fn test_defaults_cover_every_task_type() {
        let registry = registry();
        for task_type in [
            TaskType::CreateAgreementFromLegacy,
            TaskType::CreateAgreementFromConversation,
            TaskType::SyncOrderSnapshot,
        ] {
            assert!(registry.get(task_type).is_some(), "missing {task_type}");
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_is_rejected() {
        let handler = registry().get(TaskType::SyncOrderSnapshot).unwrap();
        let result = handler.handle(&json!({"agreement": 1})).await;
        assert!(matches!(
            result,
            Err(ReconciliationError::InvalidPayload {
                task_type: TaskType::SyncOrderSnapshot,
                ..
            })
        ));
    }
}
