//! Agreement service: the persisted state machine.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::{AgreementId, ConversationId, ProposalId, UserId, Version};
use domain::{
    ActionKind, Agreement, AgreementError, DEFAULT_MAX_ATTEMPTS, Money, NewAgreement, Parties,
    ProposalSnapshot, RetryTask, SnapshotTaskPayload, TaskType, Transition,
};
use projections::OrderSnapshotProjector;
use serde_json::{Map, Value};
use store::{Store, StoreError};

use crate::error::{LifecycleError, Result};
use crate::notifier::{Notifier, SystemMessage};

/// Input for creating an agreement.
#[derive(Debug, Clone)]
pub struct CreateAgreement {
    pub conversation_id: ConversationId,
    pub proposal_id: Option<ProposalId>,
    pub proposal: ProposalSnapshot,
    pub parties: Parties,
    pub created_by: String,
    /// Idempotency key of the create request.
    pub idempotency_key: Option<String>,
}

/// Caller metadata for a transition.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub performed_by: String,
    pub idempotency_key: Option<String>,
    /// Version the caller last read; checked before writing.
    pub expected_version: Option<Version>,
}

impl ActionContext {
    pub fn new(performed_by: impl Into<String>) -> Self {
        Self {
            performed_by: performed_by.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_expected_version(mut self, version: Version) -> Self {
        self.expected_version = Some(version);
        self
    }

    fn key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }
}

/// Result of a transition request.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub agreement: Agreement,
    pub transition: Transition,
}

/// Result of a create request.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub agreement: Agreement,
    /// False when an agreement with the same creation key was returned.
    pub created: bool,
}

/// Service for agreement lifecycle operations.
///
/// Every mutating call runs in one store transaction: load, apply the
/// transition, write with the next version. After commit the order snapshot is
/// synced; a failed sync is handed to the retry queue instead of failing the
/// request.
#[derive(Clone)]
pub struct AgreementService<S: Store> {
    store: S,
    projector: OrderSnapshotProjector<S>,
    notifier: Arc<dyn Notifier>,
    max_attempts: u32,
}

impl<S: Store + Clone> AgreementService<S> {
    /// Creates a new agreement service.
    pub fn new(store: S, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            projector: OrderSnapshotProjector::new(store.clone()),
            store,
            notifier,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Sets the attempt budget of snapshot repair tasks enqueued by this service.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn projector(&self) -> &OrderSnapshotProjector<S> {
        &self.projector
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Creates an agreement, idempotent by the request's idempotency key.
    #[tracing::instrument(skip(self, request), fields(conversation_id = %request.conversation_id))]
    pub async fn create(&self, request: CreateAgreement) -> Result<CreateOutcome> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let result = self.create_in(&mut tx, request.clone(), now).await;

        let outcome = match result {
            Ok(outcome) => {
                self.store.commit(tx).await?;
                outcome
            }
            Err(LifecycleError::Store(e)) if e.is_duplicate() && request.idempotency_key.is_some() => {
                // A concurrent request with the same key won the insert.
                self.store.abort(tx).await?;
                let key = request.idempotency_key.as_deref().unwrap_or_default();
                let mut tx = self.store.begin().await?;
                let winner = self.store.find_agreement_by_creation_key(&mut tx, key).await?;
                self.store.abort(tx).await?;
                let agreement = winner.ok_or(LifecycleError::Store(e))?;
                return Ok(CreateOutcome {
                    agreement,
                    created: false,
                });
            }
            Err(LifecycleError::Store(StoreError::OpenAgreementExists(conversation_id))) => {
                self.store.abort(tx).await?;
                return Err(self.open_agreement_conflict(conversation_id).await?);
            }
            Err(e) => {
                self.store.abort(tx).await?;
                return Err(e);
            }
        };

        if outcome.created {
            metrics::counter!("agreements_created_total").increment(1);
            tracing::info!(agreement_id = %outcome.agreement.id(), "agreement created");
            self.project_or_enqueue(&outcome.agreement).await;
            self.post_message(&outcome.agreement, ActionKind::Created).await;
        }
        Ok(outcome)
    }

    /// Creates an agreement inside the caller's transaction.
    pub(crate) async fn create_in(
        &self,
        tx: &mut S::Tx,
        request: CreateAgreement,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome> {
        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) = self.store.find_agreement_by_creation_key(tx, key).await? {
                tracing::debug!(agreement_id = %existing.id(), "create replayed");
                return Ok(CreateOutcome {
                    agreement: existing,
                    created: false,
                });
            }
        }

        self.ensure_no_active_agreement(tx, request.conversation_id)
            .await?;

        let mut agreement = Agreement::create(
            NewAgreement {
                conversation_id: request.conversation_id,
                proposal_id: request.proposal_id,
                proposal: request.proposal,
                parties: request.parties,
                created_by: request.created_by,
                creation_key: request.idempotency_key,
            },
            now,
        )?;
        agreement.set_version(Version::first());
        self.store.insert_agreement(tx, &agreement).await?;

        if let Some(mut conversation) = self
            .store
            .get_conversation(tx, request.conversation_id)
            .await?
        {
            conversation.link_agreement(agreement.id(), now);
            self.store.upsert_conversation(tx, &conversation).await?;
        }

        Ok(CreateOutcome {
            agreement,
            created: true,
        })
    }

    /// Fails if the conversation already has a non-terminal agreement.
    pub(crate) async fn ensure_no_active_agreement(
        &self,
        tx: &mut S::Tx,
        conversation_id: ConversationId,
    ) -> Result<()> {
        let existing = self
            .store
            .list_agreements_for_conversation(tx, conversation_id)
            .await?;
        match existing.iter().find(|a| !a.is_terminal()) {
            Some(active) => Err(LifecycleError::ActiveAgreementExists {
                conversation_id,
                agreement_id: active.id(),
            }),
            None => Ok(()),
        }
    }

    /// Names the agreement that won a concurrent insert for the conversation.
    pub(crate) async fn open_agreement_conflict(
        &self,
        conversation_id: ConversationId,
    ) -> Result<LifecycleError> {
        let mut tx = self.store.begin().await?;
        let winner = self.ensure_no_active_agreement(&mut tx, conversation_id).await;
        self.store.abort(tx).await?;
        Ok(match winner {
            Err(conflict) => conflict,
            Ok(()) => LifecycleError::Store(StoreError::OpenAgreementExists(conversation_id)),
        })
    }

    /// Creates the agreement of an accepted conversation.
    ///
    /// Uses the deterministic key `conversation_<id>_created`, so repeated
    /// calls return the same agreement.
    #[tracing::instrument(skip(self))]
    pub async fn create_from_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<CreateOutcome> {
        let conversation = {
            let mut tx = self.store.begin().await?;
            let conversation = self.store.get_conversation(&mut tx, conversation_id).await?;
            self.store.abort(tx).await?;
            conversation.ok_or(LifecycleError::ConversationNotFound(conversation_id))?
        };
        let proposal = conversation
            .accepted_proposal
            .clone()
            .ok_or(LifecycleError::ConversationNotAccepted(conversation_id))?;

        self.create(CreateAgreement {
            conversation_id,
            proposal_id: conversation.proposal_id,
            proposal,
            parties: conversation.parties(),
            created_by: "system".into(),
            idempotency_key: Some(format!("conversation_{conversation_id}_created")),
        })
        .await
    }

    /// Returns an agreement to one of its parties.
    pub async fn get(&self, agreement_id: AgreementId, user_id: UserId) -> Result<Agreement> {
        let agreement = self.load(agreement_id).await?;
        if !agreement.is_party(user_id) {
            return Err(LifecycleError::NotAParty {
                agreement_id,
                user_id,
            });
        }
        Ok(agreement)
    }

    /// Loads an agreement without a party check.
    pub async fn load(&self, agreement_id: AgreementId) -> Result<Agreement> {
        let mut tx = self.store.begin().await?;
        let agreement = self.store.get_agreement(&mut tx, agreement_id).await?;
        self.store.abort(tx).await?;
        agreement.ok_or(LifecycleError::AgreementNotFound(agreement_id))
    }

    #[tracing::instrument(skip(self, ctx), fields(performed_by = %ctx.performed_by))]
    pub async fn activate(
        &self,
        agreement_id: AgreementId,
        ctx: ActionContext,
    ) -> Result<TransitionOutcome> {
        self.execute(agreement_id, &ctx, ActionKind::Activated, |agreement, now| {
            agreement.activate(&ctx.performed_by, ctx.key(), now)
        })
        .await
    }

    #[tracing::instrument(skip(self, ctx, details), fields(performed_by = %ctx.performed_by))]
    pub async fn complete(
        &self,
        agreement_id: AgreementId,
        details: Map<String, Value>,
        ctx: ActionContext,
    ) -> Result<TransitionOutcome> {
        self.execute(agreement_id, &ctx, ActionKind::Completed, |agreement, now| {
            agreement.complete(&ctx.performed_by, details, ctx.key(), now)
        })
        .await
    }

    #[tracing::instrument(skip(self, ctx), fields(performed_by = %ctx.performed_by))]
    pub async fn cancel(
        &self,
        agreement_id: AgreementId,
        reason: &str,
        ctx: ActionContext,
    ) -> Result<TransitionOutcome> {
        self.execute(agreement_id, &ctx, ActionKind::Cancelled, |agreement, now| {
            agreement.cancel(&ctx.performed_by, reason, ctx.key(), now)
        })
        .await
    }

    #[tracing::instrument(skip(self, ctx), fields(performed_by = %ctx.performed_by))]
    pub async fn expire(
        &self,
        agreement_id: AgreementId,
        ctx: ActionContext,
    ) -> Result<TransitionOutcome> {
        self.execute(agreement_id, &ctx, ActionKind::Expired, |agreement, now| {
            agreement.expire(&ctx.performed_by, ctx.key(), now)
        })
        .await
    }

    #[tracing::instrument(skip(self, ctx, reason), fields(performed_by = %ctx.performed_by))]
    pub async fn renegotiate(
        &self,
        agreement_id: AgreementId,
        new_price: Money,
        new_time: &str,
        reason: Option<&str>,
        ctx: ActionContext,
    ) -> Result<TransitionOutcome> {
        self.execute(
            agreement_id,
            &ctx,
            ActionKind::Renegotiated,
            |agreement, now| {
                agreement.renegotiate(&ctx.performed_by, new_price, new_time, reason, ctx.key(), now)
            },
        )
        .await
    }

    /// Places an agreement under administrative dispute.
    #[tracing::instrument(skip(self, ctx), fields(performed_by = %ctx.performed_by))]
    pub async fn dispute(
        &self,
        agreement_id: AgreementId,
        reason: &str,
        ctx: ActionContext,
    ) -> Result<TransitionOutcome> {
        self.execute(agreement_id, &ctx, ActionKind::Disputed, |agreement, now| {
            agreement.dispute(&ctx.performed_by, reason, ctx.key(), now)
        })
        .await
    }

    /// Runs one transition in its own transaction, then projects and notifies.
    async fn execute<F>(
        &self,
        agreement_id: AgreementId,
        ctx: &ActionContext,
        action: ActionKind,
        apply: F,
    ) -> Result<TransitionOutcome>
    where
        F: FnOnce(&mut Agreement, DateTime<Utc>) -> std::result::Result<Transition, AgreementError>
            + Send,
    {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let outcome = match self
            .apply_in(&mut tx, agreement_id, ctx.expected_version, apply, now)
            .await
        {
            Ok(outcome) => {
                self.store.commit(tx).await?;
                outcome
            }
            Err(e) => {
                self.store.abort(tx).await?;
                if matches!(e, LifecycleError::VersionConflict { .. }) {
                    metrics::counter!("agreement_version_conflicts_total").increment(1);
                }
                return Err(e);
            }
        };

        if outcome.transition.is_applied() {
            metrics::counter!("agreement_transitions_total", "action" => action.as_str())
                .increment(1);
            tracing::info!(
                %agreement_id,
                action = %action,
                version = %outcome.agreement.version(),
                "agreement transitioned"
            );
            self.project_or_enqueue(&outcome.agreement).await;
            self.post_message(&outcome.agreement, action).await;
        } else {
            metrics::counter!("agreement_replays_total", "action" => action.as_str()).increment(1);
            tracing::debug!(%agreement_id, action = %action, "transition replayed");
        }
        Ok(outcome)
    }

    /// Loads, transitions and writes an agreement inside the caller's transaction.
    ///
    /// A replay leaves the stored agreement untouched and skips the version
    /// check, so a retried request succeeds even after its first attempt
    /// bumped the version.
    pub(crate) async fn apply_in<F>(
        &self,
        tx: &mut S::Tx,
        agreement_id: AgreementId,
        expected_version: Option<Version>,
        apply: F,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome>
    where
        F: FnOnce(&mut Agreement, DateTime<Utc>) -> std::result::Result<Transition, AgreementError>
            + Send,
    {
        let mut agreement = self
            .store
            .get_agreement(tx, agreement_id)
            .await?
            .ok_or(LifecycleError::AgreementNotFound(agreement_id))?;

        let transition = apply(&mut agreement, now)?;
        if transition == Transition::Replayed {
            return Ok(TransitionOutcome {
                agreement,
                transition,
            });
        }

        let current = agreement.version();
        if let Some(expected) = expected_version {
            if expected != current {
                return Err(LifecycleError::VersionConflict {
                    agreement_id,
                    expected,
                    actual: current,
                });
            }
        }
        self.persist(tx, &mut agreement).await?;

        Ok(TransitionOutcome {
            agreement,
            transition,
        })
    }

    /// Writes a loaded agreement back with the next version.
    pub(crate) async fn persist(&self, tx: &mut S::Tx, agreement: &mut Agreement) -> Result<()> {
        let expected = agreement.version();
        agreement.set_version(expected.next());
        if let Err(e) = self.store.update_agreement(tx, agreement, expected).await {
            agreement.set_version(expected);
            return Err(e.into());
        }
        Ok(())
    }

    /// Syncs the order snapshot, or schedules a repair when that fails.
    pub(crate) async fn project_or_enqueue(&self, agreement: &Agreement) {
        let error = match self.projector.sync_from_agreement(agreement).await {
            Ok(_) => return,
            Err(e) => e,
        };
        tracing::warn!(agreement_id = %agreement.id(), error = %error, "order snapshot sync failed, scheduling retry");
        metrics::counter!("order_snapshot_sync_deferred_total").increment(1);

        if let Err(e) = self.enqueue_snapshot_sync(agreement.id()).await {
            tracing::error!(agreement_id = %agreement.id(), error = %e, "failed to schedule order snapshot sync");
        }
    }

    async fn enqueue_snapshot_sync(&self, agreement_id: AgreementId) -> Result<()> {
        let payload = serde_json::to_value(SnapshotTaskPayload { agreement_id })
            .map_err(StoreError::from)?;
        let task = RetryTask::new(
            TaskType::SyncOrderSnapshot,
            payload,
            Duration::zero(),
            self.max_attempts,
            Utc::now(),
        );
        let mut tx = self.store.begin().await?;
        self.store.insert_task(&mut tx, &task).await?;
        self.store.commit(tx).await?;
        Ok(())
    }

    /// Posts the system message for an applied action. Failures are logged only.
    pub(crate) async fn post_message(&self, agreement: &Agreement, action: ActionKind) {
        let message = SystemMessage {
            conversation_id: agreement.conversation_id(),
            agreement_id: Some(agreement.id()),
            action: action.as_str().to_string(),
            text: message_text(agreement, action),
        };
        if let Err(e) = self.notifier.post_system_message(message).await {
            tracing::warn!(agreement_id = %agreement.id(), error = %e, "system message not posted");
        }
    }
}

fn message_text(agreement: &Agreement, action: ActionKind) -> String {
    let proposal = agreement.proposal();
    match action {
        ActionKind::Created => format!(
            "Agreement created: {} {} for {}",
            proposal.game, proposal.category, proposal.price
        ),
        ActionKind::Activated => "Work on the order has started".to_string(),
        ActionKind::Completed => "The order was marked as completed".to_string(),
        ActionKind::Cancelled => "The order was cancelled".to_string(),
        ActionKind::Expired => "The agreement expired".to_string(),
        ActionKind::Renegotiated => format!(
            "Terms renegotiated: {} in {}",
            proposal.price, proposal.estimated_time
        ),
        ActionKind::Disputed => "The order is under dispute".to_string(),
        ActionKind::Migrated => "The order was migrated".to_string(),
    }
}
