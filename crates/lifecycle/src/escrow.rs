//! Escrow hold and the atomic conversation cancellation with refund.

use chrono::{DateTime, Utc};
use common::{AgreementId, ConversationId, UserId};
use domain::{
    Agreement, AgreementStatus, Conversation, ConversationStatus, LedgerEntry, LedgerReason,
    LegacyRecord, Money, Transition, Wallet, escrow_refund_operation_id,
};
use projections::{ProjectionError, Role};
use serde::Serialize;
use store::Store;

use crate::error::{LifecycleError, Result};
use crate::notifier::ParticipantEvent;
use crate::service::AgreementService;

/// Outcome of a conversation cancellation.
#[derive(Debug, Clone, Serialize)]
pub struct EscrowCancellation {
    pub conversation_id: ConversationId,
    pub agreement_id: Option<AgreementId>,
    /// `Replayed` when the agreement was already cancelled by an earlier run.
    #[serde(skip)]
    pub transition: Option<Transition>,
    pub refund: Option<LedgerEntry>,
    pub legacy_records_cancelled: usize,
}

/// Idempotency key of the agreement cancellation performed by this flow.
pub fn escrow_cancel_key(conversation_id: ConversationId) -> String {
    format!("escrow_cancel_{conversation_id}")
}

/// Runs escrow movements against the ledger and wallets.
#[derive(Clone)]
pub struct EscrowService<S: Store> {
    service: AgreementService<S>,
}

impl<S: Store + Clone> EscrowService<S> {
    pub fn new(service: AgreementService<S>) -> Self {
        Self { service }
    }

    fn store(&self) -> &S {
        self.service.store()
    }

    /// Debits the client's wallet into escrow for an agreement.
    ///
    /// Idempotent by `operation_id`: a repeated call returns the recorded entry.
    #[tracing::instrument(skip(self))]
    pub async fn hold(
        &self,
        agreement_id: AgreementId,
        amount: Money,
        operation_id: &str,
    ) -> Result<LedgerEntry> {
        let now = Utc::now();
        let mut tx = self.store().begin().await?;
        match self.hold_in(&mut tx, agreement_id, amount, operation_id, now).await {
            Ok(entry) => {
                self.store().commit(tx).await?;
                Ok(entry)
            }
            Err(e) => {
                self.store().abort(tx).await?;
                Err(e)
            }
        }
    }

    async fn hold_in(
        &self,
        tx: &mut S::Tx,
        agreement_id: AgreementId,
        amount: Money,
        operation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        if let Some(entry) = self
            .store()
            .find_ledger_entry_by_operation(tx, operation_id)
            .await?
        {
            return Ok(entry);
        }

        let mut agreement = self
            .store()
            .get_agreement(tx, agreement_id)
            .await?
            .ok_or(LifecycleError::AgreementNotFound(agreement_id))?;
        let client = agreement.parties().client.user_id.ok_or(
            ProjectionError::UnresolvableParticipant {
                agreement_id,
                role: Role::Client,
            },
        )?;

        let mut wallet = self
            .store()
            .get_wallet_for_update(tx, client)
            .await?
            .ok_or(LifecycleError::WalletNotFound(client))?;
        let before = wallet
            .debit(amount, now)
            .ok_or(LifecycleError::InsufficientFunds { user_id: client })?;

        let entry = LedgerEntry::debit(
            client,
            LedgerReason::EscrowHold,
            amount,
            operation_id,
            before,
            now,
        )
        .with_agreement(agreement_id)
        .with_conversation(agreement.conversation_id());
        self.store().insert_ledger_entry(tx, &entry).await?;
        self.store().upsert_wallet(tx, &wallet).await?;

        agreement.record_escrow_hold(amount, now);
        self.service.persist(tx, &mut agreement).await?;
        self.service
            .projector()
            .sync_existing_in(tx, &agreement)
            .await?;

        metrics::counter!("escrow_holds_total").increment(1);
        Ok(entry)
    }

    /// Cancels a conversation and everything hanging off it in one transaction.
    ///
    /// The conversation is finalized, its latest agreement cancelled, an
    /// unrefunded escrow hold credited back to the client, legacy records
    /// cancelled and the order snapshot synced. Any failure rolls back every
    /// write and is returned as `TransactionAborted`. Participants are
    /// notified only after commit.
    #[tracing::instrument(skip(self, reason))]
    pub async fn cancel_conversation(
        &self,
        conversation_id: ConversationId,
        performed_by: &str,
        reason: &str,
    ) -> Result<EscrowCancellation> {
        let now = Utc::now();
        let mut tx = self.store().begin().await?;
        let (cancellation, conversation, agreement) = match self
            .cancel_in(&mut tx, conversation_id, performed_by, reason, now)
            .await
        {
            Ok(result) => {
                self.store().commit(tx).await?;
                result
            }
            Err(cause) => {
                self.store().abort(tx).await?;
                metrics::counter!("escrow_cancellations_aborted_total").increment(1);
                tracing::warn!(%conversation_id, error = %cause, "conversation cancellation aborted");
                return Err(LifecycleError::TransactionAborted {
                    conversation_id,
                    cause: Box::new(cause),
                });
            }
        };

        if let Some(refund) = &cancellation.refund {
            metrics::counter!("escrow_refunds_total").increment(1);
            tracing::info!(
                %conversation_id,
                amount = %refund.amount,
                balance_after = %refund.balance_after,
                "escrow refunded"
            );
        }
        if let Some(agreement) = &agreement {
            if cancellation.transition == Some(Transition::Applied) {
                self.service
                    .post_message(agreement, domain::ActionKind::Cancelled)
                    .await;
            }
        }
        self.notify(&conversation, &cancellation, reason).await;

        Ok(cancellation)
    }

    async fn cancel_in(
        &self,
        tx: &mut S::Tx,
        conversation_id: ConversationId,
        performed_by: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(EscrowCancellation, Conversation, Option<Agreement>)> {
        let mut conversation = self
            .store()
            .get_conversation(tx, conversation_id)
            .await?
            .ok_or(LifecycleError::ConversationNotFound(conversation_id))?;
        if conversation.status != ConversationStatus::Cancelled {
            conversation.cancel(reason, now);
            self.store().upsert_conversation(tx, &conversation).await?;
        }

        let latest = self
            .store()
            .list_agreements_for_conversation(tx, conversation_id)
            .await?
            .pop();
        let records = self
            .store()
            .list_legacy_records_for_conversation(tx, conversation_id)
            .await?;

        let mut transition = None;
        let mut refund = None;
        let agreement = match latest {
            Some(mut agreement) => {
                let key = escrow_cancel_key(conversation_id);
                let applied = if agreement.status() == AgreementStatus::Cancelled {
                    Transition::Replayed
                } else {
                    agreement.cancel(performed_by, reason, Some(&key), now)?
                };
                transition = Some(applied);

                refund = self.refund_hold(tx, &mut agreement, now).await?;
                let linked = self
                    .link_unmigrated_record(tx, &mut agreement, &records, now)
                    .await?;
                if applied.is_applied() || refund.is_some() || linked {
                    self.service.persist(tx, &mut agreement).await?;
                }
                self.service
                    .projector()
                    .sync_existing_in(tx, &agreement)
                    .await?;
                Some(agreement)
            }
            None => None,
        };

        self.finish(tx, conversation, agreement, transition, refund, records, reason, now)
            .await
    }

    /// Links the first legacy record of the conversation that no agreement
    /// bridges yet, so later sweeps see it as migrated.
    async fn link_unmigrated_record(
        &self,
        tx: &mut S::Tx,
        agreement: &mut Agreement,
        records: &[LegacyRecord],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if agreement.legacy_record_id().is_some() {
            return Ok(false);
        }
        for record in records {
            if self
                .store()
                .find_agreement_by_legacy_record(tx, record.id)
                .await?
                .is_none()
            {
                return Ok(agreement.link_legacy_record(record.id, now)?.is_applied());
            }
        }
        Ok(false)
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        tx: &mut S::Tx,
        conversation: Conversation,
        agreement: Option<Agreement>,
        transition: Option<Transition>,
        refund: Option<LedgerEntry>,
        records: Vec<LegacyRecord>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(EscrowCancellation, Conversation, Option<Agreement>)> {
        let mut legacy_records_cancelled = 0;
        for mut record in records {
            if record.mapped_status() == AgreementStatus::Cancelled {
                continue;
            }
            record.mark_cancelled(reason, now);
            self.store().upsert_legacy_record(tx, &record).await?;
            legacy_records_cancelled += 1;
        }

        let cancellation = EscrowCancellation {
            conversation_id: conversation.id,
            agreement_id: agreement.as_ref().map(Agreement::id),
            transition,
            refund,
            legacy_records_cancelled,
        };
        Ok((cancellation, conversation, agreement))
    }

    /// Credits an unrefunded escrow hold back to the wallet it came from.
    async fn refund_hold(
        &self,
        tx: &mut S::Tx,
        agreement: &mut Agreement,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>> {
        let Some(mut hold) = self
            .store()
            .find_unrefunded_escrow_hold(tx, agreement.id())
            .await?
        else {
            return Ok(None);
        };
        if !hold.amount.is_positive() {
            return Ok(None);
        }

        let mut wallet = self
            .store()
            .get_wallet_for_update(tx, hold.user_id)
            .await?
            .unwrap_or_else(|| Wallet::new(hold.user_id, Money::zero(), now));
        let before = wallet.credit(hold.amount, now);

        let refund = LedgerEntry::credit(
            hold.user_id,
            LedgerReason::EscrowRefund,
            hold.amount,
            escrow_refund_operation_id(agreement.id()),
            before,
            now,
        )
        .with_agreement(agreement.id())
        .with_conversation(agreement.conversation_id());
        self.store().insert_ledger_entry(tx, &refund).await?;
        self.store().upsert_wallet(tx, &wallet).await?;

        hold.mark_refunded(refund.id, now);
        self.store().update_ledger_entry(tx, &hold).await?;
        agreement.record_refund(hold.amount, now);

        Ok(Some(refund))
    }

    async fn notify(
        &self,
        conversation: &Conversation,
        cancellation: &EscrowCancellation,
        reason: &str,
    ) {
        let recipients: Vec<UserId> = [&conversation.client_id, &conversation.booster_id]
            .into_iter()
            .filter_map(|id| id.as_deref().and_then(UserId::parse))
            .collect();
        let event = ParticipantEvent {
            conversation_id: conversation.id,
            event: "conversation_cancelled".into(),
            payload: serde_json::json!({
                "agreement_id": cancellation.agreement_id,
                "reason": reason,
                "refunded": cancellation.refund.as_ref().map(|r| r.amount.cents()),
            }),
        };
        if let Err(e) = self
            .service
            .notifier()
            .notify_participants(&recipients, event)
            .await
        {
            tracing::warn!(conversation_id = %conversation.id, error = %e, "participants not notified");
        }
    }
}
