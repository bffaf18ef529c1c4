//! Agreement aggregate implementation.

use chrono::{DateTime, Utc};
use common::{AgreementId, ConversationId, LegacyRecordId, ProposalId, UserId, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    ActionHistory, ActionHistoryEntry, ActionKind, AgreementError, AgreementStatus,
    FinancialSnapshot, KeyLookup, Parties, PaymentStatus, ProposalSnapshot, RenegotiationData,
};
use crate::Money;

/// Outcome of a transition call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The transition was applied and the agreement must be persisted.
    Applied,
    /// The idempotency key was already recorded for this action; nothing changed.
    Replayed,
}

impl Transition {
    /// Returns true if the agreement was mutated.
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}

/// Input for creating a new agreement from an accepted proposal.
#[derive(Debug, Clone)]
pub struct NewAgreement {
    pub conversation_id: ConversationId,
    pub proposal_id: Option<ProposalId>,
    pub proposal: ProposalSnapshot,
    pub parties: Parties,
    pub created_by: String,
    /// Idempotency key of the create request, if any.
    pub creation_key: Option<String>,
}

/// Agreement aggregate root.
///
/// The authoritative contract record for one negotiated engagement. Every
/// mutation goes through a transition method which appends exactly one
/// history entry; persisting the result increments [`Version`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agreement {
    pub(crate) id: AgreementId,
    #[serde(default)]
    pub(crate) version: Version,
    pub(crate) conversation_id: ConversationId,
    pub(crate) proposal_id: Option<ProposalId>,
    pub(crate) legacy_record_id: Option<LegacyRecordId>,
    pub(crate) creation_key: Option<String>,
    pub(crate) proposal: ProposalSnapshot,
    pub(crate) parties: Parties,
    pub(crate) status: AgreementStatus,
    pub(crate) financial: FinancialSnapshot,
    pub(crate) renegotiation: Option<RenegotiationData>,
    pub(crate) history: ActionHistory,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) activated_at: Option<DateTime<Utc>>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) cancelled_at: Option<DateTime<Utc>>,
    pub(crate) expired_at: Option<DateTime<Utc>>,
    pub(crate) disputed_at: Option<DateTime<Utc>>,
    pub(crate) updated_at: DateTime<Utc>,
}

// Query methods
impl Agreement {
    pub fn id(&self) -> AgreementId {
        self.id
    }

    /// Returns the last persisted version (0 if never persisted).
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn proposal_id(&self) -> Option<ProposalId> {
        self.proposal_id
    }

    pub fn legacy_record_id(&self) -> Option<LegacyRecordId> {
        self.legacy_record_id
    }

    pub fn creation_key(&self) -> Option<&str> {
        self.creation_key.as_deref()
    }

    pub fn proposal(&self) -> &ProposalSnapshot {
        &self.proposal
    }

    pub fn parties(&self) -> &Parties {
        &self.parties
    }

    pub fn status(&self) -> AgreementStatus {
        self.status
    }

    pub fn financial(&self) -> &FinancialSnapshot {
        &self.financial
    }

    pub fn renegotiation(&self) -> Option<&RenegotiationData> {
        self.renegotiation.as_ref()
    }

    pub fn history(&self) -> &ActionHistory {
        &self.history
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn activated_at(&self) -> Option<DateTime<Utc>> {
        self.activated_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn expired_at(&self) -> Option<DateTime<Utc>> {
        self.expired_at
    }

    pub fn disputed_at(&self) -> Option<DateTime<Utc>> {
        self.disputed_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns true if the user is one of the two parties.
    pub fn is_party(&self, user_id: UserId) -> bool {
        self.parties.includes(user_id)
    }

    /// Returns true if the agreement reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// Transition methods
impl Agreement {
    /// Creates a pending agreement from an accepted proposal.
    ///
    /// The result is not persisted yet (version 0).
    pub fn create(input: NewAgreement, now: DateTime<Utc>) -> Result<Self, AgreementError> {
        if !input.proposal.price.is_positive() {
            return Err(AgreementError::InvalidPrice {
                cents: input.proposal.price.cents(),
            });
        }

        let mut details = Map::new();
        details.insert("price".into(), Value::from(input.proposal.price.cents()));
        details.insert("game".into(), Value::from(input.proposal.game.clone()));

        let mut history = ActionHistory::new();
        history.add_action(ActionHistoryEntry::new(
            ActionKind::Created,
            input.created_by,
            now,
            details,
            input.creation_key.clone(),
        ));

        Ok(Self {
            id: AgreementId::new(),
            version: Version::initial(),
            conversation_id: input.conversation_id,
            proposal_id: input.proposal_id,
            legacy_record_id: None,
            creation_key: input.creation_key,
            financial: FinancialSnapshot::for_price(input.proposal.price),
            proposal: input.proposal,
            parties: input.parties,
            status: AgreementStatus::Pending,
            renegotiation: None,
            history,
            created_at: now,
            activated_at: None,
            completed_at: None,
            cancelled_at: None,
            expired_at: None,
            disputed_at: None,
            updated_at: now,
        })
    }

    /// Starts work on a pending agreement.
    pub fn activate(
        &mut self,
        performed_by: &str,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Transition, AgreementError> {
        if self.guard(ActionKind::Activated, idempotency_key, AgreementStatus::can_activate)? {
            return Ok(Transition::Replayed);
        }
        self.status = AgreementStatus::Active;
        self.activated_at = Some(now);
        self.record(ActionKind::Activated, performed_by, Map::new(), idempotency_key, now);
        Ok(Transition::Applied)
    }

    /// Confirms delivery of an active agreement.
    pub fn complete(
        &mut self,
        performed_by: &str,
        details: Map<String, Value>,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Transition, AgreementError> {
        if self.guard(ActionKind::Completed, idempotency_key, AgreementStatus::can_complete)? {
            return Ok(Transition::Replayed);
        }
        self.status = AgreementStatus::Completed;
        self.completed_at = Some(now);
        if self.financial.payment_status == PaymentStatus::Held {
            self.financial.payment_status = PaymentStatus::Released;
        }
        self.record(ActionKind::Completed, performed_by, details, idempotency_key, now);
        Ok(Transition::Applied)
    }

    /// Cancels a pending or active agreement.
    pub fn cancel(
        &mut self,
        performed_by: &str,
        reason: &str,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Transition, AgreementError> {
        if self.guard(ActionKind::Cancelled, idempotency_key, AgreementStatus::can_cancel)? {
            return Ok(Transition::Replayed);
        }
        self.status = AgreementStatus::Cancelled;
        self.cancelled_at = Some(now);
        let mut details = Map::new();
        details.insert("reason".into(), Value::from(reason));
        self.record(ActionKind::Cancelled, performed_by, details, idempotency_key, now);
        Ok(Transition::Applied)
    }

    /// Expires a pending or active agreement whose negotiation window elapsed.
    pub fn expire(
        &mut self,
        performed_by: &str,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Transition, AgreementError> {
        if self.guard(ActionKind::Expired, idempotency_key, AgreementStatus::can_expire)? {
            return Ok(Transition::Replayed);
        }
        self.status = AgreementStatus::Expired;
        self.expired_at = Some(now);
        self.record(ActionKind::Expired, performed_by, Map::new(), idempotency_key, now);
        Ok(Transition::Applied)
    }

    /// Changes the price and delivery time of an active agreement.
    ///
    /// The originally accepted terms are captured the first time this is called.
    pub fn renegotiate(
        &mut self,
        performed_by: &str,
        new_price: Money,
        new_time: &str,
        reason: Option<&str>,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Transition, AgreementError> {
        if self.guard(
            ActionKind::Renegotiated,
            idempotency_key,
            AgreementStatus::can_renegotiate,
        )? {
            return Ok(Transition::Replayed);
        }
        if !new_price.is_positive() {
            return Err(AgreementError::InvalidPrice {
                cents: new_price.cents(),
            });
        }

        let previous_price = self.proposal.price;
        let previous_time = self.proposal.estimated_time.clone();
        let data = self.renegotiation.get_or_insert_with(|| RenegotiationData {
            original_price: previous_price,
            original_time: previous_time.clone(),
            current_price: previous_price,
            current_time: previous_time.clone(),
            count: 0,
            last_renegotiated_by: None,
            last_renegotiated_at: None,
            last_reason: None,
        });
        data.current_price = new_price;
        data.current_time = new_time.to_string();
        data.count += 1;
        data.last_renegotiated_by = Some(performed_by.to_string());
        data.last_renegotiated_at = Some(now);
        data.last_reason = reason.map(str::to_string);

        self.proposal.price = new_price;
        self.proposal.estimated_time = new_time.to_string();
        self.financial.total_amount = new_price;

        let mut details = Map::new();
        details.insert("from_price".into(), Value::from(previous_price.cents()));
        details.insert("to_price".into(), Value::from(new_price.cents()));
        details.insert("from_time".into(), Value::from(previous_time));
        details.insert("to_time".into(), Value::from(new_time));
        if let Some(reason) = reason {
            details.insert("reason".into(), Value::from(reason));
        }
        self.record(ActionKind::Renegotiated, performed_by, details, idempotency_key, now);
        Ok(Transition::Applied)
    }

    /// Places the agreement under administrative dispute.
    pub fn dispute(
        &mut self,
        performed_by: &str,
        reason: &str,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Transition, AgreementError> {
        if self.guard(ActionKind::Disputed, idempotency_key, AgreementStatus::can_dispute)? {
            return Ok(Transition::Replayed);
        }
        let mut details = Map::new();
        details.insert("reason".into(), Value::from(reason));
        details.insert("previous_status".into(), Value::from(self.status.as_str()));
        self.status = AgreementStatus::Disputed;
        self.disputed_at = Some(now);
        self.record(ActionKind::Disputed, performed_by, details, idempotency_key, now);
        Ok(Transition::Applied)
    }

    /// Links the agreement to the legacy record it bridges.
    ///
    /// Returns `Applied` when the link was added, `Replayed` when it already existed.
    pub fn link_legacy_record(
        &mut self,
        legacy_record_id: LegacyRecordId,
        now: DateTime<Utc>,
    ) -> Result<Transition, AgreementError> {
        match self.legacy_record_id {
            Some(existing) if existing == legacy_record_id => Ok(Transition::Replayed),
            Some(existing) => Err(AgreementError::LegacyLinkConflict {
                existing,
                requested: legacy_record_id,
            }),
            None => {
                self.legacy_record_id = Some(legacy_record_id);
                let mut details = Map::new();
                details.insert(
                    "legacy_record_id".into(),
                    Value::from(legacy_record_id.to_string()),
                );
                self.record(
                    ActionKind::Migrated,
                    "system",
                    details,
                    Some(&format!("migration_{legacy_record_id}_link")),
                    now,
                );
                Ok(Transition::Applied)
            }
        }
    }

    /// Records funds held in escrow for this agreement.
    pub fn record_escrow_hold(&mut self, amount: Money, now: DateTime<Utc>) {
        self.financial.paid_amount += amount;
        self.financial.payment_status = PaymentStatus::Held;
        self.updated_at = now;
    }

    /// Records an escrow refund on the financial snapshot.
    pub fn record_refund(&mut self, amount: Money, now: DateTime<Utc>) {
        self.financial.refund_amount += amount;
        self.financial.payment_status = PaymentStatus::Refunded;
        self.updated_at = now;
    }

    /// Sets the persisted version. Called by the persistence layer after a write.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Runs the idempotency and status checks shared by every transition.
    ///
    /// Returns `Ok(true)` when the request is a replay of an already recorded action.
    fn guard(
        &self,
        action: ActionKind,
        idempotency_key: Option<&str>,
        allowed: fn(&AgreementStatus) -> bool,
    ) -> Result<bool, AgreementError> {
        match self.history.lookup(idempotency_key, action) {
            KeyLookup::SameAction => return Ok(true),
            KeyLookup::OtherAction(recorded) => {
                return Err(AgreementError::IdempotencyKeyReused {
                    key: idempotency_key.unwrap_or_default().to_string(),
                    recorded,
                });
            }
            KeyLookup::Unused => {}
        }

        if !allowed(&self.status) {
            return Err(AgreementError::InvalidTransition {
                current: self.status,
                action,
            });
        }
        Ok(false)
    }

    fn record(
        &mut self,
        action: ActionKind,
        performed_by: &str,
        details: Map<String, Value>,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
    ) {
        self.history.add_action(ActionHistoryEntry::new(
            action,
            performed_by,
            now,
            details,
            idempotency_key.map(str::to_string),
        ));
        self.updated_at = now;
    }
}
