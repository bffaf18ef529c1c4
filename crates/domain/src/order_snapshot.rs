//! Read-optimized order record derived from an agreement.

use chrono::{DateTime, Utc};
use common::{AgreementId, ConversationId, UserId, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Money;
use crate::agreement::{ActionKind, Agreement, AgreementStatus};

/// Service terms mirrored from the proposal snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDetails {
    pub game: String,
    pub category: String,
    pub estimated_time: String,
}

/// Who completed the order and with which details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub completed_by: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Who cancelled the order and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationRecord {
    pub cancelled_by: String,
    pub cancelled_at: DateTime<Utc>,
    pub reason: Option<String>,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Denormalized order view of one agreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub agreement_id: AgreementId,
    pub conversation_id: ConversationId,
    pub client_id: UserId,
    pub booster_id: UserId,
    pub status: AgreementStatus,
    /// Agreement version this snapshot was last synced from.
    #[serde(default)]
    pub agreement_version: Version,
    pub price: Money,
    pub service: ServiceDetails,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub completion: Option<CompletionRecord>,
    pub cancellation: Option<CancellationRecord>,
    pub updated_at: DateTime<Utc>,
}

impl OrderSnapshot {
    /// Projects an agreement with already resolved participant ids.
    pub fn project(agreement: &Agreement, client_id: UserId, booster_id: UserId) -> Self {
        let mut snapshot = Self {
            agreement_id: agreement.id(),
            conversation_id: agreement.conversation_id(),
            client_id,
            booster_id,
            status: agreement.status(),
            agreement_version: agreement.version(),
            price: agreement.proposal().price,
            service: ServiceDetails::default(),
            created_at: agreement.created_at(),
            activated_at: None,
            completed_at: None,
            cancelled_at: None,
            expired_at: None,
            completion: None,
            cancellation: None,
            updated_at: agreement.updated_at(),
        };
        snapshot.sync(agreement);
        snapshot
    }

    /// Copies status, timestamps, price and terms from the agreement.
    ///
    /// On completion or cancellation the matching history entry is copied into
    /// the sub-record. Participant ids are left as they are.
    pub fn sync(&mut self, agreement: &Agreement) {
        let proposal = agreement.proposal();
        self.status = agreement.status();
        self.agreement_version = agreement.version();
        self.price = proposal.price;
        self.service = ServiceDetails {
            game: proposal.game.clone(),
            category: proposal.category.clone(),
            estimated_time: proposal.estimated_time.clone(),
        };
        self.activated_at = agreement.activated_at();
        self.completed_at = agreement.completed_at();
        self.cancelled_at = agreement.cancelled_at();
        self.expired_at = agreement.expired_at();
        self.updated_at = agreement.updated_at();

        match agreement.status() {
            AgreementStatus::Completed => {
                if let Some(entry) = agreement.history().latest(ActionKind::Completed) {
                    self.completion = Some(CompletionRecord {
                        completed_by: entry.performed_by.clone(),
                        completed_at: entry.performed_at,
                        details: entry.details.clone(),
                    });
                }
            }
            AgreementStatus::Cancelled => {
                if let Some(entry) = agreement.history().latest(ActionKind::Cancelled) {
                    self.cancellation = Some(CancellationRecord {
                        cancelled_by: entry.performed_by.clone(),
                        cancelled_at: entry.performed_at,
                        reason: entry
                            .details
                            .get("reason")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        details: entry.details.clone(),
                    });
                }
            }
            _ => {}
        }
    }

    /// Returns true if the agreement is newer than the version last synced.
    pub fn is_behind(&self, agreement: &Agreement) -> bool {
        agreement.version() > self.agreement_version
    }

    /// Returns true if the snapshot mirrors the agreement's current state.
    pub fn is_in_sync_with(&self, agreement: &Agreement) -> bool {
        !self.is_behind(agreement)
            && self.status == agreement.status()
            && self.price == agreement.proposal().price
    }
}
