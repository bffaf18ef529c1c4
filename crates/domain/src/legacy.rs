//! Legacy pre-contract records and their mapping onto agreements.

use chrono::{DateTime, Utc};
use common::{ConversationId, LegacyRecordId, ProposalId, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Money;
use crate::agreement::{
    ActionHistory, ActionHistoryEntry, ActionKind, Agreement, AgreementError, AgreementStatus,
    FinancialSnapshot, Parties, PartySnapshot, ProposalSnapshot, RenegotiationData,
};

/// Price as stored on legacy records: either a number or a human-formatted string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LegacyPrice {
    Number(f64),
    Text(String),
}

impl LegacyPrice {
    /// Returns the parsed amount, if the stored value is readable.
    pub fn amount(&self) -> Option<Money> {
        match self {
            LegacyPrice::Number(value) if value.is_finite() => Some(Money::from_decimal(*value)),
            LegacyPrice::Number(_) => None,
            LegacyPrice::Text(text) => Money::parse_amount(text),
        }
    }
}

impl Default for LegacyPrice {
    fn default() -> Self {
        LegacyPrice::Number(0.0)
    }
}

impl std::fmt::Display for LegacyPrice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LegacyPrice::Number(value) => write!(f, "{value}"),
            LegacyPrice::Text(text) => write!(f, "{text}"),
        }
    }
}

/// One price/time change recorded on a legacy record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRenegotiation {
    pub price: LegacyPrice,
    pub time: String,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

/// Pre-contract record kept for compatibility with older clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRecord {
    pub id: LegacyRecordId,
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub proposal_id: Option<ProposalId>,
    #[serde(default)]
    pub client: PartySnapshot,
    #[serde(default)]
    pub booster: PartySnapshot,
    /// Raw role identifiers; older writers did not always store UUIDs here.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub booster_id: Option<String>,
    #[serde(default)]
    pub price: LegacyPrice,
    #[serde(default)]
    pub game: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub estimated_time: String,
    /// Free-form status string.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    #[serde(default)]
    pub renegotiation_history: Vec<LegacyRenegotiation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Maps a free-form legacy status onto the agreement status set.
///
/// Unknown values map to `Active`.
pub fn map_legacy_status(status: &str) -> AgreementStatus {
    match status.trim().to_ascii_lowercase().as_str() {
        "pending" | "proposed" | "negotiating" => AgreementStatus::Pending,
        "accepted" | "active" | "in_progress" => AgreementStatus::Active,
        "completed" | "delivered" | "done" => AgreementStatus::Completed,
        "cancelled" | "canceled" | "rejected" => AgreementStatus::Cancelled,
        "expired" => AgreementStatus::Expired,
        "disputed" => AgreementStatus::Disputed,
        _ => AgreementStatus::Active,
    }
}

/// Idempotency key of the synthesized `created` entry for a migrated record.
pub fn migration_key(id: LegacyRecordId) -> String {
    format!("migration_{id}")
}

impl LegacyRecord {
    /// Creates a record in `accepted` status, as written by the proposal flow.
    pub fn accepted(
        conversation_id: ConversationId,
        client: PartySnapshot,
        booster: PartySnapshot,
        price: LegacyPrice,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: LegacyRecordId::new(),
            conversation_id,
            proposal_id: None,
            client_id: client.user_id.map(|id| id.to_string()),
            booster_id: booster.user_id.map(|id| id.to_string()),
            client,
            booster,
            price,
            game: String::new(),
            category: String::new(),
            estimated_time: String::new(),
            status: "accepted".into(),
            accepted_at: Some(now),
            completed_at: None,
            cancelled_at: None,
            cancel_reason: None,
            renegotiation_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the status this record maps to.
    pub fn mapped_status(&self) -> AgreementStatus {
        map_legacy_status(&self.status)
    }

    /// Returns true if the record represents an accepted engagement.
    pub fn is_accepted(&self) -> bool {
        self.accepted_at.is_some()
            || !matches!(self.mapped_status(), AgreementStatus::Pending)
    }

    /// Returns the time the record was accepted, falling back to creation time.
    pub fn accepted_or_created_at(&self) -> DateTime<Utc> {
        self.accepted_at.unwrap_or(self.created_at)
    }

    /// Marks the record cancelled.
    pub fn mark_cancelled(&mut self, reason: &str, now: DateTime<Utc>) {
        self.status = "cancelled".into();
        self.cancelled_at = Some(now);
        self.cancel_reason = Some(reason.to_string());
        self.updated_at = now;
    }

    /// Builds the agreement this record corresponds to.
    ///
    /// The result carries synthesized history entries with deterministic keys so
    /// that repeated migrations are recognized. It is not persisted yet.
    pub fn to_agreement(&self, now: DateTime<Utc>) -> Result<Agreement, AgreementError> {
        let price = self
            .price
            .amount()
            .ok_or_else(|| AgreementError::UnparseablePrice {
                value: self.price.to_string(),
            })?;
        if !price.is_positive() {
            return Err(AgreementError::InvalidPrice {
                cents: price.cents(),
            });
        }

        let status = self.mapped_status();
        let created_at = self.accepted_or_created_at();
        let key = migration_key(self.id);

        let mut history = ActionHistory::new();
        let mut details = Map::new();
        details.insert("legacy_record_id".into(), Value::from(self.id.to_string()));
        details.insert("legacy_status".into(), Value::from(self.status.clone()));
        history.add_action(ActionHistoryEntry::new(
            ActionKind::Created,
            "system",
            created_at,
            details,
            Some(key.clone()),
        ));

        let mut completed_at = None;
        let mut cancelled_at = None;
        match status {
            AgreementStatus::Completed => {
                let at = self.completed_at.unwrap_or(now);
                completed_at = Some(at);
                let mut details = Map::new();
                details.insert("source".into(), Value::from("legacy_migration"));
                history.add_action(ActionHistoryEntry::new(
                    ActionKind::Completed,
                    "system",
                    at,
                    details,
                    Some(format!("{key}_completed")),
                ));
            }
            AgreementStatus::Cancelled => {
                let at = self.cancelled_at.unwrap_or(now);
                cancelled_at = Some(at);
                let mut details = Map::new();
                details.insert("source".into(), Value::from("legacy_migration"));
                if let Some(reason) = &self.cancel_reason {
                    details.insert("reason".into(), Value::from(reason.clone()));
                }
                history.add_action(ActionHistoryEntry::new(
                    ActionKind::Cancelled,
                    "system",
                    at,
                    details,
                    Some(format!("{key}_cancelled")),
                ));
            }
            _ => {}
        }

        let activated_at = match status {
            AgreementStatus::Pending => None,
            _ => Some(created_at),
        };

        Ok(Agreement {
            id: common::AgreementId::new(),
            version: Version::initial(),
            conversation_id: self.conversation_id,
            proposal_id: self.proposal_id,
            legacy_record_id: Some(self.id),
            creation_key: Some(key),
            proposal: ProposalSnapshot {
                game: self.game.clone(),
                category: self.category.clone(),
                price,
                estimated_time: self.estimated_time.clone(),
            },
            parties: Parties {
                client: self.client.clone(),
                booster: self.booster.clone(),
            },
            status,
            financial: FinancialSnapshot::for_price(price),
            renegotiation: self.fold_renegotiations(),
            history,
            created_at,
            activated_at,
            completed_at,
            cancelled_at,
            expired_at: (status == AgreementStatus::Expired).then_some(now),
            disputed_at: (status == AgreementStatus::Disputed).then_some(now),
            updated_at: now,
        })
    }

    /// Folds the legacy renegotiation log: first entry is the original, last is current.
    fn fold_renegotiations(&self) -> Option<RenegotiationData> {
        let first = self.renegotiation_history.first()?;
        let last = self.renegotiation_history.last()?;
        Some(RenegotiationData {
            original_price: first.price.amount().unwrap_or_default(),
            original_time: first.time.clone(),
            current_price: last.price.amount().unwrap_or_default(),
            current_time: last.time.clone(),
            count: self.renegotiation_history.len() as u32,
            last_renegotiated_by: last.requested_by.clone(),
            last_renegotiated_at: last.at,
            last_reason: None,
        })
    }
}
