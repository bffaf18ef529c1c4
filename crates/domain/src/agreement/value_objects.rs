//! Value objects embedded in an agreement.

use chrono::{DateTime, Utc};
use common::UserId;
use serde::{Deserialize, Serialize};

use crate::Money;

/// Extension metadata carried on a party snapshot.
///
/// Older records stored the party's account id under several different keys;
/// those aliases are kept as named fields so the participant resolver can
/// probe them in a fixed order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartyMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_orders: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f32>,

    /// Account id stored under `userId`.
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id_alias: Option<String>,

    /// Account id stored under `_id`.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub object_id_alias: Option<String>,

    /// Account id stored under `id`.
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub id_alias: Option<String>,
}

impl PartyMetadata {
    /// Returns the legacy id aliases in resolution order.
    pub fn id_aliases(&self) -> [Option<&str>; 3] {
        [
            self.user_id_alias.as_deref(),
            self.object_id_alias.as_deref(),
            self.id_alias.as_deref(),
        ]
    }
}

/// Display snapshot of one party, taken when the agreement was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartySnapshot {
    pub user_id: Option<UserId>,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub metadata: PartyMetadata,
}

impl PartySnapshot {
    /// Creates a snapshot for a known user.
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id),
            display_name: display_name.into(),
            avatar_url: None,
            metadata: PartyMetadata::default(),
        }
    }
}

/// The two parties of an agreement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parties {
    pub client: PartySnapshot,
    pub booster: PartySnapshot,
}

impl Parties {
    /// Returns true if the user is either party.
    pub fn includes(&self, user_id: UserId) -> bool {
        self.client.user_id == Some(user_id) || self.booster.user_id == Some(user_id)
    }
}

/// Negotiated terms. Only renegotiation mutates them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposalSnapshot {
    pub game: String,
    pub category: String,
    pub price: Money,
    /// Estimated delivery time as agreed between the parties (free text, e.g. "3 days").
    pub estimated_time: String,
}

/// Payment state of the agreement's escrowed funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Held,
    Released,
    Refunded,
}

/// Financial snapshot of an agreement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialSnapshot {
    pub total_amount: Money,
    pub paid_amount: Money,
    pub refund_amount: Money,
    pub payment_status: PaymentStatus,
}

impl FinancialSnapshot {
    /// Creates a snapshot for a new agreement of the given price.
    pub fn for_price(price: Money) -> Self {
        Self {
            total_amount: price,
            ..Default::default()
        }
    }
}

/// Tracks how the terms moved away from the originally accepted proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenegotiationData {
    pub original_price: Money,
    pub original_time: String,
    pub current_price: Money,
    pub current_time: String,
    pub count: u32,
    pub last_renegotiated_by: Option<String>,
    pub last_renegotiated_at: Option<DateTime<Utc>>,
    pub last_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_party_metadata_reads_legacy_keys() {
        let json = serde_json::json!({
            "verified": true,
            "userId": "a",
            "_id": "b",
            "id": "c"
        });
        let metadata: PartyMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(metadata.verified, Some(true));
        assert_eq!(metadata.id_aliases(), [Some("a"), Some("b"), Some("c")]);
    }

    #[test]
    fn test_party_metadata_omits_unset_fields() {
        let json = serde_json::to_value(PartyMetadata::default()).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }

    #[test]
    fn test_parties_includes() {
        let client = UserId::new();
        let booster = UserId::new();
        let parties = Parties {
            client: PartySnapshot::new(client, "client"),
            booster: PartySnapshot::new(booster, "booster"),
        };
        assert!(parties.includes(client));
        assert!(parties.includes(booster));
        assert!(!parties.includes(UserId::new()));
    }
}
