//! Prioritized participant resolution.
//!
//! Older agreements do not always carry the party's account id on the party
//! snapshot. The resolver walks the known sources in a fixed order and
//! returns the first candidate that parses as a UUID:
//!
//! 1. party snapshot `user_id`
//! 2. party metadata aliases `userId`, `_id`, `id`
//! 3. conversation `client_id` / `booster_id`
//! 4. legacy record `client_id` / `booster_id`

use common::UserId;
use domain::{Agreement, Conversation, LegacyRecord, PartySnapshot};
use serde::Serialize;

/// Which party of an agreement is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Booster,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Booster => "booster",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a resolved id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    PartyUserId,
    /// Metadata alias; holds the alias key.
    PartyMetadata(&'static str),
    Conversation,
    LegacyRecord,
}

impl std::fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionSource::PartyUserId => write!(f, "party.user_id"),
            ResolutionSource::PartyMetadata(key) => write!(f, "party.metadata.{key}"),
            ResolutionSource::Conversation => write!(f, "conversation"),
            ResolutionSource::LegacyRecord => write!(f, "legacy_record"),
        }
    }
}

/// Outcome of resolving one party.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved { id: UserId, source: ResolutionSource },
    Unresolved,
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved { .. })
    }

    pub fn id(&self) -> Option<UserId> {
        match self {
            Resolution::Resolved { id, .. } => Some(*id),
            Resolution::Unresolved => None,
        }
    }
}

/// Records consulted after the agreement's own party snapshots.
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    pub conversation: Option<Conversation>,
    pub legacy_record: Option<LegacyRecord>,
}

const METADATA_ALIASES: [&str; 3] = ["userId", "_id", "id"];

/// Resolves the account id of one party.
pub fn resolve_participant(
    agreement: &Agreement,
    role: Role,
    context: &ResolutionContext,
) -> Resolution {
    let party = match role {
        Role::Client => &agreement.parties().client,
        Role::Booster => &agreement.parties().booster,
    };

    if let Some(resolution) = from_party(party) {
        return resolution;
    }

    if let Some(conversation) = &context.conversation {
        let candidate = match role {
            Role::Client => conversation.client_id.as_deref(),
            Role::Booster => conversation.booster_id.as_deref(),
        };
        if let Some(id) = candidate.and_then(UserId::parse) {
            return Resolution::Resolved {
                id,
                source: ResolutionSource::Conversation,
            };
        }
    }

    if let Some(record) = &context.legacy_record {
        let candidate = match role {
            Role::Client => record.client_id.as_deref(),
            Role::Booster => record.booster_id.as_deref(),
        };
        if let Some(id) = candidate.and_then(UserId::parse) {
            return Resolution::Resolved {
                id,
                source: ResolutionSource::LegacyRecord,
            };
        }
    }

    Resolution::Unresolved
}

fn from_party(party: &PartySnapshot) -> Option<Resolution> {
    if let Some(id) = party.user_id {
        return Some(Resolution::Resolved {
            id,
            source: ResolutionSource::PartyUserId,
        });
    }
    METADATA_ALIASES
        .iter()
        .zip(party.metadata.id_aliases())
        .find_map(|(key, value)| {
            value.and_then(UserId::parse).map(|id| Resolution::Resolved {
                id,
                source: ResolutionSource::PartyMetadata(*key),
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::ConversationId;
    use domain::{
        LegacyPrice, Money, NewAgreement, Parties, PartyMetadata, ProposalSnapshot,
    };

    fn agreement_with(client: PartySnapshot, booster: PartySnapshot) -> Agreement {
        Agreement::create(
            NewAgreement {
                conversation_id: ConversationId::new(),
                proposal_id: None,
                proposal: ProposalSnapshot {
                    price: Money::from_dollars(10),
                    ..Default::default()
                },
                parties: Parties { client, booster },
                created_by: "system".into(),
                creation_key: None,
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn anonymous() -> PartySnapshot {
        PartySnapshot::default()
    }

    #[test]
    fn test_party_user_id_wins() {
        let client = UserId::new();
        let agreement = agreement_with(PartySnapshot::new(client, "c"), anonymous());
        let resolution =
            resolve_participant(&agreement, Role::Client, &ResolutionContext::default());
        assert_eq!(
            resolution,
            Resolution::Resolved {
                id: client,
                source: ResolutionSource::PartyUserId
            }
        );
    }

    #[test]
    fn test_metadata_aliases_in_order_skipping_non_uuids() {
        let expected = UserId::new();
        let party = PartySnapshot {
            metadata: PartyMetadata {
                user_id_alias: Some("not-a-uuid".into()),
                object_id_alias: Some(expected.to_string()),
                id_alias: Some(UserId::new().to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let agreement = agreement_with(anonymous(), party);
        let resolution =
            resolve_participant(&agreement, Role::Booster, &ResolutionContext::default());
        assert_eq!(
            resolution,
            Resolution::Resolved {
                id: expected,
                source: ResolutionSource::PartyMetadata("_id")
            }
        );
    }

    #[test]
    fn test_falls_back_to_conversation_then_legacy() {
        let agreement = agreement_with(anonymous(), anonymous());
        let client = UserId::new();
        let booster = UserId::new();

        let mut conversation = Conversation::open(client, UserId::new(), Utc::now());
        conversation.booster_id = Some("legacy-7".into());
        let mut legacy = LegacyRecord::accepted(
            agreement.conversation_id(),
            anonymous(),
            anonymous(),
            LegacyPrice::Number(10.0),
            Utc::now(),
        );
        legacy.booster_id = Some(booster.to_string());

        let context = ResolutionContext {
            conversation: Some(conversation),
            legacy_record: Some(legacy),
        };
        assert_eq!(
            resolve_participant(&agreement, Role::Client, &context),
            Resolution::Resolved {
                id: client,
                source: ResolutionSource::Conversation
            }
        );
        assert_eq!(
            resolve_participant(&agreement, Role::Booster, &context),
            Resolution::Resolved {
                id: booster,
                source: ResolutionSource::LegacyRecord
            }
        );
    }

    #[test]
    fn test_unresolved_when_no_source_has_a_uuid() {
        let agreement = agreement_with(anonymous(), anonymous());
        let resolution =
            resolve_participant(&agreement, Role::Client, &ResolutionContext::default());
        assert_eq!(resolution, Resolution::Unresolved);
        assert_eq!(resolution.id(), None);
    }
}
