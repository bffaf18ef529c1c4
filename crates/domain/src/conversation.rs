//! Negotiation thread between a client and a booster.

use chrono::{DateTime, Utc};
use common::{AgreementId, ConversationId, LegacyRecordId, ProposalId, UserId};
use serde::{Deserialize, Serialize};

use crate::agreement::{Parties, PartySnapshot, ProposalSnapshot};

/// Status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Open,
    Accepted,
    Completed,
    Cancelled,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Open => "open",
            ConversationStatus::Accepted => "accepted",
            ConversationStatus::Completed => "completed",
            ConversationStatus::Cancelled => "cancelled",
        }
    }
}

/// A negotiation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Raw participant ids; older threads may hold non-UUID values.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub booster_id: Option<String>,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub booster_name: String,
    #[serde(default)]
    pub proposal_id: Option<ProposalId>,
    #[serde(default)]
    pub accepted_proposal: Option<ProposalSnapshot>,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default)]
    pub is_finalized: bool,
    #[serde(default)]
    pub agreement_id: Option<AgreementId>,
    #[serde(default)]
    pub legacy_record_id: Option<LegacyRecordId>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finalized_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Opens a conversation between two users.
    pub fn open(client: UserId, booster: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: ConversationId::new(),
            client_id: Some(client.to_string()),
            booster_id: Some(booster.to_string()),
            client_name: String::new(),
            booster_name: String::new(),
            proposal_id: None,
            accepted_proposal: None,
            status: ConversationStatus::Open,
            is_finalized: false,
            agreement_id: None,
            legacy_record_id: None,
            accepted_at: None,
            finalized_at: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Records the accepted proposal.
    pub fn accept(
        &mut self,
        proposal_id: ProposalId,
        proposal: ProposalSnapshot,
        now: DateTime<Utc>,
    ) {
        self.proposal_id = Some(proposal_id);
        self.accepted_proposal = Some(proposal);
        self.status = ConversationStatus::Accepted;
        self.accepted_at = Some(now);
        self.updated_at = now;
    }

    /// Returns true if a proposal was accepted and the thread is not finalized.
    pub fn is_accepted(&self) -> bool {
        self.status == ConversationStatus::Accepted && !self.is_finalized
    }

    /// Points the conversation at its agreement.
    pub fn link_agreement(&mut self, agreement_id: AgreementId, now: DateTime<Utc>) {
        self.agreement_id = Some(agreement_id);
        self.updated_at = now;
    }

    /// Cancels and finalizes the conversation.
    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) {
        self.status = ConversationStatus::Cancelled;
        self.is_finalized = true;
        self.finalized_at = Some(now);
        self.cancel_reason = Some(reason.to_string());
        self.updated_at = now;
    }

    /// Builds party snapshots from the participant fields.
    pub fn parties(&self) -> Parties {
        let snapshot = |id: &Option<String>, name: &str| PartySnapshot {
            user_id: id.as_deref().and_then(UserId::parse),
            display_name: name.to_string(),
            ..Default::default()
        };
        Parties {
            client: snapshot(&self.client_id, &self.client_name),
            booster: snapshot(&self.booster_id, &self.booster_name),
        }
    }
}
