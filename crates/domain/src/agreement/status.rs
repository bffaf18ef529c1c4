//! Agreement status machine.

use serde::{Deserialize, Serialize};

/// The status of an agreement in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──► Active ──► Completed
///    │          │
///    ├──────────┴──► Cancelled
///    └──────────┴──► Expired
///
/// any (except Disputed) ──► Disputed   (administrative only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgreementStatus {
    /// Created from an accepted proposal, not yet started.
    #[default]
    Pending,

    /// Work is under way.
    Active,

    /// Delivery was confirmed (terminal state).
    Completed,

    /// Cancelled by a party or an administrator (terminal state).
    Cancelled,

    /// The negotiation window elapsed (terminal state).
    Expired,

    /// Placed under administrative dispute.
    Disputed,
}

impl AgreementStatus {
    /// Returns true if the agreement can be activated in this status.
    pub fn can_activate(&self) -> bool {
        matches!(self, AgreementStatus::Pending)
    }

    /// Returns true if the agreement can be completed in this status.
    pub fn can_complete(&self) -> bool {
        matches!(self, AgreementStatus::Active)
    }

    /// Returns true if the agreement can be cancelled in this status.
    pub fn can_cancel(&self) -> bool {
        matches!(self, AgreementStatus::Pending | AgreementStatus::Active)
    }

    /// Returns true if the agreement can expire in this status.
    pub fn can_expire(&self) -> bool {
        matches!(self, AgreementStatus::Pending | AgreementStatus::Active)
    }

    /// Returns true if the agreement terms can be renegotiated in this status.
    pub fn can_renegotiate(&self) -> bool {
        matches!(self, AgreementStatus::Active)
    }

    /// Returns true if the agreement can be placed under dispute.
    pub fn can_dispute(&self) -> bool {
        !matches!(self, AgreementStatus::Disputed)
    }

    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgreementStatus::Completed | AgreementStatus::Cancelled | AgreementStatus::Expired
        )
    }

    /// Returns the status name as stored and exposed over the API.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgreementStatus::Pending => "pending",
            AgreementStatus::Active => "active",
            AgreementStatus::Completed => "completed",
            AgreementStatus::Cancelled => "cancelled",
            AgreementStatus::Expired => "expired",
            AgreementStatus::Disputed => "disputed",
        }
    }

    /// Parses a stored status name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(AgreementStatus::Pending),
            "active" => Some(AgreementStatus::Active),
            "completed" => Some(AgreementStatus::Completed),
            "cancelled" => Some(AgreementStatus::Cancelled),
            "expired" => Some(AgreementStatus::Expired),
            "disputed" => Some(AgreementStatus::Disputed),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgreementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
