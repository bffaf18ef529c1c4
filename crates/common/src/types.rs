use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
///
/// Each identifier is a distinct type so an agreement id can never be passed
/// where a conversation or user id is expected.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parses an identifier from its string form.
            ///
            /// Returns `None` when the input is not a well-formed UUID.
            pub fn parse(value: &str) -> Option<Self> {
                Uuid::parse_str(value.trim()).ok().map(Self)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id!(
    /// Unique identifier of an Agreement, generated at creation.
    AgreementId
);

uuid_id!(
    /// Identifier of the negotiation thread between two parties.
    ConversationId
);

uuid_id!(
    /// Identifier of the accepted proposal an Agreement was created from.
    ProposalId
);

uuid_id!(
    /// Identifier of a pre-Agreement negotiation record.
    LegacyRecordId
);

uuid_id!(
    /// Identifier of a marketplace user (client or booster).
    UserId
);

uuid_id!(
    /// Identifier of a durable retry task.
    TaskId
);

uuid_id!(
    /// Identifier of a financial ledger entry.
    LedgerEntryId
);
