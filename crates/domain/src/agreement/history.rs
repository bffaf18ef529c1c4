//! Append-only action history with idempotency-key deduplication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The logical action recorded by a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Created,
    Activated,
    Completed,
    Cancelled,
    Expired,
    Renegotiated,
    Disputed,
    Migrated,
}

impl ActionKind {
    /// Returns the action name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Created => "created",
            ActionKind::Activated => "activated",
            ActionKind::Completed => "completed",
            ActionKind::Cancelled => "cancelled",
            ActionKind::Expired => "expired",
            ActionKind::Renegotiated => "renegotiated",
            ActionKind::Disputed => "disputed",
            ActionKind::Migrated => "migrated",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recorded state transition. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionHistoryEntry {
    pub action: ActionKind,
    pub performed_by: String,
    pub performed_at: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
    pub idempotency_key: Option<String>,
}

impl ActionHistoryEntry {
    /// Creates a new entry.
    pub fn new(
        action: ActionKind,
        performed_by: impl Into<String>,
        performed_at: DateTime<Utc>,
        details: serde_json::Map<String, serde_json::Value>,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            action,
            performed_by: performed_by.into(),
            performed_at,
            details,
            idempotency_key,
        }
    }
}

/// Result of looking up an idempotency key in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLookup {
    /// The key was never used.
    Unused,
    /// The key was already used for the same action.
    SameAction,
    /// The key was already used for a different action.
    OtherAction(ActionKind),
}

/// Ordered, append-only log of actions performed on an agreement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionHistory {
    entries: Vec<ActionHistoryEntry>,
}

impl ActionHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry unless its idempotency key is already present.
    ///
    /// Returns `true` if the entry was appended.
    pub fn add_action(&mut self, entry: ActionHistoryEntry) -> bool {
        if let Some(key) = entry.idempotency_key.as_deref()
            && self.find_by_key(key).is_some()
        {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Finds the entry recorded with the given idempotency key.
    pub fn find_by_key(&self, key: &str) -> Option<&ActionHistoryEntry> {
        self.entries
            .iter()
            .find(|e| e.idempotency_key.as_deref() == Some(key))
    }

    /// Checks how a key relates to the recorded history for `action`.
    pub fn lookup(&self, key: Option<&str>, action: ActionKind) -> KeyLookup {
        let Some(key) = key else {
            return KeyLookup::Unused;
        };
        match self.find_by_key(key) {
            None => KeyLookup::Unused,
            Some(entry) if entry.action == action => KeyLookup::SameAction,
            Some(entry) => KeyLookup::OtherAction(entry.action),
        }
    }

    /// Returns the most recent entry for an action.
    pub fn latest(&self, action: ActionKind) -> Option<&ActionHistoryEntry> {
        self.entries.iter().rev().find(|e| e.action == action)
    }

    /// Returns all entries, oldest first.
    pub fn entries(&self) -> &[ActionHistoryEntry] {
        &self.entries
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no action was ever recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns how many entries were recorded for an action.
    pub fn count(&self, action: ActionKind) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: ActionKind, key: Option<&str>) -> ActionHistoryEntry {
        ActionHistoryEntry::new(
            action,
            "user-a",
            Utc::now(),
            serde_json::Map::new(),
            key.map(str::to_string),
        )
    }

    #[test]
    fn test_add_action_appends_in_order() {
        let mut history = ActionHistory::new();
        assert!(history.add_action(entry(ActionKind::Created, None)));
        assert!(history.add_action(entry(ActionKind::Activated, None)));

        let actions: Vec<_> = history.entries().iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![ActionKind::Created, ActionKind::Activated]);
    }

    #[test]
    fn test_duplicate_key_is_a_no_op() {
        let mut history = ActionHistory::new();
        assert!(history.add_action(entry(ActionKind::Completed, Some("k1"))));
        assert!(!history.add_action(entry(ActionKind::Completed, Some("k1"))));
        assert_eq!(history.count(ActionKind::Completed), 1);
    }

    #[test]
    fn test_entries_without_key_are_never_deduplicated() {
        let mut history = ActionHistory::new();
        assert!(history.add_action(entry(ActionKind::Renegotiated, None)));
        assert!(history.add_action(entry(ActionKind::Renegotiated, None)));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_lookup_distinguishes_actions() {
        let mut history = ActionHistory::new();
        history.add_action(entry(ActionKind::Cancelled, Some("k1")));

        assert_eq!(history.lookup(None, ActionKind::Cancelled), KeyLookup::Unused);
        assert_eq!(
            history.lookup(Some("k2"), ActionKind::Cancelled),
            KeyLookup::Unused
        );
        assert_eq!(
            history.lookup(Some("k1"), ActionKind::Cancelled),
            KeyLookup::SameAction
        );
        assert_eq!(
            history.lookup(Some("k1"), ActionKind::Completed),
            KeyLookup::OtherAction(ActionKind::Cancelled)
        );
    }

    #[test]
    fn test_latest_returns_most_recent() {
        let mut history = ActionHistory::new();
        let mut first = entry(ActionKind::Renegotiated, None);
        first.performed_by = "first".into();
        let mut second = entry(ActionKind::Renegotiated, None);
        second.performed_by = "second".into();
        history.add_action(first);
        history.add_action(second);

        assert_eq!(
            history.latest(ActionKind::Renegotiated).unwrap().performed_by,
            "second"
        );
        assert!(history.latest(ActionKind::Expired).is_none());
    }
}
