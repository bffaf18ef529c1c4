//! Financial ledger entries and wallet balances.

use chrono::{DateTime, Utc};
use common::{AgreementId, ConversationId, LedgerEntryId, UserId};
use serde::{Deserialize, Serialize};

use crate::Money;

/// Direction of a balance movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerDirection {
    Credit,
    Debit,
}

/// Why the balance moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    EscrowHold,
    EscrowRefund,
    EscrowRelease,
    Deposit,
    Withdrawal,
}

impl LedgerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerReason::EscrowHold => "escrow_hold",
            LedgerReason::EscrowRefund => "escrow_refund",
            LedgerReason::EscrowRelease => "escrow_release",
            LedgerReason::Deposit => "deposit",
            LedgerReason::Withdrawal => "withdrawal",
        }
    }
}

/// Refund annotations on a hold entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerMetadata {
    #[serde(default)]
    pub refunded: bool,
    #[serde(default)]
    pub refunded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub refund_entry_id: Option<LedgerEntryId>,
}

/// One append-only balance movement.
///
/// `operation_id` is unique across the ledger and makes every movement
/// idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub user_id: UserId,
    pub direction: LedgerDirection,
    pub reason: LedgerReason,
    pub amount: Money,
    pub operation_id: String,
    pub balance_before: Money,
    pub balance_after: Money,
    #[serde(default)]
    pub agreement_id: Option<AgreementId>,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub metadata: LedgerMetadata,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Creates a credit; `balance_after = balance_before + amount`.
    pub fn credit(
        user_id: UserId,
        reason: LedgerReason,
        amount: Money,
        operation_id: impl Into<String>,
        balance_before: Money,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(
            user_id,
            LedgerDirection::Credit,
            reason,
            amount,
            operation_id.into(),
            balance_before,
            balance_before + amount,
            now,
        )
    }

    /// Creates a debit; `balance_after = balance_before - amount`.
    pub fn debit(
        user_id: UserId,
        reason: LedgerReason,
        amount: Money,
        operation_id: impl Into<String>,
        balance_before: Money,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(
            user_id,
            LedgerDirection::Debit,
            reason,
            amount,
            operation_id.into(),
            balance_before,
            balance_before - amount,
            now,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        user_id: UserId,
        direction: LedgerDirection,
        reason: LedgerReason,
        amount: Money,
        operation_id: String,
        balance_before: Money,
        balance_after: Money,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: LedgerEntryId::new(),
            user_id,
            direction,
            reason,
            amount,
            operation_id,
            balance_before,
            balance_after,
            agreement_id: None,
            conversation_id: None,
            metadata: LedgerMetadata::default(),
            created_at: now,
        }
    }

    /// Associates the entry with an agreement.
    pub fn with_agreement(mut self, agreement_id: AgreementId) -> Self {
        self.agreement_id = Some(agreement_id);
        self
    }

    /// Associates the entry with a conversation.
    pub fn with_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    /// Annotates a hold entry as refunded by `refund_entry_id`.
    pub fn mark_refunded(&mut self, refund_entry_id: LedgerEntryId, now: DateTime<Utc>) {
        self.metadata.refunded = true;
        self.metadata.refunded_at = Some(now);
        self.metadata.refund_entry_id = Some(refund_entry_id);
    }

    pub fn is_refunded(&self) -> bool {
        self.metadata.refunded
    }
}

/// Operation id of the refund for an agreement's escrow hold.
pub fn escrow_refund_operation_id(agreement_id: AgreementId) -> String {
    format!("escrow_refund_{agreement_id}")
}

/// Spendable balance of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: UserId,
    pub balance: Money,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(user_id: UserId, balance: Money, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            balance,
            updated_at: now,
        }
    }

    /// Adds funds and returns the balance before the credit.
    pub fn credit(&mut self, amount: Money, now: DateTime<Utc>) -> Money {
        let before = self.balance;
        self.balance += amount;
        self.updated_at = now;
        before
    }

    /// Removes funds and returns the balance before the debit.
    ///
    /// Returns `None` and leaves the wallet untouched when the balance is short.
    pub fn debit(&mut self, amount: Money, now: DateTime<Utc>) -> Option<Money> {
        if self.balance.cents() < amount.cents() {
            return None;
        }
        let before = self.balance;
        self.balance -= amount;
        self.updated_at = now;
        Some(before)
    }
}
