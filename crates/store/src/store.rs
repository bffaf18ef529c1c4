use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AgreementId, ConversationId, LegacyRecordId, TaskId, UserId, Version};
use domain::{Agreement, Conversation, LedgerEntry, LegacyRecord, OrderSnapshot, RetryTask, Wallet};
use serde::Serialize;

use crate::Result;

/// Record counts used by the consistency check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectionCounts {
    pub agreements: u64,
    pub agreements_with_legacy_record: u64,
    pub order_snapshots: u64,
    pub legacy_records: u64,
    pub accepted_legacy_records: u64,
    pub accepted_conversations: u64,
    pub accepted_conversations_without_agreement: u64,
    pub pending_tasks: u64,
    pub failed_tasks: u64,
}

/// Transactional store over every collection the engine touches.
///
/// All operations take `&mut Self::Tx`, an in-progress transaction. The
/// lifecycle is:
///
/// 1. `begin()` starts a transaction
/// 2. reads and writes are issued with `&mut tx`
/// 3. `commit(tx)` makes the writes durable, or `abort(tx)` discards them
///
/// Dropping a transaction without committing rolls it back.
///
/// `update_agreement` is conditional on the stored version matching
/// `expected`; a mismatch fails with `StoreError::VersionConflict`. Inserts on
/// unique keys (agreement creation key and legacy record id, one order
/// snapshot per agreement, ledger operation id) fail with
/// `StoreError::DuplicateKey`.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// The transaction type used by this backend.
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx>;

    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    async fn abort(&self, tx: Self::Tx) -> Result<()>;

    // Agreements

    /// Inserts a new agreement. Its version must already be set to the first version.
    ///
    /// Fails with `OpenAgreementExists` if the agreement is not terminal and
    /// its conversation already has a non-terminal agreement.
    async fn insert_agreement(&self, tx: &mut Self::Tx, agreement: &Agreement) -> Result<()>;

    /// Overwrites an agreement if the stored version equals `expected`.
    ///
    /// The one-open-agreement-per-conversation rule of `insert_agreement` applies.
    async fn update_agreement(
        &self,
        tx: &mut Self::Tx,
        agreement: &Agreement,
        expected: Version,
    ) -> Result<()>;

    async fn get_agreement(&self, tx: &mut Self::Tx, id: AgreementId)
    -> Result<Option<Agreement>>;

    async fn find_agreement_by_creation_key(
        &self,
        tx: &mut Self::Tx,
        key: &str,
    ) -> Result<Option<Agreement>>;

    async fn find_agreement_by_legacy_record(
        &self,
        tx: &mut Self::Tx,
        legacy_record_id: LegacyRecordId,
    ) -> Result<Option<Agreement>>;

    /// Returns the conversation's agreements, oldest first.
    async fn list_agreements_for_conversation(
        &self,
        tx: &mut Self::Tx,
        conversation_id: ConversationId,
    ) -> Result<Vec<Agreement>>;

    /// Returns up to `limit` agreements that have no order snapshot, oldest first.
    async fn list_agreements_without_snapshot(
        &self,
        tx: &mut Self::Tx,
        limit: usize,
    ) -> Result<Vec<Agreement>>;

    /// Returns up to `limit` agreements whose snapshot lags behind them, oldest first.
    ///
    /// A snapshot lags when it was synced from an older agreement version or
    /// shows a different status.
    async fn list_agreements_with_stale_snapshot(
        &self,
        tx: &mut Self::Tx,
        limit: usize,
    ) -> Result<Vec<Agreement>>;

    // Conversations

    async fn upsert_conversation(&self, tx: &mut Self::Tx, conversation: &Conversation)
    -> Result<()>;

    async fn get_conversation(
        &self,
        tx: &mut Self::Tx,
        id: ConversationId,
    ) -> Result<Option<Conversation>>;

    /// Returns up to `limit` accepted, unfinalized conversations with no agreement.
    async fn list_accepted_conversations_without_agreement(
        &self,
        tx: &mut Self::Tx,
        limit: usize,
    ) -> Result<Vec<Conversation>>;

    // Legacy records

    async fn upsert_legacy_record(&self, tx: &mut Self::Tx, record: &LegacyRecord) -> Result<()>;

    async fn get_legacy_record(
        &self,
        tx: &mut Self::Tx,
        id: LegacyRecordId,
    ) -> Result<Option<LegacyRecord>>;

    async fn list_legacy_records_for_conversation(
        &self,
        tx: &mut Self::Tx,
        conversation_id: ConversationId,
    ) -> Result<Vec<LegacyRecord>>;

    /// Returns accepted records whose acceptance (or creation) time is at or after `since`.
    async fn list_accepted_legacy_records_since(
        &self,
        tx: &mut Self::Tx,
        since: DateTime<Utc>,
    ) -> Result<Vec<LegacyRecord>>;

    async fn list_all_legacy_records(&self, tx: &mut Self::Tx) -> Result<Vec<LegacyRecord>>;

    // Order snapshots

    async fn insert_order_snapshot(&self, tx: &mut Self::Tx, snapshot: &OrderSnapshot)
    -> Result<()>;

    /// Overwrites a snapshot unless the stored one was synced from a newer
    /// agreement version, in which case the write is dropped.
    async fn update_order_snapshot(&self, tx: &mut Self::Tx, snapshot: &OrderSnapshot)
    -> Result<()>;

    async fn get_order_snapshot(
        &self,
        tx: &mut Self::Tx,
        agreement_id: AgreementId,
    ) -> Result<Option<OrderSnapshot>>;

    // Ledger and wallets

    /// Reads a wallet and locks it until the transaction ends.
    async fn get_wallet_for_update(
        &self,
        tx: &mut Self::Tx,
        user_id: UserId,
    ) -> Result<Option<Wallet>>;

    async fn upsert_wallet(&self, tx: &mut Self::Tx, wallet: &Wallet) -> Result<()>;

    async fn insert_ledger_entry(&self, tx: &mut Self::Tx, entry: &LedgerEntry) -> Result<()>;

    async fn update_ledger_entry(&self, tx: &mut Self::Tx, entry: &LedgerEntry) -> Result<()>;

    async fn find_ledger_entry_by_operation(
        &self,
        tx: &mut Self::Tx,
        operation_id: &str,
    ) -> Result<Option<LedgerEntry>>;

    /// Returns the agreement's escrow hold entry that was not refunded yet.
    async fn find_unrefunded_escrow_hold(
        &self,
        tx: &mut Self::Tx,
        agreement_id: AgreementId,
    ) -> Result<Option<LedgerEntry>>;

    // Retry tasks

    async fn insert_task(&self, tx: &mut Self::Tx, task: &RetryTask) -> Result<()>;

    /// Atomically claims the oldest due task.
    ///
    /// The claimed task is returned with status `processing` and its attempt
    /// counter incremented. Concurrent callers never receive the same task.
    async fn claim_due_task(
        &self,
        tx: &mut Self::Tx,
        now: DateTime<Utc>,
    ) -> Result<Option<RetryTask>>;

    async fn update_task(&self, tx: &mut Self::Tx, task: &RetryTask) -> Result<()>;

    async fn get_task(&self, tx: &mut Self::Tx, id: TaskId) -> Result<Option<RetryTask>>;

    // Reporting

    async fn collection_counts(&self, tx: &mut Self::Tx) -> Result<CollectionCounts>;
}
