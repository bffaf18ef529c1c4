use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AgreementId, ConversationId, LedgerEntryId, LegacyRecordId, TaskId, UserId, Version};
use domain::{
    Agreement, Conversation, LedgerEntry, LedgerReason, LegacyRecord, OrderSnapshot, RetryTask,
    TaskStatus, Wallet,
};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::{CollectionCounts, Result, Store, StoreError};

#[derive(Debug, Clone, Default)]
struct StoreState {
    agreements: HashMap<AgreementId, Agreement>,
    conversations: HashMap<ConversationId, Conversation>,
    legacy_records: HashMap<LegacyRecordId, LegacyRecord>,
    order_snapshots: HashMap<AgreementId, OrderSnapshot>,
    ledger: HashMap<LedgerEntryId, LedgerEntry>,
    wallets: HashMap<UserId, Wallet>,
    tasks: HashMap<TaskId, RetryTask>,
}

#[derive(Debug, Default)]
struct FailureHooks {
    ledger_insert: AtomicBool,
    snapshot_write: AtomicBool,
    task_update: AtomicBool,
}

/// A transaction over the in-memory store.
///
/// Holds the store's write lock for its whole lifetime and works on a copy of
/// the state; `commit` swaps the copy in, dropping it discards the copy.
pub struct MemoryTx {
    guard: OwnedRwLockWriteGuard<StoreState>,
    working: StoreState,
}

/// In-memory store implementation for tests and single-process deployments.
///
/// Transactions are serialized behind one async write lock.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<StoreState>>,
    hooks: Arc<FailureHooks>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every ledger insert fail until switched off.
    pub fn set_fail_on_ledger_insert(&self, fail: bool) {
        self.hooks.ledger_insert.store(fail, Ordering::SeqCst);
    }

    /// Makes every order snapshot insert or update fail until switched off.
    pub fn set_fail_on_snapshot_write(&self, fail: bool) {
        self.hooks.snapshot_write.store(fail, Ordering::SeqCst);
    }

    /// Makes every retry task update fail until switched off. Claims still succeed.
    pub fn set_fail_on_task_update(&self, fail: bool) {
        self.hooks.task_update.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of stored agreements.
    pub async fn agreement_count(&self) -> usize {
        self.state.read().await.agreements.len()
    }

    /// Returns every retry task, oldest first.
    pub async fn tasks(&self) -> Vec<RetryTask> {
        let state = self.state.read().await;
        let mut tasks: Vec<_> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Returns every ledger entry of a user, oldest first.
    pub async fn ledger_entries_for(&self, user_id: UserId) -> Vec<LedgerEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<_> = state
            .ledger
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    fn check_open_agreement(state: &StoreState, agreement: &Agreement) -> Result<()> {
        if agreement.is_terminal() {
            return Ok(());
        }
        let conflict = state.agreements.values().any(|a| {
            a.id() != agreement.id()
                && a.conversation_id() == agreement.conversation_id()
                && !a.is_terminal()
        });
        if conflict {
            return Err(StoreError::OpenAgreementExists(agreement.conversation_id()));
        }
        Ok(())
    }

    fn check_snapshot_hook(&self) -> Result<()> {
        if self.hooks.snapshot_write.load(Ordering::SeqCst) {
            return Err(StoreError::Simulated("order snapshot write"));
        }
        Ok(())
    }
}

fn sorted_by<T, K: Ord>(mut items: Vec<T>, key: impl FnMut(&T) -> K) -> Vec<T> {
    items.sort_by_key(key);
    items
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx> {
        let guard = self.state.clone().write_owned().await;
        let working = guard.clone();
        Ok(MemoryTx { guard, working })
    }

    async fn commit(&self, tx: MemoryTx) -> Result<()> {
        let MemoryTx { mut guard, working } = tx;
        *guard = working;
        Ok(())
    }

    async fn abort(&self, tx: MemoryTx) -> Result<()> {
        drop(tx);
        Ok(())
    }

    async fn insert_agreement(&self, tx: &mut MemoryTx, agreement: &Agreement) -> Result<()> {
        let state = &mut tx.working;
        if state.agreements.contains_key(&agreement.id()) {
            return Err(StoreError::DuplicateKey {
                entity: "agreement",
                key: agreement.id().to_string(),
            });
        }
        for existing in state.agreements.values() {
            if let Some(key) = agreement.creation_key()
                && existing.creation_key() == Some(key)
            {
                return Err(StoreError::DuplicateKey {
                    entity: "agreement",
                    key: key.to_string(),
                });
            }
            if let Some(legacy_id) = agreement.legacy_record_id()
                && existing.legacy_record_id() == Some(legacy_id)
            {
                return Err(StoreError::DuplicateKey {
                    entity: "agreement",
                    key: legacy_id.to_string(),
                });
            }
        }
        Self::check_open_agreement(state, agreement)?;
        state.agreements.insert(agreement.id(), agreement.clone());
        Ok(())
    }

    async fn update_agreement(
        &self,
        tx: &mut MemoryTx,
        agreement: &Agreement,
        expected: Version,
    ) -> Result<()> {
        let state = &mut tx.working;
        if let Some(legacy_id) = agreement.legacy_record_id()
            && state
                .agreements
                .values()
                .any(|a| a.id() != agreement.id() && a.legacy_record_id() == Some(legacy_id))
        {
            return Err(StoreError::DuplicateKey {
                entity: "agreement",
                key: legacy_id.to_string(),
            });
        }

        Self::check_open_agreement(state, agreement)?;

        let stored = state
            .agreements
            .get_mut(&agreement.id())
            .ok_or_else(|| StoreError::NotFound {
                entity: "agreement",
                id: agreement.id().to_string(),
            })?;
        if stored.version() != expected {
            return Err(StoreError::VersionConflict {
                entity: "agreement",
                id: agreement.id().to_string(),
                expected,
                actual: stored.version(),
            });
        }
        *stored = agreement.clone();
        Ok(())
    }

    async fn get_agreement(&self, tx: &mut MemoryTx, id: AgreementId) -> Result<Option<Agreement>> {
        Ok(tx.working.agreements.get(&id).cloned())
    }

    async fn find_agreement_by_creation_key(
        &self,
        tx: &mut MemoryTx,
        key: &str,
    ) -> Result<Option<Agreement>> {
        Ok(tx
            .working
            .agreements
            .values()
            .find(|a| a.creation_key() == Some(key))
            .cloned())
    }

    async fn find_agreement_by_legacy_record(
        &self,
        tx: &mut MemoryTx,
        legacy_record_id: LegacyRecordId,
    ) -> Result<Option<Agreement>> {
        Ok(tx
            .working
            .agreements
            .values()
            .find(|a| a.legacy_record_id() == Some(legacy_record_id))
            .cloned())
    }

    async fn list_agreements_for_conversation(
        &self,
        tx: &mut MemoryTx,
        conversation_id: ConversationId,
    ) -> Result<Vec<Agreement>> {
        let agreements: Vec<Agreement> = tx
            .working
            .agreements
            .values()
            .filter(|a| a.conversation_id() == conversation_id)
            .cloned()
            .collect();
        Ok(sorted_by(agreements, |a| a.created_at()))
    }

    async fn list_agreements_without_snapshot(
        &self,
        tx: &mut MemoryTx,
        limit: usize,
    ) -> Result<Vec<Agreement>> {
        let state = &tx.working;
        let agreements: Vec<Agreement> = state
            .agreements
            .values()
            .filter(|a| !state.order_snapshots.contains_key(&a.id()))
            .cloned()
            .collect();
        let mut agreements = sorted_by(agreements, |a| a.created_at());
        agreements.truncate(limit);
        Ok(agreements)
    }

    async fn list_agreements_with_stale_snapshot(
        &self,
        tx: &mut MemoryTx,
        limit: usize,
    ) -> Result<Vec<Agreement>> {
        let state = &tx.working;
        let agreements: Vec<Agreement> = state
            .agreements
            .values()
            .filter(|a| {
                state
                    .order_snapshots
                    .get(&a.id())
                    .is_some_and(|s| !s.is_in_sync_with(a))
            })
            .cloned()
            .collect();
        let mut agreements = sorted_by(agreements, |a| a.created_at());
        agreements.truncate(limit);
        Ok(agreements)
    }

    async fn upsert_conversation(
        &self,
        tx: &mut MemoryTx,
        conversation: &Conversation,
    ) -> Result<()> {
        tx.working
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn get_conversation(
        &self,
        tx: &mut MemoryTx,
        id: ConversationId,
    ) -> Result<Option<Conversation>> {
        Ok(tx.working.conversations.get(&id).cloned())
    }

    async fn list_accepted_conversations_without_agreement(
        &self,
        tx: &mut MemoryTx,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        let conversations: Vec<Conversation> = tx
            .working
            .conversations
            .values()
            .filter(|c| c.is_accepted() && c.agreement_id.is_none())
            .cloned()
            .collect();
        let mut conversations = sorted_by(conversations, |c| c.created_at);
        conversations.truncate(limit);
        Ok(conversations)
    }

    async fn upsert_legacy_record(&self, tx: &mut MemoryTx, record: &LegacyRecord) -> Result<()> {
        tx.working.legacy_records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_legacy_record(
        &self,
        tx: &mut MemoryTx,
        id: LegacyRecordId,
    ) -> Result<Option<LegacyRecord>> {
        Ok(tx.working.legacy_records.get(&id).cloned())
    }

    async fn list_legacy_records_for_conversation(
        &self,
        tx: &mut MemoryTx,
        conversation_id: ConversationId,
    ) -> Result<Vec<LegacyRecord>> {
        let records: Vec<LegacyRecord> = tx
            .working
            .legacy_records
            .values()
            .filter(|r| r.conversation_id == conversation_id)
            .cloned()
            .collect();
        Ok(sorted_by(records, |r| r.created_at))
    }

    async fn list_accepted_legacy_records_since(
        &self,
        tx: &mut MemoryTx,
        since: DateTime<Utc>,
    ) -> Result<Vec<LegacyRecord>> {
        let records: Vec<LegacyRecord> = tx
            .working
            .legacy_records
            .values()
            .filter(|r| r.is_accepted() && r.accepted_or_created_at() >= since)
            .cloned()
            .collect();
        Ok(sorted_by(records, |r| r.accepted_or_created_at()))
    }

    async fn list_all_legacy_records(&self, tx: &mut MemoryTx) -> Result<Vec<LegacyRecord>> {
        let records: Vec<LegacyRecord> = tx.working.legacy_records.values().cloned().collect();
        Ok(sorted_by(records, |r| r.created_at))
    }

    async fn insert_order_snapshot(
        &self,
        tx: &mut MemoryTx,
        snapshot: &OrderSnapshot,
    ) -> Result<()> {
        self.check_snapshot_hook()?;
        let snapshots = &mut tx.working.order_snapshots;
        if snapshots.contains_key(&snapshot.agreement_id) {
            return Err(StoreError::DuplicateKey {
                entity: "order_snapshot",
                key: snapshot.agreement_id.to_string(),
            });
        }
        snapshots.insert(snapshot.agreement_id, snapshot.clone());
        Ok(())
    }

    async fn update_order_snapshot(
        &self,
        tx: &mut MemoryTx,
        snapshot: &OrderSnapshot,
    ) -> Result<()> {
        self.check_snapshot_hook()?;
        let stored = tx
            .working
            .order_snapshots
            .get_mut(&snapshot.agreement_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "order_snapshot",
                id: snapshot.agreement_id.to_string(),
            })?;
        if stored.agreement_version > snapshot.agreement_version {
            return Ok(());
        }
        *stored = snapshot.clone();
        Ok(())
    }

    async fn get_order_snapshot(
        &self,
        tx: &mut MemoryTx,
        agreement_id: AgreementId,
    ) -> Result<Option<OrderSnapshot>> {
        Ok(tx.working.order_snapshots.get(&agreement_id).cloned())
    }

    async fn get_wallet_for_update(
        &self,
        tx: &mut MemoryTx,
        user_id: UserId,
    ) -> Result<Option<Wallet>> {
        Ok(tx.working.wallets.get(&user_id).cloned())
    }

    async fn upsert_wallet(&self, tx: &mut MemoryTx, wallet: &Wallet) -> Result<()> {
        tx.working.wallets.insert(wallet.user_id, wallet.clone());
        Ok(())
    }

    async fn insert_ledger_entry(&self, tx: &mut MemoryTx, entry: &LedgerEntry) -> Result<()> {
        if self.hooks.ledger_insert.load(Ordering::SeqCst) {
            return Err(StoreError::Simulated("ledger insert"));
        }
        let ledger = &mut tx.working.ledger;
        if ledger.values().any(|e| e.operation_id == entry.operation_id) {
            return Err(StoreError::DuplicateKey {
                entity: "ledger_entry",
                key: entry.operation_id.clone(),
            });
        }
        ledger.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn update_ledger_entry(&self, tx: &mut MemoryTx, entry: &LedgerEntry) -> Result<()> {
        let stored = tx
            .working
            .ledger
            .get_mut(&entry.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "ledger_entry",
                id: entry.id.to_string(),
            })?;
        *stored = entry.clone();
        Ok(())
    }

    async fn find_ledger_entry_by_operation(
        &self,
        tx: &mut MemoryTx,
        operation_id: &str,
    ) -> Result<Option<LedgerEntry>> {
        Ok(tx
            .working
            .ledger
            .values()
            .find(|e| e.operation_id == operation_id)
            .cloned())
    }

    async fn find_unrefunded_escrow_hold(
        &self,
        tx: &mut MemoryTx,
        agreement_id: AgreementId,
    ) -> Result<Option<LedgerEntry>> {
        Ok(tx
            .working
            .ledger
            .values()
            .filter(|e| {
                e.reason == LedgerReason::EscrowHold
                    && e.agreement_id == Some(agreement_id)
                    && !e.is_refunded()
            })
            .min_by_key(|e| e.created_at)
            .cloned())
    }

    async fn insert_task(&self, tx: &mut MemoryTx, task: &RetryTask) -> Result<()> {
        tx.working.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn claim_due_task(
        &self,
        tx: &mut MemoryTx,
        now: DateTime<Utc>,
    ) -> Result<Option<RetryTask>> {
        let next = tx
            .working
            .tasks
            .values_mut()
            .filter(|t| t.is_due(now))
            .min_by_key(|t| (t.next_attempt, t.created_at));
        Ok(next.map(|task| {
            task.claim(now);
            task.clone()
        }))
    }

    async fn update_task(&self, tx: &mut MemoryTx, task: &RetryTask) -> Result<()> {
        if self.hooks.task_update.load(Ordering::SeqCst) {
            return Err(StoreError::Simulated("retry task update"));
        }
        let stored = tx
            .working
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "retry_task",
                id: task.id.to_string(),
            })?;
        *stored = task.clone();
        Ok(())
    }

    async fn get_task(&self, tx: &mut MemoryTx, id: TaskId) -> Result<Option<RetryTask>> {
        Ok(tx.working.tasks.get(&id).cloned())
    }

    async fn collection_counts(&self, tx: &mut MemoryTx) -> Result<CollectionCounts> {
        let state = &tx.working;
        let count = |n: usize| n as u64;
        let accepted = state.conversations.values().filter(|c| c.is_accepted());
        Ok(CollectionCounts {
            agreements: count(state.agreements.len()),
            agreements_with_legacy_record: count(
                state
                    .agreements
                    .values()
                    .filter(|a| a.legacy_record_id().is_some())
                    .count(),
            ),
            order_snapshots: count(state.order_snapshots.len()),
            legacy_records: count(state.legacy_records.len()),
            accepted_legacy_records: count(
                state.legacy_records.values().filter(|r| r.is_accepted()).count(),
            ),
            accepted_conversations: count(accepted.clone().count()),
            accepted_conversations_without_agreement: count(
                accepted.filter(|c| c.agreement_id.is_none()).count(),
            ),
            pending_tasks: count(
                state
                    .tasks
                    .values()
                    .filter(|t| t.status == TaskStatus::Pending)
                    .count(),
            ),
            failed_tasks: count(
                state
                    .tasks
                    .values()
                    .filter(|t| t.status == TaskStatus::Failed)
                    .count(),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use domain::{Money, NewAgreement, Parties, PartySnapshot, ProposalSnapshot, TaskType};

    fn agreement(creation_key: Option<&str>) -> Agreement {
        agreement_in(ConversationId::new(), creation_key)
    }

    fn agreement_in(conversation_id: ConversationId, creation_key: Option<&str>) -> Agreement {
        let mut agreement = Agreement::create(
            NewAgreement {
                conversation_id,
                proposal_id: None,
                proposal: ProposalSnapshot {
                    price: Money::from_dollars(10),
                    ..Default::default()
                },
                parties: Parties {
                    client: PartySnapshot::new(UserId::new(), "c"),
                    booster: PartySnapshot::new(UserId::new(), "b"),
                },
                created_by: "c".into(),
                creation_key: creation_key.map(str::to_string),
            },
            Utc::now(),
        )
        .unwrap();
        agreement.set_version(Version::first());
        agreement
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let store = InMemoryStore::new();
        let agreement = agreement(None);

        let mut tx = store.begin().await.unwrap();
        store.insert_agreement(&mut tx, &agreement).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let loaded = store.get_agreement(&mut tx, agreement.id()).await.unwrap();
        assert_eq!(loaded, Some(agreement));
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = InMemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            store
                .insert_agreement(&mut tx, &agreement(None))
                .await
                .unwrap();
        }
        assert_eq!(store.agreement_count().await, 0);

        let tx = store.begin().await.unwrap();
        store.abort(tx).await.unwrap();
        assert_eq!(store.agreement_count().await, 0);
    }

    #[tokio::test]
    async fn test_update_checks_version() {
        let store = InMemoryStore::new();
        let mut agreement = agreement(None);

        let mut tx = store.begin().await.unwrap();
        store.insert_agreement(&mut tx, &agreement).await.unwrap();

        agreement.set_version(Version::new(2));
        store
            .update_agreement(&mut tx, &agreement, Version::first())
            .await
            .unwrap();

        let stale = store
            .update_agreement(&mut tx, &agreement, Version::first())
            .await;
        assert!(matches!(
            stale,
            Err(StoreError::VersionConflict { actual, .. }) if actual == Version::new(2)
        ));
    }

    #[tokio::test]
    async fn test_creation_key_is_unique() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        store
            .insert_agreement(&mut tx, &agreement(Some("k1")))
            .await
            .unwrap();
        let duplicate = store.insert_agreement(&mut tx, &agreement(Some("k1"))).await;
        assert!(duplicate.unwrap_err().is_duplicate());
    }

    #[tokio::test]
    async fn test_one_open_agreement_per_conversation() {
        let store = InMemoryStore::new();
        let open = agreement(None);
        let second = agreement_in(open.conversation_id(), None);

        let mut tx = store.begin().await.unwrap();
        store.insert_agreement(&mut tx, &open).await.unwrap();
        let result = store.insert_agreement(&mut tx, &second).await;
        assert!(matches!(
            result,
            Err(StoreError::OpenAgreementExists(id)) if id == open.conversation_id()
        ));

        let mut cancelled = open.clone();
        cancelled.cancel("admin", "test", None, Utc::now()).unwrap();
        cancelled.set_version(Version::new(2));
        store
            .update_agreement(&mut tx, &cancelled, Version::first())
            .await
            .unwrap();
        store.insert_agreement(&mut tx, &second).await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_update_never_goes_back_a_version() {
        let store = InMemoryStore::new();
        let mut agreement = agreement(None);
        let older = OrderSnapshot::project(&agreement, UserId::new(), UserId::new());
        agreement.activate("b", None, Utc::now()).unwrap();
        agreement.set_version(Version::new(2));
        let mut newer = older.clone();
        newer.sync(&agreement);

        let mut tx = store.begin().await.unwrap();
        store.insert_agreement(&mut tx, &agreement).await.unwrap();
        store.insert_order_snapshot(&mut tx, &older).await.unwrap();
        store.update_order_snapshot(&mut tx, &newer).await.unwrap();
        store.update_order_snapshot(&mut tx, &older).await.unwrap();

        let stored = store
            .get_order_snapshot(&mut tx, agreement.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.agreement_version, Version::new(2));
        assert!(
            store
                .list_agreements_with_stale_snapshot(&mut tx, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_claim_due_task_orders_and_marks_processing() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let later = RetryTask::new(
            TaskType::SyncOrderSnapshot,
            serde_json::json!({}),
            Duration::minutes(10),
            5,
            now,
        );
        let due = RetryTask::new(
            TaskType::SyncOrderSnapshot,
            serde_json::json!({}),
            Duration::zero(),
            5,
            now,
        );

        let mut tx = store.begin().await.unwrap();
        store.insert_task(&mut tx, &later).await.unwrap();
        store.insert_task(&mut tx, &due).await.unwrap();

        let claimed = store.claim_due_task(&mut tx, now).await.unwrap().unwrap();
        assert_eq!(claimed.id, due.id);
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(claimed.attempts, 1);

        assert!(store.claim_due_task(&mut tx, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_write_hook() {
        let store = InMemoryStore::new();
        let agreement = agreement(None);
        let snapshot = OrderSnapshot::project(&agreement, UserId::new(), UserId::new());
        store.set_fail_on_snapshot_write(true);

        let mut tx = store.begin().await.unwrap();
        let result = store.insert_order_snapshot(&mut tx, &snapshot).await;
        assert!(matches!(result, Err(StoreError::Simulated(_))));

        store.set_fail_on_snapshot_write(false);
        store
            .insert_order_snapshot(&mut tx, &snapshot)
            .await
            .unwrap();
    }
}
