//! Integration tests for the sweep, price repair and retry queue drain.

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{ConversationId, ProposalId, UserId};
use domain::{
    AgreementStatus, Conversation, LegacyPrice, LegacyRecord, Money, PartySnapshot,
    ProposalSnapshot, TaskStatus, TaskType,
};
use lifecycle::{ActionContext, AgreementService, EscrowService, InMemoryNotifier};
use reconciliation::{HandlerRegistry, ReconciliationSweep, RetryQueue, SweepConfig};
use store::{InMemoryStore, Store};

struct TestHarness {
    store: InMemoryStore,
    service: AgreementService<InMemoryStore>,
    queue: RetryQueue<InMemoryStore>,
    sweep: ReconciliationSweep<InMemoryStore>,
}

impl TestHarness {
    fn new() -> Self {
        let store = InMemoryStore::new();
        let service = AgreementService::new(store.clone(), Arc::new(InMemoryNotifier::new()));
        let queue = RetryQueue::new(store.clone(), HandlerRegistry::with_defaults(service.clone()));
        let sweep = ReconciliationSweep::new(service.clone(), queue.clone(), SweepConfig::default());
        Self {
            store,
            service,
            queue,
            sweep,
        }
    }

    async fn store_legacy(&self, price: LegacyPrice) -> LegacyRecord {
        let record = LegacyRecord::accepted(
            ConversationId::new(),
            PartySnapshot::new(UserId::new(), "client"),
            PartySnapshot::new(UserId::new(), "booster"),
            price,
            Utc::now(),
        );
        let mut tx = self.store.begin().await.unwrap();
        self.store.upsert_legacy_record(&mut tx, &record).await.unwrap();
        self.store.commit(tx).await.unwrap();
        record
    }

    async fn accepted_conversation(&self) -> Conversation {
        let mut conversation = Conversation::open(UserId::new(), UserId::new(), Utc::now());
        conversation.accept(
            ProposalId::new(),
            ProposalSnapshot {
                game: "Dota 2".into(),
                category: "calibration".into(),
                price: Money::from_dollars(40),
                estimated_time: "1 day".into(),
            },
            Utc::now(),
        );
        let mut tx = self.store.begin().await.unwrap();
        self.store
            .upsert_conversation(&mut tx, &conversation)
            .await
            .unwrap();
        self.store.commit(tx).await.unwrap();
        conversation
    }
}

#[tokio::test]
async fn test_sweep_migrates_locale_priced_legacy_record() {
    let h = TestHarness::new();
    let record = h.store_legacy(LegacyPrice::Text("1.200,50".into())).await;

    let report = h.sweep.run_full_sweep().await.unwrap();
    assert_eq!(report.legacy_records_scanned, 1);
    assert_eq!(report.legacy_tasks_enqueued, 1);

    let drained = h.queue.process_pending_tasks(10).await.unwrap();
    assert_eq!(drained.completed, 1);

    let mut tx = h.store.begin().await.unwrap();
    let agreement = h
        .store
        .find_agreement_by_legacy_record(&mut tx, record.id)
        .await
        .unwrap()
        .unwrap();
    let snapshot = h
        .store
        .get_order_snapshot(&mut tx, agreement.id())
        .await
        .unwrap()
        .unwrap();
    drop(tx);

    assert_eq!(agreement.proposal().price, Money::from_cents(120050));
    assert_eq!(snapshot.price, Money::from_cents(120050));

    // Nothing left to repair.
    let again = h.sweep.run_full_sweep().await.unwrap();
    assert_eq!(again.drift(), 0);
    assert!(h.sweep.consistency_check().await.unwrap().consistent);
}

#[tokio::test]
async fn test_repair_by_price_matches_within_epsilon() {
    let h = TestHarness::new();
    let target = h.store_legacy(LegacyPrice::Text("1.200,50".into())).await;
    h.store_legacy(LegacyPrice::Number(1200.60)).await;
    h.store_legacy(LegacyPrice::Text("not a price".into())).await;

    let report = h
        .sweep
        .repair_by_price(Money::from_cents(120050), Money::from_cents(1))
        .await
        .unwrap();

    assert_eq!(report.scanned, 3);
    assert_eq!(report.matches.len(), 1);
    let repair = &report.matches[0];
    assert_eq!(repair.legacy_record_id, target.id);
    assert!(repair.repaired);
    assert!(repair.order_snapshot_exists);
    assert!(repair.error.is_none());

    let agreement = h.service.load(repair.agreement_id.unwrap()).await.unwrap();
    assert_eq!(agreement.proposal().price, Money::from_cents(120050));

    // A second run finds the record already repaired.
    let report = h
        .sweep
        .repair_by_price(Money::from_cents(120050), Money::from_cents(1))
        .await
        .unwrap();
    assert!(!report.matches[0].repaired);
    assert_eq!(report.matches[0].agreement_id, repair.agreement_id);
}

#[tokio::test]
async fn test_sweep_ignores_records_outside_window() {
    let h = TestHarness::new();
    let record = LegacyRecord::accepted(
        ConversationId::new(),
        PartySnapshot::new(UserId::new(), "client"),
        PartySnapshot::new(UserId::new(), "booster"),
        LegacyPrice::Number(30.0),
        Utc::now() - Duration::days(30),
    );
    let mut tx = h.store.begin().await.unwrap();
    h.store.upsert_legacy_record(&mut tx, &record).await.unwrap();
    h.store.commit(tx).await.unwrap();

    let report = h.sweep.run_full_sweep().await.unwrap();
    assert_eq!(report.legacy_records_scanned, 0);
    assert!(h.store.tasks().await.is_empty());
}

#[tokio::test]
async fn test_sweep_creates_agreement_for_accepted_conversation() {
    let h = TestHarness::new();
    let conversation = h.accepted_conversation().await;

    let report = h.sweep.run_full_sweep().await.unwrap();
    assert_eq!(report.conversation_tasks_enqueued, 1);
    h.queue.process_pending_tasks(10).await.unwrap();

    let mut tx = h.store.begin().await.unwrap();
    let stored = h
        .store
        .get_conversation(&mut tx, conversation.id)
        .await
        .unwrap()
        .unwrap();
    drop(tx);

    let agreement = h.service.load(stored.agreement_id.unwrap()).await.unwrap();
    assert_eq!(agreement.status(), AgreementStatus::Pending);
    assert_eq!(agreement.conversation_id(), conversation.id);
    assert!(h.sweep.consistency_check().await.unwrap().conversations_linked);
}

#[tokio::test]
async fn test_sweep_projects_agreement_missing_snapshot() {
    let h = TestHarness::new();
    let conversation = h.accepted_conversation().await;

    h.store.set_fail_on_snapshot_write(true);
    let created = h
        .service
        .create_from_conversation(conversation.id)
        .await
        .unwrap();
    h.store.set_fail_on_snapshot_write(false);

    let consistency = h.sweep.consistency_check().await.unwrap();
    assert!(!consistency.agreements_match_snapshots);
    assert_eq!(consistency.counts.pending_tasks, 1);

    let report = h.sweep.run_full_sweep().await.unwrap();
    assert_eq!(report.snapshots_created, 1);
    assert_eq!(report.snapshot_failures, 0);

    // The fallback task scheduled at creation now finds the snapshot and syncs it.
    let drained = h.queue.process_pending_tasks(10).await.unwrap();
    assert_eq!(drained.completed, 1);

    let mut tx = h.store.begin().await.unwrap();
    let snapshot = h
        .store
        .get_order_snapshot(&mut tx, created.agreement.id())
        .await
        .unwrap();
    drop(tx);
    assert!(snapshot.is_some());
    assert!(h.sweep.consistency_check().await.unwrap().consistent);
}

#[tokio::test]
async fn test_unparseable_legacy_price_fails_task_with_error() {
    let h = TestHarness::new();
    h.store_legacy(LegacyPrice::Text("ask me".into())).await;

    h.sweep.run_full_sweep().await.unwrap();
    let drained = h.queue.process_pending_tasks(10).await.unwrap();
    assert_eq!(drained.rescheduled, 1);

    let tasks = h.store.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, TaskType::CreateAgreementFromLegacy);
    assert_eq!(tasks[0].status, TaskStatus::Pending);
    assert!(tasks[0].error.as_deref().unwrap().contains("ask me"));
}

#[tokio::test]
async fn test_concurrent_drains_run_each_task_once() {
    let h = TestHarness::new();
    for _ in 0..6 {
        h.store_legacy(LegacyPrice::Number(25.0)).await;
    }
    h.sweep.run_full_sweep().await.unwrap();

    let reports = futures_util::future::join_all(
        (0..3).map(|_| {
            let queue = h.queue.clone();
            async move { queue.process_pending_tasks(10).await.unwrap() }
        }),
    )
    .await;

    let completed: usize = reports.iter().map(|r| r.completed).sum();
    let claimed: usize = reports.iter().map(|r| r.claimed).sum();
    assert_eq!(claimed, 6);
    assert_eq!(completed, 6);
    assert_eq!(h.store.agreement_count().await, 6);
    assert!(
        h.store
            .tasks()
            .await
            .iter()
            .all(|t| t.status == TaskStatus::Completed && t.attempts == 1)
    );
}

#[tokio::test]
async fn test_cancelled_conversation_is_not_migrated_again() {
    let h = TestHarness::new();
    let conversation = h.accepted_conversation().await;
    let created = h
        .service
        .create_from_conversation(conversation.id)
        .await
        .unwrap();
    let record = LegacyRecord::accepted(
        conversation.id,
        PartySnapshot::new(UserId::new(), "client"),
        PartySnapshot::new(UserId::new(), "booster"),
        LegacyPrice::Number(40.0),
        Utc::now(),
    );
    let mut tx = h.store.begin().await.unwrap();
    h.store.upsert_legacy_record(&mut tx, &record).await.unwrap();
    h.store.commit(tx).await.unwrap();

    EscrowService::new(h.service.clone())
        .cancel_conversation(conversation.id, "admin", "no show")
        .await
        .unwrap();

    let report = h.sweep.run_full_sweep().await.unwrap();
    assert_eq!(report.legacy_records_scanned, 1);
    assert_eq!(report.legacy_tasks_enqueued, 0);
    h.queue.process_pending_tasks(10).await.unwrap();

    assert_eq!(h.store.agreement_count().await, 1);
    let agreement = h.service.load(created.agreement.id()).await.unwrap();
    assert_eq!(agreement.status(), AgreementStatus::Cancelled);
    assert_eq!(agreement.legacy_record_id(), Some(record.id));
    assert!(h.sweep.consistency_check().await.unwrap().consistent);
}

#[tokio::test]
async fn test_sweep_resyncs_snapshot_left_behind() {
    let h = TestHarness::new();
    let conversation = h.accepted_conversation().await;
    let created = h
        .service
        .create_from_conversation(conversation.id)
        .await
        .unwrap();

    h.store.set_fail_on_snapshot_write(true);
    let activated = h
        .service
        .activate(created.agreement.id(), ActionContext::new("booster"))
        .await
        .unwrap();
    h.store.set_fail_on_snapshot_write(false);

    let mut tx = h.store.begin().await.unwrap();
    let stale = h
        .store
        .get_order_snapshot(&mut tx, created.agreement.id())
        .await
        .unwrap()
        .unwrap();
    drop(tx);
    assert_eq!(stale.status, AgreementStatus::Pending);

    let report = h.sweep.run_full_sweep().await.unwrap();
    assert_eq!(report.snapshots_resynced, 1);
    assert_eq!(report.drift(), 1);

    let mut tx = h.store.begin().await.unwrap();
    let snapshot = h
        .store
        .get_order_snapshot(&mut tx, created.agreement.id())
        .await
        .unwrap()
        .unwrap();
    drop(tx);
    assert_eq!(snapshot.status, AgreementStatus::Active);
    assert!(snapshot.is_in_sync_with(&activated.agreement));

    assert_eq!(h.sweep.run_full_sweep().await.unwrap().snapshots_resynced, 0);
}
