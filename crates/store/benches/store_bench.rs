use chrono::{Duration, Utc};
use common::{ConversationId, UserId, Version};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{
    Agreement, Money, NewAgreement, Parties, PartySnapshot, ProposalSnapshot, RetryTask, TaskType,
};
use store::{InMemoryStore, Store};

fn make_agreement() -> Agreement {
    let mut agreement = Agreement::create(
        NewAgreement {
            conversation_id: ConversationId::new(),
            proposal_id: None,
            proposal: ProposalSnapshot {
                game: "Valorant".into(),
                category: "rank-boost".into(),
                price: Money::from_dollars(100),
                estimated_time: "3 days".into(),
            },
            parties: Parties {
                client: PartySnapshot::new(UserId::new(), "client"),
                booster: PartySnapshot::new(UserId::new(), "booster"),
            },
            created_by: "client".into(),
            creation_key: None,
        },
        Utc::now(),
    )
    .unwrap();
    agreement.set_version(Version::first());
    agreement
}

fn bench_insert_agreement(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("store/insert_agreement", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryStore::new();
                let mut tx = store.begin().await.unwrap();
                store
                    .insert_agreement(&mut tx, &make_agreement())
                    .await
                    .unwrap();
                store.commit(tx).await.unwrap();
            });
        });
    });
}

fn bench_versioned_update(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStore::new();
    let mut agreement = make_agreement();
    rt.block_on(async {
        let mut tx = store.begin().await.unwrap();
        store.insert_agreement(&mut tx, &agreement).await.unwrap();
        store.commit(tx).await.unwrap();
    });

    c.bench_function("store/versioned_update", |b| {
        b.iter(|| {
            rt.block_on(async {
                let expected = agreement.version();
                agreement.set_version(expected.next());
                let mut tx = store.begin().await.unwrap();
                store
                    .update_agreement(&mut tx, &agreement, expected)
                    .await
                    .unwrap();
                store.commit(tx).await.unwrap();
            });
        });
    });
}

fn bench_claim_from_100_tasks(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("store/claim_from_100_tasks", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryStore::new();
                let now = Utc::now();
                let mut tx = store.begin().await.unwrap();
                for i in 0..100 {
                    let task = RetryTask::new(
                        TaskType::SyncOrderSnapshot,
                        serde_json::json!({ "n": i }),
                        Duration::seconds(i),
                        5,
                        now,
                    );
                    store.insert_task(&mut tx, &task).await.unwrap();
                }
                store
                    .claim_due_task(&mut tx, now + Duration::minutes(5))
                    .await
                    .unwrap();
                store.commit(tx).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_insert_agreement,
    bench_versioned_update,
    bench_claim_from_100_tasks
);
criterion_main!(benches);
