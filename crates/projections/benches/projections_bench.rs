use chrono::Utc;
use common::{ConversationId, UserId, Version};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{Agreement, Money, NewAgreement, Parties, PartyMetadata, PartySnapshot, ProposalSnapshot};
use projections::{OrderSnapshotProjector, ResolutionContext, Role, resolve_participant};
use store::{InMemoryStore, Store};

fn make_agreement(parties: Parties) -> Agreement {
    let mut agreement = Agreement::create(
        NewAgreement {
            conversation_id: ConversationId::new(),
            proposal_id: None,
            proposal: ProposalSnapshot {
                game: "Valorant".into(),
                category: "rank-boost".into(),
                price: Money::from_dollars(80),
                estimated_time: "4 days".into(),
            },
            parties,
            created_by: "client".into(),
            creation_key: None,
        },
        Utc::now(),
    )
    .unwrap();
    agreement.set_version(Version::first());
    agreement
}

fn known_parties() -> Parties {
    Parties {
        client: PartySnapshot::new(UserId::new(), "client"),
        booster: PartySnapshot::new(UserId::new(), "booster"),
    }
}

fn bench_resolve_from_metadata_alias(c: &mut Criterion) {
    let booster = PartySnapshot {
        metadata: PartyMetadata {
            user_id_alias: Some("legacy-handle".into()),
            id_alias: Some(UserId::new().to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let agreement = make_agreement(Parties {
        client: PartySnapshot::new(UserId::new(), "client"),
        booster,
    });
    let context = ResolutionContext::default();

    c.bench_function("projections/resolve_metadata_alias", |b| {
        b.iter(|| resolve_participant(&agreement, Role::Booster, &context));
    });
}

fn bench_create_snapshot(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("projections/create_snapshot", |b| {
        b.iter(|| {
            rt.block_on(async {
                let projector = OrderSnapshotProjector::new(InMemoryStore::new());
                let agreement = make_agreement(known_parties());
                projector.create_from_agreement(&agreement).await.unwrap();
            });
        });
    });
}

fn bench_sync_existing_snapshot(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStore::new();
    let projector = OrderSnapshotProjector::new(store.clone());
    let mut agreement = make_agreement(known_parties());

    rt.block_on(async {
        let mut tx = store.begin().await.unwrap();
        store.insert_agreement(&mut tx, &agreement).await.unwrap();
        store.commit(tx).await.unwrap();
        projector.create_from_agreement(&agreement).await.unwrap();
    });
    agreement.activate("booster", None, Utc::now()).unwrap();

    c.bench_function("projections/sync_existing_snapshot", |b| {
        b.iter(|| {
            agreement.set_version(agreement.version().next());
            rt.block_on(async {
                projector.sync_from_agreement(&agreement).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_resolve_from_metadata_alias,
    bench_create_snapshot,
    bench_sync_existing_snapshot,
);
criterion_main!(benches);
