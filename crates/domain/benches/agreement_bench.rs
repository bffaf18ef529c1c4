use chrono::Utc;
use common::{ConversationId, ProposalId, UserId};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{
    Agreement, LegacyPrice, LegacyRecord, Money, NewAgreement, Parties, PartySnapshot,
    ProposalSnapshot,
};
use serde_json::Map;

fn new_agreement() -> Agreement {
    Agreement::create(
        NewAgreement {
            conversation_id: ConversationId::new(),
            proposal_id: Some(ProposalId::new()),
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
    .unwrap()
}

fn bench_full_lifecycle(c: &mut Criterion) {
    c.bench_function("domain/create_activate_complete", |b| {
        b.iter(|| {
            let mut agreement = new_agreement();
            agreement.activate("booster", None, Utc::now()).unwrap();
            agreement
                .complete("client", Map::new(), Some("k1"), Utc::now())
                .unwrap();
        });
    });
}

fn bench_idempotent_replay(c: &mut Criterion) {
    let mut agreement = new_agreement();
    agreement.activate("booster", None, Utc::now()).unwrap();
    for i in 0..50 {
        agreement
            .renegotiate(
                "booster",
                Money::from_dollars(100 + i),
                "3 days",
                None,
                Some(&format!("reneg-{i}")),
                Utc::now(),
            )
            .unwrap();
    }

    c.bench_function("domain/replay_lookup_50_entries", |b| {
        b.iter(|| {
            agreement
                .renegotiate(
                    "booster",
                    Money::from_dollars(1),
                    "1 day",
                    None,
                    Some("reneg-25"),
                    Utc::now(),
                )
                .unwrap();
        });
    });
}

fn bench_legacy_mapping(c: &mut Criterion) {
    let mut record = LegacyRecord::accepted(
        ConversationId::new(),
        PartySnapshot::new(UserId::new(), "client"),
        PartySnapshot::new(UserId::new(), "booster"),
        LegacyPrice::Text("R$ 1.200,50".into()),
        Utc::now(),
    );
    record.status = "delivered".into();

    c.bench_function("domain/legacy_to_agreement", |b| {
        b.iter(|| record.to_agreement(Utc::now()).unwrap());
    });
}

criterion_group!(
    benches,
    bench_full_lifecycle,
    bench_idempotent_replay,
    bench_legacy_mapping
);
criterion_main!(benches);
