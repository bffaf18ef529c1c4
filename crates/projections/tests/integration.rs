//! Integration tests: agreements in the store → projector → order snapshots.

use chrono::Utc;
use common::{ConversationId, UserId, Version};
use domain::{
    Agreement, AgreementStatus, LegacyPrice, LegacyRecord, Money, NewAgreement, Parties,
    PartySnapshot, ProposalSnapshot,
};
use projections::{OrderSnapshotProjector, ProjectionError};
use store::{InMemoryStore, Store};

fn make_agreement(conversation_id: ConversationId, parties: Parties) -> Agreement {
    let mut agreement = Agreement::create(
        NewAgreement {
            conversation_id,
            proposal_id: None,
            proposal: ProposalSnapshot {
                game: "Dota 2".into(),
                category: "calibration".into(),
                price: Money::from_dollars(60),
                estimated_time: "5 days".into(),
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

async fn save(store: &InMemoryStore, agreement: &mut Agreement) {
    let mut tx = store.begin().await.unwrap();
    match store.get_agreement(&mut tx, agreement.id()).await.unwrap() {
        Some(stored) => {
            agreement.set_version(stored.version().next());
            store
                .update_agreement(&mut tx, agreement, stored.version())
                .await
                .unwrap()
        }
        None => store.insert_agreement(&mut tx, agreement).await.unwrap(),
    }
    store.commit(tx).await.unwrap();
}

#[tokio::test]
async fn test_full_lifecycle_is_mirrored() {
    let store = InMemoryStore::new();
    let projector = OrderSnapshotProjector::new(store.clone());
    let parties = Parties {
        client: PartySnapshot::new(UserId::new(), "client"),
        booster: PartySnapshot::new(UserId::new(), "booster"),
    };
    let mut agreement = make_agreement(ConversationId::new(), parties);
    save(&store, &mut agreement).await;
    projector.create_from_agreement(&agreement).await.unwrap();

    agreement.activate("booster", Some("a1"), Utc::now()).unwrap();
    save(&store, &mut agreement).await;
    projector.sync_by_id(agreement.id()).await.unwrap();

    agreement
        .renegotiate(
            "client",
            Money::from_dollars(75),
            "6 days",
            Some("scope grew"),
            Some("r1"),
            Utc::now(),
        )
        .unwrap();
    let mut details = serde_json::Map::new();
    details.insert("rating".into(), serde_json::json!(5));
    agreement
        .complete("client", details, Some("k1"), Utc::now())
        .unwrap();
    save(&store, &mut agreement).await;
    let snapshot = projector.sync_by_id(agreement.id()).await.unwrap();

    assert_eq!(snapshot.status, AgreementStatus::Completed);
    assert_eq!(snapshot.price, Money::from_dollars(75));
    assert_eq!(snapshot.service.estimated_time, "6 days");
    let completion = snapshot.completion.unwrap();
    assert_eq!(completion.completed_by, "client");
    assert_eq!(completion.details.get("rating"), Some(&serde_json::json!(5)));
    assert!(snapshot.cancellation.is_none());
}

#[tokio::test]
async fn test_legacy_record_is_last_resort() {
    let store = InMemoryStore::new();
    let projector = OrderSnapshotProjector::new(store.clone());
    let client = UserId::new();
    let booster = UserId::new();
    let conversation_id = ConversationId::new();

    let mut record = LegacyRecord::accepted(
        conversation_id,
        PartySnapshot::default(),
        PartySnapshot::default(),
        LegacyPrice::Number(60.0),
        Utc::now(),
    );
    record.client_id = Some(client.to_string());
    record.booster_id = Some(booster.to_string());

    let mut tx = store.begin().await.unwrap();
    store.upsert_legacy_record(&mut tx, &record).await.unwrap();
    store.commit(tx).await.unwrap();

    let agreement = make_agreement(conversation_id, Parties::default());
    let snapshot = projector.create_from_agreement(&agreement).await.unwrap();

    assert_eq!(snapshot.client_id, client);
    assert_eq!(snapshot.booster_id, booster);
}

#[tokio::test]
async fn test_failed_write_leaves_no_snapshot() {
    let store = InMemoryStore::new();
    let projector = OrderSnapshotProjector::new(store.clone());
    let parties = Parties {
        client: PartySnapshot::new(UserId::new(), "client"),
        booster: PartySnapshot::new(UserId::new(), "booster"),
    };
    let agreement = make_agreement(ConversationId::new(), parties);

    store.set_fail_on_snapshot_write(true);
    let result = projector.create_from_agreement(&agreement).await;
    assert!(matches!(result, Err(ProjectionError::Store(_))));

    store.set_fail_on_snapshot_write(false);
    let snapshot = projector.sync_from_agreement(&agreement).await.unwrap();
    assert_eq!(snapshot.status, AgreementStatus::Pending);
}

#[tokio::test]
async fn test_out_of_order_sync_keeps_newer_status() {
    let store = InMemoryStore::new();
    let projector = OrderSnapshotProjector::new(store.clone());
    let parties = Parties {
        client: PartySnapshot::new(UserId::new(), "client"),
        booster: PartySnapshot::new(UserId::new(), "booster"),
    };
    let mut agreement = make_agreement(ConversationId::new(), parties);
    save(&store, &mut agreement).await;
    projector.create_from_agreement(&agreement).await.unwrap();

    agreement.activate("booster", None, Utc::now()).unwrap();
    save(&store, &mut agreement).await;
    let active = agreement.clone();

    agreement
        .complete("client", serde_json::Map::new(), None, Utc::now())
        .unwrap();
    save(&store, &mut agreement).await;

    projector.sync_from_agreement(&agreement).await.unwrap();
    let snapshot = projector.sync_from_agreement(&active).await.unwrap();

    assert_eq!(snapshot.status, AgreementStatus::Completed);
    assert_eq!(snapshot.agreement_version, Version::new(3));
    let mut tx = store.begin().await.unwrap();
    let stored = store
        .get_order_snapshot(&mut tx, agreement.id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, AgreementStatus::Completed);
    assert!(stored.is_in_sync_with(&agreement));
}
