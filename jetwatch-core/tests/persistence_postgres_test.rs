//! Persistence-layer tests against a real Postgres instance, fixtures
//! managed by `sqlx::test` against the embedded `MIGRATOR`.

use chrono::Utc;
use jetwatch_core::domain::{ChangeCandidate, InsertOutcome};
use jetwatch_core::persistence::postgres::{PostgresPersistence, MIGRATOR};
use jetwatch_core::persistence::Persistence;
use jetwatch_core::types::Did;
use sqlx::PgPool;

fn handle_change_candidate(did: &str) -> ChangeCandidate {
    ChangeCandidate {
        did: Did::new(did),
        handle: Some("new.alice.example".into()),
        old_handle: Some("old.alice.example".into()),
        new_handle: Some("new.alice.example".into()),
        ..Default::default()
    }
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn duplicate_insert_returns_the_first_row(pool: PgPool) {
    let persistence = PostgresPersistence::from_pool(pool);
    let candidate = handle_change_candidate("did:plc:a");

    let first = persistence.insert(candidate.clone()).await.unwrap();
    let first_id = match first {
        InsertOutcome::Inserted(record) => record.id,
        other => panic!("expected first insert to land, got {other:?}"),
    };

    let second = persistence.insert(candidate).await.unwrap();
    match second {
        InsertOutcome::Duplicate(record) => assert_eq!(record.id, first_id),
        other => panic!("expected duplicate on replay, got {other:?}"),
    }
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn ignored_did_suppresses_insert(pool: PgPool) {
    let persistence = PostgresPersistence::from_pool(pool);
    let did = Did::new("did:plc:ignored");
    persistence.add_ignored(&did).await.unwrap();

    let outcome = persistence.insert(handle_change_candidate("did:plc:ignored")).await.unwrap();
    assert!(matches!(outcome, InsertOutcome::Ignored));
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn null_equal_duplicate_detection_treats_two_nones_as_matching(pool: PgPool) {
    let persistence = PostgresPersistence::from_pool(pool);
    let candidate = ChangeCandidate {
        did: Did::new("did:plc:b"),
        handle: Some("bob.example".into()),
        old_display_name: Some("Bob".into()),
        new_display_name: Some("Bobby".into()),
        old_avatar: None,
        new_avatar: None,
        ..Default::default()
    };

    persistence.insert(candidate.clone()).await.unwrap();
    let repeat = persistence.insert(candidate).await.unwrap();
    assert!(matches!(repeat, InsertOutcome::Duplicate(_)));
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn last_known_handle_prefers_most_recent_new_handle(pool: PgPool) {
    let persistence = PostgresPersistence::from_pool(pool);
    let did = Did::new("did:plc:c");

    persistence
        .insert(ChangeCandidate {
            did: did.clone(),
            old_handle: Some("a.example".into()),
            new_handle: Some("b.example".into()),
            handle: Some("b.example".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    // ensure the second row sorts later by changed_at
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    persistence
        .insert(ChangeCandidate {
            did: did.clone(),
            old_handle: Some("b.example".into()),
            new_handle: Some("c.example".into()),
            handle: Some("c.example".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let latest = persistence.last_known_handle(&did).await.unwrap();
    assert_eq!(latest.map(|h| h.as_str().to_string()), Some("c.example".to_string()));
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn backfill_state_round_trips_started_then_completed(pool: PgPool) {
    let persistence = PostgresPersistence::from_pool(pool);
    let user = Did::new("did:plc:u");
    let started = Utc::now();

    persistence.mark_backfill_started(&user, started).await.unwrap();
    let state = persistence.backfill_state(&user).await.unwrap().unwrap();
    assert!(state.last_started_at.is_some());
    assert!(state.last_completed_at.is_none());

    let completed = started + chrono::Duration::seconds(5);
    persistence.mark_backfill_completed(&user, completed).await.unwrap();
    let state = persistence.backfill_state(&user).await.unwrap().unwrap();
    assert!(state.last_completed_at.unwrap() >= state.last_started_at.unwrap());
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn monitored_follows_enable_disable_reenable_yields_same_set(pool: PgPool) {
    let persistence = PostgresPersistence::from_pool(pool);
    let user = Did::new("did:plc:u");
    let follow = jetwatch_core::domain::MonitoredFollow {
        user_did: user.as_str().to_string(),
        follow_did: "did:plc:f".into(),
        follow_handle: "f.example".into(),
        record_key: "rk1".into(),
        added_at: Utc::now(),
    };

    persistence.upsert_follows(&[follow.clone()]).await.unwrap();
    persistence
        .remove_follow(&user, &Did::new("did:plc:f"))
        .await
        .unwrap();
    persistence.upsert_follows(&[follow]).await.unwrap();

    let follows = persistence.follows_for_user(&user).await.unwrap();
    assert_eq!(follows.len(), 1);
    assert_eq!(follows[0].follow_did, "did:plc:f");
}
