//! End-to-end dispatch scenarios — handle changes, profile changes,
//! duplicate suppression, and follow/unfollow reconcile triggers — run
//! against an in-memory fake `Persistence` so they stay fast unit tests
//! rather than needing Postgres.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use jetwatch_core::dispatch::{Dispatcher, InMemoryMonitoringRegistry};
use jetwatch_core::domain::{
    BackfillState, ChangeCandidate, ChangeRecord, ChangeType, IgnoredDid, InsertOutcome,
    MonitoredFollow,
};
use jetwatch_core::error::Result;
use jetwatch_core::jetstream::protocol::{CommitOperation, CommitRecord, DecodedEvent, IdentityEvent};
use jetwatch_core::persistence::Persistence;
use jetwatch_core::resolver::HandleResolver;
use jetwatch_core::types::{Did, Handle};

/// Null-equal six-tuple duplicate matching over an in-memory vec, mirroring
/// `PostgresPersistence`'s `IS NOT DISTINCT FROM` semantics.
#[derive(Default)]
struct InMemoryPersistence {
    changes: Mutex<Vec<ChangeRecord>>,
    ignored: Mutex<Vec<String>>,
    follows: Mutex<Vec<MonitoredFollow>>,
    backfill: Mutex<Vec<BackfillState>>,
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn is_ignored(&self, did: &Did) -> Result<bool> {
        Ok(self.ignored.lock().unwrap().iter().any(|d| d == did.as_str()))
    }

    async fn find_duplicate(&self, candidate: &ChangeCandidate) -> Result<Option<InsertOutcome>> {
        let changes = self.changes.lock().unwrap();
        Ok(changes
            .iter()
            .find(|row| {
                row.did == candidate.did.as_str()
                    && row.old_handle == candidate.old_handle
                    && row.new_handle == candidate.new_handle
                    && row.old_display_name == candidate.old_display_name
                    && row.new_display_name == candidate.new_display_name
                    && row.old_avatar == candidate.old_avatar
                    && row.new_avatar == candidate.new_avatar
            })
            .cloned()
            .map(InsertOutcome::Duplicate))
    }

    async fn insert(&self, candidate: ChangeCandidate) -> Result<InsertOutcome> {
        if self.is_ignored(&candidate.did).await? {
            return Ok(InsertOutcome::Ignored);
        }
        if let Some(outcome) = self.find_duplicate(&candidate).await? {
            return Ok(outcome);
        }
        let record = ChangeRecord {
            id: uuid::Uuid::now_v7(),
            did: candidate.did.as_str().to_string(),
            handle: candidate.handle.clone(),
            old_handle: candidate.old_handle.clone(),
            new_handle: candidate.new_handle.clone(),
            old_display_name: candidate.old_display_name.clone(),
            new_display_name: candidate.new_display_name.clone(),
            old_avatar: candidate.old_avatar.clone(),
            new_avatar: candidate.new_avatar.clone(),
            change_type: ChangeType::classify(&candidate),
            changed_at: Utc::now(),
        };
        self.changes.lock().unwrap().push(record.clone());
        Ok(InsertOutcome::Inserted(record))
    }

    async fn last_known_handle(&self, did: &Did) -> Result<Option<Handle>> {
        Ok(self
            .changes
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.did == did.as_str())
            .last()
            .and_then(|row| row.new_handle.clone().or_else(|| row.handle.clone()))
            .map(Handle::from))
    }

    async fn add_ignored(&self, did: &Did) -> Result<()> {
        self.ignored.lock().unwrap().push(did.as_str().to_string());
        Ok(())
    }
    async fn remove_ignored(&self, did: &Did) -> Result<()> {
        self.ignored.lock().unwrap().retain(|d| d != did.as_str());
        Ok(())
    }
    async fn list_ignored(&self) -> Result<Vec<IgnoredDid>> {
        Ok(self
            .ignored
            .lock()
            .unwrap()
            .iter()
            .map(|did| IgnoredDid { did: did.clone(), added_at: Utc::now() })
            .collect())
    }

    async fn upsert_follows(&self, follows: &[MonitoredFollow]) -> Result<()> {
        let mut existing = self.follows.lock().unwrap();
        for follow in follows {
            existing.retain(|f| !(f.user_did == follow.user_did && f.follow_did == follow.follow_did));
            existing.push(follow.clone());
        }
        Ok(())
    }
    async fn remove_follow(&self, user_did: &Did, follow_did: &Did) -> Result<()> {
        self.follows
            .lock()
            .unwrap()
            .retain(|f| !(f.user_did == user_did.as_str() && f.follow_did == follow_did.as_str()));
        Ok(())
    }
    async fn follow_by_rkey(&self, user_did: &Did, rkey: &str) -> Result<Option<MonitoredFollow>> {
        Ok(self
            .follows
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.user_did == user_did.as_str() && f.record_key == rkey)
            .cloned())
    }
    async fn follows_for_user(&self, user_did: &Did) -> Result<Vec<MonitoredFollow>> {
        Ok(self
            .follows
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.user_did == user_did.as_str())
            .cloned()
            .collect())
    }
    async fn followers_of(&self, follow_did: &Did) -> Result<Vec<MonitoredFollow>> {
        Ok(self
            .follows
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.follow_did == follow_did.as_str())
            .cloned()
            .collect())
    }
    async fn purge_user(&self, user_did: &Did) -> Result<()> {
        self.follows.lock().unwrap().retain(|f| f.user_did != user_did.as_str());
        Ok(())
    }

    async fn backfill_state(&self, user_did: &Did) -> Result<Option<BackfillState>> {
        Ok(self
            .backfill
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.user_did == user_did.as_str())
            .cloned())
    }
    async fn list_backfill_states(&self) -> Result<Vec<BackfillState>> {
        Ok(self.backfill.lock().unwrap().clone())
    }
    async fn mark_backfill_started(&self, user_did: &Did, at: chrono::DateTime<Utc>) -> Result<()> {
        let mut states = self.backfill.lock().unwrap();
        states.retain(|b| b.user_did != user_did.as_str());
        states.push(BackfillState {
            user_did: user_did.as_str().to_string(),
            last_started_at: Some(at),
            last_completed_at: None,
            updated_at: at,
        });
        Ok(())
    }
    async fn mark_backfill_completed(&self, user_did: &Did, at: chrono::DateTime<Utc>) -> Result<()> {
        let mut states = self.backfill.lock().unwrap();
        if let Some(state) = states.iter_mut().find(|b| b.user_did == user_did.as_str()) {
            state.last_completed_at = Some(at);
            state.updated_at = at;
        }
        Ok(())
    }

    async fn get_setting(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }
    async fn set_setting(&self, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }
}

fn setup(is_temp_stream: bool) -> (Dispatcher, Arc<InMemoryPersistence>, Arc<InMemoryMonitoringRegistry>) {
    let persistence = Arc::new(InMemoryPersistence::default());
    let resolver = Arc::new(HandleResolver::new("plc.example"));
    let monitoring = Arc::new(InMemoryMonitoringRegistry::default());
    let dispatcher = Dispatcher::new(persistence.clone(), resolver, monitoring.clone(), is_temp_stream);
    (dispatcher, persistence, monitoring)
}

/// A live handle change produces exactly one change row.
#[tokio::test]
async fn s1_handle_change_produces_one_row() {
    let (dispatcher, persistence, _) = setup(false);

    // seed the prior handle via a synthetic first change row, since the
    // in-memory fake's last_known_handle reads from persisted changes.
    persistence
        .insert(ChangeCandidate {
            did: Did::new("did:plc:a"),
            handle: Some("old.alice.example".into()),
            old_handle: Some("ancient.alice.example".into()),
            new_handle: Some("old.alice.example".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let event = DecodedEvent::Identity(IdentityEvent {
        did: "did:plc:a".into(),
        handle: Some("new.alice.example".into()),
        seq: Some(1),
        time: None,
    });
    dispatcher.dispatch(&event, false).await.unwrap();

    let changes = persistence.changes.lock().unwrap();
    assert_eq!(changes.len(), 2);
    let latest = &changes[1];
    assert_eq!(latest.change_type, ChangeType::Handle);
    assert_eq!(latest.old_handle.as_deref(), Some("old.alice.example"));
    assert_eq!(latest.new_handle.as_deref(), Some("new.alice.example"));
    assert_eq!(latest.did, "did:plc:a");
}

/// Replaying the same identity frame produces no new row.
#[tokio::test]
async fn s2_duplicate_frame_replay_is_suppressed() {
    let (dispatcher, persistence, _) = setup(false);
    persistence
        .insert(ChangeCandidate {
            did: Did::new("did:plc:a"),
            handle: Some("old.alice.example".into()),
            old_handle: Some("ancient.alice.example".into()),
            new_handle: Some("old.alice.example".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let event = DecodedEvent::Identity(IdentityEvent {
        did: "did:plc:a".into(),
        handle: Some("new.alice.example".into()),
        seq: Some(1),
        time: None,
    });
    dispatcher.dispatch(&event, false).await.unwrap();
    let count_after_first = persistence.changes.lock().unwrap().len();

    dispatcher.dispatch(&event, false).await.unwrap();
    let count_after_replay = persistence.changes.lock().unwrap().len();

    assert_eq!(count_after_first, count_after_replay);
}

/// A profile's first capture seeds the snapshot silently; the next change
/// against it yields exactly one row.
#[tokio::test]
async fn s3_profile_first_capture_then_change_yields_one_row() {
    let (dispatcher, persistence, _) = setup(false);

    let first = DecodedEvent::ProfileCommit {
        did: "did:plc:b".into(),
        operation: CommitOperation::Create,
        record: Some(CommitRecord {
            display_name: Some("Bob".into()),
            avatar: None,
            subject: None,
        }),
    };
    dispatcher.dispatch(&first, false).await.unwrap();
    assert!(persistence.changes.lock().unwrap().is_empty());

    let second = DecodedEvent::ProfileCommit {
        did: "did:plc:b".into(),
        operation: CommitOperation::Update,
        record: Some(CommitRecord {
            display_name: Some("Bobby".into()),
            avatar: None,
            subject: None,
        }),
    };
    dispatcher.dispatch(&second, false).await.unwrap();

    let changes = persistence.changes.lock().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].change_type, ChangeType::Profile);
    assert_eq!(changes[0].old_display_name.as_deref(), Some("Bob"));
    assert_eq!(changes[0].new_display_name.as_deref(), Some("Bobby"));
}

/// A follow-record create triggers a reconcile request and persists the
/// follow.
#[tokio::test]
async fn s4_follow_create_requests_reconcile_and_persists_follow() {
    let (dispatcher, persistence, monitoring) = setup(false);
    monitoring.insert(Did::new("did:plc:u"));

    let event = DecodedEvent::FollowCommit {
        did: "did:plc:u".into(),
        operation: CommitOperation::Create,
        rkey: Some("k1".into()),
        record: Some(CommitRecord {
            display_name: None,
            avatar: None,
            subject: Some("did:plc:c".into()),
        }),
    };
    let outcome = dispatcher.dispatch(&event, false).await.unwrap();
    assert!(outcome.request_reconcile);

    let follows = persistence.follows_for_user(&Did::new("did:plc:u")).await.unwrap();
    assert_eq!(follows.len(), 1);
    assert_eq!(follows[0].follow_did, "did:plc:c");
    assert_eq!(follows[0].record_key, "k1");
}

/// Unfollowing a subject still followed by another monitored user does not
/// trigger a reconcile.
#[tokio::test]
async fn s5_unfollow_shared_subject_skips_reconcile() {
    let (dispatcher, persistence, monitoring) = setup(false);
    monitoring.insert(Did::new("did:plc:u1"));
    monitoring.insert(Did::new("did:plc:u2"));

    persistence
        .upsert_follows(&[
            MonitoredFollow {
                user_did: "did:plc:u1".into(),
                follow_did: "did:plc:d".into(),
                follow_handle: "d.example".into(),
                record_key: "k7".into(),
                added_at: Utc::now(),
            },
            MonitoredFollow {
                user_did: "did:plc:u2".into(),
                follow_did: "did:plc:d".into(),
                follow_handle: "d.example".into(),
                record_key: "k9".into(),
                added_at: Utc::now(),
            },
        ])
        .await
        .unwrap();

    let event = DecodedEvent::FollowCommit {
        did: "did:plc:u1".into(),
        operation: CommitOperation::Delete,
        rkey: Some("k7".into()),
        record: None,
    };
    let outcome = dispatcher.dispatch(&event, false).await.unwrap();
    assert!(!outcome.request_reconcile);

    let remaining_u1 = persistence.follows_for_user(&Did::new("did:plc:u1")).await.unwrap();
    assert!(remaining_u1.is_empty());
    let remaining_u2 = persistence.follows_for_user(&Did::new("did:plc:u2")).await.unwrap();
    assert_eq!(remaining_u2.len(), 1);
}

/// Unfollow that leaves no remaining followers does request a reconcile.
#[tokio::test]
async fn unfollow_with_no_remaining_followers_requests_reconcile() {
    let (dispatcher, persistence, monitoring) = setup(false);
    monitoring.insert(Did::new("did:plc:u1"));

    persistence
        .upsert_follows(&[MonitoredFollow {
            user_did: "did:plc:u1".into(),
            follow_did: "did:plc:d".into(),
            follow_handle: "d.example".into(),
            record_key: "k7".into(),
            added_at: Utc::now(),
        }])
        .await
        .unwrap();

    let event = DecodedEvent::FollowCommit {
        did: "did:plc:u1".into(),
        operation: CommitOperation::Delete,
        rkey: Some("k7".into()),
        record: None,
    };
    let outcome = dispatcher.dispatch(&event, false).await.unwrap();
    assert!(outcome.request_reconcile);
}

/// Temp streams always process follow events even in backfill mode.
#[tokio::test]
async fn temp_stream_follow_events_bypass_backfill_suppression() {
    let (dispatcher, _persistence, monitoring) = setup(true);
    monitoring.insert(Did::new("did:plc:u"));

    let event = DecodedEvent::FollowCommit {
        did: "did:plc:u".into(),
        operation: CommitOperation::Create,
        rkey: Some("k1".into()),
        record: Some(CommitRecord {
            display_name: None,
            avatar: None,
            subject: Some("did:plc:c".into()),
        }),
    };
    let outcome = dispatcher.dispatch(&event, true).await.unwrap();
    assert!(outcome.request_reconcile);
}

/// Ignored DID never gets a persisted change record (invariant 2).
#[tokio::test]
async fn ignored_did_is_never_persisted() {
    let (dispatcher, persistence, _) = setup(false);
    persistence.add_ignored(&Did::new("did:plc:ignored")).await.unwrap();

    let event = DecodedEvent::Identity(IdentityEvent {
        did: "did:plc:ignored".into(),
        handle: Some("anything.example".into()),
        seq: Some(1),
        time: None,
    });
    // first sighting, so seed a prior row directly to force a real transition
    dispatcher.dispatch(&event, false).await.unwrap();
    let direct_insert = persistence
        .insert(ChangeCandidate {
            did: Did::new("did:plc:ignored"),
            old_handle: Some("a.example".into()),
            new_handle: Some("b.example".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(matches!(direct_insert, InsertOutcome::Ignored));
    assert!(persistence.changes.lock().unwrap().is_empty());
}
