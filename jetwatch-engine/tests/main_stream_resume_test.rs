//! Graceful shutdown and resume-under-24h behavior. Exercises
//! `MainStreamManager::get_recommended_start_cursor` against a fake
//! `Persistence` holding only a settings table, since that's all the
//! resume policy reads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jetwatch_core::domain::{BackfillState, ChangeCandidate, IgnoredDid, InsertOutcome, MonitoredFollow};
use jetwatch_core::dispatch::InMemoryMonitoringRegistry;
use jetwatch_core::error::Result;
use jetwatch_core::jetstream::JetstreamHostPool;
use jetwatch_core::persistence::Persistence;
use jetwatch_core::resolver::HandleResolver;
use jetwatch_core::types::{Cursor, Did, Handle};
use jetwatch_engine::follow_graph::FollowGraphClient;
use jetwatch_engine::main_stream::MainStreamManager;
use jetwatch_engine::status::StatusBroadcaster;

#[derive(Default)]
struct SettingsOnlyPersistence {
    settings: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl Persistence for SettingsOnlyPersistence {
    async fn is_ignored(&self, _did: &Did) -> Result<bool> {
        Ok(false)
    }
    async fn find_duplicate(&self, _candidate: &ChangeCandidate) -> Result<Option<InsertOutcome>> {
        Ok(None)
    }
    async fn insert(&self, _candidate: ChangeCandidate) -> Result<InsertOutcome> {
        unimplemented!("not exercised by the resume-policy test")
    }
    async fn last_known_handle(&self, _did: &Did) -> Result<Option<Handle>> {
        Ok(None)
    }
    async fn add_ignored(&self, _did: &Did) -> Result<()> {
        Ok(())
    }
    async fn remove_ignored(&self, _did: &Did) -> Result<()> {
        Ok(())
    }
    async fn list_ignored(&self) -> Result<Vec<IgnoredDid>> {
        Ok(vec![])
    }
    async fn upsert_follows(&self, _follows: &[MonitoredFollow]) -> Result<()> {
        Ok(())
    }
    async fn remove_follow(&self, _user_did: &Did, _follow_did: &Did) -> Result<()> {
        Ok(())
    }
    async fn follow_by_rkey(&self, _user_did: &Did, _rkey: &str) -> Result<Option<MonitoredFollow>> {
        Ok(None)
    }
    async fn follows_for_user(&self, _user_did: &Did) -> Result<Vec<MonitoredFollow>> {
        Ok(vec![])
    }
    async fn followers_of(&self, _follow_did: &Did) -> Result<Vec<MonitoredFollow>> {
        Ok(vec![])
    }
    async fn purge_user(&self, _user_did: &Did) -> Result<()> {
        Ok(())
    }
    async fn backfill_state(&self, _user_did: &Did) -> Result<Option<BackfillState>> {
        Ok(None)
    }
    async fn list_backfill_states(&self) -> Result<Vec<BackfillState>> {
        Ok(vec![])
    }
    async fn mark_backfill_started(&self, _user_did: &Did, _at: chrono::DateTime<Utc>) -> Result<()> {
        Ok(())
    }
    async fn mark_backfill_completed(&self, _user_did: &Did, _at: chrono::DateTime<Utc>) -> Result<()> {
        Ok(())
    }
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.settings.lock().unwrap().get(key).cloned())
    }
    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.settings.lock().unwrap().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

fn build_manager(persistence: Arc<SettingsOnlyPersistence>) -> Arc<MainStreamManager> {
    let resolver = Arc::new(HandleResolver::new("plc.example"));
    let monitoring = Arc::new(InMemoryMonitoringRegistry::default());
    let follow_graph = Arc::new(FollowGraphClient::new("public.api.bsky.app", Duration::from_secs(1)));
    let broadcaster = Arc::new(StatusBroadcaster::new());
    let host_pool = JetstreamHostPool::new(vec!["jetstream.example".into()]).unwrap();

    MainStreamManager::new(persistence, resolver, monitoring, follow_graph, broadcaster, host_pool)
}

#[tokio::test]
async fn resume_cursor_used_when_stop_was_recent() {
    let persistence = Arc::new(SettingsOnlyPersistence::default());
    persistence
        .set_setting("main_stream.stop_cursor", "1700000000000000")
        .await
        .unwrap();
    persistence
        .set_setting("main_stream.stop_time", &Utc::now().to_rfc3339())
        .await
        .unwrap();

    let manager = build_manager(persistence);
    let cursor = manager.get_recommended_start_cursor().await;
    assert_eq!(cursor, Some(Cursor::from_micros(1_700_000_000_000_000)));
}

#[tokio::test]
async fn resume_cursor_dropped_when_stop_older_than_24h() {
    let persistence = Arc::new(SettingsOnlyPersistence::default());
    let stale_stop_time = Utc::now() - chrono::Duration::hours(25);
    persistence
        .set_setting("main_stream.stop_cursor", "1700000000000000")
        .await
        .unwrap();
    persistence
        .set_setting("main_stream.stop_time", &stale_stop_time.to_rfc3339())
        .await
        .unwrap();

    let manager = build_manager(persistence);
    let cursor = manager.get_recommended_start_cursor().await;
    assert_eq!(cursor, None);
}

#[tokio::test]
async fn resume_cursor_is_none_with_no_prior_stop() {
    let persistence = Arc::new(SettingsOnlyPersistence::default());
    let manager = build_manager(persistence);
    assert_eq!(manager.get_recommended_start_cursor().await, None);
}
