//! The persistence contract. All writes to durable
//! state go through this trait; `jetwatch-engine` depends on it, never on
//! `PostgresPersistence` directly, so the main stream / backfill managers
//! stay testable against a fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{BackfillState, ChangeCandidate, IgnoredDid, InsertOutcome, MonitoredFollow};
use crate::error::Result;
use crate::types::{Did, Handle};

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Constant-time check against the ignore list.
    async fn is_ignored(&self, did: &Did) -> Result<bool>;

    /// Null-equal six-tuple duplicate lookup.
    async fn find_duplicate(&self, candidate: &ChangeCandidate) -> Result<Option<InsertOutcome>>;

    /// Performs the duplicate check and the insert within the same logical
    /// call. Returns `Ignored` without
    /// writing if `candidate.did` is on the ignore list.
    async fn insert(&self, candidate: ChangeCandidate) -> Result<InsertOutcome>;

    /// Most recent non-null `new_handle`, falling back to `handle`.
    async fn last_known_handle(&self, did: &Did) -> Result<Option<Handle>>;

    async fn add_ignored(&self, did: &Did) -> Result<()>;
    async fn remove_ignored(&self, did: &Did) -> Result<()>;
    async fn list_ignored(&self) -> Result<Vec<IgnoredDid>>;

    async fn upsert_follows(&self, follows: &[MonitoredFollow]) -> Result<()>;
    async fn remove_follow(&self, user_did: &Did, follow_did: &Did) -> Result<()>;
    async fn follow_by_rkey(&self, user_did: &Did, rkey: &str) -> Result<Option<MonitoredFollow>>;
    async fn follows_for_user(&self, user_did: &Did) -> Result<Vec<MonitoredFollow>>;
    /// All monitoring users currently following `follow_did` — used to
    /// decide whether a delete needs a DID-set reconcile.
    async fn followers_of(&self, follow_did: &Did) -> Result<Vec<MonitoredFollow>>;
    /// Deletes every `monitored_follows` row for `user_did` — used when a
    /// monitored user is dropped entirely.
    async fn purge_user(&self, user_did: &Did) -> Result<()>;

    async fn backfill_state(&self, user_did: &Did) -> Result<Option<BackfillState>>;
    /// Every row, used by the boot-time auto-restart scan to
    /// find backfills that were in flight when the process last stopped.
    async fn list_backfill_states(&self) -> Result<Vec<BackfillState>>;
    async fn mark_backfill_started(&self, user_did: &Did, at: DateTime<Utc>) -> Result<()>;
    async fn mark_backfill_completed(&self, user_did: &Did, at: DateTime<Utc>) -> Result<()>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}
