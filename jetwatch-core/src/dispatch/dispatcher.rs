//! Routes decoded Jetstream events to the identity / profile / follow
//! handlers. One dispatcher instance per stream, holding that stream's own
//! snapshot cache.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::domain::{ChangeCandidate, MonitoredFollow, ProfileSnapshot};
use crate::dispatch::monitoring::MonitoringRegistry;
use crate::dispatch::snapshot_cache::SnapshotCache;
use crate::error::Result;
use crate::jetstream::protocol::{CommitOperation, CommitRecord, DecodedEvent, IdentityEvent};
use crate::persistence::Persistence;
use crate::resolver::HandleResolver;
use crate::types::{Did, Handle};

/// What the dispatcher learned that its caller (main stream / backfill
/// stream) needs to act on. Cursor advancement stays the caller's
/// responsibility — it owns the cursor, the dispatcher only reports
/// whether the event was handled successfully enough to advance past.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DispatchOutcome {
    /// A follow create/delete changed who's followed; the caller should
    /// request a main-stream DID-set reconciliation.
    pub request_reconcile: bool,
}

pub struct Dispatcher {
    persistence: Arc<dyn Persistence>,
    resolver: Arc<HandleResolver>,
    monitoring: Arc<dyn MonitoringRegistry>,
    snapshots: SnapshotCache,
    is_temp_stream: bool,
}

impl Dispatcher {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        resolver: Arc<HandleResolver>,
        monitoring: Arc<dyn MonitoringRegistry>,
        is_temp_stream: bool,
    ) -> Self {
        Self {
            persistence,
            resolver,
            monitoring,
            snapshots: SnapshotCache::new(),
            is_temp_stream,
        }
    }

    /// Dispatches one decoded event. `is_backfill_mode` reflects the *main*
    /// stream's current lag state; temporary streams always pass `false`
    /// since the backfill-mode suppression only applies to the main
    /// stream.
    pub async fn dispatch(&self, event: &DecodedEvent, is_backfill_mode: bool) -> Result<DispatchOutcome> {
        match event {
            DecodedEvent::Identity(identity) => {
                self.handle_identity(identity).await?;
                Ok(DispatchOutcome::default())
            }
            DecodedEvent::ProfileCommit { did, operation, record } => {
                if *operation != CommitOperation::Delete {
                    self.handle_profile_commit(did, record).await?;
                }
                Ok(DispatchOutcome::default())
            }
            DecodedEvent::FollowCommit { did, operation, rkey, record } => {
                self.handle_follow_commit(did, *operation, rkey.as_deref(), record, is_backfill_mode)
                    .await
            }
            DecodedEvent::Ignored => Ok(DispatchOutcome::default()),
        }
    }

    /// Old-handle resolution order: in-memory snapshot →
    /// `lastKnownHandle` → previous-handle-from-audit-log →
    /// current-handle-resolution → empty string.
    async fn resolve_old_handle(&self, did: &Did) -> Handle {
        if let Some(snapshot) = self.snapshots.get(did) {
            if !snapshot.handle.is_empty() {
                return snapshot.handle;
            }
        }
        if let Ok(Some(handle)) = self.persistence.last_known_handle(did).await {
            if !handle.is_empty() {
                return handle;
            }
        }
        if let Some(handle) = self.resolver.resolve_previous(did).await {
            if !handle.is_empty() {
                return handle;
            }
        }
        if let Some(handle) = self.resolver.resolve(did).await {
            if !handle.is_empty() {
                return handle;
            }
        }
        Handle::empty()
    }

    async fn handle_identity(&self, identity: &IdentityEvent) -> Result<()> {
        let did = Did::new(identity.did.clone());
        let new_handle = Handle::from(identity.handle.clone());
        let old_handle = self.resolve_old_handle(&did).await;

        let mut snapshot = self.snapshots.get(&did).unwrap_or_default();
        snapshot.handle = new_handle.clone();
        self.snapshots.set(did.clone(), snapshot);

        // Initial discoveries (either side empty) are silently absorbed.
        if old_handle == new_handle || old_handle.is_empty() || new_handle.is_empty() {
            return Ok(());
        }

        let candidate = ChangeCandidate {
            did,
            handle: Some(new_handle.as_str().to_string()),
            old_handle: Some(old_handle.as_str().to_string()),
            new_handle: Some(new_handle.as_str().to_string()),
            ..Default::default()
        };
        self.persistence.insert(candidate).await?;
        Ok(())
    }

    /// Diffs an incoming profile commit against the stream's snapshot cache
    /// and persists any display-name/avatar transition.
    async fn handle_profile_commit(&self, did_str: &str, record: &Option<CommitRecord>) -> Result<()> {
        let did = Did::new(did_str);
        let new_display_name = record
            .as_ref()
            .and_then(|r| r.display_name.clone())
            .unwrap_or_default();
        let new_avatar = record
            .as_ref()
            .and_then(|r| r.avatar_cid().map(str::to_string))
            .unwrap_or_default();

        let existing = self.snapshots.get(&did);
        let had_prior_snapshot = existing.is_some();
        let snapshot = existing.unwrap_or_default();

        let display_name_changed = snapshot.display_name != new_display_name;
        let avatar_changed = snapshot.avatar_ref != new_avatar;

        let handle = if had_prior_snapshot {
            snapshot.handle.clone()
        } else {
            match self.persistence.last_known_handle(&did).await.ok().flatten() {
                Some(handle) if !handle.is_empty() => handle,
                _ => self.resolver.resolve(&did).await.unwrap_or_else(Handle::empty),
            }
        };

        let updated = ProfileSnapshot {
            display_name: new_display_name.clone(),
            avatar_ref: new_avatar.clone(),
            handle: handle.clone(),
        };
        self.snapshots.set(did.clone(), updated);

        if !had_prior_snapshot {
            // First capture is discovery, not a change.
            return Ok(());
        }
        if !display_name_changed && !avatar_changed {
            return Ok(());
        }

        let candidate = ChangeCandidate {
            did,
            handle: if handle.is_empty() { None } else { Some(handle.as_str().to_string()) },
            old_display_name: display_name_changed.then(|| snapshot.display_name.clone()),
            new_display_name: display_name_changed.then(|| new_display_name.clone()),
            old_avatar: avatar_changed.then(|| snapshot.avatar_ref.clone()),
            new_avatar: avatar_changed.then(|| new_avatar.clone()),
            ..Default::default()
        };
        self.persistence.insert(candidate).await?;
        Ok(())
    }

    /// Tracks a monitoring user's follow-record create/delete, requesting a
    /// DID-set reconcile when the set of followed accounts changes.
    async fn handle_follow_commit(
        &self,
        follower_str: &str,
        operation: CommitOperation,
        rkey: Option<&str>,
        record: &Option<CommitRecord>,
        is_backfill_mode: bool,
    ) -> Result<DispatchOutcome> {
        if operation != CommitOperation::Create && operation != CommitOperation::Delete {
            return Ok(DispatchOutcome::default());
        }

        let follower = Did::new(follower_str);
        if !self.monitoring.contains(&follower) {
            return Ok(DispatchOutcome::default());
        }
        if is_backfill_mode && !self.is_temp_stream {
            return Ok(DispatchOutcome::default());
        }

        match operation {
            CommitOperation::Create => self.handle_follow_create(&follower, rkey, record).await,
            CommitOperation::Delete => self.handle_follow_delete(&follower, rkey).await,
            CommitOperation::Update => unreachable!("filtered above"),
        }
    }

    async fn handle_follow_create(
        &self,
        follower: &Did,
        rkey: Option<&str>,
        record: &Option<CommitRecord>,
    ) -> Result<DispatchOutcome> {
        let Some(rkey) = rkey else {
            return Ok(DispatchOutcome::default());
        };
        let Some(subject) = record.as_ref().and_then(|r| r.subject.clone()) else {
            return Ok(DispatchOutcome::default());
        };
        let subject_did = Did::new(subject.clone());

        if self.persistence.follow_by_rkey(follower, rkey).await?.is_some() {
            if self.is_temp_stream {
                debug!(%follower, subject, rkey, "follow already persisted, skipping");
            }
            return Ok(DispatchOutcome::default());
        }

        let handle = self.resolver.resolve(&subject_did).await.unwrap_or_else(Handle::empty);
        let follow = MonitoredFollow {
            user_did: follower.as_str().to_string(),
            follow_did: subject,
            follow_handle: handle.as_str().to_string(),
            record_key: rkey.to_string(),
            added_at: chrono::Utc::now(),
        };
        self.persistence.upsert_follows(&[follow]).await?;
        Ok(DispatchOutcome { request_reconcile: true })
    }

    async fn handle_follow_delete(&self, follower: &Did, rkey: Option<&str>) -> Result<DispatchOutcome> {
        let Some(rkey) = rkey else {
            return Ok(DispatchOutcome::default());
        };
        let Some(existing) = self.persistence.follow_by_rkey(follower, rkey).await? else {
            return Ok(DispatchOutcome::default());
        };

        let subject_did = Did::new(existing.follow_did.clone());
        self.persistence.remove_follow(follower, &subject_did).await?;

        let remaining = self.persistence.followers_of(&subject_did).await?;
        if remaining.is_empty() {
            Ok(DispatchOutcome { request_reconcile: true })
        } else {
            Ok(DispatchOutcome::default())
        }
    }
}
