//! The main stream manager: the single persistent connection
//! to the Jetstream firehose, DID-set reconciliation, reconnect-with-
//! backoff, cursor advancement, and backfill-lag detection. Modeled as a
//! long-lived actor task owned by the composition root, with a
//! `watch` channel carrying pending-reconcile requests (coalesced for
//! free by `watch`'s single-slot semantics) and a `CancellationToken` for
//! shutdown.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use jetwatch_core::dispatch::{Dispatcher, InMemoryMonitoringRegistry};
use jetwatch_core::jetstream::{
    build_options_message, build_subscribe_url, cursor_24h_ago_micros, cursor_now_micros,
    JetstreamFrame, JetstreamHostPool,
};
use jetwatch_core::persistence::Persistence;
use jetwatch_core::resolver::HandleResolver;
use jetwatch_core::types::{Cursor, Did};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::follow_graph::FollowGraphClient;
use crate::main_stream::state::{
    CursorInfo, MainStreamState, MainStreamStatus, ReloadSource, UptimeInfo,
    BACKFILL_LAG_THRESHOLD_SECS, VALID_CURSOR_MIN_UPTIME_SECS,
};
use crate::status::{CursorUpdate, StatusBroadcaster};

const RECONNECT_BACKOFF_CAP_SECS: u64 = 30;
const STOP_CURSOR_SETTING_KEY: &str = "main_stream.stop_cursor";
const STOP_TIME_SETTING_KEY: &str = "main_stream.stop_time";

#[derive(Default)]
struct SharedState {
    machine: MainStreamState,
    cursor: Option<Cursor>,
    started_at: Option<chrono::DateTime<Utc>>,
    in_backfill: bool,
}

pub struct MainStreamManager {
    persistence: Arc<dyn Persistence>,
    resolver: Arc<HandleResolver>,
    monitoring: Arc<InMemoryMonitoringRegistry>,
    follow_graph: Arc<FollowGraphClient>,
    broadcaster: Arc<StatusBroadcaster>,
    host_pool: JetstreamHostPool,
    dispatcher: Arc<Dispatcher>,
    shared: RwLock<SharedState>,
    reload_tx: watch::Sender<u64>,
    shutdown: CancellationToken,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl MainStreamManager {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        resolver: Arc<HandleResolver>,
        monitoring: Arc<InMemoryMonitoringRegistry>,
        follow_graph: Arc<FollowGraphClient>,
        broadcaster: Arc<StatusBroadcaster>,
        host_pool: JetstreamHostPool,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher::new(
            persistence.clone(),
            resolver.clone(),
            monitoring.clone(),
            false,
        ));
        let (reload_tx, _reload_rx) = watch::channel(0u64);
        Arc::new(Self {
            persistence,
            resolver,
            monitoring,
            follow_graph,
            broadcaster,
            host_pool,
            dispatcher,
            shared: RwLock::new(SharedState {
                machine: MainStreamState::Init,
                ..Default::default()
            }),
            reload_tx,
            shutdown: CancellationToken::new(),
            task: AsyncMutex::new(None),
        })
    }

    /// The recommended resume cursor: the stored stop cursor if it's less
    /// than 24h stale, otherwise `None` so the stream starts live.
    pub async fn get_recommended_start_cursor(&self) -> Option<Cursor> {
        let stop_time: Option<chrono::DateTime<Utc>> = self
            .persistence
            .get_setting(STOP_TIME_SETTING_KEY)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok());
        let stop_cursor: Option<i64> = self
            .persistence
            .get_setting(STOP_CURSOR_SETTING_KEY)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok());

        match (stop_time, stop_cursor) {
            (Some(stopped_at), Some(cursor)) => {
                let age = Utc::now().signed_duration_since(stopped_at);
                if age.num_seconds() < 24 * 60 * 60 {
                    Some(Cursor::from_micros(cursor))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn status(self: &Arc<Self>) -> MainStreamStatus {
        let shared = self.shared.read().expect("main stream lock poisoned");
        MainStreamStatus {
            running: matches!(shared.machine, MainStreamState::Connected | MainStreamState::Reconnecting),
            monitored_dids: self.monitoring.snapshot().len(),
            has_valid_cursor: self.is_running_with_cursor_locked(&shared),
        }
    }

    pub fn cursor_info(&self) -> CursorInfo {
        CursorInfo {
            cursor: self.shared.read().expect("main stream lock poisoned").cursor,
        }
    }

    pub fn uptime_info(&self) -> UptimeInfo {
        let shared = self.shared.read().expect("main stream lock poisoned");
        UptimeInfo {
            started_at: shared.started_at,
            uptime_secs: shared
                .started_at
                .map(|t| Utc::now().signed_duration_since(t).num_seconds()),
        }
    }

    /// `hasValidCursor`: non-null cursor *and* uptime >= 30s.
    pub fn is_running_with_cursor(&self) -> bool {
        let shared = self.shared.read().expect("main stream lock poisoned");
        self.is_running_with_cursor_locked(&shared)
    }

    fn is_running_with_cursor_locked(&self, shared: &SharedState) -> bool {
        let uptime_ok = shared
            .started_at
            .map(|t| Utc::now().signed_duration_since(t).num_seconds() >= VALID_CURSOR_MIN_UPTIME_SECS)
            .unwrap_or(false);
        shared.cursor.is_some() && uptime_ok
    }

    pub fn is_in_backfill(&self) -> bool {
        self.shared.read().expect("main stream lock poisoned").in_backfill
    }

    /// Requests a DID-set reconciliation.
    pub fn reload_dids_now(&self, source: ReloadSource) {
        debug!(?source, "DID-set reload requested");
        self.reload_tx.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub async fn start(self: &Arc<Self>, cursor: Option<Cursor>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        {
            let mut shared = self.shared.write().expect("main stream lock poisoned");
            shared.machine = MainStreamState::Idle;
            shared.cursor = cursor;
            shared.started_at = Some(Utc::now());
            shared.in_backfill = cursor
                .map(|c| Utc::now().timestamp_micros() - c.micros() > BACKFILL_LAG_THRESHOLD_SECS * 1_000_000)
                .unwrap_or(false);
        }
        let inner = self.clone();
        *task = Some(tokio::spawn(async move {
            inner.run(cursor).await;
        }));
    }

    pub async fn stop(self: &Arc<Self>) {
        self.shutdown.cancel();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let cursor = self.shared.read().expect("main stream lock poisoned").cursor;
        if let Some(cursor) = cursor {
            let _ = self
                .persistence
                .set_setting(STOP_CURSOR_SETTING_KEY, &cursor.micros().to_string())
                .await;
            let _ = self
                .persistence
                .set_setting(STOP_TIME_SETTING_KEY, &Utc::now().to_rfc3339())
                .await;
        }

        let mut shared = self.shared.write().expect("main stream lock poisoned");
        shared.machine = MainStreamState::Stopped;
        shared.cursor = None;
        shared.started_at = None;
    }

    /// Gathers monitoring-user DIDs first, then their follow targets, minus the ignore list.
    async fn wanted_dids(&self) -> Vec<String> {
        let users = self.monitoring.snapshot();
        let mut seen: HashSet<String> = HashSet::new();
        let mut ordered = Vec::new();

        for did in &users {
            if seen.insert(did.as_str().to_string()) {
                ordered.push(did.as_str().to_string());
            }
        }
        for did in &users {
            if let Ok(follows) = self.persistence.follows_for_user(did).await {
                for follow in follows {
                    if seen.insert(follow.follow_did.clone()) {
                        ordered.push(follow.follow_did);
                    }
                }
            }
        }

        if let Ok(ignored) = self.persistence.list_ignored().await {
            let ignored: HashSet<String> = ignored.into_iter().map(|i| i.did).collect();
            ordered.retain(|did| !ignored.contains(did));
        }

        ordered
    }

    /// Follow-sync bootstrap: reconciles `monitored_follows`
    /// against each monitoring user's current follow list. Non-fatal on
    /// failure.
    async fn follow_sync_bootstrap(&self) {
        for user_did in self.monitoring.snapshot() {
            let fetched = self.follow_graph.get_follows(&user_did).await;
            let fetched_dids: HashSet<String> = fetched.iter().map(|(d, _)| d.as_str().to_string()).collect();

            let current = match self.persistence.follows_for_user(&user_did).await {
                Ok(follows) => follows,
                Err(err) => {
                    warn!(%user_did, %err, "follow-sync bootstrap: failed to read current follows");
                    continue;
                }
            };

            for stale in current.iter().filter(|f| !fetched_dids.contains(&f.follow_did)) {
                let follow_did = Did::new(stale.follow_did.clone());
                if let Err(err) = self.persistence.remove_follow(&user_did, &follow_did).await {
                    warn!(%user_did, %follow_did, %err, "follow-sync bootstrap: failed to remove stale follow");
                }
            }

            let new_follows: Vec<_> = fetched
                .into_iter()
                .map(|(did, handle)| jetwatch_core::domain::MonitoredFollow {
                    user_did: user_did.as_str().to_string(),
                    follow_did: did.as_str().to_string(),
                    follow_handle: handle.as_str().to_string(),
                    record_key: String::new(),
                    added_at: Utc::now(),
                })
                .collect();
            if let Err(err) = self.persistence.upsert_follows(&new_follows).await {
                warn!(%user_did, %err, "follow-sync bootstrap: failed to upsert follows");
            }
        }
    }

    async fn run(self: Arc<Self>, seed_cursor: Option<Cursor>) {
        self.follow_sync_bootstrap().await;

        let mut reload_rx = self.reload_tx.subscribe();
        let mut attempt: u32 = 0;
        let mut cursor = seed_cursor;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let wanted_dids = self.wanted_dids().await;
            if wanted_dids.is_empty() {
                self.shared.write().expect("main stream lock poisoned").machine = MainStreamState::Idle;
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = reload_rx.changed() => continue,
                }
            }

            {
                let mut shared = self.shared.write().expect("main stream lock poisoned");
                shared.machine = if attempt == 0 {
                    MainStreamState::Connected
                } else {
                    MainStreamState::Reconnecting
                };
            }

            let subscribe_req = build_subscribe_url(&self.host_pool, cursor);
            info!(url = %subscribe_req.url, attempt, "connecting to jetstream");

            let fast_reconnect = match self
                .connect_and_process(&subscribe_req.url, wanted_dids, &mut cursor, &mut reload_rx)
                .await
            {
                ConnectOutcome::Stopped => break,
                ConnectOutcome::Reconcile => true,
                ConnectOutcome::Disconnected => false,
            };

            if fast_reconnect {
                attempt = 0;
                continue;
            }

            let delay_secs = 2u64.saturating_pow(attempt).min(RECONNECT_BACKOFF_CAP_SECS);
            warn!(delay_secs, attempt, "jetstream disconnected, backing off");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = reload_rx.changed() => { attempt = 0; continue; }
                _ = tokio::time::sleep(Duration::from_secs(delay_secs)) => {}
            }
            attempt = attempt.saturating_add(1);
        }
    }

    async fn connect_and_process(
        &self,
        url: &str,
        wanted_dids: Vec<String>,
        cursor: &mut Option<Cursor>,
        reload_rx: &mut watch::Receiver<u64>,
    ) -> ConnectOutcome {
        let (ws_stream, _) = match connect_async(url).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "jetstream connect failed");
                return ConnectOutcome::Disconnected;
            }
        };
        let (mut write, mut read) = ws_stream.split();

        let options = build_options_message(wanted_dids);
        let options_json = match serde_json::to_string(&options) {
            Ok(json) => json,
            Err(err) => {
                warn!(%err, "failed to encode options message");
                return ConnectOutcome::Disconnected;
            }
        };
        if let Err(err) = write.send(Message::Text(options_json)).await {
            warn!(%err, "failed to send options message");
            return ConnectOutcome::Disconnected;
        }

        let start_wall_time_us = Utc::now().timestamp_micros();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = write.close().await;
                    return ConnectOutcome::Stopped;
                }
                _ = reload_rx.changed() => {
                    return ConnectOutcome::Reconcile;
                }
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.process_frame(&text, cursor, start_wall_time_us).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return ConnectOutcome::Disconnected;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(%err, "jetstream read error");
                            return ConnectOutcome::Disconnected;
                        }
                    }
                }
            }
        }
    }

    async fn process_frame(&self, text: &str, cursor: &mut Option<Cursor>, start_wall_time_us: i64) {
        let frame: JetstreamFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%err, "malformed jetstream frame, skipping");
                return;
            }
        };

        let decoded = frame.decode();
        let is_backfill_mode = self.is_in_backfill();

        match self.dispatcher.dispatch(&decoded, is_backfill_mode).await {
            Ok(outcome) => {
                *cursor = Some(Cursor::from_micros(frame.time_us));
                {
                    let mut shared = self.shared.write().expect("main stream lock poisoned");
                    shared.cursor = *cursor;
                    if shared.in_backfill && frame.time_us >= start_wall_time_us {
                        shared.in_backfill = false;
                    }
                }
                self.broadcaster.broadcast_cursor(CursorUpdate {
                    timestamp_iso: Some(chrono::DateTime::<Utc>::from_timestamp_micros(frame.time_us).unwrap_or_else(Utc::now).to_rfc3339()),
                    is_in_backfill: self.is_in_backfill(),
                });
                if outcome.request_reconcile {
                    self.reload_dids_now(ReloadSource::FollowCreate);
                }
            }
            Err(err) => {
                warn!(%err, did = %frame.did, "event handler failed, cursor not advanced");
            }
        }
    }
}

enum ConnectOutcome {
    Stopped,
    Reconcile,
    Disconnected,
}

/// Convenience used by the backfill auto-restart scan at boot: the 24h replay window for a fresh temp stream.
pub fn fresh_backfill_cursor() -> Cursor {
    cursor_24h_ago_micros()
}

/// Re-exported for callers that want "now" in the same units as a cursor.
pub fn now_cursor() -> Cursor {
    cursor_now_micros()
}
