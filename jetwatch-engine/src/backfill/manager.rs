//! Bounded pool of temporary backfill streams with a FIFO wait queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use jetwatch_core::dispatch::InMemoryMonitoringRegistry;
use jetwatch_core::jetstream::JetstreamHostPool;
use jetwatch_core::persistence::Persistence;
use jetwatch_core::resolver::HandleResolver;
use jetwatch_core::types::Did;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backfill::stream::{run_temp_stream, TempStreamRequest};
use crate::main_stream::MainStreamManager;
use crate::status::StatusBroadcaster;

const DEFAULT_CAPACITY: usize = 50;
const BOOT_RETRY_DELAY_SECS: u64 = 30;

pub enum StartOutcome {
    Started,
    Queued { position: usize },
    AlreadyActive,
}

#[derive(Debug, Clone)]
pub struct CanStart {
    pub allowed: bool,
    pub reason: Option<String>,
    pub queue_position: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct TempPoolStatus {
    pub active: usize,
    pub max: usize,
    pub queue_length: usize,
    pub available_slots: usize,
    pub active_users: Vec<String>,
}

struct ActiveStream {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct QueuedRequest {
    user_did: Did,
    follow_dids: Vec<Did>,
}

struct PoolState {
    active: HashMap<String, ActiveStream>,
    queue: VecDeque<QueuedRequest>,
}

pub struct BackfillManager {
    persistence: Arc<dyn Persistence>,
    resolver: Arc<HandleResolver>,
    monitoring: Arc<InMemoryMonitoringRegistry>,
    host_pool: JetstreamHostPool,
    broadcaster: Arc<StatusBroadcaster>,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl BackfillManager {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        resolver: Arc<HandleResolver>,
        monitoring: Arc<InMemoryMonitoringRegistry>,
        host_pool: JetstreamHostPool,
        broadcaster: Arc<StatusBroadcaster>,
        capacity: Option<usize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            persistence,
            resolver,
            monitoring,
            host_pool,
            broadcaster,
            capacity: capacity.unwrap_or(DEFAULT_CAPACITY),
            state: Mutex::new(PoolState {
                active: HashMap::new(),
                queue: VecDeque::new(),
            }),
        })
    }

    pub async fn can_start(&self, user_did: &Did) -> CanStart {
        let state = self.state.lock().await;
        if state.active.contains_key(user_did.as_str()) {
            return CanStart { allowed: false, reason: Some("already active".into()), queue_position: None };
        }
        if state.active.len() < self.capacity {
            CanStart { allowed: true, reason: None, queue_position: None }
        } else {
            CanStart { allowed: false, reason: Some("pool at capacity".into()), queue_position: Some(state.queue.len()) }
        }
    }

    pub async fn start_for_user(self: &Arc<Self>, user_did: Did, follow_dids: Vec<Did>) -> StartOutcome {
        let mut state = self.state.lock().await;
        if state.active.contains_key(user_did.as_str()) {
            return StartOutcome::AlreadyActive;
        }

        if state.active.len() < self.capacity {
            self.spawn_stream(&mut state, user_did, follow_dids);
            StartOutcome::Started
        } else {
            state.queue.push_back(QueuedRequest { user_did, follow_dids });
            StartOutcome::Queued { position: state.queue.len() }
        }
    }

    pub async fn stop_for_user(&self, user_did: &Did) -> bool {
        let state = self.state.lock().await;
        if let Some(active) = state.active.get(user_did.as_str()) {
            active.cancel.cancel();
            true
        } else {
            false
        }
    }

    pub async fn status(&self) -> TempPoolStatus {
        let state = self.state.lock().await;
        TempPoolStatus {
            active: state.active.len(),
            max: self.capacity,
            queue_length: state.queue.len(),
            available_slots: self.capacity.saturating_sub(state.active.len()),
            active_users: state.active.keys().cloned().collect(),
        }
    }

    fn spawn_stream(self: &Arc<Self>, state: &mut PoolState, user_did: Did, follow_dids: Vec<Did>) {
        let cancel = CancellationToken::new();
        let request = TempStreamRequest { user_did: user_did.clone(), follow_dids };

        let pool = self.clone();
        let user_key = user_did.as_str().to_string();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_temp_stream(
                request,
                pool.persistence.clone(),
                pool.resolver.clone(),
                pool.monitoring.clone(),
                pool.host_pool.clone(),
                task_cancel,
            )
            .await;
            pool.on_stream_finished(&user_key).await;
        });

        state.active.insert(user_did.as_str().to_string(), ActiveStream { cancel, handle });
    }

    async fn on_stream_finished(self: &Arc<Self>, user_key: &str) {
        let mut state = self.state.lock().await;
        state.active.remove(user_key);

        if let Some(next) = state.queue.pop_front() {
            self.spawn_stream(&mut state, next.user_did, next.follow_dids);
        }
    }

    /// Scans `monitoring_backfill_state` for backfills that were in flight
    /// when the process last stopped and re-enqueues them. Retries once in 30s if the main stream
    /// isn't ready yet.
    pub async fn auto_restart_on_boot(self: &Arc<Self>, main_stream: Arc<MainStreamManager>) {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                if main_stream.is_running_with_cursor() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(BOOT_RETRY_DELAY_SECS)).await;
            }

            let states = match pool.persistence.list_backfill_states().await {
                Ok(states) => states,
                Err(err) => {
                    warn!(%err, "auto-restart scan: failed to list backfill states");
                    return;
                }
            };

            for state in states.into_iter().filter(|s| s.is_in_flight()) {
                let user_did = Did::new(state.user_did.clone());
                let follows = match pool.persistence.follows_for_user(&user_did).await {
                    Ok(follows) => follows,
                    Err(err) => {
                        warn!(%user_did, %err, "auto-restart scan: failed to load follows");
                        continue;
                    }
                };
                let follow_dids = follows.into_iter().map(|f| Did::new(f.follow_did)).collect();
                info!(%user_did, "auto-restart scan: re-enqueueing in-flight backfill");
                pool.start_for_user(user_did, follow_dids).await;
            }
        });
    }
}
