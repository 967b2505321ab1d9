//! Composition root: builds every long-lived component and wires
//! them together. `main.rs` owns an `AppContext` and drives its lifecycle;
//! nothing here spawns until `AppContext::run` is called.

use std::sync::Arc;

use jetwatch_core::dispatch::InMemoryMonitoringRegistry;
use jetwatch_core::jetstream::JetstreamHostPool;
use jetwatch_core::persistence::{Persistence, PostgresPersistence};
use jetwatch_core::resolver::HandleResolver;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backfill::BackfillManager;
use crate::config::Config;
use crate::follow_graph::FollowGraphClient;
use crate::main_stream::MainStreamManager;
use crate::status::{
    MainStreamStatusView, StatusBroadcaster, StatusSnapshot, TempPoolStatusView,
    UserBackfillStatusView,
};

/// How often the composition root pushes a full status snapshot to
/// subscribers, independent of the lighter per-event cursor updates the
/// main stream broadcasts directly.
const STATUS_SNAPSHOT_INTERVAL_SECS: u64 = 5;

pub struct AppContext {
    pub config: Config,
    pub persistence: Arc<dyn Persistence>,
    pub resolver: Arc<HandleResolver>,
    pub monitoring: Arc<InMemoryMonitoringRegistry>,
    pub follow_graph: Arc<FollowGraphClient>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub main_stream: Arc<MainStreamManager>,
    pub backfill: Arc<BackfillManager>,
    pub shutdown: CancellationToken,
}

impl AppContext {
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let postgres = PostgresPersistence::connect(&config.database_url).await?;
        postgres.migrate().await?;
        let persistence: Arc<dyn Persistence> = Arc::new(postgres);

        let resolver = Arc::new(HandleResolver::with_timeout(
            config.plc_directory_host.clone(),
            config.http_timeout,
        ));
        let monitoring = Arc::new(InMemoryMonitoringRegistry::default());
        let follow_graph = Arc::new(FollowGraphClient::new(
            config.follow_graph_host.clone(),
            config.http_timeout,
        ));
        let broadcaster = Arc::new(StatusBroadcaster::new());
        let host_pool = JetstreamHostPool::new(config.upstream_hosts.clone())
            .map_err(|err| anyhow::anyhow!(err))?;

        let main_stream = MainStreamManager::new(
            persistence.clone(),
            resolver.clone(),
            monitoring.clone(),
            follow_graph.clone(),
            broadcaster.clone(),
            host_pool.clone(),
        );

        let backfill = BackfillManager::new(
            persistence.clone(),
            resolver.clone(),
            monitoring.clone(),
            host_pool,
            broadcaster.clone(),
            Some(config.temp_pool_capacity),
        );

        Ok(Self {
            config,
            persistence,
            resolver,
            monitoring,
            follow_graph,
            broadcaster,
            main_stream,
            backfill,
            shutdown: CancellationToken::new(),
        })
    }

    /// Seeds the in-memory monitoring-user set from whoever already has a
    /// `monitoring_backfill_state` row, so a restart doesn't silently stop
    /// tracking everyone. A fresh deployment with no admin layer attached
    /// starts with an empty monitoring set and relies on an external caller
    /// to register DIDs via `self.monitoring`.
    pub async fn seed_monitoring_from_existing_state(&self) -> anyhow::Result<()> {
        let states = self.persistence.list_backfill_states().await?;
        for state in states {
            self.monitoring.insert(jetwatch_core::types::Did::new(state.user_did));
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let start_cursor = self.main_stream.get_recommended_start_cursor().await;
        self.main_stream.start(start_cursor).await;
        self.backfill.auto_restart_on_boot(self.main_stream.clone()).await;

        let snapshot_ctx = self.clone();
        let snapshot_task = tokio::spawn(async move { snapshot_ctx.run_status_snapshot_loop().await });

        info!("engine running");
        self.shutdown.cancelled().await;
        info!("shutdown requested, stopping main stream");
        self.main_stream.stop().await;
        snapshot_task.abort();
        Ok(())
    }

    /// §4.G: aggregates main-stream state, temp-pool state, and per-user
    /// backfill bookkeeping into one snapshot and hands it to the
    /// broadcaster. Pushed on a fixed interval rather than per mutation —
    /// every contributing mutation (reconcile, backfill start/complete,
    /// queue promotion) already happens inside independent actors, so a
    /// periodic pull here is simpler than threading a callback through all
    /// of them, and snapshots (never deltas) tolerate the latency per §7.
    async fn run_status_snapshot_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(STATUS_SNAPSHOT_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            let snapshot = self.build_status_snapshot().await;
            self.broadcaster.broadcast_status(snapshot);
        }
    }

    async fn build_status_snapshot(&self) -> StatusSnapshot {
        let main_status = self.main_stream.status();
        let pool_status = self.backfill.status().await;

        let mut users = Vec::new();
        for did in self.monitoring.snapshot() {
            let handle = self
                .resolver
                .resolve(&did)
                .await
                .map(|h| h.as_str().to_string())
                .unwrap_or_default();
            let monitored_count = self
                .persistence
                .follows_for_user(&did)
                .await
                .map(|follows| follows.len())
                .unwrap_or(0);
            let state = self.persistence.backfill_state(&did).await.ok().flatten();

            users.push(UserBackfillStatusView {
                did: did.as_str().to_string(),
                handle,
                monitored_count,
                last_started_at: state.as_ref().and_then(|s| s.last_started_at),
                last_completed_at: state.as_ref().and_then(|s| s.last_completed_at),
                has_completed_backfill: state.map(|s| s.last_completed_at.is_some()).unwrap_or(false),
            });
        }

        StatusSnapshot {
            main_stream: MainStreamStatusView {
                running: main_status.running,
                monitored_dids: main_status.monitored_dids,
                has_valid_cursor: main_status.has_valid_cursor,
            },
            temp_pool: TempPoolStatusView {
                active: pool_status.active,
                max: pool_status.max,
                queue_length: pool_status.queue_length,
                available_slots: pool_status.available_slots,
            },
            users,
            active_temp_users: pool_status.active_users,
        }
    }
}
