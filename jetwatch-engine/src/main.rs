//! # Jetwatch Engine
//!
//! Standalone ingestion and backfill engine for tracked AT Protocol
//! accounts: a single long-lived connection to the Jetstream firehose
//! that records handle, display-name, and avatar mutations, plus a pool
//! of temporary streams that backfill a newly monitored user's follow
//! graph.
//!
//! ## Architecture
//!
//! - Postgres for durable change records and follow/backfill bookkeeping
//! - `tokio-tungstenite` for the Jetstream WebSocket transport
//! - `reqwest` for did:plc directory lookups and `getFollows` pagination

use std::sync::Arc;

use clap::Parser;
use jetwatch_engine::app_context::AppContext;
use jetwatch_engine::config::Config;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments for the Jetwatch engine.
#[derive(Parser, Debug)]
#[command(name = "jetwatch-engine")]
#[command(about = "Jetstream ingestion and backfill engine for monitored AT Protocol accounts")]
struct Args {
    /// Override TEMP_POOL_CAPACITY from the environment.
    #[arg(long, env = "TEMP_POOL_CAPACITY")]
    temp_pool_capacity: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(capacity) = args.temp_pool_capacity {
        config.temp_pool_capacity = capacity;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jetwatch_engine=info,jetwatch_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(hosts = ?config.upstream_hosts, "engine configuration loaded");

    let ctx = Arc::new(AppContext::build(config).await?);
    ctx.seed_monitoring_from_existing_state().await?;

    let shutdown_ctx = ctx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        shutdown_ctx.shutdown.cancel();
    });

    if let Err(err) = ctx.run().await {
        error!(%err, "engine exited with error");
        return Err(err);
    }

    info!("engine stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
