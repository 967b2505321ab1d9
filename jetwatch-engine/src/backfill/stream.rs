//! One temporary backfill stream's lifecycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use jetwatch_core::dispatch::{Dispatcher, InMemoryMonitoringRegistry};
use jetwatch_core::jetstream::protocol::OptionsUpdateMessage;
use jetwatch_core::jetstream::{build_subscribe_url, cursor_24h_ago_micros, JetstreamFrame, JetstreamHostPool};
use jetwatch_core::persistence::Persistence;
use jetwatch_core::resolver::HandleResolver;
use jetwatch_core::types::Did;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECONNECT_BACKOFF_CAP_SECS: u64 = 30;

pub struct TempStreamRequest {
    pub user_did: Did,
    pub follow_dids: Vec<Did>,
}

/// Runs to completion: either the filtered follow list is empty (no
/// connection opened), the catch-up point is reached, or `shutdown` fires.
/// Always ends by calling `mark_backfill_completed`—
/// except when cancelled by shutdown, where the state is left in-flight so
/// the next boot's auto-restart scan picks it back up.
pub async fn run_temp_stream(
    request: TempStreamRequest,
    persistence: Arc<dyn Persistence>,
    resolver: Arc<HandleResolver>,
    monitoring: Arc<InMemoryMonitoringRegistry>,
    host_pool: JetstreamHostPool,
    shutdown: CancellationToken,
) {
    let TempStreamRequest { user_did, follow_dids } = request;
    let log_prefix = resolver
        .resolve(&user_did)
        .await
        .map(|h| h.as_str().to_string())
        .unwrap_or_else(|| user_did.as_str().to_string());

    let ignored: std::collections::HashSet<String> = persistence
        .list_ignored()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|i| i.did)
        .collect();
    let filtered: Vec<Did> = follow_dids
        .into_iter()
        .filter(|did| !ignored.contains(did.as_str()))
        .collect();

    let now = Utc::now();
    if filtered.is_empty() {
        info!(user = %log_prefix, "temp backfill: nothing to replay, marking complete immediately");
        let _ = persistence.mark_backfill_started(&user_did, now).await;
        let _ = persistence.mark_backfill_completed(&user_did, now).await;
        return;
    }

    if let Err(err) = persistence.mark_backfill_started(&user_did, now).await {
        warn!(user = %log_prefix, %err, "temp backfill: failed to mark started");
    }

    let dispatcher = Dispatcher::new(persistence.clone(), resolver.clone(), monitoring, true);
    let initial_cursor = cursor_24h_ago_micros();
    let start_time_ms = now.timestamp_millis();
    let wanted_dids: Vec<String> = filtered.iter().map(|d| d.as_str().to_string()).collect();

    let mut attempt: u32 = 0;
    let mut cursor = Some(initial_cursor);

    loop {
        if shutdown.is_cancelled() {
            info!(user = %log_prefix, "temp backfill: cancelled, leaving in-flight for next boot");
            return;
        }

        let subscribe_req = build_subscribe_url(&host_pool, cursor);
        match connect_and_replay(
            &subscribe_req.url,
            wanted_dids.clone(),
            &dispatcher,
            &mut cursor,
            start_time_ms,
            &shutdown,
            &log_prefix,
        )
        .await
        {
            TempStreamOutcome::CaughtUp => break,
            TempStreamOutcome::Cancelled => return,
            TempStreamOutcome::Disconnected => {
                let delay = 2u64.saturating_pow(attempt).min(RECONNECT_BACKOFF_CAP_SECS);
                warn!(user = %log_prefix, delay, attempt, "temp backfill: disconnected, backing off");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                }
                attempt = attempt.saturating_add(1);
            }
        }
    }

    if let Err(err) = persistence.mark_backfill_completed(&user_did, Utc::now()).await {
        warn!(user = %log_prefix, %err, "temp backfill: failed to mark completed");
    }
    info!(user = %log_prefix, "temp backfill: complete");
}

enum TempStreamOutcome {
    CaughtUp,
    Cancelled,
    Disconnected,
}

async fn connect_and_replay(
    url: &str,
    wanted_dids: Vec<String>,
    dispatcher: &Dispatcher,
    cursor: &mut Option<jetwatch_core::types::Cursor>,
    start_time_ms: i64,
    shutdown: &CancellationToken,
    log_prefix: &str,
) -> TempStreamOutcome {
    let (ws_stream, _) = match connect_async(url).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(user = log_prefix, %err, "temp backfill: connect failed");
            return TempStreamOutcome::Disconnected;
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let options = OptionsUpdateMessage::for_single_user(wanted_dids);
    let options_json = match serde_json::to_string(&options) {
        Ok(json) => json,
        Err(err) => {
            warn!(%err, "temp backfill: failed to encode options message");
            return TempStreamOutcome::Disconnected;
        }
    };
    if write.send(Message::Text(options_json)).await.is_err() {
        return TempStreamOutcome::Disconnected;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.close().await;
                return TempStreamOutcome::Cancelled;
            }
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let frame: JetstreamFrame = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(err) => {
                                debug!(%err, "temp backfill: malformed frame, skipping");
                                continue;
                            }
                        };
                        let decoded = frame.decode();
                        // Follow events are always processed on temp streams.
                        if let Err(err) = dispatcher.dispatch(&decoded, false).await {
                            warn!(user = log_prefix, %err, "temp backfill: event handler failed");
                        } else {
                            *cursor = Some(jetwatch_core::types::Cursor::from_micros(frame.time_us));
                        }
                        if frame.time_us / 1000 >= start_time_ms {
                            let _ = write.close().await;
                            return TempStreamOutcome::CaughtUp;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return TempStreamOutcome::Disconnected,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(user = log_prefix, %err, "temp backfill: read error");
                        return TempStreamOutcome::Disconnected;
                    }
                }
            }
        }
    }
}
