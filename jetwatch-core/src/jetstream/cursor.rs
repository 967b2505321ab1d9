//! Cursor math and subscribe-request assembly.

use chrono::Utc;
use rand::seq::SliceRandom;

use crate::jetstream::protocol::OptionsUpdateMessage;
use crate::types::Cursor;

pub const RETENTION_HORIZON_SECS: i64 = 24 * 60 * 60;
pub const MAX_WANTED_DIDS: usize = 10_000;

pub fn cursor_now_micros() -> Cursor {
    Cursor::from_micros(Utc::now().timestamp_micros())
}

pub fn cursor_24h_ago_micros() -> Cursor {
    Cursor::from_micros(Utc::now().timestamp_micros() - RETENTION_HORIZON_SECS * 1_000_000)
}

/// Non-empty set of candidate Jetstream hosts to connect to. Validated once
/// at config load; `pick` panics only if constructed with an empty vec,
/// which the config loader refuses to do.
#[derive(Clone, Debug)]
pub struct JetstreamHostPool {
    hosts: Vec<String>,
}

impl JetstreamHostPool {
    pub fn new(hosts: Vec<String>) -> Result<Self, String> {
        if hosts.is_empty() {
            return Err("upstream_hosts must be non-empty".to_string());
        }
        Ok(Self { hosts })
    }

    /// Picks one host uniformly at random.
    pub fn pick(&self) -> &str {
        self.hosts
            .choose(&mut rand::thread_rng())
            .expect("host pool validated non-empty at construction")
    }
}

/// Picked host is recorded alongside the URL for diagnostics.
#[derive(Clone, Debug)]
pub struct SubscribeRequest {
    pub url: String,
    pub host: String,
}

/// `requireHello=true` instructs the upstream to wait for the options
/// message before it starts streaming.
pub fn build_subscribe_url(pool: &JetstreamHostPool, cursor: Option<Cursor>) -> SubscribeRequest {
    let host = pool.pick().to_string();
    let mut url = format!("wss://{host}/subscribe?requireHello=true");
    if let Some(cursor) = cursor {
        url.push_str(&format!("&cursor={}", cursor.micros()));
    }
    SubscribeRequest { url, host }
}

/// Caps `wanted_dids` at 10 000, logging a warning and dropping the
/// surplus. Callers are responsible for ordering monitoring-user DIDs
/// first so they survive truncation.
pub fn build_options_message(wanted_dids: Vec<String>) -> OptionsUpdateMessage {
    let total = wanted_dids.len();
    let capped = if total > MAX_WANTED_DIDS {
        tracing::warn!(
            total,
            cap = MAX_WANTED_DIDS,
            dropped = total - MAX_WANTED_DIDS,
            "wanted DID set exceeds cap, truncating"
        );
        wanted_dids.into_iter().take(MAX_WANTED_DIDS).collect()
    } else {
        wanted_dids
    };
    OptionsUpdateMessage::new(capped)
}
