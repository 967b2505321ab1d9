//! State machine and status/info types for the main stream manager.

use chrono::{DateTime, Utc};
use jetwatch_core::types::Cursor;

/// `INIT -> IDLE -> CONNECTED <-> RECONNECTING -> STOPPED`. `IDLE` is re-entered whenever the monitored DID set becomes
/// empty.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MainStreamState {
    #[default]
    Init,
    Idle,
    Connected,
    Reconnecting,
    Stopped,
}

/// What triggered a DID-set reload — purely diagnostic, doesn't change
/// reconcile behavior.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReloadSource {
    Manual,
    FollowCreate,
    FollowDelete,
    Bootstrap,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MainStreamStatus {
    pub running: bool,
    pub monitored_dids: usize,
    pub has_valid_cursor: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CursorInfo {
    pub cursor: Option<Cursor>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UptimeInfo {
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<i64>,
}

/// Uptime debounce before `hasValidCursor` can become true.
pub const VALID_CURSOR_MIN_UPTIME_SECS: i64 = 30;

/// Lag threshold past which the main stream considers itself "in
/// backfill".
pub const BACKFILL_LAG_THRESHOLD_SECS: i64 = 60;
