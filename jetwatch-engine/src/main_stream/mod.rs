pub mod manager;
pub mod state;

pub use manager::{fresh_backfill_cursor, now_cursor, MainStreamManager};
pub use state::{
    CursorInfo, MainStreamState, MainStreamStatus, ReloadSource, UptimeInfo,
    BACKFILL_LAG_THRESHOLD_SECS, VALID_CURSOR_MIN_UPTIME_SECS,
};
