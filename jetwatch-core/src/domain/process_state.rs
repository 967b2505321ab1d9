use chrono::{DateTime, Utc};

use crate::types::Cursor;

/// `stop_cursor` / `stop_time` written on graceful shutdown so the main
/// stream can resume correctly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessState {
    pub stop_cursor: Option<Cursor>,
    pub stop_time: Option<DateTime<Utc>>,
}
