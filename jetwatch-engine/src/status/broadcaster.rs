//! Status snapshot aggregation and subscription-list fan-out.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq)]
pub struct MainStreamStatusView {
    pub running: bool,
    pub monitored_dids: usize,
    pub has_valid_cursor: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TempPoolStatusView {
    pub active: usize,
    pub max: usize,
    pub queue_length: usize,
    pub available_slots: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UserBackfillStatusView {
    pub did: String,
    pub handle: String,
    pub monitored_count: usize,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub has_completed_backfill: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatusSnapshot {
    pub main_stream: MainStreamStatusView,
    pub temp_pool: TempPoolStatusView,
    pub users: Vec<UserBackfillStatusView>,
    pub active_temp_users: Vec<String>,
}

/// Lighter, more frequent notification than `StatusSnapshot`.
#[derive(Clone, Debug, PartialEq)]
pub struct CursorUpdate {
    pub timestamp_iso: Option<String>,
    pub is_in_backfill: bool,
}

#[derive(Clone, Debug)]
pub enum BroadcastMessage {
    Status(StatusSnapshot),
    Cursor(CursorUpdate),
}

#[derive(Default)]
pub struct StatusBroadcaster {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<BroadcastMessage>>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber and returns the receiving half.
    pub fn register(&self) -> mpsc::UnboundedReceiver<BroadcastMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().expect("broadcaster lock poisoned").push(tx);
        rx
    }

    fn broadcast(&self, message: BroadcastMessage) {
        let mut subscribers = self.subscribers.lock().expect("broadcaster lock poisoned");
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
    }

    pub fn broadcast_status(&self, snapshot: StatusSnapshot) {
        self.broadcast(BroadcastMessage::Status(snapshot));
    }

    pub fn broadcast_cursor(&self, update: CursorUpdate) {
        self.broadcast(BroadcastMessage::Cursor(update));
    }
}
