use chrono::{DateTime, Utc};

/// Per-monitoring-user backfill bookkeeping. Invariant:
/// `last_completed_at >= last_started_at` once a backfill is complete;
/// `last_completed_at` is `None` while one is in flight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackfillState {
    pub user_did: String,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BackfillState {
    pub fn is_in_flight(&self) -> bool {
        self.last_started_at.is_some()
            && match self.last_completed_at {
                None => true,
                Some(completed) => {
                    Some(completed) < self.last_started_at
                }
            }
    }
}
