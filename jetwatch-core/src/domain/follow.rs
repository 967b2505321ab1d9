use chrono::{DateTime, Utc};

/// Primary key `(user_did, follow_did)`. `record_key` is the only reliable
/// key for processing unfollow events, since Jetstream delete commits carry
/// a record key but not the subject DID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitoredFollow {
    pub user_did: String,
    pub follow_did: String,
    pub follow_handle: String,
    pub record_key: String,
    pub added_at: DateTime<Utc>,
}
