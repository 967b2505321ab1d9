use chrono::{DateTime, Utc};

/// Presence of a row suppresses inbound change-record inserts for the DID
/// and excludes it from subscription lists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IgnoredDid {
    pub did: String,
    pub added_at: DateTime<Utc>,
}
