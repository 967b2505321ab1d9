use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Did;

/// Classification assigned by `Persistence::insert` once it has established
/// the candidate isn't a duplicate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Handle,
    Profile,
    Combined,
}

impl ChangeType {
    /// Picks the classification for a candidate that has already been
    /// confirmed non-duplicate.
    pub fn classify(candidate: &ChangeCandidate) -> Self {
        let has_handle_transition =
            non_empty(&candidate.old_handle) && non_empty(&candidate.new_handle);
        let has_profile_transition = candidate.old_display_name.is_some()
            || candidate.new_display_name.is_some()
            || candidate.old_avatar.is_some()
            || candidate.new_avatar.is_some();

        match (has_handle_transition, has_profile_transition) {
            (true, true) => ChangeType::Combined,
            (true, false) => ChangeType::Handle,
            (false, _) => ChangeType::Profile,
        }
    }
}

fn non_empty(field: &Option<String>) -> bool {
    matches!(field, Some(s) if !s.is_empty())
}

/// A candidate change awaiting idempotent insertion. Any `old_*`/`new_*`
/// field left `None` participates in null-equal duplicate comparison.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeCandidate {
    pub did: Did,
    pub handle: Option<String>,
    pub old_handle: Option<String>,
    pub new_handle: Option<String>,
    pub old_display_name: Option<String>,
    pub new_display_name: Option<String>,
    pub old_avatar: Option<String>,
    pub new_avatar: Option<String>,
}

impl ChangeCandidate {
    /// Null-equal six-tuple comparison: two `None`s match each other, per
    /// the data-model's duplicate-detection rule.
    pub fn duplicate_key_matches(&self, other: &ChangeCandidate) -> bool {
        self.did == other.did
            && self.old_display_name == other.old_display_name
            && self.new_display_name == other.new_display_name
            && self.old_avatar == other.old_avatar
            && self.new_avatar == other.new_avatar
            && self.old_handle == other.old_handle
            && self.new_handle == other.new_handle
    }

    /// Invariant: every candidate must differ in at least one old/new pair.
    pub fn has_any_transition(&self) -> bool {
        self.old_handle != self.new_handle
            || self.old_display_name != self.new_display_name
            || self.old_avatar != self.new_avatar
    }
}

/// Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: Uuid,
    pub did: String,
    pub handle: Option<String>,
    pub old_handle: Option<String>,
    pub new_handle: Option<String>,
    pub old_display_name: Option<String>,
    pub new_display_name: Option<String>,
    pub old_avatar: Option<String>,
    pub new_avatar: Option<String>,
    pub change_type: ChangeType,
    pub changed_at: DateTime<Utc>,
}

/// Result of `Persistence::insert`.
#[derive(Clone, Debug)]
pub enum InsertOutcome {
    Inserted(ChangeRecord),
    Duplicate(ChangeRecord),
    Ignored,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ChangeCandidate {
        ChangeCandidate {
            did: Did::new("did:plc:a"),
            handle: Some("alice".into()),
            ..Default::default()
        }
    }

    #[test]
    fn classify_handle_only() {
        let mut c = base();
        c.old_handle = Some("old.example".into());
        c.new_handle = Some("new.example".into());
        assert_eq!(ChangeType::classify(&c), ChangeType::Handle);
    }

    #[test]
    fn classify_profile_only() {
        let mut c = base();
        c.old_display_name = Some("Bob".into());
        c.new_display_name = Some("Bobby".into());
        assert_eq!(ChangeType::classify(&c), ChangeType::Profile);
    }

    #[test]
    fn classify_combined() {
        let mut c = base();
        c.old_handle = Some("old.example".into());
        c.new_handle = Some("new.example".into());
        c.old_display_name = Some("Bob".into());
        c.new_display_name = Some("Bobby".into());
        assert_eq!(ChangeType::classify(&c), ChangeType::Combined);
    }

    #[test]
    fn null_equal_duplicate_matching() {
        let mut a = base();
        a.old_avatar = None;
        a.new_avatar = None;
        let mut b = base();
        b.old_avatar = None;
        b.new_avatar = None;
        assert!(a.duplicate_key_matches(&b));

        b.new_avatar = Some("cid1".into());
        assert!(!a.duplicate_key_matches(&b));
    }

    #[test]
    fn requires_some_transition() {
        let c = base();
        assert!(!c.has_any_transition());
    }
}
