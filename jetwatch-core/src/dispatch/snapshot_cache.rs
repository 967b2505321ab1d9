//! In-memory profile snapshot cache. One instance per stream — never
//! shared between the main stream and a temporary backfill stream.

use dashmap::DashMap;

use crate::domain::ProfileSnapshot;
use crate::types::Did;

#[derive(Default)]
pub struct SnapshotCache {
    snapshots: DashMap<Did, ProfileSnapshot>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, did: &Did) -> Option<ProfileSnapshot> {
        self.snapshots.get(did).map(|entry| entry.clone())
    }

    pub fn set(&self, did: Did, snapshot: ProfileSnapshot) {
        self.snapshots.insert(did, snapshot);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }
}
