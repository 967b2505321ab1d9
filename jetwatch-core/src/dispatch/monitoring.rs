//! The set of "monitoring users" — accounts whose own profile and follow
//! activity the engine tracks. This set is assembled by whatever owns
//! account configuration (the HTTP API layer, which this engine doesn't
//! implement); the dispatcher and main stream manager only need to query
//! and update it, so it's a small seam rather than a persisted table of
//! its own.

use std::collections::HashSet;
use std::sync::RwLock;

use crate::types::Did;

pub trait MonitoringRegistry: Send + Sync {
    fn contains(&self, did: &Did) -> bool;
    fn snapshot(&self) -> Vec<Did>;
}

#[derive(Default)]
pub struct InMemoryMonitoringRegistry {
    users: RwLock<HashSet<Did>>,
}

impl InMemoryMonitoringRegistry {
    pub fn new(initial: impl IntoIterator<Item = Did>) -> Self {
        Self {
            users: RwLock::new(initial.into_iter().collect()),
        }
    }

    pub fn insert(&self, did: Did) {
        self.users.write().expect("registry lock poisoned").insert(did);
    }

    pub fn remove(&self, did: &Did) {
        self.users.write().expect("registry lock poisoned").remove(did);
    }
}

impl MonitoringRegistry for InMemoryMonitoringRegistry {
    fn contains(&self, did: &Did) -> bool {
        self.users.read().expect("registry lock poisoned").contains(did)
    }

    fn snapshot(&self) -> Vec<Did> {
        self.users.read().expect("registry lock poisoned").iter().cloned().collect()
    }
}
