//! Best-effort DID→handle cache. Capacity 10 000, eviction by insertion
//! order — not true LRU. Negative results (`None`) are cached too, to suppress repeated
//! failed lookups.

use std::collections::{HashMap, VecDeque};

use crate::types::{Did, Handle};

pub struct HandleCache {
    capacity: usize,
    entries: HashMap<Did, Option<Handle>>,
    insertion_order: VecDeque<Did>,
}

impl HandleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity.min(1024)),
            insertion_order: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn get(&self, did: &Did) -> Option<Option<Handle>> {
        self.entries.get(did).cloned()
    }

    pub fn insert(&mut self, did: Did, handle: Option<Handle>) {
        if !self.entries.contains_key(&did) {
            self.insertion_order.push_back(did.clone());
            self.evict_if_needed();
        }
        self.entries.insert(did, handle);
    }

    fn evict_if_needed(&mut self) {
        while self.entries.len() >= self.capacity {
            if let Some(oldest) = self.insertion_order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
