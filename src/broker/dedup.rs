//! Message Deduplication
//!
//! Sliding-window cache of message IDs. Every broker in the pool delivers
//! the same publish, so the first sighting wins and the rest are dropped.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// TTL + capacity bounded message-ID cache.
#[derive(Debug)]
pub struct DedupCache {
    entries: HashMap<String, Instant>,
    capacity: usize,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            ttl,
        }
    }

    /// Check-and-mark. The first call for a given ID returns `false` and
    /// records it; later calls within the TTL return `true`. Empty IDs
    /// cannot be deduplicated and always pass.
    pub fn is_duplicate(&mut self, msg_id: &str) -> bool {
        if msg_id.is_empty() {
            return false;
        }
        let now = Instant::now();
        if let Some(seen_at) = self.entries.get(msg_id) {
            if now.duration_since(*seen_at) < self.ttl {
                return true;
            }
        }
        self.entries.insert(msg_id.to_string(), now);
        if self.entries.len() > self.capacity {
            self.evict_oldest(self.entries.len() - self.capacity);
        }
        false
    }

    /// Drop entries past their TTL. Called periodically by the owner at
    /// half the TTL.
    pub fn remove_expired(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.entries.retain(|_, seen_at| now.duration_since(*seen_at) < ttl);
    }

    /// Entries currently tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&mut self, count: usize) {
        for _ in 0..count {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, seen_at)| **seen_at)
                .map(|(id, _)| id.clone())
            else {
                return;
            };
            self.entries.remove(&oldest);
        }
    }
}
