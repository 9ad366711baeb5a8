use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::types::SessionMessage;

/// Cache key: one offloaded message per `(session, index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OffloadKey {
    pub session_id: String,
    pub index: u64,
}

struct Entry {
    message: SessionMessage,
    priority: u8,
    stored_at: Instant,
}

struct Inner {
    /// priority -> keys in LRU order (front = oldest).
    buckets: BTreeMap<u8, VecDeque<OffloadKey>>,
    map: HashMap<OffloadKey, Entry>,
    hits: u64,
}

/// Bounded LRU + priority cache for messages pushed out of live sessions.
///
/// Eviction always takes the oldest key from the lowest non-empty priority
/// bucket. A priority update removes the key from its old bucket before
/// inserting into the new one, so a key never sits in two buckets.
pub struct OffloadCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl OffloadCache {
    pub fn new(capacity: usize, ttl_s: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buckets: BTreeMap::new(),
                map: HashMap::new(),
                hits: 0,
            }),
            capacity,
            ttl: Duration::from_secs(ttl_s),
        }
    }

    /// Insert a message at the given priority, evicting if full.
    pub fn insert(&self, key: OffloadKey, message: SessionMessage, priority: u8) {
        let mut inner = self.inner.lock().unwrap();

        // Replacing an existing key: detach it from its old bucket first.
        if let Some(old) = inner.map.remove(&key) {
            detach(&mut inner.buckets, old.priority, &key);
        } else if inner.map.len() >= self.capacity {
            evict_one(&mut inner);
        }

        inner
            .buckets
            .entry(priority)
            .or_default()
            .push_back(key.clone());
        inner.map.insert(
            key,
            Entry {
                message,
                priority,
                stored_at: Instant::now(),
            },
        );
    }

    /// Move a key to a different priority bucket.
    pub fn set_priority(&self, key: &OffloadKey, priority: u8) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.map.get(key) else {
            return false;
        };
        let old = entry.priority;
        if old == priority {
            return true;
        }
        // Remove from the old bucket before adding to the new one.
        detach(&mut inner.buckets, old, key);
        inner
            .buckets
            .entry(priority)
            .or_default()
            .push_back(key.clone());
        if let Some(entry) = inner.map.get_mut(key) {
            entry.priority = priority;
        }
        true
    }

    /// Load a message back out of the cache, recording a hit.
    pub fn load(&self, key: &OffloadKey) -> Option<SessionMessage> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.map.remove(key)?;
        detach(&mut inner.buckets, entry.priority, key);
        inner.hits += 1;
        Some(entry.message)
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let ttl = self.ttl;
        let expired: Vec<(OffloadKey, u8)> = inner
            .map
            .iter()
            .filter(|(_, e)| e.stored_at.elapsed() >= ttl)
            .map(|(k, e)| (k.clone(), e.priority))
            .collect();
        for (key, priority) in &expired {
            inner.map.remove(key);
            detach(&mut inner.buckets, *priority, key);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "offload cache TTL sweep");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.inner.lock().unwrap().hits
    }

    /// True when the key sits in exactly the one bucket matching its
    /// priority (test support for the single-bucket invariant).
    #[cfg(test)]
    fn bucket_count(&self, key: &OffloadKey) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .buckets
            .values()
            .map(|b| b.iter().filter(|k| *k == key).count())
            .sum()
    }
}

fn detach(buckets: &mut BTreeMap<u8, VecDeque<OffloadKey>>, priority: u8, key: &OffloadKey) {
    if let Some(bucket) = buckets.get_mut(&priority) {
        bucket.retain(|k| k != key);
        if bucket.is_empty() {
            buckets.remove(&priority);
        }
    }
}

/// Evict the oldest key from the lowest non-empty priority bucket.
fn evict_one(inner: &mut Inner) {
    let Some((&priority, _)) = inner.buckets.iter().next() else {
        return;
    };
    if let Some(bucket) = inner.buckets.get_mut(&priority) {
        if let Some(victim) = bucket.pop_front() {
            inner.map.remove(&victim);
            debug!(priority, "offload cache evicted lowest-priority entry");
        }
        if bucket.is_empty() {
            inner.buckets.remove(&priority);
        }
    }
}
