//! In-memory response cache for the unified chat path
//!
//! Keys are the SHA-256 of the message plus its serialized context, so the
//! same question in a different conversation is a different entry. Capacity
//! is bounded; the oldest insertion is evicted first.

use std::collections::{HashMap, VecDeque};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

struct Entries<V> {
    map: HashMap<String, V>,
    order: VecDeque<String>,
}

/// Bounded FIFO cache keyed by content hash.
pub struct ResponseCache<V> {
    max_entries: usize,
    entries: Mutex<Entries<V>>,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Hex SHA-256 over the message and each context part, length-prefixed
    /// so that shifting text between parts changes the key.
    pub fn key(message: &str, context: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in std::iter::once(message).chain(context.iter().copied()) {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let hit = self.entries.lock().await.map.get(key).cloned();
        crate::metrics::record_cache_lookup(hit.is_some());
        hit
    }

    pub async fn insert(&self, key: String, value: V) {
        let mut entries = self.entries.lock().await;
        if entries.map.insert(key.clone(), value).is_some() {
            return;
        }
        entries.order.push_back(key);
        while entries.order.len() > self.max_entries {
            if let Some(oldest) = entries.order.pop_front() {
                entries.map.remove(&oldest);
                debug!(key = %oldest, "evicted cached response");
            }
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.lock().await.map.len()
    }
}
