//! Short-lived cache of successful results

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::trace;

/// Expired entries are swept from `put` at most this often
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Results keyed by (service id, command key, hash key, canonical parameters)
#[derive(Debug)]
pub struct RequestCache {
    /// Key to (expiry, value)
    entries: DashMap<String, (Instant, Value)>,
    next_sweep: Mutex<Instant>,
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Cache key; parameter order does not matter
    pub fn key(
        service_id: &str,
        command_key: &str,
        hash_key: Option<&str>,
        parameters: &HashMap<String, Value>,
    ) -> String {
        let sorted: BTreeMap<&String, &Value> = parameters.iter().collect();
        serde_json::to_string(&(service_id, command_key, hash_key, sorted)).unwrap_or_default()
    }

    /// Cached value if not yet expired
    pub fn get(&self, key: &str) -> Option<Value> {
        let entry = self.entries.get(key)?;
        let (expires, value) = entry.value();
        if Instant::now() < *expires {
            return Some(value.clone());
        }
        drop(entry);
        self.entries.remove(key);
        None
    }

    /// Store `value` for `ttl`, sweeping expired entries when a sweep is due
    pub fn put(&self, key: String, value: Value, ttl: Duration) {
        let now = Instant::now();
        let sweep_due = {
            let mut next = self.next_sweep.lock();
            if now >= *next {
                *next = now + SWEEP_INTERVAL;
                true
            } else {
                false
            }
        };
        if sweep_due {
            self.purge();
        }
        self.entries.insert(key, (now + ttl, value));
    }

    /// Drop expired entries
    pub fn purge(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (expires, _)| now < *expires);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            trace!(removed, remaining = self.entries.len(), "request cache swept");
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
