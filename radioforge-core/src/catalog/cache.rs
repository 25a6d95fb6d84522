//! TTL cache for catalog query results.
//!
//! Keyed by the full query parameter tuple rendered to a string. An expired
//! entry is a miss and is evicted on read; callers then refetch. Lifecycle
//! operations are idempotent.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

struct Entry {
    value: serde_json::Value,
    created_at: Instant,
    ttl: Duration,
}

pub struct QueryCache {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
    enabled: AtomicBool,
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl, enabled: AtomicBool::new(true) }
    }

    /// Reset to a fresh, enabled cache. Safe to call repeatedly.
    pub fn initialize(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        self.entries.lock().expect("cache lock poisoned").clear();
    }

    /// Drop all entries. Safe to call repeatedly.
    pub fn clear(&self) {
        self.entries.lock().expect("cache lock poisoned").clear();
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.enabled.load(Ordering::SeqCst) {
            return None;
        }
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.created_at.elapsed() < entry.ttl => {
                serde_json::from_value(entry.value.clone()).ok()
            }
            Some(_) => {
                // Expired reads are misses, never stale data.
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let Ok(value) = serde_json::to_value(value) else { return };
        self.entries.lock().expect("cache lock poisoned").insert(
            key.to_string(),
            Entry { value, created_at: Instant::now(), ttl: self.ttl },
        );
    }

    #[cfg(test)]
    fn expire(&self, key: &str) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if let Some(entry) = entries.get_mut(key) {
            entry.created_at = Instant::now() - entry.ttl - Duration::from_secs(1);
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
