//! Short-lived cache of distinct queue names.
//!
//! Only saves round-trips for callers that list queues often. Dequeue never
//! consults it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const QUEUES_CACHE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub(crate) struct QueueNameCache {
    ttl: Duration,
    entry: Mutex<Option<(Instant, Vec<String>)>>,
}

impl Default for QueueNameCache {
    fn default() -> Self {
        Self::with_ttl(QUEUES_CACHE_TIMEOUT)
    }
}

impl QueueNameCache {
    pub(crate) fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    /// Cached names, unless empty or stale.
    pub(crate) fn get(&self) -> Option<Vec<String>> {
        let entry = self.entry.lock().unwrap();
        match entry.as_ref() {
            Some((updated, names)) if !names.is_empty() && updated.elapsed() < self.ttl => {
                Some(names.clone())
            }
            _ => None,
        }
    }

    pub(crate) fn put(&self, names: Vec<String>) {
        *self.entry.lock().unwrap() = Some((Instant::now(), names));
    }
}
