use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::protocol::Response;

struct CacheEntry {
    response: Response,
    stored_at: Instant,
}

/// In-memory TTL cache holding the most recent response per check. Entries
/// are overwritten on every successful execution and disappear once their
/// TTL elapses; nothing is persisted.
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self, name: &str, response: Response) {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        // Opportunistic eviction keeps the map from holding dead entries
        // for checks that stopped reporting.
        entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        entries.insert(
            name.to_string(),
            CacheEntry {
                response,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Response> {
        let entries = self.entries.lock().expect("cache mutex poisoned");
        entries
            .get(name)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.response.clone())
    }

    /// Clones all non-expired entries for a relay scan.
    pub fn snapshot(&self) -> Vec<(String, Response)> {
        let entries = self.entries.lock().expect("cache mutex poisoned");
        entries
            .iter()
            .filter(|(_, entry)| entry.stored_at.elapsed() < self.ttl)
            .map(|(name, entry)| (name.clone(), entry.response.clone()))
            .collect()
    }
}
