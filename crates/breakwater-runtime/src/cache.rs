//! Last-good response cache.
//!
//! The orchestrator records every successful response for services that
//! opt in, and serves the recorded value as a terminal stale fallback
//! once the whole retry/degradation/breaker stack has failed. Entries
//! age out on a TTL so the engine never serves arbitrarily old data.

use moka::future::Cache;
use serde_json::Value;
use std::time::Duration;

/// Cache of the most recent successful response per (service, operation).
pub struct ResponseCache {
    cache: Cache<String, Value>,
}

impl ResponseCache {
    /// Create a cache bounded by entry count and TTL.
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }

    fn key(service: &str, operation: &str) -> String {
        format!("{service}:{operation}")
    }

    /// Record a successful response.
    pub async fn put(&self, service: &str, operation: &str, value: Value) {
        self.cache.insert(Self::key(service, operation), value).await;
    }

    /// Fetch the last good response, if one is still fresh.
    pub async fn get(&self, service: &str, operation: &str) -> Option<Value> {
        self.cache.get(&Self::key(service, operation)).await
    }

    /// Drop every cached response.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(600))
    }
}
