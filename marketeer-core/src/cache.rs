//! Keyed cache with TTL — ephemeral state, rate-limit counters, metadata.
//!
//! The cache is an injected interface; tests and single-node deployments use
//! the in-memory implementation. It is a coordination aid only, never a
//! source of truth: callers must tolerate early eviction.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Keyed store with best-effort TTL and atomic counters.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>);

    async fn delete(&self, key: &str);

    /// Remove all keys matching a `prefix*` pattern. Returns the number of
    /// keys removed.
    async fn clear_pattern(&self, pattern: &str) -> usize;

    /// Atomically increment an integer counter, creating it at 1 when
    /// absent. The TTL applies only when the counter is created.
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> i64;
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-process cache. Read-your-writes within the process; expiry is lazy on
/// access plus an explicit sweep.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Drop every expired entry. Called opportunistically; correctness does
    /// not depend on it.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_pattern(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(e) if !e.is_expired(now) => return Some(e.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: evict under the write lock.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        None
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let entry = Entry {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        self.entries.write().await.insert(key.to_string(), entry);
    }

    async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    async fn clear_pattern(&self, pattern: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|k, _| !matches_pattern(k, pattern));
        before - entries.len()
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> i64 {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let current = match entries.get(key) {
            Some(e) if !e.is_expired(now) => e.value.as_i64().unwrap_or(0),
            _ => 0,
        };
        let next = current + 1;
        let expires_at = match entries.get(key) {
            Some(e) if !e.is_expired(now) => e.expires_at,
            _ => ttl.map(|d| now + d),
        };
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::from(next),
                expires_at,
            },
        );
        next
    }
}
