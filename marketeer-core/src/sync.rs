//! Concurrency utilities — keyed mutexes and single-flight coalescing.
//!
//! Integration operations for a given (brand, platform) pair serialize on a
//! keyed mutex; concurrent token refreshes coalesce to a single in-flight
//! refresh whose result every waiter shares.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};

/// A map of lazily created async mutexes, one per key.
pub struct KeyedMutex<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the mutex for `key`, creating it on first use. The guard
    /// releases the key's lock on drop; the entry itself is retained (the
    /// key space here is small: one per (brand, platform) pair).
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        lock.lock_owned().await
    }
}

impl<K> Default for KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Coalesces concurrent calls per key into one in-flight execution.
///
/// The first caller for a key runs the closure; callers arriving while it
/// is in flight await the same shared result.
pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, watch::Receiver<Option<V>>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` for `key`, or join the in-flight execution for that key.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let tx = {
            let mut inflight = self.inflight.lock().await;
            if let Some(rx) = inflight.get(&key) {
                let mut rx = rx.clone();
                drop(inflight);
                // Leader publishes exactly once, then the entry is removed.
                loop {
                    if let Some(value) = rx.borrow().clone() {
                        return value;
                    }
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                // Leader dropped without publishing; fall through and lead.
                let mut inflight = self.inflight.lock().await;
                let (tx, rx) = watch::channel(None);
                inflight.insert(key.clone(), rx);
                tx
            } else {
                let (tx, rx) = watch::channel(None);
                inflight.insert(key.clone(), rx);
                tx
            }
        };

        let value = work().await;
        let _ = tx.send(Some(value.clone()));
        self.inflight.lock().await.remove(&key);
        value
    }

    /// Number of keys currently in flight.
    pub async fn inflight_count(&self) -> usize {
        self.inflight.lock().await.len()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
