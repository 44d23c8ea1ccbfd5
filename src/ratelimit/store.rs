//! Sharded in-process counter store.
//!
//! Keys are hashed onto a fixed set of independently locked shards so that hot
//! keys under one policy do not serialize unrelated keys. Every operation,
//! including the eviction sweep, holds at most one shard lock at a time.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::{BackendResult, CounterBackend};
use super::counter::WindowRecord;

/// Default number of lock shards.
pub const DEFAULT_SHARD_COUNT: usize = 32;

type Shard = Mutex<HashMap<String, WindowRecord>>;

/// In-process fixed-window counter store.
pub struct LocalStore {
    shards: Box<[Shard]>,
    hasher: RandomState,
}

impl LocalStore {
    /// Create a store with `shard_count` lock domains (at least one).
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            hasher: RandomState::new(),
        }
    }

    /// Number of lock shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, key: &str) -> &Shard {
        let index = (self.hasher.hash_one(key) % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Record one hit for `key`, replacing the record if its window elapsed.
    ///
    /// The read-check-write sequence runs under the key's shard lock, so
    /// concurrent increments on one key are linearizable.
    pub fn increment(&self, key: &str, window_ms: u64, limit: u64, now: u64) -> WindowRecord {
        let mut shard = self.shard_for(key).lock();

        match shard.get_mut(key) {
            Some(record) if now.saturating_sub(record.window_start) < window_ms => {
                record.count += 1;
                record.window_ms = window_ms;
                record.limit = limit;
                trace!(key = %key, count = record.count, "Incremented local counter");
                record.clone()
            }
            _ => {
                let record = WindowRecord::fresh(key, window_ms, limit, now);
                debug!(key = %key, window_ms = window_ms, "Starting new local window");
                shard.insert(key.to_string(), record.clone());
                record
            }
        }
    }

    /// Read a record as stored, expired or not.
    pub fn get(&self, key: &str) -> Option<WindowRecord> {
        self.shard_for(key).lock().get(key).cloned()
    }

    /// Delete the record for one key.
    pub fn reset(&self, key: &str) -> bool {
        self.shard_for(key).lock().remove(key).is_some()
    }

    /// Clear every shard.
    pub fn reset_all(&self) {
        for shard in self.shards.iter() {
            shard.lock().clear();
        }
    }

    /// Total number of records across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove records whose window plus one grace window has elapsed.
    ///
    /// Returns the number of records removed.
    pub fn sweep(&self, now: u64) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|_, record| !record.is_evictable(now));
            removed += before - shard.len();
        }
        removed
    }

    /// The `n` live keys with the highest counts, highest first.
    pub fn top_keys(&self, n: usize, now: u64) -> Vec<(String, u64)> {
        if n == 0 {
            return Vec::new();
        }

        let mut live: Vec<(String, u64)> = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.lock();
            live.extend(
                shard
                    .values()
                    .filter(|r| !r.is_expired(now))
                    .map(|r| (r.key.clone(), r.count)),
            );
        }

        live.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        live.truncate(n);
        live
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_COUNT)
    }
}

#[async_trait]
impl CounterBackend for LocalStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn increment(
        &self,
        key: &str,
        window_ms: u64,
        limit: u64,
        now: u64,
    ) -> BackendResult<WindowRecord> {
        Ok(LocalStore::increment(self, key, window_ms, limit, now))
    }

    async fn get(&self, key: &str, _now: u64) -> BackendResult<Option<WindowRecord>> {
        Ok(LocalStore::get(self, key))
    }

    async fn reset(&self, key: &str) -> BackendResult<()> {
        LocalStore::reset(self, key);
        Ok(())
    }

    async fn reset_all(&self) -> BackendResult<()> {
        LocalStore::reset_all(self);
        Ok(())
    }

    async fn key_count(&self) -> BackendResult<usize> {
        Ok(self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_increment_creates_then_counts() {
        let store = LocalStore::new(4);

        let first = store.increment("k", 1_000, 5, 0);
        assert_eq!(first.count, 1);
        assert_eq!(first.window_start, 0);

        let second = store.increment("k", 1_000, 5, 400);
        assert_eq!(second.count, 2);
        assert_eq!(second.window_start, 0);
    }

    #[test]
    fn test_increment_replaces_elapsed_window() {
        let store = LocalStore::new(4);

        store.increment("k", 1_000, 5, 0);
        store.increment("k", 1_000, 5, 10);

        let record = store.increment("k", 1_000, 5, 1_000);
        assert_eq!(record.count, 1);
        assert_eq!(record.window_start, 1_000);
    }

    #[test]
    fn test_get_does_not_mutate() {
        let store = LocalStore::new(4);
        store.increment("k", 1_000, 5, 0);

        assert_eq!(store.get("k").map(|r| r.count), Some(1));
        assert_eq!(store.get("k").map(|r| r.count), Some(1));
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_reset_and_reset_all() {
        let store = LocalStore::new(4);
        store.increment("a", 1_000, 5, 0);
        store.increment("b", 1_000, 5, 0);
        assert_eq!(store.len(), 2);

        assert!(store.reset("a"));
        assert!(!store.reset("a"));
        assert_eq!(store.len(), 1);

        store.reset_all();
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_keeps_grace_window() {
        let store = LocalStore::new(4);
        store.increment("old", 1_000, 5, 0);
        store.increment("new", 1_000, 5, 1_500);

        // "old" expired at 1000 but stays readable until 2000.
        assert_eq!(store.sweep(1_999), 0);
        assert_eq!(store.len(), 2);

        assert_eq!(store.sweep(2_000), 1);
        assert!(store.get("old").is_none());
        assert!(store.get("new").is_some());
    }

    #[test]
    fn test_top_keys_ordering() {
        let store = LocalStore::new(4);
        for _ in 0..3 {
            store.increment("busy", 1_000, 5, 0);
        }
        store.increment("quiet", 1_000, 5, 0);
        store.increment("stale", 10, 5, 0);

        let top = store.top_keys(5, 100);
        assert_eq!(top, vec![("busy".to_string(), 3), ("quiet".to_string(), 1)]);
        assert_eq!(store.top_keys(1, 100).len(), 1);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(LocalStore::new(8));
        let threads = 8;
        let per_thread = 250;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        store.increment("shared", 60_000, 10, 0);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get("shared").unwrap().count, (threads * per_thread) as u64);
    }

    #[test]
    fn test_backend_impl_matches_inherent_methods() {
        let store = LocalStore::new(4);
        let backend: &dyn CounterBackend = &store;

        let record = tokio_test::block_on(backend.increment("k", 1_000, 5, 0)).unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(tokio_test::block_on(backend.key_count()).unwrap(), 1);
        assert_eq!(backend.name(), "memory");

        tokio_test::block_on(backend.reset("k")).unwrap();
        assert!(tokio_test::block_on(backend.get("k", 0)).unwrap().is_none());
    }

    #[test]
    fn test_zero_shards_clamped() {
        let store = LocalStore::new(0);
        assert_eq!(store.shard_count(), 1);
        store.increment("k", 1_000, 1, 0);
        assert_eq!(store.len(), 1);
    }
}
