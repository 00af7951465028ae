//! In-process counter store.
//!
//! Counters live in a `DashMap` and expire lazily: an expired entry is
//! treated as absent the next time it is touched. Only useful for a single
//! instance, since nothing is shared across processes.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{CounterStore, StoreError};

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A counter store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for `key`, or `None` if absent or expired.
    pub fn count(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.counters
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.count)
    }

    /// Drop expired entries, returning how many were removed.
    ///
    /// Expired entries are already ignored on access; this only reclaims
    /// memory held by keys that are never touched again.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut entry = self.counters.entry(key.to_string()).or_insert(Entry {
            count: 0,
            expires_at: None,
        });

        if entry.is_expired(now) {
            *entry = Entry {
                count: 0,
                expires_at: None,
            };
        }

        entry.count += 1;
        Ok(entry.count)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        if let Some(mut entry) = self.counters.get_mut(key) {
            if !entry.is_expired(now) {
                // Past the end of the clock the key simply never expires.
                entry.expires_at = now.checked_add(ttl);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ttl(store: &MemoryStore, key: &str) -> Option<Duration> {
        let now = Instant::now();
        store
            .counters
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    #[tokio::test]
    async fn test_increment_creates_at_one() {
        let store = MemoryStore::new();
        assert_eq!(store.increment("a").await.unwrap(), 1);
        assert_eq!(store.increment("a").await.unwrap(), 2);
        assert_eq!(store.increment("b").await.unwrap(), 1);
        assert_eq!(store.count("a"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_key_restarts_at_one() {
        let store = MemoryStore::new();
        store.increment("a").await.unwrap();
        store.set_expiry("a", Duration::from_secs(10)).await.unwrap();
        store.increment("a").await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(store.count("a"), None);
        assert_eq!(store.increment("a").await.unwrap(), 1);
        assert_eq!(ttl(&store, "a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_fixed_from_first_hit() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(10);

        assert_eq!(store.increment_with_expiry("a", window).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.increment_with_expiry("a", window).await.unwrap(), 2);

        // Later hits do not push the expiry out.
        assert_eq!(ttl(&store, "a"), Some(Duration::from_secs(4)));
    }

    #[tokio::test]
    async fn test_set_expiry_on_missing_key_is_noop() {
        let store = MemoryStore::new();
        store.set_expiry("missing", Duration::from_secs(1)).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.increment_with_expiry("short", Duration::from_secs(1)).await.unwrap();
        store.increment_with_expiry("long", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.purge_expired(), 0);

        assert_eq!(store.len(), 1);
        assert_eq!(store.count("long"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_expiry_never_expires() {
        let store = MemoryStore::new();
        let far = Duration::from_secs(u64::MAX);

        assert_eq!(store.increment_with_expiry("far", far).await.unwrap(), 1);
        assert_eq!(ttl(&store, "far"), None);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(store.increment_with_expiry("far", far).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("shared").await.unwrap() })
            })
            .collect();

        let mut seen: Vec<u64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        seen.sort_unstable();

        assert_eq!(seen, (1..=50).collect::<Vec<_>>());
        assert_eq!(store.count("shared"), Some(50));
    }
}
