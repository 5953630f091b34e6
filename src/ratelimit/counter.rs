//! Windowed request counter storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::identity::ClientIdentity;
use crate::error::Result;

/// Key identifying one counter row: a client hitting an endpoint within a window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    /// The client being counted.
    pub client: ClientIdentity,
    /// The endpoint identifier.
    pub endpoint: String,
    /// Start of the window, aligned to the window duration.
    pub window_start: DateTime<Utc>,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(client: &ClientIdentity, endpoint: &str, window_start: DateTime<Utc>) -> Self {
        Self {
            client: client.clone(),
            endpoint: endpoint.to_string(),
            window_start,
        }
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.client,
            self.endpoint,
            self.window_start.timestamp()
        )
    }
}

/// A stored window counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounter {
    pub client: ClientIdentity,
    pub endpoint: String,
    pub window_start: DateTime<Utc>,
    /// Requests seen in this window; only ever grows until evicted.
    pub count: u64,
    pub last_updated: DateTime<Utc>,
}

/// Durable keyed counter with atomic increment-or-create semantics.
#[async_trait]
pub trait WindowCounterStore: Send + Sync {
    /// Create the row with count 1 or increment it, returning the new count.
    ///
    /// Must be a single atomic operation: concurrent callers on the same key
    /// never lose an increment and never create duplicate rows.
    async fn increment_and_get(&self, key: &CounterKey, now: DateTime<Utc>) -> Result<u64>;

    /// Current count for a key, if the row exists.
    async fn get(&self, key: &CounterKey) -> Result<Option<u64>>;

    /// Delete rows whose window started before `cutoff`.
    ///
    /// Rows for endpoints in `exempt_endpoints` are kept. Returns the number
    /// of rows deleted.
    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        exempt_endpoints: &[String],
    ) -> Result<u64>;
}

/// In-process counter table.
///
/// Each key lives in one dashmap shard, and the shard lock is held for the
/// whole upsert, which gives the same guarantee as an
/// `INSERT .. ON CONFLICT DO UPDATE SET count = count + 1`.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<CounterKey, WindowCounter>,
}

impl MemoryCounterStore {
    /// Create an empty counter table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored counters.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }
}

#[async_trait]
impl WindowCounterStore for MemoryCounterStore {
    async fn increment_and_get(&self, key: &CounterKey, now: DateTime<Utc>) -> Result<u64> {
        let entry = self
            .counters
            .entry(key.clone())
            .and_modify(|counter| {
                counter.count += 1;
                counter.last_updated = now;
            })
            .or_insert_with(|| {
                debug!(key = %key, "Creating new window counter");
                WindowCounter {
                    client: key.client.clone(),
                    endpoint: key.endpoint.clone(),
                    window_start: key.window_start,
                    count: 1,
                    last_updated: now,
                }
            });
        Ok(entry.count)
    }

    async fn get(&self, key: &CounterKey) -> Result<Option<u64>> {
        Ok(self.counters.get(key).map(|c| c.count))
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        exempt_endpoints: &[String],
    ) -> Result<u64> {
        // Counted per row, since live increments may insert keys mid-sweep
        let mut deleted = 0u64;
        self.counters.retain(|key, _| {
            let keep =
                key.window_start >= cutoff || exempt_endpoints.iter().any(|e| e == &key.endpoint);
            if !keep {
                deleted += 1;
            }
            keep
        });
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn window(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap()
    }

    fn key(client: &str, endpoint: &str, minute: u32) -> CounterKey {
        CounterKey::new(&ClientIdentity::address(client), endpoint, window(minute))
    }

    #[tokio::test]
    async fn test_increment_creates_then_increments() {
        let store = MemoryCounterStore::new();
        let k = key("1.2.3.4", "/orders", 0);

        assert_eq!(store.get(&k).await.unwrap(), None);
        assert_eq!(store.increment_and_get(&k, window(0)).await.unwrap(), 1);
        assert_eq!(store.increment_and_get(&k, window(0)).await.unwrap(), 2);
        assert_eq!(store.get(&k).await.unwrap(), Some(2));
        assert_eq!(store.counter_count(), 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = MemoryCounterStore::new();

        store.increment_and_get(&key("a", "/x", 0), window(0)).await.unwrap();
        store.increment_and_get(&key("a", "/y", 0), window(0)).await.unwrap();
        store.increment_and_get(&key("a", "/x", 1), window(1)).await.unwrap();
        store.increment_and_get(&key("b", "/x", 0), window(0)).await.unwrap();

        assert_eq!(store.counter_count(), 4);
        assert_eq!(store.get(&key("a", "/x", 0)).await.unwrap(), Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryCounterStore::new());
        let k = key("1.2.3.4", "/login", 0);
        let n = 500;

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let store = store.clone();
                let k = k.clone();
                tokio::spawn(async move { store.increment_and_get(&k, window(0)).await.unwrap() })
            })
            .collect();

        let mut returned = Vec::with_capacity(n);
        for handle in handles {
            returned.push(handle.await.unwrap());
        }

        assert_eq!(store.get(&k).await.unwrap(), Some(n as u64));
        assert_eq!(store.counter_count(), 1);

        // Every caller observed a distinct post-increment value
        returned.sort_unstable();
        let expected: Vec<u64> = (1..=n as u64).collect();
        assert_eq!(returned, expected);
    }

    #[tokio::test]
    async fn test_delete_older_than_respects_cutoff_and_exemptions() {
        let store = MemoryCounterStore::new();
        store.increment_and_get(&key("a", "/orders", 0), window(0)).await.unwrap();
        store.increment_and_get(&key("a", "/health", 0), window(0)).await.unwrap();
        store.increment_and_get(&key("a", "/orders", 5), window(5)).await.unwrap();

        let deleted = store
            .delete_older_than(window(5), &["/health".to_string()])
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(store.get(&key("a", "/orders", 0)).await.unwrap(), None);
        assert_eq!(store.get(&key("a", "/health", 0)).await.unwrap(), Some(1));
        // A window starting exactly at the cutoff is inside the horizon
        assert_eq!(store.get(&key("a", "/orders", 5)).await.unwrap(), Some(1));
    }
}
