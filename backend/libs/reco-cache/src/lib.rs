//! Recommendation engine cache layer
//!
//! Provides the durable key-value store the engine snapshots its state into:
//! - Versioned key schema (`CacheKey`)
//! - TTL strings, hashes, sorted sets and atomic counters behind one `KvStore` trait
//! - Redis implementation with per-command timeouts
//! - In-process implementation for tests and local runs
//! - Exclusive job locks released even when the holder is cancelled
//! - Metrics integration

mod error;
mod keys;
mod lock;
mod memory;
mod metrics;
mod redis_store;

pub use error::{CacheError, CacheResult};
pub use keys::{CacheKey, CACHE_VERSION};
pub use lock::JobLock;
pub use memory::MemoryKvStore;
pub use metrics::CacheMetrics;
pub use redis_store::{RedisKvStore, SharedRedis};

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Default TTL values (seconds)
pub mod ttl {
    pub const FEATURES: u64 = 300; // 5 minutes
    pub const PREFERENCES: u64 = 600; // 10 minutes
    pub const SIMILARITY: u64 = 3 * 24 * 3600; // survives one missed daily rebuild
    pub const SNAPSHOT: u64 = 30 * 24 * 3600; // 30 days
}

/// Core key-value operations used by the engine.
///
/// Object safe so components can hold `Arc<dyn KvStore>`.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Get a string value
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Set a string value, optionally with TTL
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> CacheResult<()>;

    /// Set only if absent (`SET NX EX`). Returns true when the key was written.
    async fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> CacheResult<bool>;

    /// Delete a key
    async fn del(&self, key: &str) -> CacheResult<()>;

    /// Atomically increment an integer counter
    async fn incr(&self, key: &str, delta: i64) -> CacheResult<i64>;

    /// Set a single hash field
    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()>;

    /// Set several hash fields in one round trip
    async fn hset_multiple(&self, key: &str, entries: &[(String, String)]) -> CacheResult<()>;

    /// Get a single hash field
    async fn hget(&self, key: &str, field: &str) -> CacheResult<Option<String>>;

    /// Get all hash fields
    async fn hgetall(&self, key: &str) -> CacheResult<HashMap<String, String>>;

    /// Add a single sorted-set member
    async fn zadd(&self, key: &str, member: &str, score: f64) -> CacheResult<()>;

    /// Atomically replace a sorted set with the given members
    async fn zreplace(
        &self,
        key: &str,
        members: &[(String, f64)],
        ttl_secs: Option<u64>,
    ) -> CacheResult<()>;

    /// Highest-scored members first
    async fn zrevrange_withscores(&self, key: &str, limit: usize)
        -> CacheResult<Vec<(String, f64)>>;

    /// Score of one member
    async fn zscore(&self, key: &str, member: &str) -> CacheResult<Option<f64>>;
}

/// Get a JSON value. Undecodable entries are deleted and reported as a miss.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> CacheResult<Option<T>> {
    match store.get(key).await? {
        Some(data) => match serde_json::from_str::<T>(&data) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key = %key, error = %e, "Cache deserialization failed");
                let _ = store.del(key).await;
                Ok(None)
            }
        },
        None => {
            debug!(key = %key, "Cache miss");
            Ok(None)
        }
    }
}

/// Set a JSON value
pub async fn set_json<T: Serialize + Sync>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl_secs: Option<u64>,
) -> CacheResult<()> {
    let data = serde_json::to_string(value)?;
    store.set(key, &data, ttl_secs).await
}

/// Add jitter to TTL to prevent thundering herd
pub fn add_jitter(ttl_secs: u64) -> u64 {
    let jitter_percent = (rand::random::<u32>() % 10) as f64 / 100.0;
    let jitter = (ttl_secs as f64 * jitter_percent).round() as u64;
    ttl_secs + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        values: Vec<f64>,
    }

    #[test]
    fn test_add_jitter() {
        let ttl = 300u64;
        let with_jitter = add_jitter(ttl);
        // Jitter should be 0-10% of TTL
        assert!(with_jitter >= ttl);
        assert!(with_jitter <= ttl + (ttl / 10));
    }

    #[tokio::test]
    async fn test_json_roundtrip_through_memory_store() {
        let store = MemoryKvStore::new();
        let payload = Payload {
            values: vec![0.25, 0.5],
        };

        set_json(&store, "v1:feature:user:a", &payload, Some(60))
            .await
            .unwrap();
        let loaded: Option<Payload> = get_json(&store, "v1:feature:user:a").await.unwrap();

        assert_eq!(loaded, Some(payload));
    }

    #[tokio::test]
    async fn test_corrupted_json_is_dropped() {
        let store = MemoryKvStore::new();
        store.set("v1:feature:user:b", "{not json", None).await.unwrap();

        let loaded: Option<Payload> = get_json(&store, "v1:feature:user:b").await.unwrap();

        assert!(loaded.is_none());
        assert!(store.get("v1:feature:user:b").await.unwrap().is_none());
    }
}
