//! In-process `KvStore` used by tests and single-node runs.

use crate::{CacheError, CacheResult, KvStore};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl_secs: Option<u64>) -> Self {
        Self {
            value,
            expires_at: ttl_secs.map(|ttl| Instant::now() + Duration::from_secs(ttl)),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| Instant::now() >= at)
    }
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::InvalidData(format!("WRONGTYPE operation against key {}", key))
}

/// Dashmap-backed store with TTL expiry checked on access.
///
/// Clones share the same underlying map. `set_available(false)` makes every
/// command fail with a timeout, which lets callers exercise degraded paths.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<DashMap<String, Entry>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (false) or recovery (true)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> CacheResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Timeout(0));
        }
        Ok(())
    }

    fn live(&self, key: &str) -> Option<Value> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return Some(entry.value.clone()),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn purge_expired(&self, key: &str) {
        self.entries.remove_if(key, |_, entry| entry.is_expired());
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check()?;
        match self.live(key) {
            Some(Value::Str(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> CacheResult<()> {
        self.check()?;
        self.entries
            .insert(key.to_string(), Entry::new(Value::Str(value.to_string()), ttl_secs));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> CacheResult<bool> {
        self.check()?;
        self.purge_expired(key);
        let mut inserted = false;
        self.entries.entry(key.to_string()).or_insert_with(|| {
            inserted = true;
            Entry::new(Value::Str(value.to_string()), Some(ttl_secs))
        });
        Ok(inserted)
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        self.check()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.check()?;
        self.purge_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Str("0".to_string()), None));
        let current = match &entry.value {
            Value::Str(s) => s
                .parse::<i64>()
                .map_err(|_| CacheError::InvalidData(format!("value at {} is not an integer", key)))?,
            _ => return Err(wrong_type(key)),
        };
        let next = current + delta;
        entry.value = Value::Str(next.to_string());
        Ok(next)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        self.hset_multiple(key, &[(field.to_string(), value.to_string())])
            .await
    }

    async fn hset_multiple(&self, key: &str, entries: &[(String, String)]) -> CacheResult<()> {
        self.check()?;
        self.purge_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new()), None));
        match &mut entry.value {
            Value::Hash(map) => {
                for (field, value) in entries {
                    map.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> CacheResult<Option<String>> {
        self.check()?;
        match self.live(key) {
            Some(Value::Hash(map)) => Ok(map.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn hgetall(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        self.check()?;
        match self.live(key) {
            Some(Value::Hash(map)) => Ok(map),
            Some(_) => Err(wrong_type(key)),
            None => Ok(HashMap::new()),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> CacheResult<()> {
        self.check()?;
        self.purge_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::ZSet(HashMap::new()), None));
        match &mut entry.value {
            Value::ZSet(set) => {
                set.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn zreplace(
        &self,
        key: &str,
        members: &[(String, f64)],
        ttl_secs: Option<u64>,
    ) -> CacheResult<()> {
        self.check()?;
        if members.is_empty() {
            self.entries.remove(key);
            return Ok(());
        }
        let set: HashMap<String, f64> = members.iter().cloned().collect();
        self.entries
            .insert(key.to_string(), Entry::new(Value::ZSet(set), ttl_secs));
        Ok(())
    }

    async fn zrevrange_withscores(
        &self,
        key: &str,
        limit: usize,
    ) -> CacheResult<Vec<(String, f64)>> {
        self.check()?;
        let set = match self.live(key) {
            Some(Value::ZSet(set)) => set,
            Some(_) => return Err(wrong_type(key)),
            None => return Ok(Vec::new()),
        };
        let mut members: Vec<(String, f64)> = set.into_iter().collect();
        members.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.cmp(&a.0))
        });
        members.truncate(limit);
        Ok(members)
    }

    async fn zscore(&self, key: &str, member: &str) -> CacheResult<Option<f64>> {
        self.check()?;
        match self.live(key) {
            Some(Value::ZSet(set)) => Ok(set.get(member).copied()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }
}
