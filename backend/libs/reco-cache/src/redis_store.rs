//! Redis-backed `KvStore`

use crate::{CacheError, CacheMetrics, CacheResult, KvStore};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Shared Redis connection manager
pub type SharedRedis = Arc<Mutex<ConnectionManager>>;

/// Redis client with a per-command timeout
#[derive(Clone)]
pub struct RedisKvStore {
    redis: SharedRedis,
    metrics: CacheMetrics,
    timeout: Duration,
}

impl RedisKvStore {
    pub fn new(redis: SharedRedis, timeout: Duration) -> Self {
        Self {
            redis,
            metrics: CacheMetrics::new(),
            timeout,
        }
    }

    /// Open a connection manager for `url`
    pub async fn connect(url: &str, timeout: Duration) -> CacheResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::new(Arc::new(Mutex::new(manager)), timeout))
    }

    async fn timed<T, F>(&self, key: &str, fut: F) -> CacheResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Redis command failed");
                self.metrics.record_error(key, "redis");
                Err(CacheError::Redis(e))
            }
            Err(_) => {
                let millis = self.timeout.as_millis() as u64;
                warn!(key = %key, timeout_ms = millis, "Redis command timed out");
                self.metrics.record_error(key, "timeout");
                Err(CacheError::Timeout(millis))
            }
        }
    }
}

#[async_trait::async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.redis.lock().await;
        let value: Option<String> = self.timed(key, conn.get(key)).await?;
        match value {
            Some(_) => self.metrics.record_hit(key),
            None => self.metrics.record_miss(key),
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> CacheResult<()> {
        let mut conn = self.redis.lock().await;
        match ttl_secs {
            Some(ttl) => {
                self.timed(key, conn.set_ex::<_, _, ()>(key, value, ttl))
                    .await?
            }
            None => self.timed(key, conn.set::<_, _, ()>(key, value)).await?,
        }
        debug!(key = %key, ttl = ?ttl_secs, "Cache set");
        self.metrics.record_write(key);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> CacheResult<bool> {
        let mut conn = self.redis.lock().await;
        let cmd = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .to_owned();
        let reply: Option<String> = self
            .timed(key, cmd.query_async::<_, Option<String>>(&mut *conn))
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.redis.lock().await;
        self.timed(key, conn.del::<_, ()>(key)).await
    }

    async fn incr(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let mut conn = self.redis.lock().await;
        self.timed(key, conn.incr::<_, _, i64>(key, delta)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        let mut conn = self.redis.lock().await;
        self.timed(key, conn.hset::<_, _, _, ()>(key, field, value))
            .await?;
        self.metrics.record_write(key);
        Ok(())
    }

    async fn hset_multiple(&self, key: &str, entries: &[(String, String)]) -> CacheResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.lock().await;
        self.timed(key, conn.hset_multiple::<_, _, _, ()>(key, entries))
            .await?;
        self.metrics.record_write(key);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> CacheResult<Option<String>> {
        let mut conn = self.redis.lock().await;
        self.timed(key, conn.hget::<_, _, Option<String>>(key, field))
            .await
    }

    async fn hgetall(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        let mut conn = self.redis.lock().await;
        self.timed(key, conn.hgetall::<_, HashMap<String, String>>(key))
            .await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> CacheResult<()> {
        let mut conn = self.redis.lock().await;
        self.timed(key, conn.zadd::<_, _, _, ()>(key, member, score))
            .await
    }

    async fn zreplace(
        &self,
        key: &str,
        members: &[(String, f64)],
        ttl_secs: Option<u64>,
    ) -> CacheResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !members.is_empty() {
            let scored: Vec<(f64, &str)> = members
                .iter()
                .map(|(member, score)| (*score, member.as_str()))
                .collect();
            pipe.zadd_multiple(key, &scored).ignore();
            if let Some(ttl) = ttl_secs {
                pipe.expire(key, ttl as i64).ignore();
            }
        }

        let mut conn = self.redis.lock().await;
        self.timed(key, pipe.query_async::<_, ()>(&mut *conn))
            .await?;
        self.metrics.record_write(key);
        Ok(())
    }

    async fn zrevrange_withscores(
        &self,
        key: &str,
        limit: usize,
    ) -> CacheResult<Vec<(String, f64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.lock().await;
        let stop = (limit - 1) as isize;
        let members: Vec<(String, f64)> = self
            .timed(key, conn.zrevrange_withscores(key, 0, stop))
            .await?;
        if members.is_empty() {
            self.metrics.record_miss(key);
        } else {
            self.metrics.record_hit(key);
        }
        Ok(members)
    }

    async fn zscore(&self, key: &str, member: &str) -> CacheResult<Option<f64>> {
        let mut conn = self.redis.lock().await;
        self.timed(key, conn.zscore::<_, _, Option<f64>>(key, member))
            .await
    }
}
