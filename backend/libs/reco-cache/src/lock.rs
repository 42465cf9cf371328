//! Exclusive job lock (`SET NX EX`) with release on drop

use crate::{CacheKey, CacheResult, KvStore};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock on one job kind, held in the store under `CacheKey::job_lock`.
///
/// A holder whose future is dropped before `release` (a timed-out run)
/// still frees the lock: `Drop` hands the delete to the current runtime.
pub struct JobLock {
    store: Arc<dyn KvStore>,
    key: String,
    token: String,
    released: bool,
}

impl JobLock {
    /// `Ok(None)` when another holder has the lock
    pub async fn acquire(store: Arc<dyn KvStore>, job: &str, ttl_secs: u64) -> CacheResult<Option<Self>> {
        let key = CacheKey::job_lock(job);
        let token = Uuid::new_v4().to_string();
        if !store.set_nx(&key, &token, ttl_secs).await? {
            return Ok(None);
        }
        debug!(job = job, "Job lock acquired");
        Ok(Some(Self {
            store,
            key,
            token,
            released: false,
        }))
    }

    pub async fn release(mut self) -> CacheResult<()> {
        self.released = true;
        release(self.store.as_ref(), &self.key, &self.token).await
    }
}

/// Delete the lock only while it still carries our token
async fn release(store: &dyn KvStore, key: &str, token: &str) -> CacheResult<()> {
    if store.get(key).await?.as_deref() == Some(token) {
        store.del(key).await?;
    }
    Ok(())
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "No runtime to release abandoned job lock, left to expire");
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            match release(store.as_ref(), &key, &token).await {
                Ok(()) => debug!(key = %key, "Abandoned job lock released"),
                Err(e) => warn!(key = %key, error = %e, "Failed to release abandoned job lock"),
            }
        });
    }
}
