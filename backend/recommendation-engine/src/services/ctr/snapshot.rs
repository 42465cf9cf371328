//! Durable weight snapshots for restart, rollback and audit

use chrono::{DateTime, TimeZone, Utc};
use reco_cache::{get_json, set_json, CacheKey, CacheResult, KvStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub id: String,
    pub dimension: usize,
    pub weights: Vec<f64>,
    pub sample_count: u64,
    pub positive_count: u64,
    pub learning_rate: f64,
    pub l2_lambda: f64,
    pub saved_at: DateTime<Utc>,
}

impl ModelSnapshot {
    pub fn new_id(saved_at: DateTime<Utc>) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", saved_at.format("%Y%m%d%H%M%S"), &suffix[..8])
    }

    /// Persisted weights are usable only when they match the live layout
    pub fn matches_dimension(&self, dimension: usize) -> bool {
        self.dimension == dimension && self.weights.len() == dimension
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotSummary {
    pub id: String,
    pub saved_at: DateTime<Utc>,
}

pub struct SnapshotStore {
    cache: Arc<dyn KvStore>,
    model: String,
    retention_secs: u64,
}

impl SnapshotStore {
    pub fn new(cache: Arc<dyn KvStore>, model: impl Into<String>, retention_days: u64) -> Self {
        Self {
            cache,
            model: model.into(),
            retention_secs: retention_days * 24 * 3600,
        }
    }

    /// Write as `latest` (no TTL) and as an id-addressed copy with retention TTL
    pub async fn save(&self, snapshot: &ModelSnapshot) -> CacheResult<()> {
        let store = self.cache.as_ref();
        set_json(
            store,
            &CacheKey::model_snapshot(&self.model, &snapshot.id),
            snapshot,
            Some(self.retention_secs),
        )
        .await?;
        store
            .zadd(
                &CacheKey::model_snapshot_index(&self.model),
                &snapshot.id,
                snapshot.saved_at.timestamp_millis() as f64,
            )
            .await?;
        self.promote(snapshot).await?;

        info!(
            model = %self.model,
            snapshot_id = %snapshot.id,
            samples = snapshot.sample_count,
            "Model snapshot saved"
        );
        Ok(())
    }

    /// Make `snapshot` the one loaded on restart
    pub async fn promote(&self, snapshot: &ModelSnapshot) -> CacheResult<()> {
        set_json(self.cache.as_ref(), &CacheKey::model_latest(&self.model), snapshot, None).await
    }

    pub async fn load_latest(&self) -> CacheResult<Option<ModelSnapshot>> {
        get_json(self.cache.as_ref(), &CacheKey::model_latest(&self.model)).await
    }

    pub async fn load(&self, snapshot_id: &str) -> CacheResult<Option<ModelSnapshot>> {
        let snapshot = get_json(
            self.cache.as_ref(),
            &CacheKey::model_snapshot(&self.model, snapshot_id),
        )
        .await?;
        if snapshot.is_none() {
            debug!(snapshot_id = %snapshot_id, "Snapshot not found or expired");
        }
        Ok(snapshot)
    }

    /// Most recent first, within the retention window
    pub async fn list(&self, limit: usize) -> CacheResult<Vec<SnapshotSummary>> {
        let cutoff = Utc::now().timestamp_millis() - (self.retention_secs as i64) * 1000;
        let entries = self
            .cache
            .zrevrange_withscores(&CacheKey::model_snapshot_index(&self.model), limit)
            .await?;

        Ok(entries
            .into_iter()
            .filter(|(_, millis)| *millis as i64 >= cutoff)
            .filter_map(|(id, millis)| {
                Utc.timestamp_millis_opt(millis as i64)
                    .single()
                    .map(|saved_at| SnapshotSummary { id, saved_at })
            })
            .collect())
    }
}
