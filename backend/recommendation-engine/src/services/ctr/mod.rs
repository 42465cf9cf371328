//! Online Click Model
//!
//! Serves click-through predictions from a logistic-regression weight vector
//! and trains it in place, one event at a time. The weight vector sits behind
//! a single-writer / many-readers lock: predictions may see a vector that is
//! one update stale, never a half-applied one. Sample and positive counters
//! are plain atomics.

pub mod model;
pub mod snapshot;

pub use model::{LogisticRegression, SgdParams, NEUTRAL_CTR};
pub use snapshot::{ModelSnapshot, SnapshotStore, SnapshotSummary};

use crate::config::CtrConfig;
use crate::error::{DegradeReason, EngineError, Result, Served};
use crate::services::features::{FeatureNameTable, FeatureVector};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use reco_cache::KvStore;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MODEL_NAME: &str = "ctr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ModelState {
    Uninitialized = 0,
    /// Fresh seeded weights (nothing usable was persisted)
    Initialized = 1,
    /// Weights restored from a snapshot
    Loaded = 2,
    Serving = 3,
}

impl ModelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ModelState::Initialized,
            2 => ModelState::Loaded,
            3 => ModelState::Serving,
            _ => ModelState::Uninitialized,
        }
    }

    pub fn is_ready(&self) -> bool {
        !matches!(self, ModelState::Uninitialized)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureImportance {
    pub index: usize,
    pub name: String,
    pub weight: f64,
}

/// Reranking input: a candidate with its incoming score and model features
#[derive(Debug, Clone)]
pub struct CtrCandidate {
    pub item_id: Uuid,
    pub score: f64,
    pub features: FeatureVector,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CtrRanked {
    pub item_id: Uuid,
    pub ctr: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    /// Prediction before the SGD step
    pub prediction: f64,
    /// Set when this update triggered a periodic snapshot
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStats {
    pub state: ModelState,
    pub dimension: usize,
    pub sample_count: u64,
    pub positive_count: u64,
    pub updates_since_snapshot: u64,
    pub last_snapshot_id: Option<String>,
}

struct ModelInner {
    model: LogisticRegression,
    updates_since_snapshot: u64,
    last_snapshot_id: Option<String>,
    last_daily_snapshot: Option<NaiveDate>,
}

pub struct OnlineClickModel {
    inner: RwLock<ModelInner>,
    state: AtomicU8,
    sample_count: AtomicU64,
    positive_count: AtomicU64,
    snapshots: SnapshotStore,
    params: SgdParams,
    config: CtrConfig,
    names: Arc<FeatureNameTable>,
    dimension: usize,
}

impl OnlineClickModel {
    pub fn new(
        cache: Arc<dyn KvStore>,
        config: CtrConfig,
        names: Arc<FeatureNameTable>,
        dimension: usize,
    ) -> Self {
        let model = LogisticRegression::seeded(dimension, config.init_seed, config.init_range);
        Self {
            inner: RwLock::new(ModelInner {
                model,
                updates_since_snapshot: 0,
                last_snapshot_id: None,
                last_daily_snapshot: None,
            }),
            state: AtomicU8::new(ModelState::Uninitialized as u8),
            sample_count: AtomicU64::new(0),
            positive_count: AtomicU64::new(0),
            snapshots: SnapshotStore::new(cache, MODEL_NAME, config.snapshot_retention_days),
            params: SgdParams::from(&config),
            config,
            names,
            dimension,
        }
    }

    pub fn state(&self) -> ModelState {
        ModelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ModelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Restore persisted weights, or fall back to seeded ones.
    ///
    /// A snapshot whose dimension no longer matches the feature layout is
    /// discarded once with a warning.
    pub async fn initialize(&self) -> ModelState {
        let state = match self.snapshots.load_latest().await {
            Ok(Some(snapshot)) if snapshot.matches_dimension(self.dimension) => {
                let mut inner = self.inner.write().await;
                inner.model = LogisticRegression::from_weights(snapshot.weights);
                inner.last_snapshot_id = Some(snapshot.id.clone());
                inner.updates_since_snapshot = 0;
                self.sample_count.store(snapshot.sample_count, Ordering::Relaxed);
                self.positive_count.store(snapshot.positive_count, Ordering::Relaxed);
                info!(
                    snapshot_id = %snapshot.id,
                    samples = snapshot.sample_count,
                    "Click model weights loaded"
                );
                ModelState::Loaded
            }
            Ok(Some(snapshot)) => {
                warn!(
                    persisted = snapshot.dimension,
                    expected = self.dimension,
                    "Persisted click model dimension mismatch, reinitialising weights"
                );
                self.reseed().await;
                ModelState::Initialized
            }
            Ok(None) => {
                info!(dimension = self.dimension, "No persisted click model, using seeded weights");
                ModelState::Initialized
            }
            Err(e) => {
                warn!(error = %e, "Failed to load click model snapshot, using seeded weights");
                ModelState::Initialized
            }
        };
        self.set_state(state);
        state
    }

    async fn reseed(&self) {
        let mut inner = self.inner.write().await;
        inner.model = LogisticRegression::seeded(
            self.dimension,
            self.config.init_seed,
            self.config.init_range,
        );
        inner.updates_since_snapshot = 0;
        self.sample_count.store(0, Ordering::Relaxed);
        self.positive_count.store(0, Ordering::Relaxed);
    }

    fn mark_serving(&self) {
        let _ = self.state.compare_exchange(
            ModelState::Loaded as u8,
            ModelState::Serving as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        let _ = self.state.compare_exchange(
            ModelState::Initialized as u8,
            ModelState::Serving as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Predicted click probability; neutral 0.5 when not ready or the
    /// vector has the wrong length
    pub async fn predict(&self, features: &FeatureVector) -> Served<f64> {
        if !self.state().is_ready() {
            return Served::degraded(NEUTRAL_CTR, DegradeReason::ModelNotReady);
        }
        let inner = self.inner.read().await;
        match inner.model.try_predict(features.as_slice()) {
            Ok(p) => {
                self.mark_serving();
                Served::Fresh(p)
            }
            Err(e) => {
                warn!(error = %e, "CTR prediction on mismatched vector, returning neutral");
                Served::degraded(NEUTRAL_CTR, DegradeReason::DimensionMismatch)
            }
        }
    }

    /// Predictions in input order, all read from one weight version
    pub async fn batch_predict(&self, features: &[FeatureVector]) -> Served<Vec<f64>> {
        if !self.state().is_ready() {
            return Served::degraded(
                vec![NEUTRAL_CTR; features.len()],
                DegradeReason::ModelNotReady,
            );
        }
        let inner = self.inner.read().await;
        let mut reason = None;
        let predictions = features
            .iter()
            .map(|f| {
                inner.model.try_predict(f.as_slice()).unwrap_or_else(|_| {
                    reason = Some(DegradeReason::DimensionMismatch);
                    NEUTRAL_CTR
                })
            })
            .collect();
        if reason.is_some() {
            warn!(count = features.len(), "Batch prediction contained mismatched vectors");
        }
        self.mark_serving();
        Served::with_reason(predictions, reason)
    }

    /// Order by predicted CTR, ties broken by the incoming score
    pub async fn rerank(&self, candidates: Vec<CtrCandidate>) -> Served<Vec<CtrRanked>> {
        let vectors: Vec<FeatureVector> = candidates.iter().map(|c| c.features.clone()).collect();
        let (predictions, reason) = self.batch_predict(&vectors).await.into_parts();

        let mut ranked: Vec<CtrRanked> = candidates
            .into_iter()
            .zip(predictions)
            .map(|(c, ctr)| CtrRanked {
                item_id: c.item_id,
                ctr,
                score: c.score,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.ctr
                .total_cmp(&a.ctr)
                .then_with(|| b.score.total_cmp(&a.score))
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        Served::with_reason(ranked, reason)
    }

    /// One SGD step for an observed (features, clicked) event
    pub async fn update(&self, features: &FeatureVector, clicked: bool) -> Result<UpdateOutcome> {
        self.ensure_ready()?;
        let label = if clicked { 1.0 } else { 0.0 };

        let (prediction, due) = {
            let mut inner = self.inner.write().await;
            let prediction = inner.model.update(features.as_slice(), label, &self.params)?;
            inner.updates_since_snapshot += 1;
            (prediction, inner.updates_since_snapshot >= self.config.snapshot_every)
        };

        self.sample_count.fetch_add(1, Ordering::Relaxed);
        if clicked {
            self.positive_count.fetch_add(1, Ordering::Relaxed);
        }
        self.mark_serving();

        let snapshot_id = if due { self.periodic_snapshot().await } else { None };
        Ok(UpdateOutcome {
            prediction,
            snapshot_id,
        })
    }

    /// Apply events in order under one write lock. Mismatched vectors are
    /// skipped; returns how many were applied.
    pub async fn batch_update(&self, events: &[(FeatureVector, bool)]) -> Result<usize> {
        self.ensure_ready()?;
        let mut applied = 0usize;
        let mut positives = 0u64;

        let due = {
            let mut inner = self.inner.write().await;
            for (features, clicked) in events {
                let label = if *clicked { 1.0 } else { 0.0 };
                match inner.model.update(features.as_slice(), label, &self.params) {
                    Ok(_) => {
                        applied += 1;
                        positives += u64::from(*clicked);
                    }
                    Err(e) => debug!(error = %e, "Skipping training event"),
                }
            }
            inner.updates_since_snapshot += applied as u64;
            inner.updates_since_snapshot >= self.config.snapshot_every
        };

        self.sample_count.fetch_add(applied as u64, Ordering::Relaxed);
        self.positive_count.fetch_add(positives, Ordering::Relaxed);
        if applied > 0 {
            self.mark_serving();
        }
        if applied < events.len() {
            warn!(
                applied = applied,
                skipped = events.len() - applied,
                "Batch update skipped mismatched vectors"
            );
        }

        if due {
            self.periodic_snapshot().await;
        }
        Ok(applied)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state().is_ready() {
            Ok(())
        } else {
            Err(EngineError::InvalidInput(
                "Click model is not initialised".into(),
            ))
        }
    }

    async fn periodic_snapshot(&self) -> Option<String> {
        match self.snapshot().await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "Periodic model snapshot failed, will retry");
                None
            }
        }
    }

    /// Persist weights and counters; returns the snapshot id
    pub async fn snapshot(&self) -> Result<String> {
        let now = Utc::now();
        let (snapshot, counted) = {
            let inner = self.inner.read().await;
            let snapshot = ModelSnapshot {
                id: ModelSnapshot::new_id(now),
                dimension: self.dimension,
                weights: inner.model.to_vec(),
                sample_count: self.sample_count.load(Ordering::Relaxed),
                positive_count: self.positive_count.load(Ordering::Relaxed),
                learning_rate: self.params.learning_rate,
                l2_lambda: self.params.l2_lambda,
                saved_at: now,
            };
            (snapshot, inner.updates_since_snapshot)
        };

        self.snapshots.save(&snapshot).await?;

        let mut inner = self.inner.write().await;
        // updates that landed while saving count toward the next snapshot
        inner.updates_since_snapshot = inner.updates_since_snapshot.saturating_sub(counted);
        inner.last_snapshot_id = Some(snapshot.id.clone());
        Ok(snapshot.id)
    }

    /// Take the once-a-day snapshot when its hour has passed.
    /// Returns the id when one was written.
    pub async fn maybe_daily_snapshot(&self, now: DateTime<Utc>) -> Result<Option<String>> {
        let today = now.date_naive();
        {
            let inner = self.inner.read().await;
            if now.hour() < self.config.snapshot_hour_utc
                || inner.last_daily_snapshot == Some(today)
            {
                return Ok(None);
            }
        }

        let id = self.snapshot().await?;
        self.inner.write().await.last_daily_snapshot = Some(today);
        Ok(Some(id))
    }

    pub async fn list_snapshots(&self, limit: usize) -> Result<Vec<SnapshotSummary>> {
        Ok(self.snapshots.list(limit).await?)
    }

    /// Swap in the weights of an earlier snapshot and make it the restart point
    pub async fn rollback_to_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let snapshot = self.snapshots.load(snapshot_id).await?.ok_or_else(|| {
            EngineError::InvalidInput(format!("Snapshot {} not found", snapshot_id))
        })?;
        if !snapshot.matches_dimension(self.dimension) {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: snapshot.weights.len(),
            });
        }

        self.snapshots.promote(&snapshot).await?;
        {
            let mut inner = self.inner.write().await;
            inner.model = LogisticRegression::from_weights(snapshot.weights);
            inner.updates_since_snapshot = 0;
            inner.last_snapshot_id = Some(snapshot.id.clone());
        }
        self.sample_count.store(snapshot.sample_count, Ordering::Relaxed);
        self.positive_count.store(snapshot.positive_count, Ordering::Relaxed);
        self.set_state(ModelState::Loaded);

        info!(snapshot_id = %snapshot_id, "Click model rolled back");
        Ok(())
    }

    /// Back to seeded weights and zero counters
    pub async fn reset_weights(&self) {
        self.reseed().await;
        self.set_state(ModelState::Initialized);
        info!(dimension = self.dimension, "Click model weights reset");
    }

    /// Top `k` dimensions by |weight|
    pub async fn feature_importance(&self, k: usize) -> Vec<FeatureImportance> {
        let inner = self.inner.read().await;
        inner
            .model
            .top_weights(k)
            .into_iter()
            .map(|(index, weight)| FeatureImportance {
                index,
                name: self.names.name(index).to_string(),
                weight,
            })
            .collect()
    }

    pub async fn weights(&self) -> Vec<f64> {
        self.inner.read().await.model.to_vec()
    }

    pub async fn stats(&self) -> ModelStats {
        let inner = self.inner.read().await;
        ModelStats {
            state: self.state(),
            dimension: self.dimension,
            sample_count: self.sample_count.load(Ordering::Relaxed),
            positive_count: self.positive_count.load(Ordering::Relaxed),
            updates_since_snapshot: inner.updates_since_snapshot,
            last_snapshot_id: inner.last_snapshot_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::features::TOTAL_DIM;
    use chrono::TimeZone;
    use reco_cache::MemoryKvStore;

    fn model_with(cache: MemoryKvStore, config: CtrConfig) -> OnlineClickModel {
        OnlineClickModel::new(
            Arc::new(cache),
            config,
            Arc::new(FeatureNameTable::standard()),
            TOTAL_DIM,
        )
    }

    fn vector(value: f64) -> FeatureVector {
        FeatureVector::from_values(vec![value; TOTAL_DIM], TOTAL_DIM)
    }

    #[tokio::test]
    async fn test_uninitialized_model_is_neutral() {
        let model = model_with(MemoryKvStore::new(), CtrConfig::default());

        let served = model.predict(&vector(1.0)).await;

        assert_eq!(served.reason(), Some(DegradeReason::ModelNotReady));
        assert_eq!(*served.value(), NEUTRAL_CTR);
        assert!(model.update(&vector(1.0), true).await.is_err());
    }

    #[tokio::test]
    async fn test_fresh_model_serves_half_on_zero_vector() {
        let model = model_with(MemoryKvStore::new(), CtrConfig::default());
        assert_eq!(model.initialize().await, ModelState::Initialized);

        let served = model.predict(&vector(0.0)).await;

        assert_eq!(served, Served::Fresh(0.5));
        assert_eq!(model.state(), ModelState::Serving);
    }

    #[tokio::test]
    async fn test_online_update_moves_model_to_serving() {
        let model = model_with(MemoryKvStore::new(), CtrConfig::default());
        model.initialize().await;
        assert_eq!(model.state(), ModelState::Initialized);

        model.update(&vector(1.0), false).await.unwrap();

        assert_eq!(model.state(), ModelState::Serving);
        assert_eq!(model.stats().await.state, ModelState::Serving);
    }

    #[tokio::test]
    async fn test_wrong_length_vector_degrades() {
        let model = model_with(MemoryKvStore::new(), CtrConfig::default());
        model.initialize().await;

        let short = FeatureVector::from_values(vec![1.0; 64], 64);
        let served = model.predict(&short).await;

        assert_eq!(served.reason(), Some(DegradeReason::DimensionMismatch));
        assert_eq!(served.into_inner(), NEUTRAL_CTR);
    }

    #[tokio::test]
    async fn test_persisted_dimension_mismatch_reinitialises() {
        let cache = MemoryKvStore::new();
        let store = SnapshotStore::new(Arc::new(cache.clone()), MODEL_NAME, 30);
        let now = Utc::now();
        store
            .save(&ModelSnapshot {
                id: ModelSnapshot::new_id(now),
                dimension: 64,
                weights: vec![0.3; 64],
                sample_count: 10,
                positive_count: 2,
                learning_rate: 0.01,
                l2_lambda: 0.001,
                saved_at: now,
            })
            .await
            .unwrap();
        let model = model_with(cache, CtrConfig::default());

        assert_eq!(model.initialize().await, ModelState::Initialized);

        let seeded = LogisticRegression::seeded(TOTAL_DIM, 42, 0.01).to_vec();
        assert_eq!(model.weights().await, seeded);
        assert_eq!(model.stats().await.sample_count, 0);
    }

    #[tokio::test]
    async fn test_weights_survive_restart() {
        let cache = MemoryKvStore::new();
        let model = model_with(cache.clone(), CtrConfig::default());
        model.initialize().await;
        model.update(&vector(1.0), true).await.unwrap();
        model.snapshot().await.unwrap();
        let trained = model.weights().await;

        let restarted = model_with(cache, CtrConfig::default());
        assert_eq!(restarted.initialize().await, ModelState::Loaded);
        assert_eq!(restarted.weights().await, trained);
        assert_eq!(restarted.stats().await.sample_count, 1);
        assert_eq!(restarted.stats().await.positive_count, 1);
    }

    #[tokio::test]
    async fn test_snapshot_every_n_updates() {
        let config = CtrConfig {
            snapshot_every: 3,
            ..CtrConfig::default()
        };
        let model = model_with(MemoryKvStore::new(), config);
        model.initialize().await;

        for _ in 0..2 {
            let outcome = model.update(&vector(0.5), false).await.unwrap();
            assert!(outcome.snapshot_id.is_none());
        }
        let outcome = model.update(&vector(0.5), true).await.unwrap();

        assert!(outcome.snapshot_id.is_some());
        let stats = model.stats().await;
        assert_eq!(stats.sample_count, 3);
        assert_eq!(stats.positive_count, 1);
        assert_eq!(stats.updates_since_snapshot, 0);
        assert_eq!(stats.last_snapshot_id, outcome.snapshot_id);
        assert_eq!(model.list_snapshots(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_restores_weights() {
        let model = model_with(MemoryKvStore::new(), CtrConfig::default());
        model.initialize().await;
        let id = model.snapshot().await.unwrap();
        let before = model.weights().await;

        model.update(&vector(1.0), true).await.unwrap();
        assert_ne!(model.weights().await, before);

        model.rollback_to_snapshot(&id).await.unwrap();
        assert_eq!(model.weights().await, before);
        assert_eq!(model.state(), ModelState::Loaded);

        let missing = model.rollback_to_snapshot("nope").await;
        assert!(matches!(missing, Err(EngineError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_batch_update_skips_mismatched_vectors() {
        let model = model_with(MemoryKvStore::new(), CtrConfig::default());
        model.initialize().await;
        let events = vec![
            (vector(1.0), true),
            (FeatureVector::from_values(vec![1.0; 10], 10), true),
            (vector(0.2), false),
        ];

        let applied = model.batch_update(&events).await.unwrap();

        assert_eq!(applied, 2);
        assert_eq!(model.stats().await.sample_count, 2);
        assert_eq!(model.stats().await.positive_count, 1);
    }

    #[tokio::test]
    async fn test_rerank_orders_by_ctr_then_score() {
        let model = model_with(MemoryKvStore::new(), CtrConfig::default());
        model.initialize().await;
        // push weights up on every dimension so denser vectors score higher
        for _ in 0..20 {
            model.update(&vector(1.0), true).await.unwrap();
        }
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let candidates = vec![
            CtrCandidate { item_id: a, score: 0.9, features: vector(0.0) },
            CtrCandidate { item_id: b, score: 0.1, features: vector(1.0) },
            CtrCandidate { item_id: c, score: 0.95, features: vector(0.0) },
        ];

        let ranked = model.rerank(candidates).await.into_inner();

        let order: Vec<Uuid> = ranked.iter().map(|r| r.item_id).collect();
        assert_eq!(order, vec![b, c, a]);
    }

    #[tokio::test]
    async fn test_feature_importance_uses_name_table() {
        let model = model_with(MemoryKvStore::new(), CtrConfig::default());
        model.initialize().await;

        let top = model.feature_importance(5).await;

        assert_eq!(top.len(), 5);
        assert!(top.windows(2).all(|w| w[0].weight.abs() >= w[1].weight.abs()));
        assert!(top.iter().all(|f| f.name != "unknown"));
    }

    #[tokio::test]
    async fn test_daily_snapshot_once_per_day() {
        let model = model_with(MemoryKvStore::new(), CtrConfig::default());
        model.initialize().await;
        let early = Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 3, 1, 4, 0, 0).unwrap();

        assert!(model.maybe_daily_snapshot(early).await.unwrap().is_none());
        assert!(model.maybe_daily_snapshot(late).await.unwrap().is_some());
        assert!(model.maybe_daily_snapshot(late).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_weights() {
        let model = model_with(MemoryKvStore::new(), CtrConfig::default());
        model.initialize().await;
        model.update(&vector(1.0), true).await.unwrap();

        model.reset_weights().await;

        assert_eq!(
            model.weights().await,
            LogisticRegression::seeded(TOTAL_DIM, 42, 0.01).to_vec()
        );
        assert_eq!(model.stats().await.sample_count, 0);
    }
}
