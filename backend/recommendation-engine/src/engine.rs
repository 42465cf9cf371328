//! Engine facade
//!
//! Wires the services together over one cache and one set of data sources
//! and exposes the engine's operations by item and user id.

use crate::config::Config;
use crate::error::{DegradeReason, EngineError, Result, Served};
use crate::jobs::{ClusteringJob, JobScheduler, ModelSnapshotJob, SimilarityRebuildJob};
use crate::models::{Item, RecommendedItem};
use crate::services::clustering::{ClusterAssignment, ClusterStats, UserClusterer};
use crate::services::collaborative::{CollaborativeIndex, RebuildReport, SimilarityStatus};
use crate::services::ctr::{
    CtrCandidate, CtrRanked, FeatureImportance, ModelState, ModelStats, OnlineClickModel, SnapshotSummary,
    UpdateOutcome, NEUTRAL_CTR,
};
use crate::services::evaluation::{BatchEvaluation, EvaluationReport, OfflineEvaluator};
use crate::services::features::{FeatureNameTable, FeatureStore, FeatureVector, TOTAL_DIM};
use crate::services::orchestrator::{OrchestratorDeps, RecommendationOrchestrator};
use crate::sources::{ExplorationStrategy, InteractionLog, InterestTagSource, ItemCatalog};
use reco_cache::KvStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// External collaborators the engine reads from
#[derive(Clone)]
pub struct EngineSources {
    pub catalog: Arc<dyn ItemCatalog>,
    pub interactions: Arc<dyn InteractionLog>,
    pub tags: Arc<dyn InterestTagSource>,
    pub exploration: Arc<dyn ExplorationStrategy>,
}

pub struct RecommendationEngine {
    config: Config,
    catalog: Arc<dyn ItemCatalog>,
    features: Arc<FeatureStore>,
    ctr: Arc<OnlineClickModel>,
    collaborative: Arc<CollaborativeIndex>,
    clusterer: Arc<UserClusterer>,
    orchestrator: RecommendationOrchestrator,
    evaluator: OfflineEvaluator,
}

impl RecommendationEngine {
    pub fn new(config: Config, sources: EngineSources, cache: Arc<dyn KvStore>) -> Self {
        let names = Arc::new(FeatureNameTable::standard());
        let features = Arc::new(FeatureStore::new(
            sources.catalog.clone(),
            sources.interactions.clone(),
            sources.tags.clone(),
            cache.clone(),
            config.features.clone(),
            config.orchestrator.new_item_days,
        ));
        let ctr = Arc::new(OnlineClickModel::new(
            cache.clone(),
            config.ctr.clone(),
            names,
            TOTAL_DIM,
        ));
        let collaborative = Arc::new(CollaborativeIndex::new(
            sources.catalog.clone(),
            sources.interactions.clone(),
            cache.clone(),
            config.collaborative.clone(),
        ));
        let clusterer = Arc::new(UserClusterer::new(
            sources.catalog.clone(),
            sources.interactions.clone(),
            cache,
            config.clustering.clone(),
        ));
        let orchestrator = RecommendationOrchestrator::new(
            OrchestratorDeps {
                catalog: sources.catalog.clone(),
                interactions: sources.interactions.clone(),
                tags: sources.tags.clone(),
                exploration: sources.exploration.clone(),
                features: features.clone(),
                collaborative: collaborative.clone(),
                clusterer: clusterer.clone(),
                ctr: ctr.clone(),
            },
            config.orchestrator.clone(),
            config.features.behavior_window_days,
            config.clustering.seed,
        );
        let evaluator = OfflineEvaluator::new(
            sources.catalog.clone(),
            sources.interactions,
            clusterer.clone(),
            config.features.behavior_window_days,
        );

        Self {
            config,
            catalog: sources.catalog,
            features,
            ctr,
            collaborative,
            clusterer,
            orchestrator,
            evaluator,
        }
    }

    /// Restore model weights; call once before serving
    pub async fn initialize(&self) -> ModelState {
        let state = self.ctr.initialize().await;
        info!(state = ?state, "Recommendation engine initialised");
        state
    }

    /// Scheduler with one loop per background job
    pub fn scheduler(&self) -> JobScheduler {
        let mut scheduler = JobScheduler::new(Duration::from_secs(self.config.scheduler.job_timeout_secs));
        scheduler
            .register(Arc::new(SimilarityRebuildJob::new(
                self.collaborative.clone(),
                Duration::from_secs(self.config.collaborative.rebuild_interval_secs),
            )))
            .register(Arc::new(ClusteringJob::new(
                self.clusterer.clone(),
                Duration::from_secs(self.config.clustering.rebuild_interval_secs),
            )))
            .register(Arc::new(ModelSnapshotJob::new(self.ctr.clone())));
        scheduler
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn features(&self) -> &Arc<FeatureStore> {
        &self.features
    }

    // ========================================================================
    // Recommendations
    // ========================================================================

    pub async fn recommend(&self, user_id: Uuid, limit: usize) -> Served<Vec<RecommendedItem>> {
        self.orchestrator.recommend(user_id, limit).await
    }

    // ========================================================================
    // Click model
    // ========================================================================

    async fn fetch_items(&self, item_ids: &[Uuid]) -> Served<Vec<Item>> {
        match self.catalog.get_items(item_ids).await {
            Ok(items) => Served::Fresh(items),
            Err(e) => {
                warn!(error = %e, "Catalogue unavailable for click model features");
                Served::degraded(Vec::new(), DegradeReason::SourceUnavailable)
            }
        }
    }

    /// Model input for every (user, item) pair whose item exists
    async fn feature_map(&self, user_id: Uuid, item_ids: &[Uuid]) -> Served<HashMap<Uuid, FeatureVector>> {
        let (items, reason) = self.fetch_items(item_ids).await.into_parts();
        let (vectors, feature_reason) = self
            .features
            .features_for_items(user_id, &items)
            .await
            .into_parts();
        Served::with_reason(vectors.into_iter().collect(), reason.or(feature_reason))
    }

    /// Click probability of one item for one user; neutral for unknown items
    pub async fn predict_ctr(&self, user_id: Uuid, item_id: Uuid) -> Served<f64> {
        let (mut vectors, reason) = self.feature_map(user_id, &[item_id]).await.into_parts();
        let Some(features) = vectors.remove(&item_id) else {
            return Served::with_reason(NEUTRAL_CTR, reason);
        };
        let (p, model_reason) = self.ctr.predict(&features).await.into_parts();
        Served::with_reason(p, reason.or(model_reason))
    }

    /// Predictions in input order
    pub async fn batch_predict_ctr(&self, user_id: Uuid, item_ids: &[Uuid]) -> Served<Vec<(Uuid, f64)>> {
        let (vectors, reason) = self.feature_map(user_id, item_ids).await.into_parts();
        let known: Vec<FeatureVector> = item_ids
            .iter()
            .filter_map(|id| vectors.get(id).cloned())
            .collect();
        let (mut predictions, model_reason) = self.ctr.batch_predict(&known).await.into_parts();
        predictions.reverse();

        let out = item_ids
            .iter()
            .map(|id| {
                let p = if vectors.contains_key(id) {
                    predictions.pop().unwrap_or(NEUTRAL_CTR)
                } else {
                    NEUTRAL_CTR
                };
                (*id, p)
            })
            .collect();
        Served::with_reason(out, reason.or(model_reason))
    }

    /// Reorder `(item, score)` candidates by predicted CTR. Unknown items
    /// get the neutral probability.
    pub async fn rerank_by_ctr(&self, user_id: Uuid, candidates: &[(Uuid, f64)]) -> Served<Vec<CtrRanked>> {
        let ids: Vec<Uuid> = candidates.iter().map(|(id, _)| *id).collect();
        let (mut vectors, reason) = self.feature_map(user_id, &ids).await.into_parts();

        let mut unknown = Vec::new();
        let mut scored = Vec::with_capacity(candidates.len());
        for (item_id, score) in candidates {
            match vectors.remove(item_id) {
                Some(features) => scored.push(CtrCandidate {
                    item_id: *item_id,
                    score: *score,
                    features,
                }),
                None => unknown.push(CtrRanked {
                    item_id: *item_id,
                    ctr: NEUTRAL_CTR,
                    score: *score,
                }),
            }
        }

        let (mut ranked, model_reason) = self.ctr.rerank(scored).await.into_parts();
        if !unknown.is_empty() {
            ranked.extend(unknown);
            ranked.sort_by(|a, b| {
                b.ctr
                    .total_cmp(&a.ctr)
                    .then_with(|| b.score.total_cmp(&a.score))
                    .then_with(|| a.item_id.cmp(&b.item_id))
            });
        }
        Served::with_reason(ranked, reason.or(model_reason))
    }

    /// One online update from an observed impression
    pub async fn update_model(&self, user_id: Uuid, item_id: Uuid, clicked: bool) -> Result<UpdateOutcome> {
        let item = self
            .catalog
            .get_item(item_id)
            .await?
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown item {}", item_id)))?;
        let features = self.features.features_for(user_id, &item).await.into_inner();
        self.ctr.update(&features, clicked).await
    }

    /// `(user, item, clicked)` events applied in order; events on unknown
    /// items are skipped. Returns how many were applied.
    pub async fn batch_update_model(&self, events: &[(Uuid, Uuid, bool)]) -> Result<usize> {
        let mut by_user: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for (user_id, item_id, _) in events {
            by_user.entry(*user_id).or_default().push(*item_id);
        }
        let mut vectors: HashMap<(Uuid, Uuid), FeatureVector> = HashMap::new();
        for (user_id, item_ids) in by_user {
            let items = self.catalog.get_items(&item_ids).await?;
            let (built, _) = self.features.features_for_items(user_id, &items).await.into_parts();
            vectors.extend(built.into_iter().map(|(item_id, v)| ((user_id, item_id), v)));
        }

        let training: Vec<(FeatureVector, bool)> = events
            .iter()
            .filter_map(|(user_id, item_id, clicked)| {
                vectors.get(&(*user_id, *item_id)).map(|v| (v.clone(), *clicked))
            })
            .collect();
        self.ctr.batch_update(&training).await
    }

    pub async fn get_feature_importance(&self, k: usize) -> Vec<FeatureImportance> {
        self.ctr.feature_importance(k).await
    }

    pub async fn reset_model_weights(&self) {
        self.ctr.reset_weights().await
    }

    pub async fn model_stats(&self) -> ModelStats {
        self.ctr.stats().await
    }

    pub async fn list_snapshots(&self, limit: usize) -> Result<Vec<SnapshotSummary>> {
        self.ctr.list_snapshots(limit).await
    }

    pub async fn rollback_to_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.ctr.rollback_to_snapshot(snapshot_id).await
    }

    // ========================================================================
    // Collaborative filtering
    // ========================================================================

    pub async fn get_item_based_recommendations(&self, user_id: Uuid, limit: usize) -> Served<Vec<RecommendedItem>> {
        self.collaborative.recommend_for(user_id, limit).await
    }

    pub async fn calculate_item_similarity(&self, a: Uuid, b: Uuid) -> Served<f64> {
        self.collaborative.similarity(a, b).await
    }

    pub async fn get_similar_items(&self, item_id: Uuid, limit: usize) -> Served<Vec<(Uuid, f64)>> {
        self.collaborative.get_similar_items(item_id, limit).await
    }

    pub async fn refresh_item_similarity_cache(&self, item_id: Uuid) -> Result<usize> {
        self.collaborative.refresh_item(item_id).await
    }

    pub async fn get_similarity_matrix_status(&self) -> Served<SimilarityStatus> {
        self.collaborative.status().await
    }

    /// Admin-triggered full rebuild
    pub async fn rebuild_similarity(&self) -> Result<RebuildReport> {
        self.collaborative.rebuild().await
    }

    /// Stop an in-process rebuild before its next item; the previous
    /// build keeps serving
    pub fn cancel_similarity_rebuild(&self) {
        self.collaborative.cancel_rebuild();
    }

    // ========================================================================
    // Clustering
    // ========================================================================

    pub async fn run_clustering(&self, k: Option<usize>) -> Result<ClusterStats> {
        self.clusterer.run_clustering(k).await
    }

    pub async fn get_user_cluster_assignment(&self, user_id: Uuid) -> Served<Option<ClusterAssignment>> {
        self.clusterer.get_user_cluster_assignment(user_id).await
    }

    pub async fn get_assignment_at(&self, user_id: Uuid, version: u64) -> Result<Option<ClusterAssignment>> {
        self.clusterer.get_assignment_at(user_id, version).await
    }

    pub async fn assign_user_to_cluster(&self, user_id: Uuid) -> Served<ClusterAssignment> {
        self.clusterer.assign_user(user_id).await
    }

    pub async fn get_cluster_stats(&self) -> Served<Option<ClusterStats>> {
        self.clusterer.get_cluster_stats().await
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    pub async fn generate_evaluation_report(
        &self,
        user_id: Uuid,
        recommended: &[Uuid],
        k: usize,
    ) -> Served<EvaluationReport> {
        self.evaluator.generate_evaluation_report(user_id, recommended, k).await
    }

    pub async fn batch_evaluate(&self, lists: &[(Uuid, Vec<Uuid>)], k: usize) -> Served<BatchEvaluation> {
        self.evaluator.batch_evaluate(lists, k).await
    }
}
