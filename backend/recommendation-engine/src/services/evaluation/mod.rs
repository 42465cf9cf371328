//! Offline Evaluator
//!
//! Scores a ranked list against the user's observed engagements. Users
//! without any engagement are scored against a proxy relevance set: popular
//! items of their cluster's categories, or globally popular items when
//! they have no cluster.

pub mod metrics;

use crate::error::{DegradeReason, Served};
use crate::models::Item;
use crate::services::clustering::UserClusterer;
use crate::sources::{InteractionLog, ItemCatalog, ItemQuery};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Size of a proxy relevance set
pub const PROXY_RELEVANT: usize = 20;

/// Where the relevance set of a report came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelevanceSource {
    /// The user's own engagements in the window
    Observed,
    /// Popular items in the user's cluster categories
    ClusterProxy,
    /// Globally popular items
    GlobalProxy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RankingMetrics {
    pub ndcg: f64,
    pub hit_rate: f64,
    pub precision: f64,
    pub recall: f64,
    pub average_precision: f64,
    pub reciprocal_rank: f64,
}

impl RankingMetrics {
    pub fn compute(ranked: &[Uuid], relevant: &HashSet<Uuid>, k: usize) -> Self {
        Self {
            ndcg: metrics::ndcg_at_k(ranked, relevant, k),
            hit_rate: metrics::hit_rate_at_k(ranked, relevant, k),
            precision: metrics::precision_at_k(ranked, relevant, k),
            recall: metrics::recall_at_k(ranked, relevant, k),
            average_precision: metrics::average_precision(&ranked[..k.min(ranked.len())], relevant),
            reciprocal_rank: metrics::reciprocal_rank(&ranked[..k.min(ranked.len())], relevant),
        }
    }

    fn mean(all: &[RankingMetrics]) -> Self {
        if all.is_empty() {
            return Self::default();
        }
        let n = all.len() as f64;
        let sum = |f: fn(&RankingMetrics) -> f64| all.iter().map(f).sum::<f64>() / n;
        Self {
            ndcg: sum(|m| m.ndcg),
            hit_rate: sum(|m| m.hit_rate),
            precision: sum(|m| m.precision),
            recall: sum(|m| m.recall),
            average_precision: sum(|m| m.average_precision),
            reciprocal_rank: sum(|m| m.reciprocal_rank),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub user_id: Uuid,
    pub k: usize,
    pub relevance_source: RelevanceSource,
    pub relevant_count: usize,
    pub recommended_count: usize,
    pub metrics: RankingMetrics,
    /// Distinct items of this list over catalogue size
    pub coverage: f64,
    pub diversity: f64,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchEvaluation {
    pub k: usize,
    pub users: usize,
    /// Per-metric means over users (MAP and MRR among them)
    pub mean: RankingMetrics,
    pub mean_diversity: f64,
    /// Catalogue coverage of the union of all recommended lists
    pub coverage: f64,
    pub observed_users: usize,
    pub proxy_users: usize,
    pub reports: Vec<EvaluationReport>,
}

pub struct OfflineEvaluator {
    catalog: Arc<dyn ItemCatalog>,
    interactions: Arc<dyn InteractionLog>,
    clusterer: Arc<UserClusterer>,
    window_days: i64,
}

impl OfflineEvaluator {
    pub fn new(
        catalog: Arc<dyn ItemCatalog>,
        interactions: Arc<dyn InteractionLog>,
        clusterer: Arc<UserClusterer>,
        window_days: i64,
    ) -> Self {
        Self {
            catalog,
            interactions,
            clusterer,
            window_days,
        }
    }

    /// Relevance set of a user and where it came from
    pub async fn relevance_set(&self, user_id: Uuid) -> Served<(HashSet<Uuid>, RelevanceSource)> {
        let since = Utc::now() - Duration::days(self.window_days);
        let mut reason = None;

        match self.interactions.user_interactions(user_id, since).await {
            Ok(events) => {
                let observed: HashSet<Uuid> = events
                    .iter()
                    .filter(|e| e.kind.is_engagement())
                    .map(|e| e.item_id)
                    .collect();
                if !observed.is_empty() {
                    return Served::Fresh((observed, RelevanceSource::Observed));
                }
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Behaviour unavailable, using proxy relevance");
                reason = Some(DegradeReason::SourceUnavailable);
            }
        }

        let (assignment, _) = self.clusterer.get_user_cluster_assignment(user_id).await.into_parts();
        if let Some(cluster_id) = assignment.map(|a| a.cluster_id).filter(|id| *id >= 0) {
            let mut proxy = HashSet::new();
            for category in self.clusterer.cluster_categories(cluster_id).await {
                match self.catalog.list_items(&ItemQuery::in_category(category, PROXY_RELEVANT)).await {
                    Ok(items) => proxy.extend(items.into_iter().map(|i| i.id)),
                    Err(e) => {
                        warn!(error = %e, "Catalogue unavailable for cluster proxy relevance");
                        reason = Some(DegradeReason::SourceUnavailable);
                    }
                }
                if proxy.len() >= PROXY_RELEVANT {
                    break;
                }
            }
            if !proxy.is_empty() {
                debug!(user_id = %user_id, cluster_id = cluster_id, "Using cluster proxy relevance");
                return Served::with_reason((proxy, RelevanceSource::ClusterProxy), reason);
            }
        }

        let global = match self.catalog.list_items(&ItemQuery::popular(PROXY_RELEVANT)).await {
            Ok(items) => items.into_iter().map(|i| i.id).collect(),
            Err(e) => {
                warn!(error = %e, "Catalogue unavailable for global proxy relevance");
                reason = Some(DegradeReason::SourceUnavailable);
                HashSet::new()
            }
        };
        Served::with_reason((global, RelevanceSource::GlobalProxy), reason)
    }

    async fn catalog_size(&self) -> (usize, Option<DegradeReason>) {
        match self.catalog.item_count().await {
            Ok(n) => (n, None),
            Err(e) => {
                warn!(error = %e, "Catalogue size unavailable, coverage reported as 0");
                (0, Some(DegradeReason::SourceUnavailable))
            }
        }
    }

    async fn list_items(&self, ids: &[Uuid]) -> (Vec<Item>, Option<DegradeReason>) {
        match self.catalog.get_items(ids).await {
            Ok(mut items) => {
                // diversity is order independent, but keep the list order anyway
                items.sort_by_key(|item| ids.iter().position(|id| *id == item.id));
                (items, None)
            }
            Err(e) => {
                warn!(error = %e, "Catalogue unavailable, diversity reported as 0");
                (Vec::new(), Some(DegradeReason::SourceUnavailable))
            }
        }
    }

    async fn report(&self, user_id: Uuid, recommended: &[Uuid], k: usize, catalog_size: usize) -> Served<EvaluationReport> {
        let ((relevant, relevance_source), mut reason) = self.relevance_set(user_id).await.into_parts();
        let top = &recommended[..k.min(recommended.len())];
        let (items, item_reason) = self.list_items(top).await;
        reason = reason.or(item_reason);

        let report = EvaluationReport {
            user_id,
            k,
            relevance_source,
            relevant_count: relevant.len(),
            recommended_count: top.len(),
            metrics: RankingMetrics::compute(recommended, &relevant, k),
            coverage: metrics::coverage(top.iter().copied(), catalog_size),
            diversity: metrics::intra_list_diversity(&items),
            generated_at: Utc::now(),
        };
        Served::with_reason(report, reason)
    }

    pub async fn generate_evaluation_report(
        &self,
        user_id: Uuid,
        recommended: &[Uuid],
        k: usize,
    ) -> Served<EvaluationReport> {
        let (catalog_size, size_reason) = self.catalog_size().await;
        let (report, reason) = self.report(user_id, recommended, k, catalog_size).await.into_parts();
        Served::with_reason(report, reason.or(size_reason))
    }

    pub async fn batch_evaluate(&self, lists: &[(Uuid, Vec<Uuid>)], k: usize) -> Served<BatchEvaluation> {
        let (catalog_size, mut reason) = self.catalog_size().await;
        let mut reports = Vec::with_capacity(lists.len());
        let mut union: HashSet<Uuid> = HashSet::new();

        for (user_id, recommended) in lists {
            let (report, r) = self.report(*user_id, recommended, k, catalog_size).await.into_parts();
            reason = reason.or(r);
            union.extend(recommended.iter().take(k).copied());
            reports.push(report);
        }

        let all: Vec<RankingMetrics> = reports.iter().map(|r| r.metrics).collect();
        let observed_users = reports
            .iter()
            .filter(|r| r.relevance_source == RelevanceSource::Observed)
            .count();
        let mean_diversity = if reports.is_empty() {
            0.0
        } else {
            reports.iter().map(|r| r.diversity).sum::<f64>() / reports.len() as f64
        };

        let batch = BatchEvaluation {
            k,
            users: reports.len(),
            mean: RankingMetrics::mean(&all),
            mean_diversity,
            coverage: metrics::coverage(union, catalog_size),
            observed_users,
            proxy_users: reports.len() - observed_users,
            reports,
        };
        info!(
            users = batch.users,
            k = k,
            ndcg = batch.mean.ndcg,
            map = batch.mean.average_precision,
            coverage = batch.coverage,
            "Batch evaluation complete"
        );
        Served::with_reason(batch, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusteringConfig;
    use crate::models::{InteractionEvent, InteractionKind};
    use crate::sources::{MemoryCatalog, MemoryInteractionLog};
    use reco_cache::MemoryKvStore;

    fn item(category: &str, sales: u64) -> Item {
        Item {
            id: Uuid::new_v4(),
            category: category.into(),
            merchant_id: format!("m-{}", sales % 3),
            brand: None,
            origin: None,
            price: 10.0 * sales as f64,
            original_price: 10.0 * sales as f64,
            rating: 4.0,
            sales_count: sales,
            review_count: 1,
            stock: 1,
            is_promoted: false,
            tags: vec![],
            embedding: vec![],
            created_at: Utc::now(),
        }
    }

    fn evaluator(catalog: Arc<MemoryCatalog>, log: Arc<MemoryInteractionLog>) -> OfflineEvaluator {
        let clusterer = Arc::new(UserClusterer::new(
            catalog.clone(),
            log.clone(),
            Arc::new(MemoryKvStore::new()),
            ClusteringConfig::default(),
        ));
        OfflineEvaluator::new(catalog, log, clusterer, 90)
    }

    #[tokio::test]
    async fn test_report_uses_observed_engagements() {
        let catalog = Arc::new(MemoryCatalog::new());
        let items: Vec<Item> = (1..=10).map(|i| item("shoes", i)).collect();
        catalog.extend(items.clone());
        let log = Arc::new(MemoryInteractionLog::new());
        let user = Uuid::new_v4();
        log.record(InteractionEvent::new(user, items[0].id, InteractionKind::Purchase, Utc::now()));
        // views are not engagements
        log.record(InteractionEvent::new(user, items[1].id, InteractionKind::View, Utc::now()));

        let eval = evaluator(catalog, log);
        let ranked = vec![items[0].id, items[1].id, items[2].id];
        let report = eval.generate_evaluation_report(user, &ranked, 3).await;

        assert!(!report.is_degraded());
        let report = report.into_inner();
        assert_eq!(report.relevance_source, RelevanceSource::Observed);
        assert_eq!(report.relevant_count, 1);
        assert!((report.metrics.ndcg - 1.0).abs() < 1e-12);
        assert!((report.metrics.precision - 1.0 / 3.0).abs() < 1e-12);
        assert!((report.coverage - 0.3).abs() < 1e-12);
        assert!(report.diversity > 0.0);
    }

    #[tokio::test]
    async fn test_cold_user_without_cluster_uses_global_popular() {
        let catalog = Arc::new(MemoryCatalog::new());
        let items: Vec<Item> = (1..=30).map(|i| item("bags", i)).collect();
        catalog.extend(items.clone());
        let eval = evaluator(catalog, Arc::new(MemoryInteractionLog::new()));

        // the best seller is globally popular, the worst is not
        let best = items[29].id;
        let worst = items[0].id;
        let report = eval
            .generate_evaluation_report(Uuid::new_v4(), &[worst, best], 2)
            .await
            .into_inner();

        assert_eq!(report.relevance_source, RelevanceSource::GlobalProxy);
        assert_eq!(report.relevant_count, PROXY_RELEVANT);
        assert_eq!(report.metrics.hit_rate, 1.0);
        assert!((report.metrics.reciprocal_rank - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_batch_means_and_union_coverage() {
        let catalog = Arc::new(MemoryCatalog::new());
        let items: Vec<Item> = (1..=10).map(|i| item("shoes", i)).collect();
        catalog.extend(items.clone());
        let log = Arc::new(MemoryInteractionLog::new());
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        log.record(InteractionEvent::new(u1, items[0].id, InteractionKind::Click, Utc::now()));
        log.record(InteractionEvent::new(u2, items[5].id, InteractionKind::CartAdd, Utc::now()));
        let eval = evaluator(catalog, log);

        let lists = vec![
            (u1, vec![items[0].id, items[1].id]),
            (u2, vec![items[1].id, items[2].id]),
        ];
        let batch = eval.batch_evaluate(&lists, 2).await.into_inner();

        assert_eq!(batch.users, 2);
        assert_eq!(batch.observed_users, 2);
        assert!((batch.mean.hit_rate - 0.5).abs() < 1e-12);
        assert!((batch.mean.reciprocal_rank - 0.5).abs() < 1e-12);
        // items 0, 1, 2 of 10
        assert!((batch.coverage - 0.3).abs() < 1e-12);
        for report in &batch.reports {
            let m = report.metrics;
            for value in [m.ndcg, m.hit_rate, m.precision, m.recall, m.average_precision, m.reciprocal_rank] {
                assert!((0.0..=1.0).contains(&value));
            }
        }
    }
}
