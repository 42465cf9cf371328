//! Recommendation Orchestrator
//!
//! Pure composition over the other services. Warm users get a weighted
//! blend of content, collaborative, popularity and exploration streams;
//! users below the cold-start threshold get the fixed cold-start mix, and
//! users in between get both, split by their warmth score.

pub mod cold_start;

pub use cold_start::{personalized_slots, split_mix, warmth};

use crate::config::OrchestratorConfig;
use crate::error::{DegradeReason, Served};
use crate::models::{InteractionEvent, Item, RecommendationSource, RecommendedItem};
use crate::services::clustering::UserClusterer;
use crate::services::collaborative::CollaborativeIndex;
use crate::services::ctr::{CtrCandidate, OnlineClickModel};
use crate::services::features::FeatureStore;
use crate::sources::{ExplorationStrategy, InteractionLog, InterestTagSource, ItemCatalog, ItemOrder, ItemQuery};
use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Candidate over-fetch factor per stream
const FETCH_FACTOR: usize = 2;
/// Pool the random cold-start stream samples from
const RANDOM_POOL: usize = 200;
const CONTENT_CATEGORIES: usize = 3;

/// Services the orchestrator composes
pub struct OrchestratorDeps {
    pub catalog: Arc<dyn ItemCatalog>,
    pub interactions: Arc<dyn InteractionLog>,
    pub tags: Arc<dyn InterestTagSource>,
    pub exploration: Arc<dyn ExplorationStrategy>,
    pub features: Arc<FeatureStore>,
    pub collaborative: Arc<CollaborativeIndex>,
    pub clusterer: Arc<UserClusterer>,
    pub ctr: Arc<OnlineClickModel>,
}

/// Merged candidate scores; a duplicate keeps its best contribution
#[derive(Default)]
struct Blend {
    scores: HashMap<Uuid, (f64, RecommendationSource)>,
}

impl Blend {
    /// Rank-normalised contribution `weight * (len - rank) / len`
    fn add_stream(&mut self, ids: &[Uuid], weight: f64, source: RecommendationSource, exclude: &HashSet<Uuid>) {
        let len = ids.len() as f64;
        for (rank, id) in ids.iter().enumerate() {
            if exclude.contains(id) {
                continue;
            }
            let score = weight * (len - rank as f64) / len;
            let slot = self.scores.entry(*id).or_insert((score, source));
            if score > slot.0 {
                *slot = (score, source);
            }
        }
    }

    fn into_ranked(self) -> Vec<RecommendedItem> {
        let mut ranked: Vec<RecommendedItem> = self
            .scores
            .into_iter()
            .map(|(id, (score, source))| RecommendedItem::new(id, score, source))
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.item_id.cmp(&b.item_id)));
        ranked
    }
}

/// Only outages degrade a composed answer; missing similarity data or
/// clustering are normal states a stream already fell back from
fn outage(reason: Option<DegradeReason>) -> Option<DegradeReason> {
    reason.filter(|r| {
        matches!(
            r,
            DegradeReason::CacheUnavailable | DegradeReason::SourceUnavailable
        )
    })
}

pub struct RecommendationOrchestrator {
    deps: OrchestratorDeps,
    config: OrchestratorConfig,
    behavior_window_days: i64,
    rng: Mutex<StdRng>,
}

impl RecommendationOrchestrator {
    pub fn new(deps: OrchestratorDeps, config: OrchestratorConfig, behavior_window_days: i64, seed: u64) -> Self {
        Self {
            deps,
            config,
            behavior_window_days,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub async fn recommend(&self, user_id: Uuid, limit: usize) -> Served<Vec<RecommendedItem>> {
        if limit == 0 {
            return Served::Fresh(Vec::new());
        }
        let since = Utc::now() - Duration::days(self.behavior_window_days);
        let mut reason = None;

        let events: Vec<InteractionEvent> = match self.deps.interactions.user_interactions(user_id, since).await {
            Ok(events) => events,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Behaviour unavailable, treating user as cold");
                reason = Some(DegradeReason::SourceUnavailable);
                Vec::new()
            }
        };
        let interacted: HashSet<Uuid> = events.iter().map(|e| e.item_id).collect();
        let behavior_count = events.len();

        let cold = behavior_count < self.config.cold_start_threshold;
        let personalized = if cold {
            0
        } else {
            let w = warmth(behavior_count, self.config.warmth_midpoint, self.config.warmth_steepness);
            personalized_slots(limit, w)
        };
        debug!(
            user_id = %user_id,
            behavior_count = behavior_count,
            personalized = personalized,
            "Recommendation split"
        );

        let mut results = Vec::with_capacity(limit);
        if personalized > 0 {
            let (blend, r) = self.blend(user_id, personalized, &interacted).await.into_parts();
            reason = reason.or(r);
            results.extend(blend);
        }

        let mut taken: HashSet<Uuid> = interacted.clone();
        taken.extend(results.iter().map(|r| r.item_id));
        let remaining = limit - results.len().min(limit);
        if remaining > 0 {
            let (cold_items, r) = self.cold_start(user_id, remaining, &taken).await.into_parts();
            reason = reason.or(r);
            results.extend(cold_items);
        }
        results.truncate(limit);

        // an unready model would only hand back neutral scores
        let rerank = self.config.ctr_rerank && self.deps.ctr.state().is_ready();
        if rerank && !cold && results.len() > 1 {
            let (reranked, r) = self.rerank(user_id, results).await.into_parts();
            reason = reason.or(r);
            results = reranked;
        }

        Served::with_reason(results, reason)
    }

    /// Weighted blend of the four streams, backfilled from popularity
    async fn blend(&self, user_id: Uuid, count: usize, interacted: &HashSet<Uuid>) -> Served<Vec<RecommendedItem>> {
        let fetch = count * FETCH_FACTOR;
        let weights = &self.config.weights;
        let mut reason = None;

        let (ctx, r) = self.deps.features.user_context(user_id).await.into_parts();
        reason = reason.or(outage(r));
        let mut categories: Vec<String> = match self.deps.tags.interest_tags(user_id).await {
            Ok(tags) => {
                let now = Utc::now();
                let mut tags: Vec<_> = tags.into_iter().filter(|t| t.is_category()).collect();
                tags.sort_by(|a, b| b.decayed_weight(now).total_cmp(&a.decayed_weight(now)));
                tags.into_iter().map(|t| t.value).collect()
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Interest tags unavailable for content stream");
                reason = reason.or(Some(DegradeReason::SourceUnavailable));
                Vec::new()
            }
        };
        for category in ctx.preferences.top_categories(CONTENT_CATEGORIES) {
            if !categories.iter().any(|c| c.eq_ignore_ascii_case(&category)) {
                categories.push(category);
            }
        }
        categories.truncate(CONTENT_CATEGORIES);

        let mut content = Vec::new();
        for category in &categories {
            match self.deps.catalog.list_items(&ItemQuery::in_category(category.clone(), fetch)).await {
                Ok(items) => content.extend(items.into_iter().map(|i| i.id)),
                Err(e) => {
                    warn!(category = %category, error = %e, "Content stream listing failed");
                    reason = reason.or(Some(DegradeReason::SourceUnavailable));
                }
            }
        }

        let (collaborative, r) = self.deps.collaborative.recommend_for(user_id, fetch).await.into_parts();
        reason = reason.or(outage(r));
        let collaborative: Vec<Uuid> = collaborative.into_iter().map(|r| r.item_id).collect();

        let popular = self.list_ids(&ItemQuery::popular(fetch + interacted.len()), &mut reason).await;

        let exploration = if self.deps.exploration.should_explore(self.config.exploration_ratio) {
            let n = ((count as f64 * weights.exploration).ceil() as usize).max(1);
            match self
                .deps
                .exploration
                .exploration_recommendations(user_id, &categories, n)
                .await
            {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Exploration strategy failed, skipping stream");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let mut blend = Blend::default();
        blend.add_stream(&content, weights.content, RecommendationSource::ContentBased, interacted);
        blend.add_stream(&collaborative, weights.collaborative, RecommendationSource::Collaborative, interacted);
        blend.add_stream(&popular, weights.popularity, RecommendationSource::Popularity, interacted);
        blend.add_stream(&exploration, weights.exploration, RecommendationSource::Exploration, interacted);

        let mut ranked = blend.into_ranked();
        ranked.truncate(count);

        if ranked.len() < count {
            let chosen: HashSet<Uuid> = ranked.iter().map(|r| r.item_id).collect();
            let backfill: Vec<Uuid> = popular
                .iter()
                .filter(|id| !interacted.contains(*id) && !chosen.contains(*id))
                .copied()
                .take(count - ranked.len())
                .collect();
            debug!(user_id = %user_id, backfill = backfill.len(), "Blend short, backfilling from popularity");
            ranked.extend(
                backfill
                    .into_iter()
                    .map(|id| RecommendedItem::new(id, 0.0, RecommendationSource::Popularity)),
            );
        }

        Served::with_reason(ranked, reason)
    }

    async fn list_ids(&self, query: &ItemQuery, reason: &mut Option<DegradeReason>) -> Vec<Uuid> {
        match self.deps.catalog.list_items(query).await {
            Ok(items) => items.into_iter().map(|i| i.id).collect(),
            Err(e) => {
                warn!(error = %e, "Catalogue listing failed");
                *reason = reason.or(Some(DegradeReason::SourceUnavailable));
                Vec::new()
            }
        }
    }

    /// Fixed popular / high-rated / new / random mix for `count` slots
    pub async fn cold_start(&self, user_id: Uuid, count: usize, exclude: &HashSet<Uuid>) -> Served<Vec<RecommendedItem>> {
        let [popular_n, rated_n, new_n, random_n] = split_mix(count, &self.config.cold_start_mix);
        let mix = &self.config.cold_start_mix;
        let mut reason = None;
        let mut taken = exclude.clone();
        let mut out: Vec<RecommendedItem> = Vec::with_capacity(count);
        let over = exclude.len() + count;

        // popular, preferring the user's cluster categories
        let mut popular: Vec<Uuid> = Vec::new();
        let (assignment, _) = self.deps.clusterer.get_user_cluster_assignment(user_id).await.into_parts();
        if let Some(cluster_id) = assignment.map(|a| a.cluster_id).filter(|id| *id >= 0) {
            for category in self.deps.clusterer.cluster_categories(cluster_id).await {
                popular.extend(self.list_ids(&ItemQuery::in_category(category, over), &mut reason).await);
            }
        }
        popular.extend(self.list_ids(&ItemQuery::popular(over), &mut reason).await);
        take_stream(&mut out, &mut taken, &popular, popular_n, mix.popular, RecommendationSource::ColdStartPopular);

        let rated = self
            .list_ids(&ItemQuery::popular(over).ordered(ItemOrder::Rating), &mut reason)
            .await;
        take_stream(&mut out, &mut taken, &rated, rated_n, mix.high_rated, RecommendationSource::ColdStartHighRated);

        let cutoff = Utc::now() - Duration::days(self.config.new_item_days);
        let fresh = self
            .list_ids(
                &ItemQuery::popular(over).ordered(ItemOrder::Newest).created_after(cutoff),
                &mut reason,
            )
            .await;
        take_stream(&mut out, &mut taken, &fresh, new_n, mix.new_items, RecommendationSource::ColdStartNew);

        let mut pool = self
            .list_ids(
                &ItemQuery::popular(RANDOM_POOL.max(over)).ordered(ItemOrder::Unordered),
                &mut reason,
            )
            .await;
        {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            pool.shuffle(&mut *rng);
        }
        take_stream(&mut out, &mut taken, &pool, random_n, mix.random, RecommendationSource::ColdStartRandom);

        // a short sub-stream leaves slots for the others to fill
        if out.len() < count {
            for candidate in popular.iter().chain(&rated).chain(&pool) {
                if out.len() >= count {
                    break;
                }
                if taken.insert(*candidate) {
                    out.push(RecommendedItem::new(*candidate, 0.0, RecommendationSource::ColdStartPopular));
                }
            }
        }

        Served::with_reason(out, reason)
    }

    /// Reorder by predicted CTR; items the catalogue no longer has keep
    /// their place at the end
    async fn rerank(&self, user_id: Uuid, items: Vec<RecommendedItem>) -> Served<Vec<RecommendedItem>> {
        let ids: Vec<Uuid> = items.iter().map(|r| r.item_id).collect();
        let catalog_items: Vec<Item> = match self.deps.catalog.get_items(&ids).await {
            Ok(found) => found,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Catalogue unavailable, skipping CTR rerank");
                return Served::degraded(items, DegradeReason::SourceUnavailable);
            }
        };

        let (vectors, feature_reason) = self
            .deps
            .features
            .features_for_items(user_id, &catalog_items)
            .await
            .into_parts();
        let by_id: HashMap<Uuid, RecommendedItem> = items.iter().map(|r| (r.item_id, r.clone())).collect();
        let candidates: Vec<CtrCandidate> = vectors
            .into_iter()
            .filter_map(|(item_id, features)| {
                by_id.get(&item_id).map(|r| CtrCandidate {
                    item_id,
                    score: r.score,
                    features,
                })
            })
            .collect();

        let (ranked, ctr_reason) = self.deps.ctr.rerank(candidates).await.into_parts();
        let mut seen = HashSet::new();
        let mut out: Vec<RecommendedItem> = ranked
            .into_iter()
            .filter_map(|r| {
                seen.insert(r.item_id);
                by_id.get(&r.item_id).map(|item| RecommendedItem {
                    ctr: Some(r.ctr),
                    ..item.clone()
                })
            })
            .collect();
        out.extend(items.into_iter().filter(|r| !seen.contains(&r.item_id)));

        Served::with_reason(out, outage(feature_reason).or(ctr_reason))
    }
}

/// Append up to `n` unseen ids from `stream`, rank-scored by `weight`
fn take_stream(
    out: &mut Vec<RecommendedItem>,
    taken: &mut HashSet<Uuid>,
    stream: &[Uuid],
    n: usize,
    weight: f64,
    source: RecommendationSource,
) {
    let mut picked: Vec<Uuid> = Vec::with_capacity(n);
    for id in stream {
        if picked.len() >= n {
            break;
        }
        if !taken.contains(id) && !picked.contains(id) {
            picked.push(*id);
        }
    }
    let len = picked.len().max(1) as f64;
    for (rank, id) in picked.into_iter().enumerate() {
        taken.insert(id);
        out.push(RecommendedItem::new(id, weight * (len - rank as f64) / len, source));
    }
}
