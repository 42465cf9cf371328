//! Collaborative Index
//!
//! Item-based collaborative filtering. A scheduled rebuild turns the
//! interaction log into a user x item matrix, keeps the top-N cosine
//! neighbours of every item and publishes them by swapping the serving
//! index pointer; the same lists are written to the cache as sorted sets
//! so other processes (and restarts) can read them.

pub mod matrix;

pub use matrix::{InteractionMatrix, Neighbors};

use crate::config::CollaborativeConfig;
use crate::error::{DegradeReason, EngineError, Result, Served};
use crate::models::{InteractionEvent, Item, RecommendationSource, RecommendedItem};
use crate::sources::{InteractionLog, ItemCatalog, ItemQuery};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use reco_cache::{get_json, set_json, ttl, CacheKey, JobLock, KvStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const REBUILD_JOB: &str = "similarity_rebuild";

/// Published neighbour lists of one rebuild
#[derive(Debug, Clone, Default)]
pub struct SimilarityIndex {
    pub version: u64,
    pub neighbors: HashMap<Uuid, Neighbors>,
    pub built_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    #[default]
    Idle,
    Running,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarityStatus {
    pub version: u64,
    pub state: BuildState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub item_count: usize,
    pub user_count: usize,
    pub pair_count: usize,
    pub duration_ms: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildReport {
    pub version: u64,
    pub item_count: usize,
    pub user_count: usize,
    pub pair_count: usize,
    pub duration_ms: u64,
}

/// Clears the in-process running flag on every exit path
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Armed for the duration of a rebuild. If the rebuild future is dropped
/// (timeout) before disarming, the status is moved to `Failed` in the
/// background and the job lock is released by its own drop.
struct RebuildAbort {
    cache: Arc<dyn KvStore>,
    status: Arc<RwLock<SimilarityStatus>>,
    published: u64,
    lock: Option<JobLock>,
    armed: bool,
}

impl RebuildAbort {
    /// Hand back the lock for an orderly release
    fn disarm(mut self) -> Option<JobLock> {
        self.armed = false;
        self.lock.take()
    }
}

impl Drop for RebuildAbort {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        warn!(version = self.published, "Similarity rebuild abandoned, serving previous index");
        let cache = self.cache.clone();
        let status = self.status.clone();
        let published = self.published;
        handle.spawn(async move {
            let previous = status.read().await.clone();
            let failed = SimilarityStatus {
                version: published,
                state: BuildState::Failed,
                finished_at: Some(Utc::now()),
                last_error: Some("rebuild abandoned before completion".into()),
                ..previous
            };
            write_status(cache.as_ref(), &status, failed).await;
        });
    }
}

async fn write_status(cache: &dyn KvStore, slot: &RwLock<SimilarityStatus>, status: SimilarityStatus) {
    if let Err(e) = set_json(cache, &CacheKey::similarity_status(), &status, None).await {
        warn!(error = %e, "Failed to persist similarity status");
    }
    *slot.write().await = status;
}

pub struct CollaborativeIndex {
    catalog: Arc<dyn ItemCatalog>,
    interactions: Arc<dyn InteractionLog>,
    cache: Arc<dyn KvStore>,
    config: CollaborativeConfig,
    index: RwLock<Arc<SimilarityIndex>>,
    /// Per-item refreshes, tagged with the build they refine
    overrides: DashMap<Uuid, (u64, Neighbors)>,
    status: Arc<RwLock<SimilarityStatus>>,
    running: AtomicBool,
    cancel: AtomicBool,
}

impl CollaborativeIndex {
    pub fn new(
        catalog: Arc<dyn ItemCatalog>,
        interactions: Arc<dyn InteractionLog>,
        cache: Arc<dyn KvStore>,
        config: CollaborativeConfig,
    ) -> Self {
        Self {
            catalog,
            interactions,
            cache,
            config,
            index: RwLock::new(Arc::new(SimilarityIndex::default())),
            overrides: DashMap::new(),
            status: Arc::new(RwLock::new(SimilarityStatus::default())),
            running: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
        }
    }

    fn window_start(&self) -> DateTime<Utc> {
        Utc::now() - Duration::days(self.config.window_days)
    }

    /// Ask a running rebuild to stop before its next item
    pub fn cancel_rebuild(&self) {
        if self.running.load(Ordering::Acquire) {
            self.cancel.store(true, Ordering::Release);
        }
    }

    pub fn is_rebuilding(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Full rebuild; rejected while another one runs here or elsewhere
    pub async fn rebuild(&self) -> Result<RebuildReport> {
        self.rebuild_with(&self.cancel).await
    }

    /// Full rebuild that checks `cancel` between items
    pub async fn rebuild_with(&self, cancel: &AtomicBool) -> Result<RebuildReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::JobAlreadyRunning(REBUILD_JOB.into()));
        }
        let _guard = RunningGuard(&self.running);
        self.cancel.store(false, Ordering::Release);

        let lock = match JobLock::acquire(self.cache.clone(), REBUILD_JOB, self.config.job_lock_ttl_secs).await {
            Ok(Some(lock)) => Some(lock),
            Ok(None) => return Err(EngineError::JobAlreadyRunning(REBUILD_JOB.into())),
            Err(e) => {
                warn!(error = %e, "Job lock unavailable, rebuilding without distributed lock");
                None
            }
        };

        let started_at = Utc::now();
        let published = self.index.read().await.version;
        let abort = RebuildAbort {
            cache: self.cache.clone(),
            status: self.status.clone(),
            published,
            lock,
            armed: true,
        };
        let version = self.next_version(published).await;
        let previous = self.status.read().await.clone();
        self.publish_status(SimilarityStatus {
            version,
            state: BuildState::Running,
            started_at: Some(started_at),
            ..previous
        })
        .await;
        info!(version = version, "Similarity rebuild started");

        let result = self.run_rebuild(version, cancel).await;
        let finished_at = Utc::now();

        match &result {
            Ok(report) => {
                info!(
                    version = report.version,
                    items = report.item_count,
                    users = report.user_count,
                    pairs = report.pair_count,
                    duration_ms = report.duration_ms,
                    "Similarity rebuild completed"
                );
                self.publish_status(SimilarityStatus {
                    version: report.version,
                    state: BuildState::Idle,
                    started_at: Some(started_at),
                    finished_at: Some(finished_at),
                    item_count: report.item_count,
                    user_count: report.user_count,
                    pair_count: report.pair_count,
                    duration_ms: report.duration_ms,
                    last_error: None,
                })
                .await;
            }
            Err(e) => {
                warn!(version = version, error = %e, "Similarity rebuild failed, serving previous index");
                let previous = self.status.read().await.clone();
                self.publish_status(SimilarityStatus {
                    version: published,
                    state: BuildState::Failed,
                    finished_at: Some(finished_at),
                    last_error: Some(e.to_string()),
                    ..previous
                })
                .await;
            }
        }

        if let Some(lock) = abort.disarm() {
            if let Err(e) = lock.release().await {
                warn!(error = %e, "Failed to release similarity job lock");
            }
        }
        result
    }

    /// Monotonic across processes via the cache counter; local fallback
    async fn next_version(&self, published: u64) -> u64 {
        match self.cache.incr(&CacheKey::similarity_version_counter(), 1).await {
            Ok(v) => (v.max(0) as u64).max(published + 1),
            Err(e) => {
                warn!(error = %e, "Similarity version counter unavailable, using local version");
                published + 1
            }
        }
    }

    /// Build named by the shared pointer, or the local one when the cache
    /// has none or cannot be read
    async fn active_version(&self) -> (u64, Option<DegradeReason>) {
        let local = self.index.read().await.version;
        match self.cache.get(&CacheKey::similarity_active_version()).await {
            Ok(raw) => (raw.and_then(|v| v.parse::<u64>().ok()).unwrap_or(local), None),
            Err(e) => {
                warn!(error = %e, "Active similarity build unavailable, using local index");
                (local, Some(DegradeReason::CacheUnavailable))
            }
        }
    }

    /// Point readers at `version` unless a newer build is already active
    async fn activate(&self, version: u64) -> Result<()> {
        let key = CacheKey::similarity_active_version();
        let current = self.cache.get(&key).await?.and_then(|v| v.parse::<u64>().ok());
        if current.is_some_and(|c| c > version) {
            warn!(version = version, active = ?current, "Newer similarity build already active");
            return Ok(());
        }
        self.cache.set(&key, &version.to_string(), None).await?;
        Ok(())
    }

    async fn run_rebuild(&self, version: u64, cancel: &AtomicBool) -> Result<RebuildReport> {
        let started = Instant::now();
        let events = self.interactions.interactions_since(self.window_start()).await?;
        let matrix = InteractionMatrix::from_events(&events);
        debug!(
            events = events.len(),
            users = matrix.user_count(),
            items = matrix.item_count(),
            "Interaction matrix built"
        );

        let mut neighbors = HashMap::with_capacity(matrix.item_count());
        let mut pair_count = 0usize;
        for item in matrix.items() {
            if cancel.load(Ordering::Acquire) {
                return Err(EngineError::Cancelled(REBUILD_JOB.into()));
            }
            let list = matrix.neighbors(item, self.config.min_co_raters, self.config.top_n);
            pair_count += list.len();
            neighbors.insert(item, list);
            tokio::task::yield_now().await;
        }

        // persist before publishing so the cache never lags the serving index
        let mut persist_failures = 0usize;
        for (item, list) in &neighbors {
            if let Err(e) = self.persist_neighbors(version, *item, list).await {
                persist_failures += 1;
                debug!(item_id = %item, error = %e, "Failed to persist neighbours");
            }
        }
        if persist_failures > 0 {
            warn!(
                failures = persist_failures,
                "Some neighbour lists were not persisted; serving from memory"
            );
        }
        if let Err(e) = self.activate(version).await {
            warn!(version = version, error = %e, "Failed to activate similarity build in cache");
        }

        let report = RebuildReport {
            version,
            item_count: matrix.item_count(),
            user_count: matrix.user_count(),
            pair_count,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        *self.index.write().await = Arc::new(SimilarityIndex {
            version,
            neighbors,
            built_at: Some(Utc::now()),
        });
        self.overrides.clear();
        Ok(report)
    }

    async fn persist_neighbors(&self, version: u64, item: Uuid, list: &Neighbors) -> Result<()> {
        let key = CacheKey::item_neighbors(version, item);
        if list.is_empty() {
            self.cache.del(&key).await?;
        } else {
            let members: Vec<(String, f64)> =
                list.iter().map(|(id, sim)| (id.to_string(), *sim)).collect();
            self.cache
                .zreplace(&key, &members, Some(ttl::SIMILARITY))
                .await?;
        }
        Ok(())
    }

    async fn publish_status(&self, status: SimilarityStatus) {
        write_status(self.cache.as_ref(), &self.status, status).await;
    }

    /// Build status; the cached record wins because rebuilds may run in
    /// another process
    pub async fn status(&self) -> Served<SimilarityStatus> {
        let local = self.status.read().await.clone();
        match get_json::<SimilarityStatus>(self.cache.as_ref(), &CacheKey::similarity_status()).await
        {
            Ok(Some(persisted)) => Served::Fresh(persisted),
            Ok(None) => Served::Fresh(local),
            Err(e) => {
                warn!(error = %e, "Similarity status unavailable in cache, using local state");
                Served::degraded(local, DegradeReason::CacheUnavailable)
            }
        }
    }

    pub async fn current_version(&self) -> u64 {
        self.index.read().await.version
    }

    /// Recompute one item's neighbour set from its co-raters and replace it
    /// in memory and in the cache. Returns the neighbour count.
    pub async fn refresh_item(&self, item_id: Uuid) -> Result<usize> {
        let since = self.window_start();
        let item_events = self.interactions.item_interactions(item_id, since).await?;
        let users: HashSet<Uuid> = item_events.iter().map(|e| e.user_id).collect();

        let mut events: Vec<InteractionEvent> = item_events;
        let mut candidates: HashSet<Uuid> = HashSet::new();
        for user in &users {
            let user_events = self.interactions.user_interactions(*user, since).await?;
            candidates.extend(user_events.iter().map(|e| e.item_id));
        }
        candidates.remove(&item_id);
        // complete rows for every candidate so their norms are exact
        for candidate in &candidates {
            events.extend(self.interactions.item_interactions(*candidate, since).await?);
        }

        let matrix = InteractionMatrix::from_events(&events);
        let list = matrix.neighbors(item_id, self.config.min_co_raters, self.config.top_n);
        let (version, _) = self.active_version().await;
        if let Err(e) = self.persist_neighbors(version, item_id, &list).await {
            warn!(item_id = %item_id, error = %e, "Failed to persist refreshed neighbours");
        }

        let count = list.len();
        self.overrides.insert(item_id, (version, list));
        info!(item_id = %item_id, neighbors = count, "Item similarity refreshed");
        Ok(count)
    }

    /// Neighbour list of `item_id` in the local index when it is the
    /// active build
    async fn local_neighbors(&self, item_id: Uuid, active: u64) -> Option<Neighbors> {
        if let Some(entry) = self.overrides.get(&item_id) {
            let (version, list) = entry.value();
            if *version == active {
                return Some(list.clone());
            }
        }
        let index = self.index.read().await;
        if index.version != active {
            return None;
        }
        index.neighbors.get(&item_id).cloned()
    }

    /// Neighbour list of the active build from memory, then the cache.
    /// `None` when neither has one.
    async fn neighbors_of(&self, item_id: Uuid) -> (Option<Neighbors>, Option<DegradeReason>) {
        let (active, reason) = self.active_version().await;
        if let Some(list) = self.local_neighbors(item_id, active).await {
            return (Some(list), reason);
        }
        if active == 0 {
            return (None, reason);
        }

        match self
            .cache
            .zrevrange_withscores(&CacheKey::item_neighbors(active, item_id), self.config.top_n)
            .await
        {
            Ok(members) if members.is_empty() => (None, reason),
            Ok(members) => {
                let list = members
                    .into_iter()
                    .filter_map(|(id, sim)| Uuid::parse_str(&id).ok().map(|id| (id, sim)))
                    .collect();
                (Some(list), reason)
            }
            Err(e) => {
                warn!(item_id = %item_id, error = %e, "Neighbour cache read failed");
                (None, Some(DegradeReason::CacheUnavailable))
            }
        }
    }

    /// Cosine similarity of two items from the active build (memory, then
    /// cache), then a live computation when enabled, then 0
    pub async fn similarity(&self, a: Uuid, b: Uuid) -> Served<f64> {
        if a == b {
            return Served::Fresh(1.0);
        }

        let (active, mut reason) = self.active_version().await;
        for (x, y) in [(a, b), (b, a)] {
            let found = self
                .local_neighbors(x, active)
                .await
                .and_then(|l| l.iter().find(|(id, _)| *id == y).map(|(_, s)| *s));
            if let Some(sim) = found {
                return Served::with_reason(sim, reason);
            }
        }

        if active > 0 && reason.is_none() {
            for (x, y) in [(a, b), (b, a)] {
                match self
                    .cache
                    .zscore(&CacheKey::item_neighbors(active, x), &y.to_string())
                    .await
                {
                    Ok(Some(sim)) => return Served::Fresh(sim),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(item_a = %x, item_b = %y, error = %e, "Similarity cache read failed");
                        reason = Some(DegradeReason::CacheUnavailable);
                        break;
                    }
                }
            }
        }

        if self.config.live_fallback {
            match self.live_similarity(a, b).await {
                Ok(Some(sim)) => return Served::with_reason(sim, reason),
                Ok(None) => {}
                Err(e) => {
                    warn!(item_a = %a, item_b = %b, error = %e, "Live similarity failed");
                    reason = reason.or(Some(DegradeReason::SourceUnavailable));
                }
            }
        }

        debug!(item_a = %a, item_b = %b, "No similarity data for pair");
        Served::degraded(0.0, reason.unwrap_or(DegradeReason::NoSimilarityData))
    }

    /// `None` when the pair has too few co-raters to be meaningful
    async fn live_similarity(&self, a: Uuid, b: Uuid) -> Result<Option<f64>> {
        let since = self.window_start();
        let (ea, eb) = tokio::try_join!(
            self.interactions.item_interactions(a, since),
            self.interactions.item_interactions(b, since)
        )?;
        let mut events = ea;
        events.extend(eb);
        let (sim, co_raters) = InteractionMatrix::from_events(&events).similarity(a, b);
        Ok((co_raters >= self.config.min_co_raters).then_some(sim))
    }

    /// Top neighbours of an item, falling back to same-category popularity
    /// (score 0) when no similarity data exists
    pub async fn get_similar_items(&self, item_id: Uuid, limit: usize) -> Served<Vec<(Uuid, f64)>> {
        let (list, reason) = self.neighbors_of(item_id).await;
        if let Some(mut list) = list.filter(|l| !l.is_empty()) {
            list.truncate(limit);
            return Served::with_reason(list, reason);
        }

        let fallback_reason = reason.unwrap_or(DegradeReason::NoSimilarityData);
        let item = match self.catalog.get_item(item_id).await {
            Ok(Some(item)) => item,
            Ok(None) => return Served::degraded(Vec::new(), fallback_reason),
            Err(e) => {
                warn!(item_id = %item_id, error = %e, "Catalogue unavailable for similarity fallback");
                return Served::degraded(Vec::new(), DegradeReason::SourceUnavailable);
            }
        };

        match self
            .catalog
            .list_items(&ItemQuery::in_category(item.category.clone(), limit + 1))
            .await
        {
            Ok(items) => {
                debug!(item_id = %item_id, category = %item.category, "Similar items from category popularity");
                let list = items
                    .into_iter()
                    .filter(|i| i.id != item_id)
                    .take(limit)
                    .map(|i| (i.id, 0.0))
                    .collect();
                Served::degraded(list, fallback_reason)
            }
            Err(e) => {
                warn!(item_id = %item_id, error = %e, "Category popularity fallback failed");
                Served::degraded(Vec::new(), DegradeReason::SourceUnavailable)
            }
        }
    }

    /// Item-based recommendations: for every candidate neighbour of the
    /// user's items, `sum(sim * weight) / sum(|sim|)`. Candidates without a
    /// positive-similarity neighbour are dropped.
    pub async fn recommend_for(&self, user_id: Uuid, limit: usize) -> Served<Vec<RecommendedItem>> {
        let events = match self
            .interactions
            .user_interactions(user_id, self.window_start())
            .await
        {
            Ok(events) => events,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Interaction log unavailable for collaborative stream");
                return Served::degraded(Vec::new(), DegradeReason::SourceUnavailable);
            }
        };
        if events.is_empty() || limit == 0 {
            return Served::Fresh(Vec::new());
        }

        let mut interacted: HashMap<Uuid, f64> = HashMap::new();
        for event in &events {
            let slot = interacted.entry(event.item_id).or_insert(0.0);
            *slot = slot.max(event.kind.weight());
        }

        let mut reason = None;
        // candidate -> (weighted sum, |sim| sum, has positive neighbour)
        let mut scores: HashMap<Uuid, (f64, f64, bool)> = HashMap::new();
        for (item, weight) in &interacted {
            let (list, r) = self.neighbors_of(*item).await;
            reason = reason.or(r);
            for (candidate, sim) in list.unwrap_or_default() {
                if interacted.contains_key(&candidate) {
                    continue;
                }
                let entry = scores.entry(candidate).or_insert((0.0, 0.0, false));
                entry.0 += sim * weight;
                entry.1 += sim.abs();
                entry.2 |= sim > 0.0;
            }
        }

        let mut ranked: Vec<(Uuid, f64)> = scores
            .into_iter()
            .filter(|(_, (_, denom, positive))| *positive && *denom > 0.0)
            .map(|(id, (num, denom, _))| (id, num / denom))
            .collect();
        matrix::sort_neighbors(&mut ranked);
        ranked.truncate(limit);

        if !ranked.is_empty() {
            let items = ranked
                .into_iter()
                .map(|(id, score)| RecommendedItem::new(id, score, RecommendationSource::Collaborative))
                .collect();
            return Served::with_reason(items, reason);
        }

        debug!(user_id = %user_id, "No collaborative candidates, using category popularity");
        let exclude: HashSet<Uuid> = interacted.keys().copied().collect();
        let fallback = self.category_popularity(&events, &exclude, limit).await;
        let (items, fallback_reason) = fallback.into_parts();
        Served::degraded(
            items,
            reason
                .or(fallback_reason)
                .unwrap_or(DegradeReason::NoSimilarityData),
        )
    }

    /// Popular items in the user's most-interacted category
    async fn category_popularity(
        &self,
        events: &[InteractionEvent],
        exclude: &HashSet<Uuid>,
        limit: usize,
    ) -> Served<Vec<RecommendedItem>> {
        let ids: Vec<Uuid> = exclude.iter().copied().collect();
        let items = match self.catalog.get_items(&ids).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "Catalogue unavailable for category fallback");
                return Served::degraded(Vec::new(), DegradeReason::SourceUnavailable);
            }
        };
        let category_of: HashMap<Uuid, &str> =
            items.iter().map(|i| (i.id, i.category.as_str())).collect();

        let mut weights: HashMap<&str, f64> = HashMap::new();
        for event in events {
            if let Some(category) = category_of.get(&event.item_id) {
                *weights.entry(category).or_insert(0.0) += event.kind.weight();
            }
        }
        let Some(category) = weights
            .into_iter()
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(c, _)| c.to_string())
        else {
            return Served::Fresh(Vec::new());
        };

        match self
            .catalog
            .list_items(&ItemQuery::in_category(category, limit + exclude.len()))
            .await
        {
            Ok(items) => {
                let list: Vec<Item> = items
                    .into_iter()
                    .filter(|i| !exclude.contains(&i.id))
                    .take(limit)
                    .collect();
                let n = list.len().max(1) as f64;
                Served::Fresh(
                    list.into_iter()
                        .enumerate()
                        .map(|(rank, item)| {
                            RecommendedItem::new(
                                item.id,
                                (n - rank as f64) / n,
                                RecommendationSource::Popularity,
                            )
                        })
                        .collect(),
                )
            }
            Err(e) => {
                warn!(error = %e, "Category popularity listing failed");
                Served::degraded(Vec::new(), DegradeReason::SourceUnavailable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InteractionKind;
    use crate::sources::{MemoryCatalog, MemoryInteractionLog};
    use reco_cache::MemoryKvStore;

    struct Fixture {
        catalog: Arc<MemoryCatalog>,
        log: Arc<MemoryInteractionLog>,
        cache: MemoryKvStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                catalog: Arc::new(MemoryCatalog::new()),
                log: Arc::new(MemoryInteractionLog::new()),
                cache: MemoryKvStore::new(),
            }
        }

        fn index(&self) -> CollaborativeIndex {
            self.index_with(CollaborativeConfig::default())
        }

        fn index_with(&self, config: CollaborativeConfig) -> CollaborativeIndex {
            CollaborativeIndex::new(
                self.catalog.clone(),
                self.log.clone(),
                Arc::new(self.cache.clone()),
                config,
            )
        }

        fn interact(&self, user: Uuid, item: Uuid, kind: InteractionKind) {
            self.log.record(InteractionEvent::new(user, item, kind, Utc::now()));
        }
    }

    fn item(category: &str, sales: u64) -> Item {
        Item {
            id: Uuid::new_v4(),
            category: category.into(),
            merchant_id: "m".into(),
            brand: None,
            origin: None,
            price: 20.0,
            original_price: 20.0,
            rating: 4.0,
            sales_count: sales,
            review_count: 1,
            stock: 3,
            is_promoted: false,
            tags: vec![],
            embedding: vec![],
            created_at: Utc::now(),
        }
    }

    /// Items a and b bought together by u1..u3; c only viewed by u1, u2
    fn seeded() -> (Fixture, [Uuid; 3], [Uuid; 3]) {
        let fx = Fixture::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let users = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        for user in &users {
            fx.interact(*user, a, InteractionKind::Purchase);
            fx.interact(*user, b, InteractionKind::Purchase);
        }
        fx.interact(users[0], c, InteractionKind::View);
        fx.interact(users[1], c, InteractionKind::View);
        (fx, [a, b, c], users)
    }

    #[tokio::test]
    async fn test_rebuild_publishes_index_and_status() {
        let (fx, [a, b, _], _) = seeded();
        let index = fx.index();

        let report = index.rebuild().await.unwrap();

        assert_eq!(report.version, 1);
        assert_eq!(report.user_count, 3);
        assert_eq!(report.item_count, 3);
        assert_eq!(index.similarity(a, b).await, Served::Fresh(1.0));
        let status = index.status().await.into_inner();
        assert_eq!(status.state, BuildState::Idle);
        assert_eq!(status.version, 1);
        assert!(!index.is_rebuilding());
        // lock released
        assert!(fx.cache.get(&CacheKey::job_lock(REBUILD_JOB)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persisted_neighbors_serve_other_instances() {
        let (fx, [a, b, _], _) = seeded();
        fx.index().rebuild().await.unwrap();

        let config = CollaborativeConfig {
            live_fallback: false,
            ..CollaborativeConfig::default()
        };
        let reader = fx.index_with(config);

        assert_eq!(reader.similarity(b, a).await, Served::Fresh(1.0));
        let similar = reader.get_similar_items(a, 5).await;
        assert!(!similar.is_degraded());
        assert_eq!(similar.value()[0].0, b);
    }

    #[tokio::test]
    async fn test_rebuild_rejected_while_locked() {
        let (fx, _, _) = seeded();
        fx.cache
            .set_nx(&CacheKey::job_lock(REBUILD_JOB), "other-host", 60)
            .await
            .unwrap();

        let result = fx.index().rebuild().await;

        assert!(matches!(result, Err(EngineError::JobAlreadyRunning(_))));
    }

    #[tokio::test]
    async fn test_cancelled_rebuild_keeps_previous_index() {
        let (fx, [a, b, _], _) = seeded();
        let index = fx.index();
        index.rebuild().await.unwrap();

        let cancel = AtomicBool::new(true);
        let result = index.rebuild_with(&cancel).await;

        assert!(matches!(result, Err(EngineError::Cancelled(_))));
        assert_eq!(index.current_version().await, 1);
        assert_eq!(index.similarity(a, b).await, Served::Fresh(1.0));
        assert_eq!(index.status().await.into_inner().state, BuildState::Failed);
    }

    #[tokio::test]
    async fn test_items_leaving_the_window_are_dropped_on_rebuild() {
        let (fx, [a, b, _], _) = seeded();
        let config = CollaborativeConfig {
            live_fallback: false,
            ..CollaborativeConfig::default()
        };
        let first = fx.index_with(config.clone());
        first.rebuild().await.unwrap();

        // a later window in which a and b no longer appear
        let later = Arc::new(MemoryInteractionLog::new());
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        for _ in 0..2 {
            let user = Uuid::new_v4();
            later.record(InteractionEvent::new(user, x, InteractionKind::Purchase, Utc::now()));
            later.record(InteractionEvent::new(user, y, InteractionKind::Purchase, Utc::now()));
        }
        let second = CollaborativeIndex::new(fx.catalog.clone(), later, Arc::new(fx.cache.clone()), config);
        let report = second.rebuild().await.unwrap();
        assert_eq!(report.version, 2);

        for index in [&second, &first] {
            let served = index.similarity(a, b).await;
            assert_eq!(served.reason(), Some(DegradeReason::NoSimilarityData));
            assert!(index.neighbors_of(a).await.0.is_none());
            assert_eq!(index.similarity(x, y).await, Served::Fresh(1.0));
        }
    }

    #[tokio::test]
    async fn test_abandoned_rebuild_releases_lock_and_marks_failure() {
        use futures::FutureExt;

        let (fx, [a, b, _], _) = seeded();
        let index = fx.index();
        index.rebuild().await.unwrap();

        // dropped mid-build, as a timeout does
        assert!(index.rebuild().now_or_never().is_none());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(!index.is_rebuilding());
        assert!(fx.cache.get(&CacheKey::job_lock(REBUILD_JOB)).await.unwrap().is_none());
        let status = index.status().await.into_inner();
        assert_eq!(status.state, BuildState::Failed);
        assert_eq!(status.version, 1);
        assert_eq!(index.similarity(a, b).await, Served::Fresh(1.0));

        let next = index.rebuild().await.unwrap();
        assert!(next.version > 1);
    }

    #[tokio::test]
    async fn test_unknown_pair_without_live_fallback_is_degraded_zero() {
        let fx = Fixture::new();
        let config = CollaborativeConfig {
            live_fallback: false,
            ..CollaborativeConfig::default()
        };
        let index = fx.index_with(config);

        let served = index.similarity(Uuid::new_v4(), Uuid::new_v4()).await;

        assert_eq!(served.reason(), Some(DegradeReason::NoSimilarityData));
        assert_eq!(served.into_inner(), 0.0);
    }

    #[tokio::test]
    async fn test_live_fallback_computes_cold_pairs() {
        let (fx, [a, b, _], _) = seeded();
        let index = fx.index();

        // nothing built yet
        assert_eq!(index.similarity(a, b).await, Served::Fresh(1.0));
    }

    #[tokio::test]
    async fn test_recommend_for_excludes_interacted_items() {
        let (fx, [a, b, c], users) = seeded();
        let index = fx.index();
        index.rebuild().await.unwrap();

        let newcomer = Uuid::new_v4();
        fx.interact(newcomer, a, InteractionKind::Purchase);
        let recs = index.recommend_for(newcomer, 10).await.into_inner();

        let ids: Vec<Uuid> = recs.iter().map(|r| r.item_id).collect();
        assert!(!ids.contains(&a));
        assert!(ids.contains(&b));
        assert!(ids.contains(&c));
        assert!(recs.iter().all(|r| r.source == RecommendationSource::Collaborative));

        // users[0] has touched every item: nothing left to suggest
        let empty = index.recommend_for(users[0], 10).await;
        assert!(empty.value().iter().all(|r| r.item_id != a && r.item_id != b));
    }

    #[tokio::test]
    async fn test_similar_items_fall_back_to_category_popularity() {
        let fx = Fixture::new();
        let lonely = item("shoes", 1);
        let popular = item("shoes", 100);
        let other = item("books", 500);
        fx.catalog.extend([lonely.clone(), popular.clone(), other]);
        let config = CollaborativeConfig {
            live_fallback: false,
            ..CollaborativeConfig::default()
        };
        let index = fx.index_with(config);

        let served = index.get_similar_items(lonely.id, 5).await;

        assert_eq!(served.reason(), Some(DegradeReason::NoSimilarityData));
        assert_eq!(served.into_inner(), vec![(popular.id, 0.0)]);
    }

    #[tokio::test]
    async fn test_refresh_item_replaces_single_neighbor_set() {
        let (fx, [a, _, c], users) = seeded();
        let index = fx.index();
        index.rebuild().await.unwrap();

        // make c a strong co-purchase of a for a third user
        fx.interact(users[2], c, InteractionKind::Purchase);
        let count = index.refresh_item(a).await.unwrap();

        assert_eq!(count, 2);
        let similar = index.get_similar_items(a, 5).await.into_inner();
        assert!(similar.iter().any(|(id, _)| *id == c));
        assert_eq!(index.current_version().await, 1);
    }
}
