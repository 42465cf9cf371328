//! User Clusterer
//!
//! Segments active users with k-means++ over the 56-d clustering vector.
//! Every completed run gets a new version; the previous run is marked
//! inactive but stays readable, so a reader always sees one consistent
//! version. New users are assigned incrementally against the active
//! centroids between runs.

pub mod features;
pub mod kmeans;

pub use features::{CategoryTable, CLUSTER_DIM};
pub use kmeans::{KMeansParams, KMeansResult};

use crate::config::ClusteringConfig;
use crate::error::{DegradeReason, EngineError, Result, Served};
use crate::models::{InteractionEvent, Item};
use crate::sources::{InteractionLog, ItemCatalog};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use reco_cache::{get_json, set_json, CacheKey, JobLock, KvStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CLUSTERING_JOB: &str = "clustering";

/// Cluster id given to users without behaviour
pub const NEW_USER_CLUSTER_ID: i64 = -1;

/// Versions kept in memory, the active one included
const HISTORY_VERSIONS: usize = 3;

const DISTANCE_EPSILON: f64 = 1e-12;
const ASSIGNMENT_BATCH: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: i64,
    pub version: u64,
    pub centroid: Vec<f64>,
    pub member_count: usize,
    pub mean_distance: f64,
    /// Top-3 categories of the centroid's category group
    pub recommended_categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub user_id: Uuid,
    pub cluster_id: i64,
    pub distance: f64,
    pub second_cluster_id: Option<i64>,
    pub second_distance: Option<f64>,
    pub confidence: f64,
    pub is_boundary: bool,
    pub version: u64,
    pub assigned_at: DateTime<Utc>,
}

/// Run metadata, persisted per version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRun {
    pub version: u64,
    pub k: usize,
    pub active: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub user_count: usize,
    pub boundary_count: usize,
    pub mean_confidence: f64,
    pub iterations: usize,
    pub converged: bool,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub id: i64,
    pub member_count: usize,
    pub mean_distance: f64,
    pub recommended_categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterStats {
    pub version: u64,
    pub k: usize,
    pub clusters: Vec<ClusterSummary>,
    pub total_users: usize,
    pub boundary_users: usize,
    pub mean_confidence: f64,
    pub iterations: usize,
    pub converged: bool,
    pub finished_at: DateTime<Utc>,
}

/// One published clustering version
struct ClusterVersion {
    run: ClusterRun,
    clusters: Vec<Cluster>,
    table: CategoryTable,
    /// Assignments known in memory; the cache holds the full set
    assignments: DashMap<Uuid, ClusterAssignment>,
}

impl ClusterVersion {
    fn stats(&self) -> ClusterStats {
        ClusterStats {
            version: self.run.version,
            k: self.run.k,
            clusters: self
                .clusters
                .iter()
                .map(|c| ClusterSummary {
                    id: c.id,
                    member_count: c.member_count,
                    mean_distance: c.mean_distance,
                    recommended_categories: c.recommended_categories.clone(),
                })
                .collect(),
            total_users: self.run.user_count,
            boundary_users: self.run.boundary_count,
            mean_confidence: self.run.mean_confidence,
            iterations: self.run.iterations,
            converged: self.run.converged,
            finished_at: self.run.finished_at,
        }
    }
}

#[derive(Default)]
struct ClusterState {
    active: Option<u64>,
    versions: BTreeMap<u64, Arc<ClusterVersion>>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// `1 - d1 / (d1 + d2)`; 0.5 when both distances are zero, 1.0 with a single cluster
pub fn assignment_confidence(nearest: f64, second: Option<f64>) -> f64 {
    match second {
        None => 1.0,
        Some(second) if nearest + second <= DISTANCE_EPSILON => 0.5,
        Some(second) => (1.0 - nearest / (nearest + second)).clamp(0.0, 1.0),
    }
}

/// Nearly equidistant between the two closest centroids
pub fn is_boundary(nearest: f64, second: Option<f64>, ratio: f64) -> bool {
    match second {
        None => false,
        Some(second) if nearest <= DISTANCE_EPSILON => second <= DISTANCE_EPSILON,
        Some(second) => second / nearest < ratio,
    }
}

pub struct UserClusterer {
    catalog: Arc<dyn ItemCatalog>,
    interactions: Arc<dyn InteractionLog>,
    cache: Arc<dyn KvStore>,
    config: ClusteringConfig,
    state: RwLock<ClusterState>,
    running: AtomicBool,
}

impl UserClusterer {
    pub fn new(
        catalog: Arc<dyn ItemCatalog>,
        interactions: Arc<dyn InteractionLog>,
        cache: Arc<dyn KvStore>,
        config: ClusteringConfig,
    ) -> Self {
        Self {
            catalog,
            interactions,
            cache,
            config,
            state: RwLock::new(ClusterState::default()),
            running: AtomicBool::new(false),
        }
    }

    fn window_start(&self) -> DateTime<Utc> {
        Utc::now() - Duration::days(self.config.window_days)
    }

    fn assignment_for(
        &self,
        user_id: Uuid,
        vector: &[f64],
        clusters: &[Cluster],
        centroids: &[Vec<f64>],
        version: u64,
    ) -> ClusterAssignment {
        let now = Utc::now();
        match kmeans::nearest_two(vector, centroids) {
            Some(((best, d1), second)) => ClusterAssignment {
                user_id,
                cluster_id: clusters[best].id,
                distance: d1,
                second_cluster_id: second.map(|(i, _)| clusters[i].id),
                second_distance: second.map(|(_, d)| d),
                confidence: assignment_confidence(d1, second.map(|(_, d)| d)),
                is_boundary: is_boundary(d1, second.map(|(_, d)| d), self.config.boundary_ratio),
                version,
                assigned_at: now,
            },
            None => Self::new_user_assignment(user_id, version),
        }
    }

    fn new_user_assignment(user_id: Uuid, version: u64) -> ClusterAssignment {
        ClusterAssignment {
            user_id,
            cluster_id: NEW_USER_CLUSTER_ID,
            distance: 0.0,
            second_cluster_id: None,
            second_distance: None,
            confidence: 0.5,
            is_boundary: false,
            version,
            assigned_at: Utc::now(),
        }
    }

    /// Full clustering run over active users; publishes a new version.
    /// `k` overrides the configured cluster count.
    pub async fn run_clustering(&self, k: Option<usize>) -> Result<ClusterStats> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::JobAlreadyRunning(CLUSTERING_JOB.into()));
        }
        let _guard = RunningGuard(&self.running);

        let lock = match JobLock::acquire(self.cache.clone(), CLUSTERING_JOB, self.config.job_lock_ttl_secs).await {
            Ok(Some(lock)) => Some(lock),
            Ok(None) => return Err(EngineError::JobAlreadyRunning(CLUSTERING_JOB.into())),
            Err(e) => {
                warn!(error = %e, "Job lock unavailable, clustering without distributed lock");
                None
            }
        };

        let k = k.unwrap_or(self.config.k);
        info!(k = k, "Clustering run started");
        let result = self.run_inner(k).await;
        match &result {
            Ok(stats) => info!(
                version = stats.version,
                users = stats.total_users,
                boundary_users = stats.boundary_users,
                iterations = stats.iterations,
                converged = stats.converged,
                "Clustering run completed"
            ),
            Err(e) => warn!(k = k, error = %e, "Clustering run failed, previous version stays active"),
        }

        if let Some(lock) = lock {
            if let Err(e) = lock.release().await {
                warn!(error = %e, "Failed to release clustering job lock");
            }
        }
        result
    }

    async fn run_inner(&self, k: usize) -> Result<ClusterStats> {
        if k == 0 {
            return Err(EngineError::InvalidInput("k must be positive".into()));
        }
        let started_at = Utc::now();
        let started = Instant::now();
        let since = self.window_start();

        let users = self.interactions.active_users(since, self.config.max_users).await?;
        let user_set: HashSet<Uuid> = users.iter().copied().collect();
        let mut by_user: HashMap<Uuid, Vec<InteractionEvent>> = HashMap::new();
        for event in self.interactions.interactions_since(since).await? {
            if user_set.contains(&event.user_id) {
                by_user.entry(event.user_id).or_default().push(event);
            }
        }

        let item_ids: Vec<Uuid> = by_user
            .values()
            .flatten()
            .map(|e| e.item_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let items: HashMap<Uuid, Item> = match self.catalog.get_items(&item_ids).await {
            Ok(items) => items.into_iter().map(|i| (i.id, i)).collect(),
            Err(e) => {
                warn!(error = %e, "Catalogue unavailable, clustering on behaviour-only features");
                HashMap::new()
            }
        };

        let all_events: Vec<InteractionEvent> = by_user.values().flatten().cloned().collect();
        let table = CategoryTable::from_events(&all_events, &items);

        let mut user_ids = Vec::with_capacity(users.len());
        let mut points = Vec::with_capacity(users.len());
        let mut neutral = 0usize;
        for user in &users {
            let events = by_user.get(user).map(Vec::as_slice).unwrap_or(&[]);
            let vector = match features::build(events, &items, &table) {
                Some(v) => features::sanitize(v),
                None => {
                    neutral += 1;
                    features::neutral_vector()
                }
            };
            user_ids.push(*user);
            points.push(vector);
        }
        if neutral > 0 {
            debug!(count = neutral, "Users clustered on the neutral vector");
        }

        let params = KMeansParams {
            k,
            max_iterations: self.config.max_iterations,
            tolerance: self.config.tolerance,
            seed: self.config.seed,
        };
        let points = Arc::new(points);
        let fit_points = points.clone();
        let fit = tokio::task::spawn_blocking(move || kmeans::fit(&fit_points, &params))
            .await
            .map_err(|e| EngineError::Cancelled(format!("clustering task: {}", e)))??;

        let version = self.next_version().await;
        let mut clusters: Vec<Cluster> = fit
            .centroids
            .iter()
            .enumerate()
            .map(|(i, centroid)| Cluster {
                id: i as i64,
                version,
                centroid: centroid.clone(),
                member_count: 0,
                mean_distance: 0.0,
                recommended_categories: recommended_categories(centroid, &table),
            })
            .collect();

        let assignments: DashMap<Uuid, ClusterAssignment> = DashMap::with_capacity(user_ids.len());
        let mut distance_sums = vec![0.0; k];
        let mut boundary_count = 0usize;
        let mut confidence_sum = 0.0;
        for (user, point) in user_ids.iter().zip(points.iter()) {
            let assignment =
                self.assignment_for(*user, point, &clusters, &fit.centroids, version);
            if let Ok(idx) = usize::try_from(assignment.cluster_id) {
                clusters[idx].member_count += 1;
                distance_sums[idx] += assignment.distance;
            }
            boundary_count += usize::from(assignment.is_boundary);
            confidence_sum += assignment.confidence;
            assignments.insert(*user, assignment);
        }
        for (cluster, sum) in clusters.iter_mut().zip(distance_sums) {
            if cluster.member_count > 0 {
                cluster.mean_distance = sum / cluster.member_count as f64;
            }
        }

        let run = ClusterRun {
            version,
            k,
            active: true,
            started_at,
            finished_at: Utc::now(),
            user_count: user_ids.len(),
            boundary_count,
            mean_confidence: if user_ids.is_empty() {
                0.0
            } else {
                confidence_sum / user_ids.len() as f64
            },
            iterations: fit.iterations,
            converged: fit.converged,
            categories: table.names().to_vec(),
        };

        let published = Arc::new(ClusterVersion {
            run,
            clusters,
            table,
            assignments,
        });
        self.persist_version(&published).await;
        let stats = published.stats();
        self.publish(published).await;

        debug!(
            version = version,
            duration_ms = started.elapsed().as_millis() as u64,
            "Clustering version published"
        );
        Ok(stats)
    }

    /// Monotonic across processes via the cache counter; local fallback
    async fn next_version(&self) -> u64 {
        let local = {
            let state = self.state.read().await;
            state.versions.keys().next_back().copied().unwrap_or(0)
        };
        match self.cache.incr(&CacheKey::cluster_version_counter(), 1).await {
            Ok(v) => (v.max(0) as u64).max(local + 1),
            Err(e) => {
                warn!(error = %e, "Version counter unavailable, using local version");
                local + 1
            }
        }
    }

    async fn persist_version(&self, version: &ClusterVersion) {
        let v = version.run.version;
        let store = self.cache.as_ref();

        let mut failures = 0usize;
        if set_json(store, &CacheKey::cluster_centroids(v), &version.clusters, None)
            .await
            .is_err()
        {
            failures += 1;
        }

        let entries: Vec<(String, String)> = version
            .assignments
            .iter()
            .filter_map(|entry| {
                serde_json::to_string(entry.value())
                    .ok()
                    .map(|json| (entry.key().to_string(), json))
            })
            .collect();
        for chunk in entries.chunks(ASSIGNMENT_BATCH) {
            if store
                .hset_multiple(&CacheKey::cluster_assignments(v), chunk)
                .await
                .is_err()
            {
                failures += 1;
            }
        }

        // the pointer only moves forward; a run that finishes after a newer
        // one was published is stored inactive
        let pointer = match store.get(&CacheKey::cluster_active_version()).await {
            Ok(raw) => raw.and_then(|p| p.parse::<u64>().ok()),
            Err(_) => {
                failures += 1;
                None
            }
        };
        let superseded = pointer.is_some_and(|p| p > v);
        if let Some(prev) = pointer.filter(|p| *p < v) {
            self.deactivate_run(prev).await;
        }
        let mut run = version.run.clone();
        run.active = !superseded;
        if set_json(store, &CacheKey::cluster_run(v), &run, None)
            .await
            .is_err()
        {
            failures += 1;
        }
        if superseded {
            warn!(version = v, "Newer clustering version already active, keeping it");
        } else if store
            .set(&CacheKey::cluster_active_version(), &v.to_string(), None)
            .await
            .is_err()
        {
            failures += 1;
        }

        if failures > 0 {
            warn!(version = v, failures = failures, "Clustering version only partially persisted");
        }
    }

    async fn deactivate_run(&self, version: u64) {
        let key = CacheKey::cluster_run(version);
        match get_json::<ClusterRun>(self.cache.as_ref(), &key).await {
            Ok(Some(mut run)) => {
                run.active = false;
                if let Err(e) = set_json(self.cache.as_ref(), &key, &run, None).await {
                    warn!(version = version, error = %e, "Failed to mark clustering run inactive");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(version = version, error = %e, "Failed to read previous clustering run"),
        }
    }

    async fn publish(&self, version: Arc<ClusterVersion>) {
        let mut state = self.state.write().await;
        let v = version.run.version;
        state.versions.insert(v, version);
        if state.active.map_or(true, |active| v > active) {
            state.active = Some(v);
        }
        while state.versions.len() > HISTORY_VERSIONS {
            let Some(oldest) = state.versions.keys().next().copied() else {
                break;
            };
            state.versions.remove(&oldest);
        }
    }

    fn local_active(state: &ClusterState) -> Option<Arc<ClusterVersion>> {
        state.active.and_then(|v| state.versions.get(&v).cloned())
    }

    /// Active version as named by the shared pointer. The local copy is
    /// served while it is at least as new as the pointer; otherwise the
    /// pointed-to version is loaded from the cache.
    async fn active_version(&self) -> (Option<Arc<ClusterVersion>>, Option<DegradeReason>) {
        let pointer = match self.cache.get(&CacheKey::cluster_active_version()).await {
            Ok(raw) => raw.and_then(|v| v.parse::<u64>().ok()),
            Err(e) => {
                warn!(error = %e, "Active clustering version unavailable, serving local version");
                let local = Self::local_active(&*self.state.read().await);
                return (local, Some(DegradeReason::CacheUnavailable));
            }
        };
        let local = Self::local_active(&*self.state.read().await);

        let (active, local) = match (pointer, local) {
            (None, local) => return (local, None),
            (Some(p), Some(local)) if local.run.version >= p => return (Some(local), None),
            (Some(p), local) => (p, local),
        };

        match self.load_version(active).await {
            Ok(Some(version)) => {
                debug!(version = active, "Loaded newer clustering version from cache");
                let version = Arc::new(version);
                self.publish(version.clone()).await;
                (Some(version), None)
            }
            Ok(None) => (local, None),
            Err(e) => {
                warn!(version = active, error = %e, "Failed to load clustering version");
                (local, Some(DegradeReason::CacheUnavailable))
            }
        }
    }

    async fn load_version(&self, version: u64) -> Result<Option<ClusterVersion>> {
        let store = self.cache.as_ref();
        let run: Option<ClusterRun> = get_json(store, &CacheKey::cluster_run(version)).await?;
        let clusters: Option<Vec<Cluster>> =
            get_json(store, &CacheKey::cluster_centroids(version)).await?;
        Ok(match (run, clusters) {
            (Some(run), Some(clusters)) => Some(ClusterVersion {
                table: CategoryTable::from_names(run.categories.clone()),
                run,
                clusters,
                assignments: DashMap::new(),
            }),
            _ => None,
        })
    }

    /// Active assignment of a user; `None` when the user was never assigned
    pub async fn get_user_cluster_assignment(&self, user_id: Uuid) -> Served<Option<ClusterAssignment>> {
        let (version, reason) = self.active_version().await;
        let Some(version) = version else {
            return Served::degraded(None, reason.unwrap_or(DegradeReason::NoActiveClustering));
        };
        if let Some(assignment) = version.assignments.get(&user_id) {
            return Served::with_reason(Some(assignment.value().clone()), reason);
        }
        match self.cached_assignment(user_id, version.run.version).await {
            Ok(found) => {
                if let Some(a) = &found {
                    version.assignments.insert(user_id, a.clone());
                }
                Served::with_reason(found, reason)
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Cluster assignment cache read failed");
                Served::degraded(None, DegradeReason::CacheUnavailable)
            }
        }
    }

    /// Assignment under a specific, possibly inactive, version
    pub async fn get_assignment_at(&self, user_id: Uuid, version: u64) -> Result<Option<ClusterAssignment>> {
        {
            let state = self.state.read().await;
            if let Some(found) = state
                .versions
                .get(&version)
                .and_then(|v| v.assignments.get(&user_id).map(|a| a.value().clone()))
            {
                return Ok(Some(found));
            }
        }
        self.cached_assignment(user_id, version).await
    }

    async fn cached_assignment(&self, user_id: Uuid, version: u64) -> Result<Option<ClusterAssignment>> {
        let raw = self
            .cache
            .hget(&CacheKey::cluster_assignments(version), &user_id.to_string())
            .await?;
        Ok(match raw {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    /// Incremental assignment against the active centroids.
    ///
    /// Users without behaviour go to the new-user cluster; a user whose
    /// behaviour cannot be read is placed on the neutral vector.
    pub async fn assign_user(&self, user_id: Uuid) -> Served<ClusterAssignment> {
        let (version, reason) = self.active_version().await;
        let Some(version) = version else {
            return Served::degraded(
                Self::new_user_assignment(user_id, 0),
                reason.unwrap_or(DegradeReason::NoActiveClustering),
            );
        };
        let v = version.run.version;

        let (vector, mut reason) = match self
            .interactions
            .user_interactions(user_id, self.window_start())
            .await
        {
            Ok(events) if events.is_empty() => {
                let assignment = Self::new_user_assignment(user_id, v);
                version.assignments.insert(user_id, assignment.clone());
                return Served::Fresh(assignment);
            }
            Ok(events) => {
                let ids: Vec<Uuid> = events.iter().map(|e| e.item_id).collect();
                let (items, reason) = match self.catalog.get_items(&ids).await {
                    Ok(items) => (items.into_iter().map(|i| (i.id, i)).collect(), None),
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "Catalogue unavailable for cluster assignment");
                        (HashMap::new(), Some(DegradeReason::SourceUnavailable))
                    }
                };
                let vector = features::build(&events, &items, &version.table)
                    .map(features::sanitize)
                    .unwrap_or_else(features::neutral_vector);
                (vector, reason)
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Behaviour unavailable, assigning on neutral vector");
                (features::neutral_vector(), Some(DegradeReason::SourceUnavailable))
            }
        };

        let centroids: Vec<Vec<f64>> =
            version.clusters.iter().map(|c| c.centroid.clone()).collect();
        let assignment = self.assignment_for(user_id, &vector, &version.clusters, &centroids, v);
        if reason.is_none() {
            version.assignments.insert(user_id, assignment.clone());
            match serde_json::to_string(&assignment) {
                Ok(json) => {
                    if let Err(e) = self
                        .cache
                        .hset(&CacheKey::cluster_assignments(v), &user_id.to_string(), &json)
                        .await
                    {
                        warn!(user_id = %user_id, error = %e, "Failed to persist cluster assignment");
                        reason = Some(DegradeReason::CacheUnavailable);
                    }
                }
                Err(e) => warn!(user_id = %user_id, error = %e, "Failed to encode cluster assignment"),
            }
        }
        Served::with_reason(assignment, reason)
    }

    /// Recommended categories of a cluster in the active version
    pub async fn cluster_categories(&self, cluster_id: i64) -> Vec<String> {
        let (version, _) = self.active_version().await;
        version
            .and_then(|v| {
                v.clusters
                    .iter()
                    .find(|c| c.id == cluster_id)
                    .map(|c| c.recommended_categories.clone())
            })
            .unwrap_or_default()
    }

    pub async fn get_cluster_stats(&self) -> Served<Option<ClusterStats>> {
        let (version, reason) = self.active_version().await;
        match version {
            Some(v) => Served::with_reason(Some(v.stats()), reason),
            None => Served::degraded(None, reason.unwrap_or(DegradeReason::NoActiveClustering)),
        }
    }

    pub async fn active_version_number(&self) -> Option<u64> {
        self.active_version().await.0.map(|v| v.run.version)
    }

    /// Run metadata of any retained version
    pub async fn run_info(&self, version: u64) -> Result<Option<ClusterRun>> {
        let retained = self.state.read().await.versions.get(&version).map(|v| v.run.clone());
        let run = match retained {
            Some(run) => Some(run),
            None => get_json(self.cache.as_ref(), &CacheKey::cluster_run(version)).await?,
        };
        let active = self.active_version_number().await;
        Ok(run.map(|mut run| {
            run.active = active == Some(version);
            run
        }))
    }
}

/// Top-3 positive slots of the centroid's category group
fn recommended_categories(centroid: &[f64], table: &CategoryTable) -> Vec<String> {
    let mut slots: Vec<(usize, f64)> = centroid
        .get(features::CATEGORY)
        .unwrap_or(&[])
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, w)| *w > 0.0)
        .collect();
    slots.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    slots
        .into_iter()
        .filter_map(|(slot, _)| table.name(slot).map(str::to_string))
        .take(3)
        .collect()
}
