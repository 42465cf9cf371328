//! Cache key schema for the recommendation engine
//!
//! Every component builds keys through `CacheKey` so the layout stays in one place.
//! Key format: v{VERSION}:{entity}:{identifier}[:sub_key]

use uuid::Uuid;

/// Cache schema version - increment when changing key formats
pub const CACHE_VERSION: u32 = 1;

/// Cache key builder
pub struct CacheKey;

impl CacheKey {
    // ============= Feature Keys =============

    /// Cached user feature vector
    /// Format: v1:feature:user:{user_id}
    pub fn user_features(user_id: Uuid) -> String {
        format!("v{}:feature:user:{}", CACHE_VERSION, user_id)
    }

    /// Cached item feature vector
    /// Format: v1:feature:item:{item_id}
    pub fn item_features(item_id: Uuid) -> String {
        format!("v{}:feature:item:{}", CACHE_VERSION, item_id)
    }

    /// Cached user preference record (input to cross features)
    /// Format: v1:feature:prefs:{user_id}
    pub fn user_preferences(user_id: Uuid) -> String {
        format!("v{}:feature:prefs:{}", CACHE_VERSION, user_id)
    }

    // ============= Click Model Keys =============

    /// Latest weight snapshot (no TTL)
    pub fn model_latest(model: &str) -> String {
        format!("v{}:model:{}:latest", CACHE_VERSION, model)
    }

    /// Snapshot addressed by id, kept for rollback/audit
    pub fn model_snapshot(model: &str, snapshot_id: &str) -> String {
        format!("v{}:model:{}:snapshot:{}", CACHE_VERSION, model, snapshot_id)
    }

    /// Sorted set of snapshot ids scored by unix timestamp
    pub fn model_snapshot_index(model: &str) -> String {
        format!("v{}:model:{}:snapshots", CACHE_VERSION, model)
    }

    // ============= Similarity Keys =============

    /// Top-N neighbours of an item in one similarity build (sorted set,
    /// score = cosine similarity)
    /// Format: v1:sim:{build}:item:{item_id}
    pub fn item_neighbors(build: u64, item_id: Uuid) -> String {
        format!("v{}:sim:{}:item:{}", CACHE_VERSION, build, item_id)
    }

    /// Monotonic similarity build counter
    pub fn similarity_version_counter() -> String {
        format!("v{}:sim:version", CACHE_VERSION)
    }

    /// Build whose neighbour sets are served
    pub fn similarity_active_version() -> String {
        format!("v{}:sim:active", CACHE_VERSION)
    }

    /// Similarity matrix build status (JSON)
    pub fn similarity_status() -> String {
        format!("v{}:sim:status", CACHE_VERSION)
    }

    // ============= Cluster Keys =============

    /// Monotonic clustering version counter
    pub fn cluster_version_counter() -> String {
        format!("v{}:cluster:version", CACHE_VERSION)
    }

    /// Currently active clustering version
    pub fn cluster_active_version() -> String {
        format!("v{}:cluster:active", CACHE_VERSION)
    }

    /// Run metadata (active flag, timings) for one version
    pub fn cluster_run(version: u64) -> String {
        format!("v{}:cluster:{}:run", CACHE_VERSION, version)
    }

    /// Clusters (centroids + stats) for one version
    pub fn cluster_centroids(version: u64) -> String {
        format!("v{}:cluster:{}:centroids", CACHE_VERSION, version)
    }

    /// Hash of user_id -> assignment JSON for one version
    pub fn cluster_assignments(version: u64) -> String {
        format!("v{}:cluster:{}:assignments", CACHE_VERSION, version)
    }

    // ============= Job Keys =============

    /// Distributed lock for an exclusive scheduled job
    pub fn job_lock(job: &str) -> String {
        format!("v{}:job:lock:{}", CACHE_VERSION, job)
    }

    // ============= Utility =============

    /// Extract entity type from key
    pub fn entity_type(key: &str) -> Option<&str> {
        // Format: v{N}:{entity}:...
        let mut parts = key.split(':');
        let version = parts.next()?;
        if !version.starts_with('v') {
            return None;
        }
        parts.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_features_key() {
        let user_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let key = CacheKey::user_features(user_id);
        assert_eq!(key, "v1:feature:user:550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn test_cluster_keys_are_versioned() {
        assert_eq!(CacheKey::cluster_centroids(3), "v1:cluster:3:centroids");
        assert_eq!(CacheKey::cluster_assignments(3), "v1:cluster:3:assignments");
        assert_ne!(CacheKey::cluster_run(3), CacheKey::cluster_run(4));
    }

    #[test]
    fn test_neighbor_keys_are_namespaced_by_build() {
        let item = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            CacheKey::item_neighbors(2, item),
            "v1:sim:2:item:550e8400-e29b-41d4-a716-446655440000"
        );
        assert_ne!(CacheKey::item_neighbors(1, item), CacheKey::item_neighbors(2, item));
    }

    #[test]
    fn test_model_snapshot_key() {
        assert_eq!(
            CacheKey::model_snapshot("ctr", "20261017030000"),
            "v1:model:ctr:snapshot:20261017030000"
        );
    }

    #[test]
    fn test_entity_type() {
        assert_eq!(CacheKey::entity_type("v1:feature:user:123"), Some("feature"));
        assert_eq!(CacheKey::entity_type("v1:sim:item:123"), Some("sim"));
        assert_eq!(CacheKey::entity_type("invalid"), None);
    }
}
