//! Feature Store
//!
//! Builds the fixed-length user, item and cross vectors the click model and
//! the clusterer consume, and caches them in the key-value store with a
//! short, jittered TTL. Extraction never fails: a source that errors yields
//! a zero sub-vector and a degraded answer.

pub mod layout;
pub mod vector;

pub use layout::{FeatureNameTable, VectorKind, CROSS_DIM, ITEM_DIM, TOTAL_DIM, USER_DIM};
pub use vector::{concatenate, FeatureVector};

use crate::config::FeaturesConfig;
use crate::error::{DegradeReason, Served};
use crate::models::{InteractionEvent, Item, UserPreferences};
use crate::sources::{InteractionLog, InterestTagSource, ItemCatalog};
use chrono::{Duration, Utc};
use futures::future::join_all;
use reco_cache::{add_jitter, get_json, set_json, CacheKey, KvStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-user inputs shared by every item scored for that user
#[derive(Debug, Clone, PartialEq)]
pub struct UserContext {
    pub vector: FeatureVector,
    pub preferences: UserPreferences,
}

pub struct FeatureStore {
    catalog: Arc<dyn ItemCatalog>,
    interactions: Arc<dyn InteractionLog>,
    tags: Arc<dyn InterestTagSource>,
    cache: Arc<dyn KvStore>,
    config: FeaturesConfig,
    new_item_days: i64,
}

impl FeatureStore {
    pub fn new(
        catalog: Arc<dyn ItemCatalog>,
        interactions: Arc<dyn InteractionLog>,
        tags: Arc<dyn InterestTagSource>,
        cache: Arc<dyn KvStore>,
        config: FeaturesConfig,
        new_item_days: i64,
    ) -> Self {
        Self {
            catalog,
            interactions,
            tags,
            cache,
            config,
            new_item_days,
        }
    }

    /// User vector (64-d)
    pub async fn build_user_vector(&self, user_id: Uuid) -> Served<FeatureVector> {
        self.user_context(user_id).await.map(|ctx| ctx.vector)
    }

    pub async fn user_preferences(&self, user_id: Uuid) -> Served<UserPreferences> {
        self.user_context(user_id).await.map(|ctx| ctx.preferences)
    }

    /// Item vector (64-d), cached by item id
    pub async fn build_item_vector(&self, item: &Item) -> Served<FeatureVector> {
        let key = CacheKey::item_features(item.id);
        let mut reason = None;

        match get_json::<FeatureVector>(self.cache.as_ref(), &key).await {
            Ok(Some(cached)) if cached.is_valid(VectorKind::Item) => return Served::Fresh(cached),
            Ok(_) => debug!(item_id = %item.id, "Item feature cache miss"),
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Item feature cache read failed, building live");
                reason = Some(DegradeReason::CacheUnavailable);
            }
        }

        let vector = vector::build_item_vector(item, Utc::now(), self.new_item_days);
        if reason.is_none() {
            if let Err(e) = set_json(
                self.cache.as_ref(),
                &key,
                &vector,
                Some(add_jitter(self.config.cache_ttl_secs)),
            )
            .await
            {
                warn!(item_id = %item.id, error = %e, "Failed to cache item features");
                reason = Some(DegradeReason::CacheUnavailable);
            }
        }
        Served::with_reason(vector, reason)
    }

    /// Cross vector (32-d); pure, never cached
    pub fn build_cross_vector(
        &self,
        user_vec: &FeatureVector,
        item_vec: &FeatureVector,
        prefs: &UserPreferences,
        item: &Item,
    ) -> FeatureVector {
        vector::build_cross_vector(user_vec, item_vec, prefs, item)
    }

    /// Full 160-d model input for one (user, item) pair
    pub async fn features_for(&self, user_id: Uuid, item: &Item) -> Served<FeatureVector> {
        let (ctx, ctx_reason) = self.user_context(user_id).await.into_parts();
        let (item_vec, item_reason) = self.build_item_vector(item).await.into_parts();
        let cross = self.build_cross_vector(&ctx.vector, &item_vec, &ctx.preferences, item);
        Served::with_reason(
            concatenate(&ctx.vector, &item_vec, &cross),
            ctx_reason.or(item_reason),
        )
    }

    /// Model inputs for many items sharing one user context
    pub async fn features_for_items(
        &self,
        user_id: Uuid,
        items: &[Item],
    ) -> Served<Vec<(Uuid, FeatureVector)>> {
        let (ctx, mut reason) = self.user_context(user_id).await.into_parts();
        let item_vectors = join_all(items.iter().map(|item| self.build_item_vector(item))).await;

        let mut out = Vec::with_capacity(items.len());
        for (item, served) in items.iter().zip(item_vectors) {
            let (item_vec, item_reason) = served.into_parts();
            reason = reason.or(item_reason);
            let cross = self.build_cross_vector(&ctx.vector, &item_vec, &ctx.preferences, item);
            out.push((item.id, concatenate(&ctx.vector, &item_vec, &cross)));
        }
        Served::with_reason(out, reason)
    }

    /// Drop cached user features after new behaviour arrives
    pub async fn invalidate_user(&self, user_id: Uuid) {
        for key in [CacheKey::user_features(user_id), CacheKey::user_preferences(user_id)] {
            if let Err(e) = self.cache.del(&key).await {
                warn!(user_id = %user_id, error = %e, "Failed to invalidate user features");
            }
        }
    }

    pub async fn user_context(&self, user_id: Uuid) -> Served<UserContext> {
        let vector_key = CacheKey::user_features(user_id);
        let prefs_key = CacheKey::user_preferences(user_id);
        let mut cache_ok = true;

        let cached_vector = get_json::<FeatureVector>(self.cache.as_ref(), &vector_key).await;
        let cached_prefs = get_json::<UserPreferences>(self.cache.as_ref(), &prefs_key).await;
        match (cached_vector, cached_prefs) {
            (Ok(Some(vector)), Ok(Some(preferences))) if vector.is_valid(VectorKind::User) => {
                return Served::Fresh(UserContext { vector, preferences });
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(user_id = %user_id, error = %e, "User feature cache read failed, building live");
                cache_ok = false;
            }
            _ => debug!(user_id = %user_id, "User feature cache miss"),
        }

        let (ctx, source_reason) = self.compute_user_context(user_id).await;
        let mut reason = source_reason;

        // Degraded contexts are served but not cached
        if cache_ok && source_reason.is_none() {
            let ttl = Some(add_jitter(self.config.cache_ttl_secs));
            let write_vector = set_json(self.cache.as_ref(), &vector_key, &ctx.vector, ttl).await;
            let write_prefs = set_json(self.cache.as_ref(), &prefs_key, &ctx.preferences, ttl).await;
            if let Err(e) = write_vector.and(write_prefs) {
                warn!(user_id = %user_id, error = %e, "Failed to cache user features");
                cache_ok = false;
            }
        }
        if !cache_ok {
            reason = reason.or(Some(DegradeReason::CacheUnavailable));
        }

        Served::with_reason(ctx, reason)
    }

    async fn compute_user_context(&self, user_id: Uuid) -> (UserContext, Option<DegradeReason>) {
        let now = Utc::now();
        let since = now - Duration::days(self.config.behavior_window_days);
        let mut reason = None;

        let (events, tags) = tokio::join!(
            self.interactions.user_interactions(user_id, since),
            self.tags.interest_tags(user_id)
        );
        let events: Vec<InteractionEvent> = events.unwrap_or_else(|e| {
            warn!(user_id = %user_id, error = %e, "Interaction log unavailable, using empty behaviour");
            reason = Some(DegradeReason::SourceUnavailable);
            Vec::new()
        });
        let tags = tags.unwrap_or_else(|e| {
            warn!(user_id = %user_id, error = %e, "Interest tags unavailable, using zero tag buckets");
            reason = Some(DegradeReason::SourceUnavailable);
            Vec::new()
        });

        // Distinct items, newest first
        let mut seen = HashSet::new();
        let item_ids: Vec<Uuid> = events
            .iter()
            .map(|e| e.item_id)
            .filter(|id| seen.insert(*id))
            .collect();

        let items: HashMap<Uuid, Item> = if item_ids.is_empty() {
            HashMap::new()
        } else {
            match self.catalog.get_items(&item_ids).await {
                Ok(items) => items.into_iter().map(|item| (item.id, item)).collect(),
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Catalogue unavailable, using zero item-derived features");
                    reason = Some(DegradeReason::SourceUnavailable);
                    HashMap::new()
                }
            }
        };

        let preferences = vector::derive_preferences(&events, &items, &tags, now);
        let recent: Vec<Item> = item_ids
            .iter()
            .take(self.config.max_behavior_items)
            .filter_map(|id| items.get(id).cloned())
            .collect();
        let vector = vector::build_user_vector(&preferences, &recent, now);

        (UserContext { vector, preferences }, reason)
    }
}
