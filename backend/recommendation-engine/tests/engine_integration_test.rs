//! End-to-end tests over the engine facade with in-memory sources and cache

use async_trait::async_trait;
use chrono::{Duration, Utc};
use mockall::mock;
use reco_cache::{CacheError, CacheResult, KvStore, MemoryKvStore};
use recommendation_engine::config::CtrConfig;
use recommendation_engine::services::clustering::NEW_USER_CLUSTER_ID;
use recommendation_engine::services::ctr::OnlineClickModel;
use recommendation_engine::services::features::{FeatureNameTable, FeatureVector, TOTAL_DIM};
use recommendation_engine::sources::{
    ExplorationStrategy, MemoryCatalog, MemoryInteractionLog, MemoryInterestTags, NoExploration,
};
use recommendation_engine::{
    Config, DegradeReason, EngineSources, InteractionEvent, InteractionKind, Item, RecommendationEngine,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

mock! {
    pub Exploration {}

    #[async_trait]
    impl ExplorationStrategy for Exploration {
        fn should_explore(&self, ratio: f64) -> bool;

        async fn exploration_recommendations(
            &self,
            user_id: Uuid,
            known_categories: &[String],
            limit: usize,
        ) -> recommendation_engine::Result<Vec<Uuid>>;
    }
}

/// Store whose every command times out
struct UnreachableStore;

fn timeout<T>() -> CacheResult<T> {
    Err(CacheError::Timeout(50))
}

#[async_trait]
impl KvStore for UnreachableStore {
    async fn get(&self, _: &str) -> CacheResult<Option<String>> {
        timeout()
    }
    async fn set(&self, _: &str, _: &str, _: Option<u64>) -> CacheResult<()> {
        timeout()
    }
    async fn set_nx(&self, _: &str, _: &str, _: u64) -> CacheResult<bool> {
        timeout()
    }
    async fn del(&self, _: &str) -> CacheResult<()> {
        timeout()
    }
    async fn incr(&self, _: &str, _: i64) -> CacheResult<i64> {
        timeout()
    }
    async fn hset(&self, _: &str, _: &str, _: &str) -> CacheResult<()> {
        timeout()
    }
    async fn hset_multiple(&self, _: &str, _: &[(String, String)]) -> CacheResult<()> {
        timeout()
    }
    async fn hget(&self, _: &str, _: &str) -> CacheResult<Option<String>> {
        timeout()
    }
    async fn hgetall(&self, _: &str) -> CacheResult<HashMap<String, String>> {
        timeout()
    }
    async fn zadd(&self, _: &str, _: &str, _: f64) -> CacheResult<()> {
        timeout()
    }
    async fn zreplace(&self, _: &str, _: &[(String, f64)], _: Option<u64>) -> CacheResult<()> {
        timeout()
    }
    async fn zrevrange_withscores(&self, _: &str, _: usize) -> CacheResult<Vec<(String, f64)>> {
        timeout()
    }
    async fn zscore(&self, _: &str, _: &str) -> CacheResult<Option<f64>> {
        timeout()
    }
}

fn item(category: &str, merchant: &str, price: f64, sales: u64) -> Item {
    Item {
        id: Uuid::new_v4(),
        category: category.into(),
        merchant_id: merchant.into(),
        brand: None,
        origin: None,
        price,
        original_price: price * 1.2,
        rating: 3.5 + (sales % 3) as f64 * 0.5,
        sales_count: sales,
        review_count: sales / 2,
        stock: 20,
        is_promoted: sales % 5 == 0,
        tags: vec![category.to_string()],
        embedding: vec![],
        created_at: Utc::now() - Duration::days((sales % 30) as i64),
    }
}

struct Fixture {
    catalog: Arc<MemoryCatalog>,
    log: Arc<MemoryInteractionLog>,
    shoes: Vec<Item>,
    bags: Vec<Item>,
}

impl Fixture {
    fn new() -> Self {
        let shoes: Vec<Item> = (0..15).map(|i| item("shoes", "m-shoes", 60.0 + i as f64, 100 + i)).collect();
        let bags: Vec<Item> = (0..15).map(|i| item("bags", "m-bags", 300.0 + i as f64, 40 + i)).collect();
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.extend(shoes.iter().cloned());
        catalog.extend(bags.iter().cloned());
        Self {
            catalog,
            log: Arc::new(MemoryInteractionLog::new()),
            shoes,
            bags,
        }
    }

    fn record(&self, user: Uuid, item: &Item, kind: InteractionKind) {
        self.log
            .record(InteractionEvent::new(user, item.id, kind, Utc::now() - Duration::hours(1)));
    }

    /// A user with `n` events on the first few items of `items`
    fn warm_user(&self, items: &[Item], n: usize) -> Uuid {
        let user = Uuid::new_v4();
        for i in 0..n {
            let kind = if i % 3 == 0 { InteractionKind::Purchase } else { InteractionKind::View };
            self.record(user, &items[i % 3], kind);
        }
        user
    }

    fn engine_with(&self, cache: Arc<dyn KvStore>, exploration: Arc<dyn ExplorationStrategy>) -> RecommendationEngine {
        let sources = EngineSources {
            catalog: self.catalog.clone(),
            interactions: self.log.clone(),
            tags: Arc::new(MemoryInterestTags::new()),
            exploration,
        };
        RecommendationEngine::new(Config::default(), sources, cache)
    }

    fn engine(&self) -> RecommendationEngine {
        self.engine_with(Arc::new(MemoryKvStore::new()), Arc::new(NoExploration))
    }
}

#[tokio::test]
async fn test_all_zero_features_predict_exactly_half() {
    let model = OnlineClickModel::new(
        Arc::new(MemoryKvStore::new()),
        CtrConfig::default(),
        Arc::new(FeatureNameTable::standard()),
        TOTAL_DIM,
    );
    model.initialize().await;

    let served = model.predict(&FeatureVector::zeros(TOTAL_DIM)).await;
    assert!(!served.is_degraded());
    assert_eq!(served.into_inner(), 0.5);
}

#[tokio::test]
async fn test_click_update_moves_prediction_towards_label() {
    let fx = Fixture::new();
    let user = fx.warm_user(&fx.shoes, 6);
    let engine = fx.engine();
    engine.initialize().await;
    let target = fx.shoes[5].id;

    let before = engine.predict_ctr(user, target).await.into_inner();
    let outcome = engine.update_model(user, target, true).await.unwrap();
    let after = engine.predict_ctr(user, target).await.into_inner();

    assert!((outcome.prediction - before).abs() < 1e-12);
    assert!(after > before, "{} should exceed {}", after, before);
    assert_eq!(engine.model_stats().await.sample_count, 1);
    assert_eq!(engine.model_stats().await.positive_count, 1);
}

#[tokio::test]
async fn test_unknown_item_gets_neutral_ctr() {
    let fx = Fixture::new();
    let engine = fx.engine();
    engine.initialize().await;

    let p = engine.predict_ctr(Uuid::new_v4(), Uuid::new_v4()).await.into_inner();
    assert_eq!(p, 0.5);
    assert_err!(engine.update_model(Uuid::new_v4(), Uuid::new_v4(), true).await);
}

#[tokio::test]
async fn test_identical_interaction_sets_are_fully_similar() {
    let fx = Fixture::new();
    let (a, b, c) = (&fx.shoes[0], &fx.shoes[1], &fx.bags[0]);
    for _ in 0..3 {
        let user = Uuid::new_v4();
        fx.record(user, a, InteractionKind::Purchase);
        fx.record(user, b, InteractionKind::Purchase);
    }
    let loner = Uuid::new_v4();
    fx.record(loner, c, InteractionKind::View);
    let engine = fx.engine();

    let report = assert_ok!(engine.rebuild_similarity().await);
    assert_eq!(report.version, 1);

    let ab = engine.calculate_item_similarity(a.id, b.id).await;
    let ba = engine.calculate_item_similarity(b.id, a.id).await;
    assert!(!ab.is_degraded());
    assert_eq!(ab.into_inner(), 1.0);
    assert_eq!(ba.into_inner(), 1.0);

    let neighbours = engine.get_similar_items(a.id, 10).await.into_inner();
    assert_eq!(neighbours, vec![(b.id, 1.0)]);
    assert!(neighbours.iter().all(|(id, _)| *id != a.id));

    let status = engine.get_similarity_matrix_status().await.into_inner();
    assert_eq!(status.version, 1);
    assert!(status.pair_count >= 1);
}

#[tokio::test]
async fn test_clustering_versions_stay_queryable() {
    let fx = Fixture::new();
    let shoppers: Vec<Uuid> = (0..4).map(|_| fx.warm_user(&fx.shoes, 6)).collect();
    for _ in 0..4 {
        fx.warm_user(&fx.bags, 8);
    }
    let engine = fx.engine();

    let first = engine.run_clustering(Some(2)).await.unwrap();
    assert_eq!(first.k, 2);
    assert_eq!(first.total_users, 8);
    let user = shoppers[0];
    let v1 = engine.get_user_cluster_assignment(user).await.into_inner().unwrap();
    assert_eq!(v1.version, first.version);

    let second = engine.run_clustering(Some(2)).await.unwrap();
    assert!(second.version > first.version);

    let active = engine.get_user_cluster_assignment(user).await.into_inner().unwrap();
    assert_eq!(active.version, second.version);
    let old = engine.get_assignment_at(user, first.version).await.unwrap().unwrap();
    assert_eq!(old.version, first.version);

    let stats = engine.get_cluster_stats().await.into_inner().unwrap();
    assert_eq!(stats.version, second.version);
    assert_eq!(stats.clusters.len(), 2);
}

#[tokio::test]
async fn test_zero_behaviour_user_joins_new_user_cluster() {
    let fx = Fixture::new();
    for _ in 0..3 {
        fx.warm_user(&fx.shoes, 4);
        fx.warm_user(&fx.bags, 4);
    }
    let engine = fx.engine();
    engine.run_clustering(Some(2)).await.unwrap();

    let assignment = engine.assign_user_to_cluster(Uuid::new_v4()).await;
    assert!(!assignment.is_degraded());
    let assignment = assignment.into_inner();
    assert_eq!(assignment.cluster_id, NEW_USER_CLUSTER_ID);
    assert_eq!(assignment.confidence, 0.5);
    assert_eq!(assignment.distance, 0.0);
}

#[tokio::test]
async fn test_cold_user_skips_blend_and_exploration() {
    let fx = Fixture::new();
    let mut exploration = MockExploration::new();
    exploration.expect_should_explore().times(0);
    exploration.expect_exploration_recommendations().times(0);
    let engine = fx.engine_with(Arc::new(MemoryKvStore::new()), Arc::new(exploration));

    let recs = engine.recommend(Uuid::new_v4(), 8).await.into_inner();

    assert_eq!(recs.len(), 8);
    let ids: HashSet<Uuid> = recs.iter().map(|r| r.item_id).collect();
    assert_eq!(ids.len(), 8);
}

#[tokio::test]
async fn test_warm_user_recommendations_with_exploration() {
    let fx = Fixture::new();
    let user = fx.warm_user(&fx.shoes, 12);
    let explored = fx.bags[14].id;

    let mut exploration = MockExploration::new();
    exploration.expect_should_explore().returning(|_| true);
    exploration
        .expect_exploration_recommendations()
        .times(1)
        .returning(move |_, known, _| {
            assert!(known.iter().any(|c| c == "shoes"));
            Ok(vec![explored])
        });
    let engine = fx.engine_with(Arc::new(MemoryKvStore::new()), Arc::new(exploration));
    engine.initialize().await;

    let recs = engine.recommend(user, 10).await.into_inner();

    assert_eq!(recs.len(), 10);
    let interacted: HashSet<Uuid> = fx.shoes[..3].iter().map(|i| i.id).collect();
    assert!(recs.iter().all(|r| !interacted.contains(&r.item_id)));
    assert!(recs.iter().all(|r| r.ctr.map_or(false, |p| (0.0..=1.0).contains(&p))));
}

#[tokio::test]
async fn test_cache_outage_still_serves() {
    let fx = Fixture::new();
    let user = fx.warm_user(&fx.bags, 12);
    let engine = fx.engine_with(Arc::new(UnreachableStore), Arc::new(NoExploration));
    engine.initialize().await;

    let served = engine.recommend(user, 6).await;

    assert_eq!(served.reason(), Some(DegradeReason::CacheUnavailable));
    assert_eq!(served.into_inner().len(), 6);
    assert_ok!(engine.rebuild_similarity().await);
}

#[tokio::test]
async fn test_batch_evaluation_of_served_lists() {
    let fx = Fixture::new();
    let warm = fx.warm_user(&fx.shoes, 9);
    let cold = Uuid::new_v4();
    let engine = fx.engine();

    let mut lists = Vec::new();
    for user in [warm, cold] {
        let ids: Vec<Uuid> = engine
            .recommend(user, 10)
            .await
            .into_inner()
            .into_iter()
            .map(|r| r.item_id)
            .collect();
        lists.push((user, ids));
    }
    let batch = engine.batch_evaluate(&lists, 10).await.into_inner();

    assert_eq!(batch.users, 2);
    assert_eq!(batch.observed_users, 1);
    assert_eq!(batch.proxy_users, 1);
    for value in [
        batch.mean.ndcg,
        batch.mean.hit_rate,
        batch.mean.precision,
        batch.mean.recall,
        batch.mean.average_precision,
        batch.mean.reciprocal_rank,
        batch.coverage,
        batch.mean_diversity,
    ] {
        assert!((0.0..=1.0).contains(&value), "{} out of range", value);
    }
    assert!(batch.coverage > 0.0);
}
