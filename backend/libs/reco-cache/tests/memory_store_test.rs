use reco_cache::{CacheError, CacheKey, KvStore, MemoryKvStore};
use tokio_test::assert_ok;
use uuid::Uuid;

#[tokio::test]
async fn set_nx_only_writes_once() {
    let store = MemoryKvStore::new();
    let key = CacheKey::job_lock("similarity_rebuild");

    assert!(store.set_nx(&key, "worker-a", 60).await.unwrap());
    assert!(!store.set_nx(&key, "worker-b", 60).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("worker-a"));

    assert_ok!(store.del(&key).await);
    assert!(store.set_nx(&key, "worker-b", 60).await.unwrap());
}

#[tokio::test]
async fn zero_ttl_entries_expire_immediately() {
    let store = MemoryKvStore::new();
    store.set("v1:feature:user:x", "[]", Some(0)).await.unwrap();

    assert!(store.get("v1:feature:user:x").await.unwrap().is_none());
    assert!(store.is_empty());
}

#[tokio::test]
async fn incr_is_cumulative() {
    let store = MemoryKvStore::new();
    let key = CacheKey::cluster_version_counter();

    assert_eq!(store.incr(&key, 1).await.unwrap(), 1);
    assert_eq!(store.incr(&key, 1).await.unwrap(), 2);
    assert_eq!(store.incr(&key, 5).await.unwrap(), 7);
}

#[tokio::test]
async fn zreplace_swaps_the_whole_set() {
    let store = MemoryKvStore::new();
    let key = CacheKey::item_neighbors(1, Uuid::new_v4());

    store
        .zreplace(
            &key,
            &[("a".to_string(), 0.9), ("b".to_string(), 0.4)],
            None,
        )
        .await
        .unwrap();
    store
        .zreplace(
            &key,
            &[("c".to_string(), 0.7), ("d".to_string(), 0.8)],
            None,
        )
        .await
        .unwrap();

    let members = store.zrevrange_withscores(&key, 10).await.unwrap();
    assert_eq!(
        members,
        vec![("d".to_string(), 0.8), ("c".to_string(), 0.7)]
    );
    assert!(store.zscore(&key, "a").await.unwrap().is_none());
}

#[tokio::test]
async fn zrevrange_respects_limit() {
    let store = MemoryKvStore::new();
    for (member, score) in [("a", 0.1), ("b", 0.5), ("c", 0.3)] {
        store.zadd("v1:model:ctr:snapshots", member, score).await.unwrap();
    }

    let top = store
        .zrevrange_withscores("v1:model:ctr:snapshots", 2)
        .await
        .unwrap();
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].0, "b");
    assert_eq!(top[1].0, "c");
}

#[tokio::test]
async fn hashes_merge_fields() {
    let store = MemoryKvStore::new();
    let key = CacheKey::cluster_assignments(1);

    store.hset(&key, "u1", "{}").await.unwrap();
    store
        .hset_multiple(&key, &[("u2".to_string(), "{}".to_string())])
        .await
        .unwrap();

    let all = store.hgetall(&key).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(store.hget(&key, "u1").await.unwrap().as_deref(), Some("{}"));
    assert!(store.hget(&key, "u3").await.unwrap().is_none());
}

#[tokio::test]
async fn wrong_type_is_reported() {
    let store = MemoryKvStore::new();
    store.set("v1:sim:status", "{}", None).await.unwrap();

    let err = store.zscore("v1:sim:status", "x").await.unwrap_err();
    assert!(matches!(err, CacheError::InvalidData(_)));
}

#[tokio::test]
async fn outage_fails_every_command() {
    let store = MemoryKvStore::new();
    store.set("v1:feature:item:a", "1", None).await.unwrap();

    store.set_available(false);
    let err = store.get("v1:feature:item:a").await.unwrap_err();
    assert_eq!(err.kind(), "timeout");

    store.set_available(true);
    assert!(store.get("v1:feature:item:a").await.unwrap().is_some());
}
