//! Daily item-item similarity rebuild

use super::ScheduledJob;
use crate::error::Result;
use crate::services::collaborative::{CollaborativeIndex, REBUILD_JOB};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct SimilarityRebuildJob {
    index: Arc<CollaborativeIndex>,
    interval: Duration,
}

impl SimilarityRebuildJob {
    pub fn new(index: Arc<CollaborativeIndex>, interval: Duration) -> Self {
        Self { index, interval }
    }
}

#[async_trait]
impl ScheduledJob for SimilarityRebuildJob {
    fn name(&self) -> &'static str {
        REBUILD_JOB
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<()> {
        let report = self.index.rebuild().await?;
        info!(
            version = report.version,
            items = report.item_count,
            pairs = report.pair_count,
            "Similarity index published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollaborativeConfig;
    use crate::jobs::{run_once, TickOutcome};
    use crate::models::InteractionEvent;
    use crate::services::collaborative::BuildState;
    use crate::sources::{InteractionLog, MemoryCatalog};
    use chrono::{DateTime, Utc};
    use reco_cache::{CacheKey, KvStore, MemoryKvStore};
    use uuid::Uuid;

    /// Log whose full scan never completes
    struct StalledLog;

    #[async_trait]
    impl InteractionLog for StalledLog {
        async fn user_interactions(&self, _: Uuid, _: DateTime<Utc>) -> Result<Vec<InteractionEvent>> {
            Ok(Vec::new())
        }
        async fn item_interactions(&self, _: Uuid, _: DateTime<Utc>) -> Result<Vec<InteractionEvent>> {
            Ok(Vec::new())
        }
        async fn interactions_since(&self, _: DateTime<Utc>) -> Result<Vec<InteractionEvent>> {
            std::future::pending().await
        }
        async fn active_users(&self, _: DateTime<Utc>, _: usize) -> Result<Vec<Uuid>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_timed_out_rebuild_can_run_again_next_tick() {
        let cache = MemoryKvStore::new();
        let index = Arc::new(CollaborativeIndex::new(
            Arc::new(MemoryCatalog::new()),
            Arc::new(StalledLog),
            Arc::new(cache.clone()),
            CollaborativeConfig::default(),
        ));
        let job = SimilarityRebuildJob::new(index.clone(), Duration::from_secs(60));

        let outcome = run_once(&job, Duration::from_millis(20)).await;
        assert_eq!(outcome, TickOutcome::TimedOut);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!index.is_rebuilding());
        assert!(cache.get(&CacheKey::job_lock(REBUILD_JOB)).await.unwrap().is_none());
        assert_eq!(index.status().await.into_inner().state, BuildState::Failed);

        // the next tick is not turned away by a leftover lock
        let again = run_once(&job, Duration::from_millis(20)).await;
        assert_eq!(again, TickOutcome::TimedOut);
    }
}
