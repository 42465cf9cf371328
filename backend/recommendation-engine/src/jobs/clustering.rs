//! Weekly user clustering

use super::ScheduledJob;
use crate::error::Result;
use crate::services::clustering::{UserClusterer, CLUSTERING_JOB};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct ClusteringJob {
    clusterer: Arc<UserClusterer>,
    interval: Duration,
}

impl ClusteringJob {
    pub fn new(clusterer: Arc<UserClusterer>, interval: Duration) -> Self {
        Self { clusterer, interval }
    }
}

#[async_trait]
impl ScheduledJob for ClusteringJob {
    fn name(&self) -> &'static str {
        CLUSTERING_JOB
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<()> {
        let stats = self.clusterer.run_clustering(None).await?;
        info!(
            version = stats.version,
            k = stats.k,
            users = stats.total_users,
            boundary_users = stats.boundary_users,
            "Clustering version activated"
        );
        Ok(())
    }
}
