//! Daily click model snapshot

use super::ScheduledJob;
use crate::error::Result;
use crate::services::ctr::OnlineClickModel;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How often the snapshot hour is checked
pub const CHECK_INTERVAL: Duration = Duration::from_secs(600);

pub struct ModelSnapshotJob {
    model: Arc<OnlineClickModel>,
}

impl ModelSnapshotJob {
    pub fn new(model: Arc<OnlineClickModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl ScheduledJob for ModelSnapshotJob {
    fn name(&self) -> &'static str {
        "model_snapshot"
    }

    fn interval(&self) -> Duration {
        CHECK_INTERVAL
    }

    async fn run(&self) -> Result<()> {
        if !self.model.state().is_ready() {
            debug!("Click model not ready, skipping snapshot");
            return Ok(());
        }
        match self.model.maybe_daily_snapshot(Utc::now()).await? {
            Some(id) => info!(snapshot_id = %id, "Daily click model snapshot saved"),
            None => debug!("Daily snapshot already taken or not due"),
        }
        Ok(())
    }
}
