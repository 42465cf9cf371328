use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub clickhouse: ClickHouseConfig,
    pub features: FeaturesConfig,
    pub ctr: CtrConfig,
    pub collaborative: CollaborativeConfig,
    pub clustering: ClusteringConfig,
    pub orchestrator: OrchestratorConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            command_timeout_ms: 500,
        }
    }
}

/// ClickHouse configuration for the catalogue / interaction log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "nova_reco".to_string(),
            username: "default".to_string(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub cache_ttl_secs: u64,
    pub behavior_window_days: i64,
    pub max_behavior_items: usize,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            behavior_window_days: 90,
            max_behavior_items: 50,
        }
    }
}

/// Online click model hyper-parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CtrConfig {
    pub learning_rate: f64,
    pub l2_lambda: f64,
    pub gradient_clip: f64,
    pub init_seed: u64,
    pub init_range: f64,
    /// Snapshot after this many updates
    pub snapshot_every: u64,
    pub snapshot_retention_days: u64,
    pub snapshot_hour_utc: u32,
}

impl Default for CtrConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            l2_lambda: 0.001,
            gradient_clip: 5.0,
            init_seed: 42,
            init_range: 0.01,
            snapshot_every: 1000,
            snapshot_retention_days: 30,
            snapshot_hour_utc: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaborativeConfig {
    pub window_days: i64,
    pub min_co_raters: usize,
    pub top_n: usize,
    pub rebuild_interval_secs: u64,
    /// Compute pairs live when neither memory nor cache has them
    pub live_fallback: bool,
    pub job_lock_ttl_secs: u64,
}

impl Default for CollaborativeConfig {
    fn default() -> Self {
        Self {
            window_days: 90,
            min_co_raters: 2,
            top_n: 50,
            rebuild_interval_secs: 86_400,
            live_fallback: true,
            job_lock_ttl_secs: 7_200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub k: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub seed: u64,
    /// second/nearest distance ratio below which a user is a boundary user
    pub boundary_ratio: f64,
    pub window_days: i64,
    pub rebuild_interval_secs: u64,
    pub max_users: usize,
    pub job_lock_ttl_secs: u64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            k: 8,
            max_iterations: 100,
            tolerance: 1e-4,
            seed: 42,
            boundary_ratio: 1.2,
            window_days: 90,
            rebuild_interval_secs: 604_800,
            max_users: 100_000,
            job_lock_ttl_secs: 7_200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamWeights {
    pub content: f64,
    pub collaborative: f64,
    pub popularity: f64,
    pub exploration: f64,
}

impl Default for StreamWeights {
    fn default() -> Self {
        Self {
            content: 0.4,
            collaborative: 0.3,
            popularity: 0.2,
            exploration: 0.1,
        }
    }
}

impl StreamWeights {
    pub fn sum(&self) -> f64 {
        self.content + self.collaborative + self.popularity + self.exploration
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdStartMix {
    pub popular: f64,
    pub high_rated: f64,
    pub new_items: f64,
    pub random: f64,
}

impl Default for ColdStartMix {
    fn default() -> Self {
        Self {
            popular: 0.4,
            high_rated: 0.3,
            new_items: 0.2,
            random: 0.1,
        }
    }
}

impl ColdStartMix {
    pub fn sum(&self) -> f64 {
        self.popular + self.high_rated + self.new_items + self.random
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub weights: StreamWeights,
    pub cold_start_mix: ColdStartMix,
    /// Users with fewer behaviour events than this skip the blend
    pub cold_start_threshold: usize,
    pub warmth_midpoint: f64,
    pub warmth_steepness: f64,
    pub exploration_ratio: f64,
    pub ctr_rerank: bool,
    pub new_item_days: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            weights: StreamWeights::default(),
            cold_start_mix: ColdStartMix::default(),
            cold_start_threshold: 1,
            warmth_midpoint: 5.0,
            warmth_steepness: 1.0,
            exploration_ratio: 0.1,
            ctr_rerank: true,
            new_item_days: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub job_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            job_timeout_secs: 3_600,
        }
    }
}

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

impl Config {
    /// Load from `.env` and the process environment (`SECTION__FIELD=value`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = config::Config::try_from(&Config::default())?;
        let config = config::Config::builder()
            .add_source(defaults)
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.redis.url.is_empty() {
            return Err(EngineError::Configuration("Redis URL is required".into()));
        }

        if self.clickhouse.url.is_empty() {
            return Err(EngineError::Configuration(
                "ClickHouse URL is required".into(),
            ));
        }

        if self.features.behavior_window_days <= 0 || self.features.max_behavior_items == 0 {
            return Err(EngineError::Configuration(
                "Feature behaviour window and item limit must be positive".into(),
            ));
        }

        let ctr = &self.ctr;
        if !(ctr.learning_rate > 0.0 && ctr.learning_rate <= 1.0) {
            return Err(EngineError::Configuration(
                "CTR learning rate must be in (0, 1]".into(),
            ));
        }
        if ctr.l2_lambda < 0.0 || ctr.gradient_clip <= 0.0 || ctr.init_range < 0.0 {
            return Err(EngineError::Configuration(
                "CTR l2_lambda/init_range must be >= 0 and gradient_clip > 0".into(),
            ));
        }
        if ctr.snapshot_every == 0 || ctr.snapshot_hour_utc > 23 {
            return Err(EngineError::Configuration(
                "CTR snapshot_every must be > 0 and snapshot_hour_utc in 0..=23".into(),
            ));
        }

        if self.collaborative.top_n == 0 || self.collaborative.min_co_raters == 0 {
            return Err(EngineError::Configuration(
                "Collaborative top_n and min_co_raters must be positive".into(),
            ));
        }

        let clustering = &self.clustering;
        if clustering.k == 0 || clustering.max_iterations == 0 {
            return Err(EngineError::Configuration(
                "Clustering k and max_iterations must be positive".into(),
            ));
        }
        if clustering.job_lock_ttl_secs == 0 || self.collaborative.job_lock_ttl_secs == 0 {
            return Err(EngineError::Configuration(
                "Job lock TTLs must be greater than 0".into(),
            ));
        }
        if clustering.boundary_ratio < 1.0 {
            return Err(EngineError::Configuration(
                "Boundary ratio must be >= 1.0".into(),
            ));
        }

        let orchestrator = &self.orchestrator;
        if (orchestrator.weights.sum() - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EngineError::Configuration(format!(
                "Stream weights must sum to 1.0, got {:.3}",
                orchestrator.weights.sum()
            )));
        }
        if (orchestrator.cold_start_mix.sum() - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EngineError::Configuration(format!(
                "Cold-start mix must sum to 1.0, got {:.3}",
                orchestrator.cold_start_mix.sum()
            )));
        }
        if !(0.0..=1.0).contains(&orchestrator.exploration_ratio) {
            return Err(EngineError::Configuration(
                "Exploration ratio must be in [0, 1]".into(),
            ));
        }

        if self.scheduler.job_timeout_secs == 0 {
            return Err(EngineError::Configuration(
                "Job timeout must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ctr.init_seed, 42);
        assert_eq!(config.collaborative.top_n, 50);
        assert!((config.clustering.boundary_ratio - 1.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_stream_weights() {
        let mut config = Config::default();
        config.orchestrator.weights.content = 0.9;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_learning_rate() {
        let mut config = Config::default();
        config.ctr.learning_rate = 0.0;
        assert!(config.validate().is_err());

        config.ctr.learning_rate = 0.05;
        config.ctr.snapshot_hour_utc = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_job_lock_ttl_is_rejected() {
        let mut config = Config::default();
        assert_eq!(config.clustering.job_lock_ttl_secs, 7_200);
        config.clustering.job_lock_ttl_secs = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_boundary_ratio() {
        let mut config = Config::default();
        config.clustering.boundary_ratio = 0.8;

        assert!(config.validate().is_err());
    }
}
