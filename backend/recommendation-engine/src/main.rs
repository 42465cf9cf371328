use anyhow::{Context, Result};
use recommendation_engine::cli::{parse_mode, RunMode};
use recommendation_engine::sources::{CatalogExploration, ClickHouseSource};
use recommendation_engine::{Config, EngineSources, RecommendationEngine};
use reco_cache::{KvStore, RedisKvStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mode = parse_mode(std::env::args().skip(1)).map_err(anyhow::Error::msg)?;
    let config = Config::from_env().context("Failed to load configuration")?;
    info!(mode = %mode, "Starting recommendation-engine");

    let cache: Arc<dyn KvStore> = Arc::new(
        RedisKvStore::connect(
            &config.redis.url,
            Duration::from_millis(config.redis.command_timeout_ms),
        )
        .await
        .context("Failed to connect to Redis")?,
    );

    let source = Arc::new(ClickHouseSource::from_config(&config.clickhouse));
    let sources = EngineSources {
        catalog: source.clone(),
        interactions: source.clone(),
        tags: source.clone(),
        exploration: Arc::new(CatalogExploration::new(source, config.clustering.seed)),
    };

    let engine = RecommendationEngine::new(config, sources, cache);
    engine.initialize().await;

    match mode {
        RunMode::SimilarityRebuild => {
            let report = engine.rebuild_similarity().await?;
            info!(
                version = report.version,
                items = report.item_count,
                pairs = report.pair_count,
                duration_ms = report.duration_ms,
                "Similarity rebuild finished"
            );
        }
        RunMode::Clustering => {
            let stats = engine.run_clustering(None).await?;
            info!(
                version = stats.version,
                users = stats.total_users,
                iterations = stats.iterations,
                converged = stats.converged,
                "Clustering finished"
            );
        }
        RunMode::Scheduler if !engine.config().scheduler.enabled => {
            warn!("Scheduler disabled by configuration, nothing to run");
        }
        RunMode::Scheduler => {
            let mut scheduler = engine.scheduler();
            scheduler.start();
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            scheduler.shutdown().await;
        }
    }

    info!("recommendation-engine stopped");
    Ok(())
}
