pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod models;
pub mod services;
pub mod sources;
pub mod utils;

pub use config::Config;
pub use engine::{EngineSources, RecommendationEngine};
pub use error::{DegradeReason, EngineError, Result, Served};
pub use jobs::JobScheduler;
pub use models::{InteractionEvent, InteractionKind, Item, RecommendationSource, RecommendedItem};
