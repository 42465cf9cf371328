use reco_cache::CacheError;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Data source error: {0}")]
    Source(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Job already running: {0}")]
    JobAlreadyRunning(String),

    #[error("Job cancelled: {0}")]
    Cancelled(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<clickhouse::error::Error> for EngineError {
    fn from(err: clickhouse::error::Error) -> Self {
        EngineError::Source(err.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

/// Why a read fell back to a cheaper answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    /// Cache read/write failed; value computed from the next source
    CacheUnavailable,
    /// Catalogue, interaction log or tag source failed
    SourceUnavailable,
    /// Click model has not loaded or initialised weights yet
    ModelNotReady,
    /// Input vector length did not match the model
    DimensionMismatch,
    /// No similarity data; popularity fallback used
    NoSimilarityData,
    /// No clustering run is active
    NoActiveClustering,
}

impl DegradeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradeReason::CacheUnavailable => "cache_unavailable",
            DegradeReason::SourceUnavailable => "source_unavailable",
            DegradeReason::ModelNotReady => "model_not_ready",
            DegradeReason::DimensionMismatch => "dimension_mismatch",
            DegradeReason::NoSimilarityData => "no_similarity_data",
            DegradeReason::NoActiveClustering => "no_active_clustering",
        }
    }
}

/// Result of a user-facing read that never fails.
///
/// `Degraded` still carries a usable value; the reason tells callers which
/// fallback produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Served<T> {
    Fresh(T),
    Degraded { value: T, reason: DegradeReason },
}

impl<T> Served<T> {
    pub fn degraded(value: T, reason: DegradeReason) -> Self {
        Served::Degraded { value, reason }
    }

    /// Wrap `value`, degraded when a reason was recorded
    pub fn with_reason(value: T, reason: Option<DegradeReason>) -> Self {
        match reason {
            Some(reason) => Served::Degraded { value, reason },
            None => Served::Fresh(value),
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Served::Fresh(value) => value,
            Served::Degraded { value, .. } => value,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Served::Fresh(value) => value,
            Served::Degraded { value, .. } => value,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Served::Degraded { .. })
    }

    pub fn reason(&self) -> Option<DegradeReason> {
        match self {
            Served::Fresh(_) => None,
            Served::Degraded { reason, .. } => Some(*reason),
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Served<U> {
        match self {
            Served::Fresh(value) => Served::Fresh(f(value)),
            Served::Degraded { value, reason } => Served::Degraded {
                value: f(value),
                reason,
            },
        }
    }

    /// Split into the value and its reason, for folding several reads together
    pub fn into_parts(self) -> (T, Option<DegradeReason>) {
        match self {
            Served::Fresh(value) => (value, None),
            Served::Degraded { value, reason } => (value, Some(reason)),
        }
    }
}
