//! Cache error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Invalid cache data: {0}")]
    InvalidData(String),
}

impl CacheError {
    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::Redis(_) => "redis",
            CacheError::Serialization(_) => "serialization",
            CacheError::Timeout(_) => "timeout",
            CacheError::InvalidData(_) => "invalid_data",
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
