// Error kinds surfaced by the dispatch pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("global rate limit exceeded: {current}/{limit}")]
    GlobalRateLimited { current: u64, limit: u64 },

    #[error("kv store unavailable: {0}")]
    KvStoreUnavailable(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("request not found: {0}")]
    RequestNotFound(uuid::Uuid),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl From<redis::RedisError> for GatewayError {
    fn from(e: redis::RedisError) -> Self {
        GatewayError::KvStoreUnavailable(e.to_string())
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        GatewayError::Persistence(e.to_string())
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(e: config::ConfigError) -> Self {
        GatewayError::Config(e.to_string())
    }
}
