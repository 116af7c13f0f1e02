use thiserror::Error;

/// Common error types used across the delivery subsystem.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Push transport error: {0}")]
    PushTransport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
