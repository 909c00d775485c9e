//! Error types for the Redis layer.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while connecting to or querying Redis.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("either an address or a host and port is required")]
    MissingAddress,

    #[error("invalid address {0:?}: expected host:port")]
    InvalidAddress(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("malformed {0} list: {1}")]
    MalformedList(&'static str, String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl StoreError {
    /// Whether this error is a configuration problem on the caller's
    /// side, as opposed to a store failure.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StoreError::MissingAddress
                | StoreError::InvalidAddress(_)
                | StoreError::InvalidPort(_)
                | StoreError::MalformedList(_, _)
        )
    }
}
