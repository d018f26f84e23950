use std::time::Duration;

use thiserror::Error;

/// Failure reported by a [`LockBackend`](crate::store::LockBackend).
///
/// Every variant is a transport-level problem. Contention and ownership
/// mismatches are ordinary return values, never errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Backing store unavailable: {0}")]
    Unavailable(String),

    #[error("Backing store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected backing store reply: {0}")]
    Protocol(String),

    #[cfg(feature = "redis-backend")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Unified error type for lock protocol operations.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Invalid TTL: {reason}")]
    InvalidTtl { reason: String },

    #[error("Invalid job name: {reason}")]
    InvalidJobName { reason: String },

    #[error("Lock backend unavailable for {key}: {source}")]
    BackendUnavailable {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Lock store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, LockError>;
