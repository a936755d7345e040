use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportError;

/// Result type for gate operations
pub type Result<T> = std::result::Result<T, GateError>;

/// Errors that can occur while gating an outbound API call
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Rate limit exceeded for client {client}, retry after {}s", .retry_after.as_secs())]
    RateLimitExceeded {
        client: String,
        retry_after: Duration,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Client not found: {0}")]
    ClientNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GateError {
    /// Whether this error came from the cache or rate-limit storage layer.
    ///
    /// These are the failures the configured storage failure policy applies to.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            GateError::Storage(_) | GateError::Redis(_) | GateError::Serialization(_)
        )
    }

    /// Back-off hint carried by a rate-limit denial
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GateError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
