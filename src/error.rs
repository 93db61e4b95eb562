//! Error types for the Apiguard rate limiter.

use thiserror::Error;

/// Main error type for Apiguard operations.
#[derive(Error, Debug)]
pub enum GuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GuardError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        GuardError::Config(msg.into())
    }
}

impl From<::config::ConfigError> for GuardError {
    fn from(err: ::config::ConfigError) -> Self {
        GuardError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for GuardError {
    fn from(err: serde_yaml::Error) -> Self {
        GuardError::Config(err.to_string())
    }
}

/// Result type alias for Apiguard operations.
pub type Result<T> = std::result::Result<T, GuardError>;
