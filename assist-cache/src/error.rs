//! Error types for cache operations
//!
//! Most runtime failures in this crate are "miss-equivalent": the cache
//! logs them and reports a miss instead of surfacing them to callers.
//! The variants below are what the internal layers pass around before
//! that conversion happens, plus the configuration errors that are fatal
//! at startup.

use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Invalid configuration (budgets, paths, TTLs)
    #[error("Configuration error: {0}")]
    Config(String),

    /// SQLite error from the disk tier
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compressed payload could not be inflated
    #[error("Compression error: {0}")]
    Compression(String),

    /// A stored row failed validation
    #[error("Corrupt cache row: {0}")]
    Corrupt(String),

    /// Disk operation exceeded its time bound
    #[error("Disk operation timed out after {timeout_ms}ms: {context}")]
    Timeout { timeout_ms: u64, context: String },

    /// Blocking task failed to complete
    #[error("Background task failed: {0}")]
    Task(String),

    /// Disk tier was requested but the configuration has none
    #[error("Disk tier is disabled")]
    DiskDisabled,

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}
