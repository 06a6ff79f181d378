//! Unified error types for the service
//!
//! One closed taxonomy is used across all components. Variants carry plain
//! strings so they stay serializable for callers; raw protocol text must be
//! stripped before a message reaches the facade boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Service-wide error type.
///
/// `ResyncRequired` is a control-flow signal consumed by the sync engine,
/// not a user-facing failure.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message")]
pub enum MailError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Mailbox state invalidated, full resync required")]
    ResyncRequired,

    #[error("Server unavailable: {0}")]
    Unavailable(String),

    #[error("Local model not available: {0}")]
    ModelUnavailable(String),

    #[error("Summarization timed out after {0}s")]
    ModelTimeout(u64),

    #[error("Nothing to summarize")]
    EmptyInput,

    #[error("Summarizer is busy, try again later")]
    Busy,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl From<rusqlite::Error> for MailError {
    fn from(e: rusqlite::Error) -> Self {
        MailError::Database(e.to_string())
    }
}

impl From<r2d2::Error> for MailError {
    fn from(e: r2d2::Error) -> Self {
        MailError::Database(e.to_string())
    }
}

impl From<std::io::Error> for MailError {
    fn from(e: std::io::Error) -> Self {
        MailError::Network(e.to_string())
    }
}

impl From<toml::de::Error> for MailError {
    fn from(e: toml::de::Error) -> Self {
        MailError::Config(e.to_string())
    }
}

/// Result type alias using MailError
pub type Result<T> = std::result::Result<T, MailError>;
