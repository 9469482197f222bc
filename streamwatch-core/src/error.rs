//! Error types for streamwatch-core

use thiserror::Error;

/// Main error type for the streamwatch-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Media client error (REST polling, enrichment)
    #[error("media client error: {0}")]
    Client(String),

    /// Transport error (websocket connect/read/send)
    #[error("transport error: {0}")]
    Transport(String),

    /// Media server not found in the registry
    #[error("media server not found: {0}")]
    ServerNotFound(i64),
}

/// Result type alias for streamwatch-core
pub type Result<T> = std::result::Result<T, Error>;
