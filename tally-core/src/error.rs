//! Error types for tally-core

use thiserror::Error;

/// Main error type for the tally-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Event could not be constructed
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Collector transport error
    #[error("transport error: {0}")]
    Transport(String),

    /// The delivery queue task is no longer running
    #[error("delivery queue is closed")]
    QueueClosed,
}

/// Result type alias for tally-core
pub type Result<T> = std::result::Result<T, Error>;
