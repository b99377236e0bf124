//! Error types for `Vigil` core library.

use thiserror::Error;

/// Result type alias using `Vigil` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Vigil` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed control channel frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The peer closed the channel
    #[error("Channel closed")]
    ChannelClosed,

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
