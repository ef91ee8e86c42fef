//! Error types for pipecall

use std::time::Duration;

use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// A send was attempted while no child process is alive
    #[error("Process is not running")]
    NotRunning,

    /// The child answered a call with an `error` field
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// A prefixed line could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The process generation ended before a reply arrived
    #[error("Channel closed before a response arrived")]
    ChannelClosed,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Failed to spawn child process: {0}")]
    Spawn(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for failures reported by the child rather than by the transport
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote(_))
    }
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
