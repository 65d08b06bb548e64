//! Error types for the xDS agent client.

use thiserror::Error;

/// Error type for the xDS agent client.
///
/// Only [`Error::Cancelled`] stops the reconnection loop. Every other
/// variant raised while streaming is absorbed and answered with a fresh
/// connection and stream.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level connection to the discovery server failed.
    #[error("failed to connect to discovery server: {0}")]
    Connect(String),

    /// The discovery RPC could not be established on a live connection.
    #[error("failed to establish discovery stream: {0}")]
    StreamSetup(String),

    /// A running discovery stream failed while receiving or sending.
    #[error("discovery stream failed: {0}")]
    Stream(String),

    /// The server closed the discovery stream.
    #[error("discovery stream closed by server")]
    StreamClosed,

    /// The processor rejected a pushed response.
    #[error("failed to process discovery response: {0}")]
    Process(String),

    /// The client was cancelled before the operation could complete.
    #[error("xDS client cancelled")]
    Cancelled,

    /// `start` was called on a client that is already running.
    #[error("xDS client already started")]
    AlreadyStarted,

    /// A retry policy parameter was out of range.
    #[error("validation error: {0}")]
    Validation(String),

    /// The client configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Returns `true` if this error signals cancellation rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type alias for xDS agent client operations.
pub type Result<T> = std::result::Result<T, Error>;
