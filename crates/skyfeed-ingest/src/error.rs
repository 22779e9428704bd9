//! Error types for the ingestion side.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while ingesting the firehose.
#[derive(Error, Debug)]
pub enum Error {
    /// Feed log or registry error.
    #[error(transparent)]
    Core(#[from] skyfeed_core::Error),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame, CAR file or record could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The upstream sent an error frame.
    #[error("Upstream error frame: {error}: {message}")]
    Upstream {
        /// Error name, e.g. `FutureCursor`.
        error: String,
        /// Human-readable message, possibly empty.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The ingest worker exited without being asked to.
    #[error("Ingest worker failed: {0}")]
    WorkerFailed(String),
}
