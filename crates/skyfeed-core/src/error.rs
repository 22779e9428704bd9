//! Error types for the skyfeed core crate.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the feed registry and the feed log.
#[derive(Error, Debug)]
pub enum Error {
    /// A feed key is empty or contains characters unsafe for a file name.
    #[error("invalid feed key '{0}': keys must be non-empty and contain only [A-Za-z0-9_-]")]
    InvalidFeedKey(String),

    /// The same feed key was registered twice.
    #[error("duplicate feed key '{0}'")]
    DuplicateFeed(String),

    /// A persisted log line could not be parsed.
    #[error("corrupt feed log {path} at line {line}: {source}")]
    CorruptLog {
        /// The log file.
        path: PathBuf,
        /// 1-based line number of the bad record.
        line: usize,
        /// The underlying parse error.
        source: serde_json::Error,
    },

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
