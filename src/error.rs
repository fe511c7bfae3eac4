//! Error types for exif-stamp.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for the metadata-write core.
///
/// Structural drift during a verified write is deliberately *not* an error:
/// it surfaces as [`Verified::Drifted`](crate::safe_write::Verified::Drifted)
/// and leads to a sidecar write.
#[derive(Debug, Error)]
pub enum StampError {
    /// exiftool cannot be found or does not answer the version probe.
    #[error("exiftool unavailable at {path}: {reason}")]
    ProcessUnavailable { path: PathBuf, reason: String },

    /// A batch did not finish within its adaptive window. The process has
    /// already been killed when this is returned.
    #[error("exiftool did not finish {units} unit(s) within {waited:?}")]
    Timeout { units: usize, waited: Duration },

    /// A ready sentinel arrived out of order.
    #[error("exiftool protocol desynchronized: expected {expected}, got {got}")]
    Desync { expected: String, got: String },

    /// Caller supplied a path that does not exist.
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    /// exiftool finished the unit but reported that it did not update the file.
    #[error("exiftool rejected {path}: {reason}")]
    Rejected { path: PathBuf, reason: String },

    /// exiftool answered but the tags could not be extracted.
    #[error("could not read tags from {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    /// An argument cannot be expressed as a single protocol line.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unexpected state of the process plumbing.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using StampError.
pub type Result<T> = std::result::Result<T, StampError>;
