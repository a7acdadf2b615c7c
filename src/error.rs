//! Error types for report-ingest
//!
//! This module provides the error handling for the library:
//! - A single top-level [`Error`] used by every component
//! - Import-specific failures grouped in [`ImportError`]
//! - Context information (component name, operation, path, partition size)

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for report-ingest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for report-ingest
///
/// Each variant includes contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "partition_size")
        key: Option<String>,
    },

    /// A caller supplied an argument that violates a precondition
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A service was used before `start()` or after `shutdown()`/`close()`
    #[error("{component} is not running")]
    NotStarted {
        /// The component that rejected the call (e.g., "task runner")
        component: &'static str,
    },

    /// Members were added to a group task after it was submitted
    #[error("group task {0} has already been submitted")]
    AlreadySubmitted(crate::types::TaskId),

    /// The operation observed a cancellation signal
    #[error("operation cancelled")]
    Cancelled,

    /// A bounded wait expired
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The operation that timed out
        operation: String,
        /// The bound that expired
        after: Duration,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A report backend answered with a failure
    #[error("backend error: {message}")]
    Backend {
        /// Human-readable failure description
        message: String,
        /// HTTP status reported by the backend, if any
        status: Option<u16>,
    },

    /// Import pipeline failure
    #[error("import error: {0}")]
    Import(#[from] ImportError),

    /// A downloaded file was rejected by the configured validator
    #[error("validation rejected {path}")]
    Rejected {
        /// The rejected file
        path: PathBuf,
    },

    /// Encrypting or decrypting a downloaded file failed
    #[error("encryption failed for {path}: {reason}")]
    Encryption {
        /// The file being encrypted
        path: PathBuf,
        /// The underlying reason
        reason: String,
    },

    /// A worker panicked while running a task body
    #[error("worker {worker} panicked: {cause}")]
    WorkerPanicked {
        /// The worker name assigned by the pool
        worker: String,
        /// The panic payload rendered as text
        cause: String,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Import pipeline errors
#[derive(Debug, Error)]
pub enum ImportError {
    /// A partition stored fewer (or more) reports than ids it was given
    #[error("partition stored {stored} of {expected} reports")]
    PartitionIncomplete {
        /// Number of ids in the partition
        expected: usize,
        /// Number of reports actually stored
        stored: usize,
    },

    /// The destination directory cannot be used
    #[error("destination {path} is unusable: {reason}")]
    InvalidDestination {
        /// The destination directory
        path: PathBuf,
        /// Why it was rejected
        reason: String,
    },

    /// A report identifier cannot be used as a path component
    #[error("unsafe file name component: {0:?}")]
    UnsafeName(String),
}

impl Error {
    /// Shorthand for [`Error::Config`] with a key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }

    /// Returns true if this error is a cancellation signal
    ///
    /// Cancellation is the one condition that callers propagate instead of absorbing.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
