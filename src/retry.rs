//! Retry policy for bulk transfers
//!
//! Two pieces live here:
//! - [`AttemptSchedule`]: per-attempt timeouts that grow linearly with the attempt
//!   number, and the fixed pause inserted between attempts
//! - [`IsRetryable`]: classification of failures into transient (leave the item
//!   pending for the next attempt) and terminal (never retry the item)
//!
//! # Example
//!
//! ```
//! use report_ingest::config::DownloadConfig;
//! use report_ingest::retry::AttemptSchedule;
//! use std::time::Duration;
//!
//! let config = DownloadConfig::new(
//!     Duration::from_secs(2),
//!     Duration::from_secs(10),
//!     3,
//!     0.5,
//! );
//! let schedule = AttemptSchedule::from_config(&config);
//!
//! // Third attempt (index 2) doubles the base timeouts
//! let timeouts = schedule.timeouts(2);
//! assert_eq!(timeouts.connect, Duration::from_secs(4));
//! assert_eq!(timeouts.read, Duration::from_secs(20));
//! assert_eq!(schedule.pause(), Duration::from_secs(1));
//! ```

use crate::config::DownloadConfig;
use crate::error::Error;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, non-2xx responses, connection reset) return `true`.
/// Permanent failures (validation rejection, encryption failure, disk full) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Any transport-level failure is worth another attempt
            Error::Network(_) => true,
            // Non-2xx answers from a remote are retried
            Error::Backend { .. } => true,
            Error::Timeout { .. } => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            // The file arrived but is unusable; fetching it again gives the same bytes
            Error::Rejected { .. } => false,
            Error::Encryption { .. } => false,
            Error::Config { .. } => false,
            Error::InvalidArgument(_) => false,
            Error::NotStarted { .. } => false,
            Error::AlreadySubmitted(_) => false,
            // Cancellation must propagate, never loop
            Error::Cancelled => false,
            Error::Serialization(_) => false,
            Error::Import(_) => false,
            Error::WorkerPanicked { .. } => false,
            Error::Other(_) => false,
        }
    }
}

/// Timeouts applied to one download attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptTimeouts {
    /// Connect timeout
    pub connect: Duration,
    /// Read timeout (per read, not whole-body)
    pub read: Duration,
}

/// Linear timeout escalation and backoff derived from a [`DownloadConfig`]
#[derive(Clone, Copy, Debug)]
pub struct AttemptSchedule {
    connect: Duration,
    read: Duration,
    increment: f64,
    attempts: u32,
}

impl AttemptSchedule {
    /// Build the schedule for a configuration
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            read: config.read_timeout,
            increment: config.clamped_increment(),
            attempts: config.attempts(),
        }
    }

    /// Total number of attempts
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Timeouts for the zero-based `attempt`: `base * (1 + attempt * increment)`
    pub fn timeouts(&self, attempt: u32) -> AttemptTimeouts {
        let factor = 1.0 + f64::from(attempt) * self.increment;
        AttemptTimeouts {
            connect: self.connect.mul_f64(factor),
            read: self.read.mul_f64(factor),
        }
    }

    /// Pause between attempts: 10% of the base read timeout, the same every time
    pub fn pause(&self) -> Duration {
        self.read / 10
    }
}
