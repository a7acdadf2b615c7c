//! Configuration types for report-ingest

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Hard upper bound on concurrent workers in the task runner
pub const MAX_WORKERS: usize = 128;

/// Bulk download behaviour (timeouts, retries, connection caps)
///
/// Timeouts grow linearly with the attempt number: attempt `n` uses
/// `base * (1 + n * timeout_increment)`, with the increment clamped to `[0, 1]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Base connect timeout (default: 5s)
    #[serde(default = "default_connect_timeout", with = "duration_ms_serde")]
    pub connect_timeout: Duration,

    /// Base read timeout (default: 10s)
    ///
    /// Also drives the pause between attempts, which is 10% of this value.
    #[serde(default = "default_read_timeout", with = "duration_ms_serde")]
    pub read_timeout: Duration,

    /// Maximum number of attempts, including the first (default: 3)
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Fraction of the base timeouts added per attempt (default: 0.5)
    #[serde(default = "default_timeout_increment")]
    pub timeout_increment: f64,

    /// Maximum in-flight requests per attempt (default: 20)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum idle pooled connections per host (default: 10)
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            retries: default_retries(),
            timeout_increment: default_timeout_increment(),
            max_connections: default_max_connections(),
            max_connections_per_host: default_max_connections_per_host(),
        }
    }
}

impl DownloadConfig {
    /// Create a configuration with the given timeouts and retry policy, keeping
    /// default connection caps
    pub fn new(
        connect_timeout: Duration,
        read_timeout: Duration,
        retries: u32,
        timeout_increment: f64,
    ) -> Self {
        Self {
            connect_timeout,
            read_timeout,
            retries,
            timeout_increment,
            ..Self::default()
        }
    }

    /// Number of attempts actually made (zero is treated as one)
    pub fn attempts(&self) -> u32 {
        self.retries.max(1)
    }

    /// Timeout growth fraction clamped into `[0, 1]`
    pub fn clamped_increment(&self) -> f64 {
        if self.timeout_increment.is_nan() {
            0.0
        } else {
            self.timeout_increment.clamp(0.0, 1.0)
        }
    }
}

/// Worker pool and scheduler sizing
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Maximum concurrently running workers (default: 128, capped at [`MAX_WORKERS`])
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Scheduler pool size (None = max(2, available cores))
    #[serde(default)]
    pub scheduler_threads: Option<usize>,

    /// How long shutdown waits for in-flight work before cancelling it (default: 30s)
    #[serde(default = "default_shutdown_grace", with = "duration_ms_serde")]
    pub shutdown_grace: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            scheduler_threads: None,
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl TaskConfig {
    /// Effective worker cap
    pub fn worker_limit(&self) -> usize {
        self.max_workers.min(MAX_WORKERS)
    }

    /// Effective scheduler pool size
    pub fn scheduler_limit(&self) -> usize {
        self.scheduler_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .max(2)
        })
    }
}

/// Import pipeline behaviour
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Largest partition fetched in one backend call (default: 100)
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Bound on waiting for all partitions of one import (default: 60 minutes)
    #[serde(default = "default_import_timeout", with = "duration_ms_serde")]
    pub import_timeout: Duration,

    /// Interval between group progress ticks (default: 2s)
    #[serde(default = "default_poll_interval", with = "duration_ms_serde")]
    pub poll_interval: Duration,

    /// Bound on waiting for one group progress tick (default: 1 minute)
    #[serde(default = "default_tick_timeout", with = "duration_ms_serde")]
    pub tick_timeout: Duration,

    /// Extension used for parsed reports that do not carry one (default: "xml")
    #[serde(default = "default_extension")]
    pub default_extension: String,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_batch: default_max_batch(),
            import_timeout: default_import_timeout(),
            poll_interval: default_poll_interval(),
            tick_timeout: default_tick_timeout(),
            default_extension: default_extension(),
        }
    }
}

/// Main configuration for the ingest engine
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Bulk download settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Worker pool and scheduler settings
    #[serde(default)]
    pub tasks: TaskConfig,

    /// Import pipeline settings
    #[serde(default)]
    pub import: ImportConfig,
}

impl Config {
    /// Check settings that would otherwise fail deep inside a running task
    pub fn validate(&self) -> Result<()> {
        if self.download.max_connections == 0 {
            return Err(Error::config(
                "max_connections",
                "at least one connection is required",
            ));
        }
        if self.tasks.max_workers == 0 {
            return Err(Error::config(
                "max_workers",
                "at least one worker is required",
            ));
        }
        if self.tasks.scheduler_threads == Some(0) {
            return Err(Error::config(
                "scheduler_threads",
                "scheduler needs at least one thread",
            ));
        }
        if self.import.max_batch == 0 {
            return Err(Error::config("max_batch", "must be at least 1"));
        }
        if self.import.poll_interval.is_zero() {
            return Err(Error::config("poll_interval", "must be non-zero"));
        }
        Ok(())
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retries() -> u32 {
    3
}

fn default_timeout_increment() -> f64 {
    0.5
}

fn default_max_connections() -> usize {
    20
}

fn default_max_connections_per_host() -> usize {
    10
}

fn default_max_workers() -> usize {
    MAX_WORKERS
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_max_batch() -> usize {
    100
}

fn default_import_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_tick_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_extension() -> String {
    "xml".to_string()
}

// Duration serialization helper (milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
