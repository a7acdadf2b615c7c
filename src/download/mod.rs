//! Bulk download engine -- retrying, connection-pooled transfer of URLs to files.
//!
//! Split into focused submodules:
//! - [`hooks`] - Validator, encryptor and completion callback seams
//! - [`transfer`] - Single-request fetch, validation and encryption
//!
//! Each attempt builds its own HTTP client, issues one request per outstanding
//! entry, and waits for all of them before deciding what is left. Entries whose
//! file was rejected or could not be encrypted are never requested again, but
//! still show up in the returned pending set when their file is absent.
//!
//! Whether an entry still needs work is decided purely by file existence after
//! the attempt: a destination that already exists on disk counts as satisfied.

mod hooks;
mod transfer;


pub use hooks::{
    CompletionCallback, DownloadHooks, FileEncryptor, FileValidator, NonEmptyValidator,
    Sha256Validator, sha256_hex,
};
pub use transfer::decrypt_file;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use url::Url;

use crate::config::DownloadConfig;
use crate::error::{Error, Result};
use crate::retry::{AttemptSchedule, AttemptTimeouts, IsRetryable};

/// A single source/destination pair
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DownloadRequest {
    /// Where to fetch from
    pub source: Url,
    /// Where to store the body
    pub destination: PathBuf,
}

impl DownloadRequest {
    /// Create a request
    pub fn new(source: Url, destination: impl Into<PathBuf>) -> Self {
        Self {
            source,
            destination: destination.into(),
        }
    }
}

/// Collect requests into the map form accepted by [`download`]
///
/// Later duplicates of the same source replace earlier ones.
pub fn request_map(requests: impl IntoIterator<Item = DownloadRequest>) -> HashMap<Url, PathBuf> {
    requests
        .into_iter()
        .map(|r| (r.source, r.destination))
        .collect()
}

/// Download every `source -> destination` entry, retrying transient failures.
///
/// Returns the entries whose destination file does not exist once all attempts
/// are used up. An empty map means everything was stored.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] for an empty request map and
/// [`Error::Network`] if an HTTP client cannot be constructed. Per-entry failures
/// never surface as errors; they stay in the returned map.
///
/// # Example
///
/// ```no_run
/// use report_ingest::config::DownloadConfig;
/// use report_ingest::download::{download, DownloadHooks};
/// use std::collections::HashMap;
///
/// # async fn example() -> report_ingest::Result<()> {
/// let mut requests = HashMap::new();
/// requests.insert(
///     "https://repo.example.org/reports/1.xml".parse().unwrap(),
///     "/var/lib/reports/1.xml".into(),
/// );
///
/// let pending = download(&requests, &DownloadConfig::default(), &DownloadHooks::default()).await?;
/// assert!(pending.is_empty());
/// # Ok(())
/// # }
/// ```
pub async fn download(
    requests: &HashMap<Url, PathBuf>,
    config: &DownloadConfig,
    hooks: &DownloadHooks,
) -> Result<HashMap<Url, PathBuf>> {
    if requests.is_empty() {
        return Err(Error::InvalidArgument(
            "download requires at least one request".to_string(),
        ));
    }

    let schedule = AttemptSchedule::from_config(config);
    let mut pending = requests.clone();
    let mut cancelled: HashSet<Url> = HashSet::new();

    for attempt in 0..schedule.attempts() {
        let timeouts = schedule.timeouts(attempt);
        tracing::debug!(
            attempt = attempt + 1,
            max_attempts = schedule.attempts(),
            outstanding = pending.len(),
            connect_timeout_ms = timeouts.connect.as_millis(),
            read_timeout_ms = timeouts.read.as_millis(),
            "starting download attempt"
        );

        run_attempt(&pending, &mut cancelled, config, timeouts, hooks).await?;

        pending = missing_files(requests).await;
        let only_cancelled_left = pending.keys().all(|url| cancelled.contains(url));
        if only_cancelled_left {
            break;
        }

        if attempt + 1 < schedule.attempts() {
            tracing::info!(
                attempt = attempt + 1,
                remaining = pending.len(),
                cancelled = cancelled.len(),
                delay_ms = schedule.pause().as_millis(),
                "download attempt incomplete, retrying"
            );
            tokio::time::sleep(schedule.pause()).await;
        }
    }

    if !pending.is_empty() {
        tracing::warn!(
            pending = pending.len(),
            cancelled = cancelled.len(),
            total = requests.len(),
            "download finished with missing files"
        );
    }
    Ok(pending)
}

/// Convenience wrapper for a single file; returns true if it was stored.
pub async fn download_one(
    source: Url,
    destination: PathBuf,
    config: &DownloadConfig,
    hooks: &DownloadHooks,
) -> Result<bool> {
    let requests = HashMap::from([(source, destination)]);
    let pending = download(&requests, config, hooks).await?;
    Ok(pending.is_empty())
}

/// One scatter/gather round over every outstanding, non-cancelled entry.
///
/// The client and the connection cap live only for the duration of this call.
async fn run_attempt(
    pending: &HashMap<Url, PathBuf>,
    cancelled: &mut HashSet<Url>,
    config: &DownloadConfig,
    timeouts: AttemptTimeouts,
    hooks: &DownloadHooks,
) -> Result<()> {
    let client = reqwest::Client::builder()
        .connect_timeout(timeouts.connect)
        .read_timeout(timeouts.read)
        .pool_max_idle_per_host(config.max_connections_per_host)
        .build()?;
    let limit = Arc::new(Semaphore::new(config.max_connections.max(1)));

    let work = pending
        .iter()
        .filter(|(url, _)| !cancelled.contains(*url))
        .map(|(url, dest)| {
            let client = &client;
            let limit = Arc::clone(&limit);
            async move {
                // The semaphore is never closed, so acquisition only fails if it is dropped
                let _permit = limit.acquire_owned().await.ok();
                let result = transfer::transfer(client, url, dest, hooks).await;
                (url, result)
            }
        });

    let results = futures::future::join_all(work).await;

    for (url, result) in results {
        match result {
            Ok(path) => {
                tracing::debug!(url = %url, path = %path.display(), "download stored");
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(url = %url, error = %e, "download failed, will retry");
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "download failed permanently");
                cancelled.insert(url.clone());
            }
        }
    }
    Ok(())
}

/// Entries whose destination file does not exist.
async fn missing_files(requests: &HashMap<Url, PathBuf>) -> HashMap<Url, PathBuf> {
    let mut missing = HashMap::new();
    for (url, dest) in requests {
        let exists = tokio::fs::try_exists(dest).await.unwrap_or(false);
        if !exists {
            missing.insert(url.clone(), dest.clone());
        }
    }
    missing
}
