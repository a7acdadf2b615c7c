//! # report-ingest
//!
//! Concurrent fetch-and-import engine for structured medical report repositories.
//!
//! ## Overview
//!
//! report-ingest provides:
//! - **Bulk downloads** - retrying, connection-capped HTTP transfers with optional
//!   validation and at-rest encryption
//! - **Cancellable tasks** - progress-tracked work run on a bounded worker pool
//! - **Partitioned imports** - a center's reports fetched in batches and stored
//!   as `<center>/ontology_<id>/<global id>.<ext>`
//! - **Import groups** - several imports driven together with one aggregate progress
//!
//! The task services are explicit values with a start/stop lifecycle; nothing is
//! global. The library emits `tracing` events and installs no subscriber.
//!
//! ## Quick Start
//!
//! ```no_run
//! use report_ingest::import::{HttpReportBackend, ImportTask, ImportTaskParams, JsonBulkParser};
//! use report_ingest::{Config, Credentials, TaskServices};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     config.validate()?;
//!
//!     let services = TaskServices::new(&config.tasks);
//!     services.start();
//!
//!     let backend = HttpReportBackend::new(
//!         "https://reports.example.org/api/".parse()?,
//!         Duration::from_secs(120),
//!     )?;
//!     let task = ImportTask::new(
//!         ImportTaskParams {
//!             backend: Arc::new(backend),
//!             parser: Arc::new(JsonBulkParser),
//!             center: "north-clinic".to_string(),
//!             credentials: Credentials::new("importer", "secret"),
//!             ids: vec!["RPT-0001".to_string(), "RPT-0002".to_string()],
//!             partition_size: 50,
//!             dest_dir: "/var/lib/reports".into(),
//!             parent: None,
//!         },
//!         &services,
//!         &config.import,
//!     )
//!     .await?;
//!
//!     let imported = task.submit().await?.await??;
//!     println!("imported {imported} reports");
//!
//!     services.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Bulk download engine
pub mod download;
/// Error types
pub mod error;
/// Report import tasks
pub mod import;
/// Retry classification and attempt schedules
pub mod retry;
/// Cancellable tasks, runner, scheduler and registry
pub mod task;
/// Core types
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{Config, DownloadConfig, ImportConfig, TaskConfig};
pub use download::{DownloadHooks, DownloadRequest, download, download_one};
pub use error::{Error, ImportError, Result};
pub use import::{ImportGroupTask, ImportTask, ImportTaskParams};
pub use task::{CancellableTask, TaskHandle, TaskRegistry, TaskRunner, TaskScheduler, TaskServices};
pub use types::{Credentials, ParsedReport, TaskId, TaskSnapshot, TaskState};

/// Run until a termination signal arrives, then shut the task services down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use report_ingest::{TaskConfig, TaskServices, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() {
///     let services = TaskServices::new(&TaskConfig::default());
///     services.start();
///
///     run_with_shutdown(&services).await;
/// }
/// ```
pub async fn run_with_shutdown(services: &TaskServices) {
    wait_for_signal().await;
    services.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = sigint.recv() => tracing::info!("received SIGINT"),
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(
                error = %e,
                "could not register SIGTERM handler, waiting for SIGINT only"
            );
            sigint.recv().await;
            tracing::info!("received SIGINT");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(
                error = %e,
                "could not register SIGINT handler, waiting for SIGTERM only"
            );
            sigterm.recv().await;
            tracing::info!("received SIGTERM");
        }
        (Err(e), Err(_)) => {
            tracing::error!(
                error = %e,
                "could not register any signal handlers, using ctrl_c fallback"
            );
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C"),
        Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C"),
    }
}
