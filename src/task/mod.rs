//! Task framework: cancellable tasks, a bounded runner, a scheduler and a registry.
//!
//! Split into focused submodules:
//! - [`handle`] - [`CancellableTask`] trait and the shared [`TaskHandle`]
//! - [`runner`] - [`TaskRunner`], the semaphore-bounded worker pool
//! - [`scheduler`] - [`TaskScheduler`] for delayed and periodic work
//! - [`registry`] - [`TaskRegistry`], id-keyed lookup of live tasks
//!
//! The three services are bundled in [`TaskServices`], which is passed to every
//! task that needs them. All of them reject calls until started.

mod handle;
mod registry;
mod runner;
mod scheduler;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use handle::{CancellableTask, PROGRESS_MAX, PROGRESS_MIN, TaskHandle};
pub use registry::TaskRegistry;
pub use runner::{LogPanicHandler, TaskRunner, WorkerPanicHandler};
pub use scheduler::{ScheduledTask, TaskScheduler};

use std::sync::Arc;

use crate::config::TaskConfig;

/// Runner, scheduler and registry sharing one lifecycle
#[derive(Clone, Debug)]
pub struct TaskServices {
    runner: TaskRunner,
    scheduler: TaskScheduler,
    registry: TaskRegistry,
}

impl TaskServices {
    /// Create stopped services
    pub fn new(config: &TaskConfig) -> Self {
        Self {
            runner: TaskRunner::new(config),
            scheduler: TaskScheduler::new(config),
            registry: TaskRegistry::new(),
        }
    }

    /// Create stopped services whose runner reports panics to `handler`
    pub fn with_panic_handler(config: &TaskConfig, handler: Arc<dyn WorkerPanicHandler>) -> Self {
        Self {
            runner: TaskRunner::with_panic_handler(config, handler),
            scheduler: TaskScheduler::new(config),
            registry: TaskRegistry::new(),
        }
    }

    /// Start all three services
    pub fn start(&self) {
        self.registry.start();
        self.runner.start();
        self.scheduler.start();
        tracing::info!(
            max_workers = self.runner.max_workers(),
            "task services started"
        );
    }

    /// Cancel registered tasks, then stop the scheduler and drain the runner
    pub async fn shutdown(&self) {
        tracing::info!("shutting down task services");
        self.registry.close();
        self.scheduler.shutdown().await;
        self.runner.shutdown().await;
        tracing::info!("task services stopped");
    }

    /// The worker pool
    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    /// The delayed/periodic executor
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// The live-task registry
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }
}
