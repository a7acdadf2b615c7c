//! Bounded worker pool for task bodies and arbitrary futures.

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::handle::CancellableTask;
use crate::config::TaskConfig;
use crate::error::{Error, Result};

const COMPONENT: &str = "task runner";

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const CLOSED: u8 = 2;

/// Receives notice of a worker whose future panicked
pub trait WorkerPanicHandler: Send + Sync {
    /// Called on the panicking worker before the panic reaches its `JoinHandle`
    fn on_panic(&self, worker: &str, cause: &str);
}

/// Default handler: logs the panic at error level
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPanicHandler;

impl WorkerPanicHandler for LogPanicHandler {
    fn on_panic(&self, worker: &str, cause: &str) {
        tracing::error!(worker = %worker, cause = %cause, "worker terminated abnormally");
    }
}

/// Semaphore-bounded pool of tokio tasks
///
/// At most [`TaskConfig::worker_limit`] futures run at once; further submissions
/// wait for a free slot. Tasks that report [`CancellableTask::is_composite`]
/// run beside the pool instead of inside it. The runner must be
/// [started](Self::start) before it accepts work and refuses work again once
/// [shut down](Self::shutdown).
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    lifecycle: AtomicU8,
    max_workers: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    stopping: CancellationToken,
    in_flight: Mutex<HashMap<u64, AbortHandle>>,
    next_worker: AtomicU64,
    shutdown_grace: Duration,
    panic_handler: Arc<dyn WorkerPanicHandler>,
}

impl TaskRunner {
    /// Create a stopped runner that logs worker panics
    pub fn new(config: &TaskConfig) -> Self {
        Self::with_panic_handler(config, Arc::new(LogPanicHandler))
    }

    /// Create a stopped runner with a custom panic handler
    pub fn with_panic_handler(config: &TaskConfig, handler: Arc<dyn WorkerPanicHandler>) -> Self {
        let max_workers = config.worker_limit();
        Self {
            inner: Arc::new(RunnerInner {
                lifecycle: AtomicU8::new(IDLE),
                max_workers,
                permits: Arc::new(Semaphore::new(max_workers)),
                tracker: TaskTracker::new(),
                stopping: CancellationToken::new(),
                in_flight: Mutex::new(HashMap::new()),
                next_worker: AtomicU64::new(1),
                shutdown_grace: config.shutdown_grace,
                panic_handler: handler,
            }),
        }
    }

    /// Begin accepting work. A closed runner stays closed.
    pub fn start(&self) {
        let _ = self.inner.lifecycle.compare_exchange(
            IDLE,
            RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Whether the runner currently accepts work
    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.load(Ordering::Acquire) == RUNNING
    }

    /// Pool size
    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Number of futures currently holding a worker slot
    pub fn active_workers(&self) -> usize {
        self.inner
            .max_workers
            .saturating_sub(self.inner.permits.available_permits())
    }

    /// Run `fut` on the pool, waiting for a free worker first.
    ///
    /// If `fut` panics, the panic handler is told and the returned handle
    /// yields a panic [`JoinError`](tokio::task::JoinError).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] if the runner is not started or closes while
    /// the caller waits for a slot.
    pub async fn submit<F, T>(&self, fut: F) -> Result<JoinHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_running()?;
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::NotStarted {
                component: COMPONENT,
            })?;
        self.ensure_running()?;
        Ok(self.spawn(Some(permit), fut))
    }

    fn spawn<F, T>(&self, permit: Option<OwnedSemaphorePermit>, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = self.inner.next_worker.fetch_add(1, Ordering::Relaxed);
        let worker = format!("task-runner-{slot}");
        let handler = Arc::clone(&self.inner.panic_handler);
        let inner = Arc::clone(&self.inner);

        let join = self.inner.tracker.spawn(async move {
            let _permit = permit;
            let outcome = AssertUnwindSafe(fut).catch_unwind().await;
            inner.forget(slot);
            match outcome {
                Ok(value) => value,
                Err(payload) => {
                    handler.on_panic(&worker, &panic_message(payload.as_ref()));
                    std::panic::resume_unwind(payload)
                }
            }
        });
        self.inner.remember(slot, join.abort_handle());
        join
    }

    /// Run a task body on the pool and drive its handle's lifecycle.
    ///
    /// The handle moves to `Running` when the body starts, then to `Completed`,
    /// `Failed` or `Cancelled`. Cancelling the task's token stops the body with
    /// [`Error::Cancelled`], as does a runner shutdown that outlasts its grace
    /// period. A panicking body is reported as [`Error::WorkerPanicked`] and
    /// marks the task failed.
    ///
    /// Composite tasks start at once without taking a worker slot, so the work
    /// they submit can never wait on the slot they hold.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] if the runner is not started.
    pub async fn execute<T>(&self, task: Arc<T>) -> Result<JoinHandle<Result<usize>>>
    where
        T: CancellableTask + ?Sized,
    {
        let handler = Arc::clone(&self.inner.panic_handler);
        let stopping = self.inner.stopping.clone();
        let composite = task.is_composite();
        let driver = async move {
            let handle = task.handle();
            if !handle.begin() {
                return Err(Error::Cancelled);
            }
            let token = handle.cancellation_token().clone();
            let body = AssertUnwindSafe(Arc::clone(&task).run()).catch_unwind();

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::Cancelled),
                _ = stopping.cancelled() => {
                    token.cancel();
                    Err(Error::Cancelled)
                }
                outcome = body => match outcome {
                    Ok(result) => result,
                    Err(payload) => {
                        let worker = format!("task-{}", handle.id());
                        let cause = panic_message(payload.as_ref());
                        handler.on_panic(&worker, &cause);
                        Err(Error::WorkerPanicked { worker, cause })
                    }
                },
            };

            handle.finish(&result);
            if let Err(e) = &result
                && !e.is_cancelled()
            {
                tracing::warn!(task_id = %handle.id(), error = %e, "task failed");
            }
            result
        };

        if composite {
            self.ensure_running()?;
            Ok(self.spawn(None, driver))
        } else {
            self.submit(driver).await
        }
    }

    /// Stop accepting work and drain the pool.
    ///
    /// In-flight work gets `shutdown_grace` to finish. After that, executed
    /// tasks are cancelled and settle as `Cancelled`; whatever is still running
    /// one more grace period later is aborted.
    pub async fn shutdown(&self) {
        let previous = self.inner.lifecycle.swap(CLOSED, Ordering::AcqRel);
        if previous == CLOSED {
            return;
        }
        self.inner.permits.close();
        self.inner.tracker.close();

        let grace = self.inner.shutdown_grace;
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                grace_ms = grace.as_millis(),
                "task runner grace period elapsed, cancelling remaining tasks"
            );
            self.inner.stopping.cancel();
            if tokio::time::timeout(grace, self.inner.tracker.wait())
                .await
                .is_err()
            {
                let stragglers = self.inner.abort_all();
                tracing::warn!(stragglers, "aborting work that ignored cancellation");
                self.inner.tracker.wait().await;
            }
        }
        tracing::debug!("task runner stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::NotStarted {
                component: COMPONENT,
            })
        }
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("running", &self.is_running())
            .field("max_workers", &self.inner.max_workers)
            .field("active_workers", &self.active_workers())
            .finish()
    }
}

impl RunnerInner {
    fn remember(&self, slot: u64, handle: AbortHandle) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|_, h| !h.is_finished());
        if !handle.is_finished() {
            in_flight.insert(slot, handle);
        }
    }

    fn forget(&self, slot: u64) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&slot);
    }

    fn abort_all(&self) -> usize {
        let drained: Vec<AbortHandle> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, h)| h)
            .collect();
        let count = drained.iter().filter(|h| !h.is_finished()).count();
        for handle in drained {
            handle.abort();
        }
        count
    }
}

/// Render a panic payload as text
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
