//! Delayed and periodic work.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::TaskConfig;
use crate::error::{Error, Result};

const COMPONENT: &str = "task scheduler";

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const CLOSED: u8 = 2;

/// Handle to a periodic job
#[derive(Debug)]
pub struct ScheduledTask {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl ScheduledTask {
    /// Stop the job after its current run, if any
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the job has stopped
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the job to stop
    pub async fn join(self) {
        if let Err(e) = self.join.await
            && e.is_panic()
        {
            tracing::error!(error = %e, "periodic job panicked");
        }
    }
}

/// Runs futures after a delay or on a period
///
/// Runs are bounded by [`TaskConfig::scheduler_limit`]. Shutting down cancels
/// all pending and periodic work; a run in progress is dropped at its next
/// await point.
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Debug)]
struct SchedulerInner {
    lifecycle: AtomicU8,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl TaskScheduler {
    /// Create a stopped scheduler
    pub fn new(config: &TaskConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                lifecycle: AtomicU8::new(IDLE),
                permits: Arc::new(Semaphore::new(config.scheduler_limit())),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Begin accepting work. A closed scheduler stays closed.
    pub fn start(&self) {
        let _ = self.inner.lifecycle.compare_exchange(
            IDLE,
            RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Whether the scheduler currently accepts work
    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.load(Ordering::Acquire) == RUNNING
    }

    /// Run `fut` once after `delay`.
    ///
    /// The handle yields [`Error::Cancelled`] if the scheduler shuts down first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] if the scheduler is not running.
    pub fn schedule_once<F, T>(&self, delay: Duration, fut: F) -> Result<JoinHandle<Result<T>>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_running()?;
        let shutdown = self.inner.shutdown.clone();
        let permits = Arc::clone(&self.inner.permits);

        Ok(self.inner.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => Err(Error::Cancelled),
                value = async {
                    tokio::time::sleep(delay).await;
                    // A closed semaphore means shutdown, which the other branch observes
                    let _permit = permits.acquire_owned().await.ok();
                    fut.await
                } => Ok(value),
            }
        }))
    }

    /// Run `job` every `period`, starting after `initial`.
    ///
    /// Runs that overrun the period are followed immediately by the next one
    /// until the schedule catches up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a zero period and
    /// [`Error::NotStarted`] if the scheduler is not running.
    pub fn schedule_at_fixed_rate<F, Fut>(
        &self,
        initial: Duration,
        period: Duration,
        mut job: F,
    ) -> Result<ScheduledTask>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            return Err(Error::InvalidArgument(
                "fixed-rate period must be non-zero".to_string(),
            ));
        }
        let permits = Arc::clone(&self.inner.permits);
        self.spawn_periodic(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + initial, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                interval.tick().await;
                let Ok(_permit) = permits.acquire().await else {
                    break;
                };
                job().await;
            }
        })
    }

    /// Run `job` repeatedly with `delay` between the end of one run and the
    /// start of the next, starting after `initial`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] if the scheduler is not running.
    pub fn schedule_with_fixed_delay<F, Fut>(
        &self,
        initial: Duration,
        delay: Duration,
        mut job: F,
    ) -> Result<ScheduledTask>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.inner.permits);
        self.spawn_periodic(async move {
            tokio::time::sleep(initial).await;
            loop {
                {
                    let Ok(_permit) = permits.acquire().await else {
                        break;
                    };
                    job().await;
                }
                tokio::time::sleep(delay).await;
            }
        })
    }

    /// Cancel all outstanding work and wait for it to unwind
    pub async fn shutdown(&self) {
        let previous = self.inner.lifecycle.swap(CLOSED, Ordering::AcqRel);
        if previous == CLOSED {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.permits.close();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::debug!("task scheduler stopped");
    }

    fn spawn_periodic<L>(&self, body: L) -> Result<ScheduledTask>
    where
        L: Future<Output = ()> + Send + 'static,
    {
        self.ensure_running()?;
        let token = self.inner.shutdown.child_token();
        let stop = token.clone();
        let join = self.inner.tracker.spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = body => {}
            }
        });
        Ok(ScheduledTask { token, join })
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
