//! Cancellable task state shared between a task body, its runner and its observers.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::{TaskId, TaskSnapshot, TaskState};

/// Lower bound of reported progress
pub const PROGRESS_MIN: f32 = 0.0;
/// Upper bound of reported progress
pub const PROGRESS_MAX: f32 = 100.0;

/// A unit of cancellable, progress-tracked work
///
/// Implementors own a [`TaskHandle`] and provide the body in [`run`](Self::run).
/// The body is started by [`TaskRunner::execute`](super::TaskRunner::execute), which
/// drives the handle through `Created -> Running -> Completed | Failed | Cancelled`.
pub trait CancellableTask: Send + Sync + 'static {
    /// Shared state of this task
    fn handle(&self) -> &TaskHandle;

    /// The task body; returns the number of items it processed
    fn run(self: Arc<Self>) -> BoxFuture<'static, Result<usize>>;

    /// Task identity
    fn id(&self) -> TaskId {
        self.handle().id()
    }

    /// Progress in percent, clamped to 0 when cancelled and 100 when done
    fn progress(&self) -> f32 {
        self.handle().progress()
    }

    /// Whether the body finished (successfully or not)
    fn is_done(&self) -> bool {
        self.handle().is_done()
    }

    /// Ask the body to stop; does not wait
    fn cancel(&self) {
        self.handle().cancel()
    }

    /// Whether the body mostly waits on other work it submits to the runner.
    /// Composite tasks do not hold a worker slot while they run.
    fn is_composite(&self) -> bool {
        false
    }
}

/// Identity, progress, status and lifecycle of one task
///
/// Progress and status are written by the owning task's body only; everything is
/// readable from any thread.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    parent: TaskId,
    progress: AtomicU32,
    status: RwLock<String>,
    error: AtomicBool,
    state: watch::Sender<TaskState>,
    token: CancellationToken,
    created_at: DateTime<Utc>,
    finished_at: OnceLock<DateTime<Utc>>,
}

impl TaskHandle {
    /// Create a handle with a fresh id; `parent` defaults to [`TaskId::ROOT`]
    pub fn new(parent: Option<TaskId>) -> Self {
        let (state, _) = watch::channel(TaskState::Created);
        Self {
            id: TaskId::new(),
            parent: parent.unwrap_or(TaskId::ROOT),
            progress: AtomicU32::new(PROGRESS_MIN.to_bits()),
            status: RwLock::new(String::new()),
            error: AtomicBool::new(false),
            state,
            token: CancellationToken::new(),
            created_at: Utc::now(),
            finished_at: OnceLock::new(),
        }
    }

    /// Task identity
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Parent identity ([`TaskId::ROOT`] when none was given)
    pub fn parent(&self) -> TaskId {
        self.parent
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Progress in percent
    ///
    /// Terminal states override the stored value: cancelled reports exactly 0,
    /// completed or failed reports exactly 100.
    pub fn progress(&self) -> f32 {
        match self.state() {
            TaskState::Cancelled => PROGRESS_MIN,
            TaskState::Completed | TaskState::Failed => PROGRESS_MAX,
            TaskState::Created | TaskState::Running => {
                f32::from_bits(self.progress.load(Ordering::Acquire))
            }
        }
    }

    /// Store a new progress value
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `value` is NaN or outside `[0, 100]`.
    pub fn set_progress(&self, value: f32) -> Result<()> {
        if !(PROGRESS_MIN..=PROGRESS_MAX).contains(&value) {
            return Err(Error::InvalidArgument(format!(
                "progress must be within [0, 100], got {value}"
            )));
        }
        self.progress.store(value.to_bits(), Ordering::Release);
        Ok(())
    }

    /// Store `value` only if it exceeds the current progress
    ///
    /// Lets concurrent workers of one task report progress without it moving
    /// backwards. Returns the progress in effect afterwards.
    ///
    /// # Errors
    ///
    /// Same as [`set_progress`](Self::set_progress).
    pub fn raise_progress(&self, value: f32) -> Result<f32> {
        if !(PROGRESS_MIN..=PROGRESS_MAX).contains(&value) {
            return Err(Error::InvalidArgument(format!(
                "progress must be within [0, 100], got {value}"
            )));
        }
        let previous = self
            .progress
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                (value > f32::from_bits(bits)).then_some(value.to_bits())
            });
        Ok(match previous {
            Ok(_) => value,
            Err(bits) => f32::from_bits(bits),
        })
    }

    /// Current status text
    pub fn status(&self) -> String {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the status text
    pub fn set_status(&self, status: impl Into<String>) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status.into();
    }

    /// Whether the task recorded an error
    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    /// Set or clear the error flag
    pub fn set_error(&self, error: bool) {
        self.error.store(error, Ordering::Release);
    }

    /// Whether the body finished (successfully or not)
    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Whether the task was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// Whether the task reached any terminal state
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Token observed by the task body
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Request cancellation
    ///
    /// A task that never started moves straight to `Cancelled`; a running body
    /// observes the token and is stopped by its runner.
    pub fn cancel(&self) {
        self.token.cancel();
        self.state.send_if_modified(|state| {
            if *state == TaskState::Created {
                *state = TaskState::Cancelled;
                true
            } else {
                false
            }
        });
        if self.is_cancelled() {
            self.stamp_finished();
        }
    }

    /// Wait until the task reaches a terminal state and return it
    pub async fn wait(&self) -> TaskState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            // The sender lives in `self`, so this is unreachable while we hold `&self`
            Err(_) => self.state(),
        }
    }

    /// When the task was constructed
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the task reached a terminal state
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at.get().copied()
    }

    /// Point-in-time view of the task
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            parent: self.parent,
            state: self.state(),
            progress: self.progress(),
            status: self.status(),
            error: self.has_error(),
            created_at: self.created_at,
            finished_at: self.finished_at(),
        }
    }

    /// `Created -> Running`; returns false if the task was cancelled first.
    pub(crate) fn begin(&self) -> bool {
        if self.token.is_cancelled() {
            self.cancel();
            return false;
        }
        self.state.send_if_modified(|state| {
            if *state == TaskState::Created {
                *state = TaskState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Move to the terminal state matching `result`. Terminal states are final.
    pub(crate) fn finish(&self, result: &Result<usize>) {
        let next = match result {
            Ok(_) => TaskState::Completed,
            Err(Error::Cancelled) => TaskState::Cancelled,
            Err(e) => {
                self.set_error(true);
                if self.status().is_empty() {
                    self.set_status(e.to_string());
                }
                TaskState::Failed
            }
        };
        self.transition(next);
    }

    pub(crate) fn transition(&self, next: TaskState) {
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed && next.is_terminal() {
            self.stamp_finished();
        }
    }

    fn stamp_finished(&self) {
        let _ = self.finished_at.set(Utc::now());
    }
}
