//! A group of import tasks run together and reported as one.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ImportConfig;
use crate::error::{Error, Result};
use crate::task::{CancellableTask, PROGRESS_MAX, PROGRESS_MIN, TaskHandle, TaskServices};
use crate::types::TaskId;

#[derive(Default)]
struct Members {
    tasks: Vec<Arc<dyn CancellableTask>>,
    submitted: bool,
}

/// Runs its member tasks on the task runner and aggregates their progress
///
/// Progress is recomputed on a scheduler tick every `poll_interval` and never
/// reads 100 while a member is still unfinished. Before submission the group
/// reports 0 and is not done.
pub struct ImportGroupTask {
    handle: TaskHandle,
    services: TaskServices,
    poll_interval: Duration,
    tick_timeout: Duration,
    members: Mutex<Members>,
}

impl ImportGroupTask {
    /// Create an empty group
    pub fn new(services: &TaskServices, config: &ImportConfig) -> Arc<Self> {
        Arc::new(Self {
            handle: TaskHandle::new(None),
            services: services.clone(),
            poll_interval: config.poll_interval,
            tick_timeout: config.tick_timeout,
            members: Mutex::new(Members::default()),
        })
    }

    /// Add a member
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadySubmitted`] once the group has been submitted.
    pub async fn add_task(&self, task: Arc<dyn CancellableTask>) -> Result<()> {
        let mut members = self.members.lock().await;
        if members.submitted {
            return Err(Error::AlreadySubmitted(self.handle.id()));
        }
        members.tasks.push(task);
        Ok(())
    }

    /// Number of members
    pub async fn len(&self) -> usize {
        self.members.lock().await.tasks.len()
    }

    /// Whether the group has no members
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether [`submit`](Self::submit) has succeeded
    pub async fn is_submitted(&self) -> bool {
        self.members.lock().await.submitted
    }

    /// Register the group and its members, then start the driver on the runner.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if no member was added
    /// - [`Error::AlreadySubmitted`] on a second call
    /// - [`Error::NotStarted`] if the services are not running
    pub async fn submit(self: &Arc<Self>) -> Result<JoinHandle<Result<usize>>> {
        {
            let mut members = self.members.lock().await;
            if members.submitted {
                return Err(Error::AlreadySubmitted(self.handle.id()));
            }
            if members.tasks.is_empty() {
                return Err(Error::InvalidArgument(
                    "import group has no tasks".to_string(),
                ));
            }

            let registry = self.services.registry();
            let group: Arc<dyn CancellableTask> = Arc::clone(self) as Arc<dyn CancellableTask>;
            registry.add(&group)?;
            for task in &members.tasks {
                registry.add(task)?;
            }
            members.submitted = true;
        }
        tracing::info!(group_id = %self.handle.id(), "import group submitted");
        self.services.runner().execute(Arc::clone(self)).await
    }

    /// Recompute aggregate progress from the members.
    ///
    /// The result is the mean of member progress, lowered by one point while any
    /// member is not done, so 100 is only reported once every member finished.
    /// The value is stored on the group only after submission.
    pub async fn tick(&self) -> f32 {
        let members = self.members.lock().await;
        let progress = aggregate(&members.tasks);
        if members.submitted
            && let Err(e) = self.handle.set_progress(progress)
        {
            tracing::debug!(error = %e, "group progress rejected");
        }
        progress
    }

    async fn drive(self: Arc<Self>) -> Result<usize> {
        let tasks = self.members.lock().await.tasks.clone();
        let group_id = self.handle.id();

        for task in &tasks {
            self.services.runner().execute(Arc::clone(task)).await?;
        }
        self.handle
            .set_status(format!("running {} import tasks", tasks.len()));

        loop {
            let group = Arc::clone(&self);
            let tick = self
                .services
                .scheduler()
                .schedule_once(self.poll_interval, async move { group.tick().await })?;

            let progress = match tokio::time::timeout(self.tick_timeout, tick).await {
                Ok(Ok(Ok(progress))) => progress,
                Ok(Ok(Err(e))) => return Err(e),
                Ok(Err(join)) => {
                    return Err(Error::Other(format!("group progress tick failed: {join}")));
                }
                Err(_) => {
                    self.handle.set_error(true);
                    self.handle.set_status(format!(
                        "group progress tick did not finish within {:?}",
                        self.tick_timeout
                    ));
                    tracing::warn!(group_id = %group_id, "group progress tick timed out");
                    return Err(Error::Timeout {
                        operation: "group progress tick".to_string(),
                        after: self.tick_timeout,
                    });
                }
            };
            tracing::debug!(group_id = %group_id, progress, "group progress");

            let all_finished = tasks.iter().all(|t| t.handle().is_finished());
            if progress >= PROGRESS_MAX || all_finished {
                break;
            }
        }

        let unsuccessful = tasks
            .iter()
            .filter(|t| t.handle().has_error() || t.handle().is_cancelled())
            .count();
        if unsuccessful > 0 {
            self.handle.set_error(true);
            self.handle.set_status(format!(
                "{unsuccessful} of {} import tasks did not complete cleanly",
                tasks.len()
            ));
        } else {
            self.handle
                .set_status(format!("{} import tasks finished", tasks.len()));
        }

        if let Err(e) = self.services.registry().remove(group_id) {
            tracing::debug!(group_id = %group_id, error = %e, "could not unregister import group");
        }
        Ok(tasks.len())
    }

    /// Id of the group, for use as the parent of its members
    pub fn group_id(&self) -> TaskId {
        self.handle.id()
    }
}

fn aggregate(tasks: &[Arc<dyn CancellableTask>]) -> f32 {
    if tasks.is_empty() {
        return PROGRESS_MIN;
    }
    let mean = tasks.iter().map(|t| t.progress()).sum::<f32>() / tasks.len() as f32;
    if tasks.iter().all(|t| t.is_done()) {
        mean.min(PROGRESS_MAX)
    } else {
        (mean - 1.0).max(PROGRESS_MIN)
    }
}

impl CancellableTask for ImportGroupTask {
    fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    fn run(self: Arc<Self>) -> BoxFuture<'static, Result<usize>> {
        Box::pin(self.drive())
    }

    fn is_composite(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for ImportGroupTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportGroupTask")
            .field("id", &self.handle.id())
            .field("state", &self.handle.state())
            .field("progress", &self.handle.progress())
            .finish_non_exhaustive()
    }
}
