use super::*;
use crate::error::Error;
use crate::types::{TaskId, TaskState};
use futures::future::BoxFuture;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn config(workers: usize) -> TaskConfig {
    TaskConfig {
        max_workers: workers,
        scheduler_threads: Some(2),
        shutdown_grace: Duration::from_millis(200),
    }
}

fn started(workers: usize) -> TaskServices {
    let services = TaskServices::new(&config(workers));
    services.start();
    services
}

/// Sleeps, then reports `items` processed
struct SleepTask {
    handle: TaskHandle,
    sleep: Duration,
    items: usize,
}

impl SleepTask {
    fn new(sleep: Duration, items: usize) -> Arc<Self> {
        Self::with_parent(None, sleep, items)
    }

    fn with_parent(parent: Option<TaskId>, sleep: Duration, items: usize) -> Arc<Self> {
        Arc::new(Self {
            handle: TaskHandle::new(parent),
            sleep,
            items,
        })
    }
}

impl CancellableTask for SleepTask {
    fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    fn run(self: Arc<Self>) -> BoxFuture<'static, crate::Result<usize>> {
        Box::pin(async move {
            self.handle.set_progress(50.0)?;
            tokio::time::sleep(self.sleep).await;
            Ok(self.items)
        })
    }
}

struct FailingTask {
    handle: TaskHandle,
}

impl CancellableTask for FailingTask {
    fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    fn run(self: Arc<Self>) -> BoxFuture<'static, crate::Result<usize>> {
        Box::pin(async move { Err(Error::Other("backend exploded".to_string())) })
    }
}

struct PanicTask {
    handle: TaskHandle,
}

impl CancellableTask for PanicTask {
    fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    fn run(self: Arc<Self>) -> BoxFuture<'static, crate::Result<usize>> {
        Box::pin(async move {
            let partitions: Vec<usize> = Vec::new();
            Ok(partitions[3])
        })
    }
}

#[derive(Default)]
struct RecordingPanicHandler {
    seen: Mutex<Vec<(String, String)>>,
}

impl WorkerPanicHandler for RecordingPanicHandler {
    fn on_panic(&self, worker: &str, cause: &str) {
        self.seen
            .lock()
            .unwrap()
            .push((worker.to_string(), cause.to_string()));
    }
}

// ---------------------------------------------------------------------------
// TaskHandle
// ---------------------------------------------------------------------------

#[test]
fn new_handle_has_root_parent_and_zero_progress() {
    let handle = TaskHandle::new(None);
    assert!(handle.parent().is_root());
    assert_eq!(handle.state(), TaskState::Created);
    assert_eq!(handle.progress(), 0.0);
    assert!(!handle.has_error());
    assert!(handle.status().is_empty());
    assert!(handle.finished_at().is_none());
}

#[test]
fn set_progress_rejects_out_of_range_values() {
    let handle = TaskHandle::new(None);
    assert!(matches!(
        handle.set_progress(-0.5),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        handle.set_progress(100.5),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        handle.set_progress(f32::NAN),
        Err(Error::InvalidArgument(_))
    ));

    handle.set_progress(37.5).unwrap();
    assert_eq!(handle.progress(), 37.5);
    handle.set_progress(100.0).unwrap();
    assert_eq!(handle.progress(), 100.0);
}

#[test]
fn terminal_states_override_stored_progress() {
    let done = TaskHandle::new(None);
    done.set_progress(42.0).unwrap();
    done.transition(TaskState::Running);
    done.transition(TaskState::Completed);
    assert_eq!(done.progress(), 100.0);
    assert!(done.finished_at().is_some());

    let failed = TaskHandle::new(None);
    failed.set_progress(10.0).unwrap();
    failed.transition(TaskState::Failed);
    assert_eq!(failed.progress(), 100.0);

    let cancelled = TaskHandle::new(None);
    cancelled.set_progress(90.0).unwrap();
    cancelled.cancel();
    assert_eq!(cancelled.progress(), 0.0);
}

#[test]
fn terminal_state_is_final() {
    let handle = TaskHandle::new(None);
    handle.transition(TaskState::Running);
    handle.transition(TaskState::Completed);
    handle.transition(TaskState::Failed);
    handle.cancel();
    assert_eq!(handle.state(), TaskState::Completed);
}

#[tokio::test]
async fn cancel_before_start_resolves_wait() {
    let handle = TaskHandle::new(None);
    handle.cancel();
    assert_eq!(handle.wait().await, TaskState::Cancelled);
    assert!(handle.cancellation_token().is_cancelled());

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.state, TaskState::Cancelled);
    assert!(snapshot.finished_at.is_some());
}

// ---------------------------------------------------------------------------
// TaskRunner
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execute_requires_started_runner() {
    let runner = TaskRunner::new(&config(2));
    let task = SleepTask::new(Duration::ZERO, 1);

    let err = runner.execute(Arc::clone(&task)).await.unwrap_err();
    assert!(matches!(err, Error::NotStarted { component } if component == "task runner"));

    runner.start();
    let join = runner.execute(Arc::clone(&task)).await.unwrap();
    assert_eq!(join.await.unwrap().unwrap(), 1);

    runner.shutdown().await;
    let err = runner.execute(SleepTask::new(Duration::ZERO, 1)).await.unwrap_err();
    assert!(matches!(err, Error::NotStarted { .. }));
}

#[tokio::test]
async fn executed_task_completes_with_full_progress() {
    let services = started(4);
    let task = SleepTask::new(Duration::from_millis(20), 7);

    let join = services.runner().execute(Arc::clone(&task)).await.unwrap();
    assert_eq!(join.await.unwrap().unwrap(), 7);
    assert_eq!(task.handle().wait().await, TaskState::Completed);
    assert_eq!(task.progress(), 100.0);
    assert!(task.is_done());

    services.shutdown().await;
}

#[tokio::test]
async fn failed_task_records_error_and_status() {
    let services = started(4);
    let task = Arc::new(FailingTask {
        handle: TaskHandle::new(None),
    });

    let join = services.runner().execute(Arc::clone(&task)).await.unwrap();
    assert!(matches!(join.await.unwrap(), Err(Error::Other(_))));

    let handle = task.handle();
    assert_eq!(handle.state(), TaskState::Failed);
    assert!(handle.has_error());
    assert!(handle.status().contains("backend exploded"));
    assert!(task.is_done());

    services.shutdown().await;
}

#[tokio::test]
async fn cancelling_running_task_stops_body() {
    let services = started(4);
    let task = SleepTask::new(Duration::from_secs(60), 1);

    let join = services.runner().execute(Arc::clone(&task)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(task.handle().state(), TaskState::Running);

    task.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), join)
        .await
        .expect("cancelled task should stop promptly")
        .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(task.handle().state(), TaskState::Cancelled);
    assert_eq!(task.progress(), 0.0);
    assert!(!task.is_done());

    services.shutdown().await;
}

#[tokio::test]
async fn full_pool_makes_submitters_wait() {
    let services = started(1);
    let runner = services.runner().clone();
    let (release, hold) = tokio::sync::oneshot::channel::<()>();

    let first = runner
        .submit(async move {
            let _ = hold.await;
            1
        })
        .await
        .unwrap();
    assert_eq!(runner.active_workers(), 1);

    let blocked = tokio::time::timeout(Duration::from_millis(50), runner.submit(async { 2 })).await;
    assert!(blocked.is_err(), "submit should wait while the pool is full");

    release.send(()).unwrap();
    assert_eq!(first.await.unwrap(), 1);
    let second = runner.submit(async { 2 }).await.unwrap();
    assert_eq!(second.await.unwrap(), 2);

    services.shutdown().await;
}

#[tokio::test]
async fn panicking_task_is_reported_and_pool_keeps_working() {
    let handler = Arc::new(RecordingPanicHandler::default());
    let services = TaskServices::with_panic_handler(&config(2), handler.clone());
    services.start();

    let task = Arc::new(PanicTask {
        handle: TaskHandle::new(None),
    });
    let join = services.runner().execute(Arc::clone(&task)).await.unwrap();
    let result = join.await.unwrap();
    assert!(matches!(
        result,
        Err(Error::WorkerPanicked { ref cause, .. }) if cause.contains("out of bounds")
    ));
    assert_eq!(task.handle().state(), TaskState::Failed);
    assert!(task.handle().has_error());

    let after = services.runner().submit(async { 5 }).await.unwrap();
    assert_eq!(after.await.unwrap(), 5);
    assert_eq!(handler.seen.lock().unwrap().len(), 1);

    services.shutdown().await;
}

#[tokio::test]
async fn submitted_panic_reaches_handler_and_join_handle() {
    let handler = Arc::new(RecordingPanicHandler::default());
    let runner = TaskRunner::with_panic_handler(&config(2), handler.clone());
    runner.start();

    let join = runner
        .submit(async {
            panic!("boom");
        })
        .await
        .unwrap();
    let err = join.await.unwrap_err();
    assert!(err.is_panic());

    let seen = handler.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].0.starts_with("task-runner-"));
    assert_eq!(seen[0].1, "boom");

    runner.shutdown().await;
}

#[tokio::test]
async fn shutdown_aborts_work_that_outlives_grace() {
    let mut cfg = config(2);
    cfg.shutdown_grace = Duration::from_millis(50);
    let runner = TaskRunner::new(&cfg);
    runner.start();

    let join = runner
        .submit(tokio::time::sleep(Duration::from_secs(60)))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), runner.shutdown())
        .await
        .expect("shutdown should not wait for the straggler");
    assert!(join.await.unwrap_err().is_cancelled());
    assert!(!runner.is_running());
}

#[tokio::test]
async fn shutdown_waits_for_work_within_grace() {
    let runner = TaskRunner::new(&config(2));
    runner.start();
    let done = Arc::new(AtomicUsize::new(0));

    let flag = Arc::clone(&done);
    let join = runner
        .submit(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            flag.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    runner.shutdown().await;
    assert_eq!(done.load(Ordering::SeqCst), 1);
    join.await.unwrap();
}

#[tokio::test]
async fn forced_shutdown_settles_executed_tasks_as_cancelled() {
    let mut cfg = config(2);
    cfg.shutdown_grace = Duration::from_millis(50);
    let runner = TaskRunner::new(&cfg);
    runner.start();

    let task = SleepTask::new(Duration::from_secs(60), 1);
    let join = runner.execute(Arc::clone(&task)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(task.handle().state(), TaskState::Running);

    tokio::time::timeout(Duration::from_secs(5), runner.shutdown())
        .await
        .expect("shutdown should not wait for the sleeping task");

    let state = tokio::time::timeout(Duration::from_secs(1), task.handle().wait())
        .await
        .expect("handle should reach a terminal state");
    assert_eq!(state, TaskState::Cancelled);
    assert!(task.handle().cancellation_token().is_cancelled());
    assert!(task.handle().finished_at().is_some());
    assert_eq!(task.progress(), 0.0);
    assert!(matches!(join.await.unwrap(), Err(Error::Cancelled)));
}

/// Submits one unit of work to the runner and waits for it
struct NestingTask {
    handle: TaskHandle,
    runner: TaskRunner,
}

impl CancellableTask for NestingTask {
    fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    fn run(self: Arc<Self>) -> BoxFuture<'static, crate::Result<usize>> {
        Box::pin(async move {
            let inner = self.runner.submit(async { 3 }).await?;
            inner
                .await
                .map_err(|e| Error::Other(format!("nested work failed: {e}")))
        })
    }

    fn is_composite(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn composite_task_does_not_hold_a_worker_slot() {
    let services = started(1);
    let task = Arc::new(NestingTask {
        handle: TaskHandle::new(None),
        runner: services.runner().clone(),
    });

    let join = services.runner().execute(Arc::clone(&task)).await.unwrap();
    let items = tokio::time::timeout(Duration::from_secs(5), join)
        .await
        .expect("nested work should get the only worker slot")
        .unwrap()
        .unwrap();
    assert_eq!(items, 3);
    assert_eq!(task.handle().state(), TaskState::Completed);
    assert_eq!(services.runner().active_workers(), 0);

    services.shutdown().await;
}

// ---------------------------------------------------------------------------
// TaskScheduler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn schedule_requires_started_scheduler() {
    let scheduler = TaskScheduler::new(&config(1));
    assert!(matches!(
        scheduler.schedule_once(Duration::ZERO, async {}),
        Err(Error::NotStarted { component }) if component == "task scheduler"
    ));
}

#[tokio::test]
async fn schedule_once_runs_after_delay() {
    let services = started(1);
    let started_at = tokio::time::Instant::now();

    let join = services
        .scheduler()
        .schedule_once(Duration::from_millis(30), async { "tick" })
        .unwrap();
    assert_eq!(join.await.unwrap().unwrap(), "tick");
    assert!(started_at.elapsed() >= Duration::from_millis(30));

    services.shutdown().await;
}

#[tokio::test]
async fn pending_once_job_is_cancelled_by_shutdown() {
    let services = started(1);
    let join = services
        .scheduler()
        .schedule_once(Duration::from_secs(60), async { 1 })
        .unwrap();

    services.shutdown().await;
    assert!(matches!(join.await.unwrap(), Err(Error::Cancelled)));
}

#[tokio::test]
async fn fixed_rate_job_stops_on_shutdown() {
    let services = started(1);
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&runs);
    let job = services
        .scheduler()
        .schedule_at_fixed_rate(Duration::ZERO, Duration::from_millis(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    services.shutdown().await;
    let after_shutdown = runs.load(Ordering::SeqCst);
    assert!(after_shutdown >= 2, "expected several runs, got {after_shutdown}");
    assert!(job.is_finished());

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(runs.load(Ordering::SeqCst), after_shutdown);
}

#[tokio::test]
async fn fixed_delay_job_can_be_cancelled() {
    let services = started(1);
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&runs);
    let job = services
        .scheduler()
        .schedule_with_fixed_delay(Duration::ZERO, Duration::from_millis(5), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    job.cancel();
    job.join().await;
    let stopped_at = runs.load(Ordering::SeqCst);
    assert!(stopped_at >= 2);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(runs.load(Ordering::SeqCst), stopped_at);

    services.shutdown().await;
}

#[tokio::test]
async fn zero_period_is_rejected() {
    let services = started(1);
    let result =
        services
            .scheduler()
            .schedule_at_fixed_rate(Duration::ZERO, Duration::ZERO, || async {});
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    services.shutdown().await;
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

#[test]
fn registry_rejects_calls_while_inactive() {
    let registry = TaskRegistry::new();
    let task: Arc<dyn CancellableTask> = SleepTask::new(Duration::ZERO, 0);

    assert!(matches!(
        registry.add(&task),
        Err(Error::NotStarted { component }) if component == "task registry"
    ));
    assert!(registry.get(task.id()).is_err());
    assert!(registry.remove(task.id()).is_err());
}

#[test]
fn added_task_is_returned_by_get() {
    let registry = TaskRegistry::new();
    registry.start();
    let task: Arc<dyn CancellableTask> = SleepTask::new(Duration::ZERO, 0);

    registry.add(&task).unwrap();
    let found = registry.get(task.id()).unwrap().expect("task registered");
    assert_eq!(found.id(), task.id());
    assert!(std::ptr::addr_eq(Arc::as_ptr(&found), Arc::as_ptr(&task)));
    assert_eq!(registry.len(), 1);

    let removed = registry.remove(task.id()).unwrap();
    assert!(removed.is_some());
    assert!(registry.get(task.id()).unwrap().is_none());
    assert!(registry.is_empty());
}

#[test]
fn dropped_task_disappears_from_registry() {
    let registry = TaskRegistry::new();
    registry.start();
    let task: Arc<dyn CancellableTask> = SleepTask::new(Duration::ZERO, 0);
    let id = task.id();

    registry.add(&task).unwrap();
    drop(task);
    assert!(registry.get(id).unwrap().is_none());
    assert_eq!(registry.len(), 0);
}

#[test]
fn children_lists_tasks_by_parent() {
    let registry = TaskRegistry::new();
    registry.start();

    let parent: Arc<dyn CancellableTask> = SleepTask::new(Duration::ZERO, 0);
    let a: Arc<dyn CancellableTask> = SleepTask::with_parent(Some(parent.id()), Duration::ZERO, 0);
    let b: Arc<dyn CancellableTask> = SleepTask::with_parent(Some(parent.id()), Duration::ZERO, 0);
    let unrelated: Arc<dyn CancellableTask> = SleepTask::new(Duration::ZERO, 0);
    for task in [&parent, &a, &b, &unrelated] {
        registry.add(task).unwrap();
    }

    let mut children: Vec<TaskId> = registry
        .children(parent.id())
        .unwrap()
        .iter()
        .map(|t| t.id())
        .collect();
    children.sort();
    let mut expected = vec![a.id(), b.id()];
    expected.sort();
    assert_eq!(children, expected);

    let roots = registry.children(TaskId::ROOT).unwrap();
    assert_eq!(roots.len(), 2);
}

#[test]
fn close_cancels_registered_tasks() {
    let registry = TaskRegistry::new();
    registry.start();
    let task: Arc<dyn CancellableTask> = SleepTask::new(Duration::ZERO, 0);
    registry.add(&task).unwrap();

    registry.close();
    assert!(!registry.is_active());
    assert_eq!(task.handle().state(), TaskState::Cancelled);
    assert!(registry.get(task.id()).is_err());
}

// ---------------------------------------------------------------------------
// TaskServices
// ---------------------------------------------------------------------------

#[tokio::test]
async fn services_shutdown_cancels_running_registered_task() {
    let services = started(2);
    let task = SleepTask::new(Duration::from_secs(60), 1);
    let as_dyn: Arc<dyn CancellableTask> = task.clone();
    services.registry().add(&as_dyn).unwrap();

    let join = services.runner().execute(Arc::clone(&task)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(5), services.shutdown())
        .await
        .expect("shutdown should finish promptly");
    assert!(matches!(join.await.unwrap(), Err(Error::Cancelled)));
    assert_eq!(task.handle().state(), TaskState::Cancelled);
}
