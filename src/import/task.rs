//! Partitioned import of one center's reports into a directory tree.

use futures::future::BoxFuture;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backend::{BulkParser, ReportBackend};
use crate::config::ImportConfig;
use crate::error::{Error, ImportError, Result};
use crate::task::{CancellableTask, PROGRESS_MAX, TaskHandle, TaskServices};
use crate::types::{Credentials, ParsedReport, TaskId};
use crate::utils::{ensure_writable_dir, remove_if_exists, safe_component, staging_path};

/// Parameters for [`ImportTask::new`]
#[derive(Clone)]
pub struct ImportTaskParams {
    /// Where reports come from
    pub backend: Arc<dyn ReportBackend>,
    /// How bulk payloads are split into documents
    pub parser: Arc<dyn BulkParser>,
    /// Center whose reports are imported; also the first directory level
    pub center: String,
    /// Credentials for the backend
    pub credentials: Credentials,
    /// Report ids; duplicates are fetched once
    pub ids: Vec<String>,
    /// Requested ids per backend call, clamped to `[1, max_batch]`
    pub partition_size: usize,
    /// Root of the output tree
    pub dest_dir: PathBuf,
    /// Owning group, if any
    pub parent: Option<TaskId>,
}

impl std::fmt::Debug for ImportTaskParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportTaskParams")
            .field("center", &self.center)
            .field("credentials", &self.credentials)
            .field("ids", &self.ids.len())
            .field("partition_size", &self.partition_size)
            .field("dest_dir", &self.dest_dir)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

/// Imports a set of reports in partitions fetched concurrently on the task runner
///
/// Every partition is fetched with one backend call, parsed, and written to
/// `dest_dir/<center>/ontology_<ontology>/<global id>.<ext>`. A failed partition
/// does not stop the others; the task records the shortfall in its status and
/// error flag and still completes.
pub struct ImportTask {
    handle: TaskHandle,
    backend: Arc<dyn ReportBackend>,
    parser: Arc<dyn BulkParser>,
    center: String,
    credentials: Credentials,
    ids: BTreeSet<String>,
    partition_size: usize,
    dest_dir: PathBuf,
    services: TaskServices,
    timeout: Duration,
    default_extension: String,
    pending: AtomicUsize,
    fetched: AtomicUsize,
}

impl ImportTask {
    /// Validate `params` and prepare the destination directory.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a blank or path-unsafe center, or blank credentials
    /// - [`ImportError::InvalidDestination`] if `dest_dir` cannot be used
    pub async fn new(
        params: ImportTaskParams,
        services: &TaskServices,
        config: &ImportConfig,
    ) -> Result<Arc<Self>> {
        let center = params.center.trim();
        if center.is_empty() {
            return Err(Error::InvalidArgument("center name is blank".to_string()));
        }
        let center = safe_component(center)
            .map_err(|_| {
                Error::InvalidArgument(format!(
                    "center name {center:?} is not a valid path component"
                ))
            })?
            .to_string();
        if params.credentials.is_blank() {
            return Err(Error::InvalidArgument(
                "backend credentials are blank".to_string(),
            ));
        }

        ensure_writable_dir(&params.dest_dir).await?;

        let max_batch = config.max_batch.max(1);
        let partition_size = params.partition_size.clamp(1, max_batch);
        if partition_size != params.partition_size {
            tracing::debug!(
                requested = params.partition_size,
                effective = partition_size,
                "partition size clamped"
            );
        }

        let ids: BTreeSet<String> = params.ids.into_iter().collect();

        Ok(Arc::new(Self {
            handle: TaskHandle::new(params.parent),
            backend: params.backend,
            parser: params.parser,
            center,
            credentials: params.credentials,
            ids,
            partition_size,
            dest_dir: params.dest_dir,
            services: services.clone(),
            timeout: config.import_timeout,
            default_extension: config.default_extension.clone(),
            pending: AtomicUsize::new(0),
            fetched: AtomicUsize::new(0),
        }))
    }

    /// Center being imported
    pub fn center(&self) -> &str {
        &self.center
    }

    /// Distinct report ids, in sorted order
    pub fn ids(&self) -> &BTreeSet<String> {
        &self.ids
    }

    /// Effective partition size
    pub fn partition_size(&self) -> usize {
        self.partition_size
    }

    /// Ids submitted to partition workers so far
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Reports written so far
    pub fn fetched(&self) -> usize {
        self.fetched.load(Ordering::Acquire)
    }

    /// Stable split of the distinct ids into chunks of at most `partition_size`
    pub fn partitions(&self) -> Vec<Vec<String>> {
        let ids: Vec<String> = self.ids.iter().cloned().collect();
        ids.chunks(self.partition_size)
            .map(<[String]>::to_vec)
            .collect()
    }

    /// Register this task and run it on the task runner
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] if the services are not running.
    pub async fn submit(self: &Arc<Self>) -> Result<JoinHandle<Result<usize>>> {
        let task: Arc<dyn CancellableTask> = Arc::clone(self) as Arc<dyn CancellableTask>;
        self.services.registry().add(&task)?;
        self.services.runner().execute(Arc::clone(self)).await
    }

    async fn import(self: Arc<Self>) -> Result<usize> {
        let partitions = self.partitions();
        let total = self.ids.len();
        let partition_count = partitions.len();
        tracing::info!(
            task_id = %self.id(),
            center = %self.center,
            reports = total,
            partitions = partition_count,
            "starting import"
        );
        self.handle.set_status(format!(
            "importing {total} reports in {partition_count} partitions"
        ));

        // Cancelled on timeout; a child of the task token so task cancellation reaches it too
        let workers = self.handle.cancellation_token().child_token();

        self.pending.fetch_add(total, Ordering::AcqRel);
        // Waiting for worker slots counts against the import timeout too
        let dispatch = async {
            let mut joins = Vec::with_capacity(partition_count);
            for (index, ids) in partitions.into_iter().enumerate() {
                let task = Arc::clone(&self);
                let token = workers.child_token();
                let join = self
                    .services
                    .runner()
                    .submit(async move { task.run_partition(index, ids, token).await })
                    .await?;
                joins.push(join);
            }
            Ok::<_, Error>(futures::future::join_all(joins).await)
        };

        let results = match tokio::time::timeout(self.timeout, dispatch).await {
            Ok(results) => results?,
            Err(_) => {
                workers.cancel();
                self.handle.set_error(true);
                self.handle.set_status(format!(
                    "import timed out after {:?} with {} of {total} reports stored",
                    self.timeout,
                    self.fetched()
                ));
                tracing::warn!(
                    task_id = %self.id(),
                    timeout_ms = self.timeout.as_millis(),
                    fetched = self.fetched(),
                    "import timed out"
                );
                return Err(Error::Timeout {
                    operation: format!("import of {total} reports for center {}", self.center),
                    after: self.timeout,
                });
            }
        };

        let mut failed = 0usize;
        for (index, result) in results.into_iter().enumerate() {
            let error = match result {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(join) => join.to_string(),
            };
            failed += 1;
            tracing::warn!(
                task_id = %self.id(),
                partition = index,
                error = %error,
                "partition import failed"
            );
        }

        let fetched = self.fetched();
        if failed > 0 {
            self.handle.set_error(true);
            self.handle.set_status(format!(
                "not all reports were imported: {failed} of {partition_count} partitions failed, \
                 {fetched} of {total} reports stored"
            ));
        } else {
            self.handle.set_status(format!("imported {fetched} reports"));
        }

        if let Err(e) = self.services.registry().remove(self.id()) {
            tracing::debug!(task_id = %self.id(), error = %e, "could not unregister import task");
        }
        tracing::info!(
            task_id = %self.id(),
            fetched,
            failed_partitions = failed,
            "import finished"
        );
        Ok(fetched)
    }

    async fn run_partition(
        self: Arc<Self>,
        index: usize,
        ids: Vec<String>,
        token: CancellationToken,
    ) -> Result<usize> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = self.fetch_and_store(index, &ids) => result,
        }
    }

    /// One backend call for the whole partition, then one file per parsed report.
    async fn fetch_and_store(&self, index: usize, ids: &[String]) -> Result<usize> {
        let payload = self
            .backend
            .fetch_batch(&self.center, &self.credentials, ids)
            .await?;

        let parser = Arc::clone(&self.parser);
        let reports = tokio::task::spawn_blocking(move || parser.parse_bulk(&payload))
            .await
            .map_err(|e| Error::Other(format!("bulk parser failed: {e}")))?;

        let mut stored = 0usize;
        for report in &reports {
            match self.store(report).await {
                Ok(path) => {
                    stored += 1;
                    self.record_fetched();
                    tracing::trace!(path = %path.display(), "report stored");
                }
                Err(e) => {
                    tracing::warn!(
                        partition = index,
                        global_id = %report.global_id,
                        error = %e,
                        "failed to store report"
                    );
                }
            }
        }

        if stored != ids.len() {
            return Err(ImportError::PartitionIncomplete {
                expected: ids.len(),
                stored,
            }
            .into());
        }
        Ok(stored)
    }

    /// Write `report` into its place in the output tree via a staging file.
    async fn store(&self, report: &ParsedReport) -> Result<PathBuf> {
        let ontology = safe_component(&report.ontology_id)?;
        let stem = safe_component(&report.global_id)?;
        let extension = safe_component(
            report
                .extension
                .as_deref()
                .unwrap_or(&self.default_extension),
        )?;

        let dir = self
            .dest_dir
            .join(&self.center)
            .join(format!("ontology_{ontology}"));
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{stem}.{extension}"));
        write_atomically(&path, &report.bytes).await?;
        Ok(path)
    }

    fn record_fetched(&self) {
        let fetched = self.fetched.fetch_add(1, Ordering::AcqRel) + 1;
        let pending = self.pending.load(Ordering::Acquire).max(1);
        let progress = (fetched as f32 * PROGRESS_MAX / pending as f32).min(PROGRESS_MAX);
        if let Err(e) = self.handle.raise_progress(progress) {
            tracing::debug!(error = %e, "progress update rejected");
        }
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let staging = staging_path(path, "part");
    let written = async {
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, path).await
    }
    .await;
    if let Err(e) = written {
        if let Err(cleanup) = remove_if_exists(&staging).await {
            tracing::debug!(
                path = %staging.display(),
                error = %cleanup,
                "failed to remove staging file"
            );
        }
        return Err(e.into());
    }
    Ok(())
}

impl CancellableTask for ImportTask {
    fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    fn run(self: Arc<Self>) -> BoxFuture<'static, Result<usize>> {
        Box::pin(self.import())
    }

    fn is_composite(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for ImportTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportTask")
            .field("id", &self.handle.id())
            .field("center", &self.center)
            .field("ids", &self.ids.len())
            .field("partition_size", &self.partition_size)
            .field("pending", &self.pending())
            .field("fetched", &self.fetched())
            .finish_non_exhaustive()
    }
}
