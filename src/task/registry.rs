//! Process-wide lookup of live tasks by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use super::handle::CancellableTask;
use crate::error::{Error, Result};
use crate::types::{TaskId, TaskSnapshot};

const COMPONENT: &str = "task registry";

/// Registry of running tasks
///
/// Entries are weak: a task that has been dropped everywhere else disappears
/// from lookups even if nobody removed it.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    active: AtomicBool,
    tasks: RwLock<HashMap<TaskId, Weak<dyn CancellableTask>>>,
}

impl TaskRegistry {
    /// Create an inactive registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting calls
    pub fn start(&self) {
        self.inner.active.store(true, Ordering::Release);
    }

    /// Whether the registry is active
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Register `task` under its own id, replacing any previous entry
    pub fn add(&self, task: &Arc<dyn CancellableTask>) -> Result<()> {
        self.ensure_active()?;
        let mut tasks = self.write();
        tasks.retain(|_, weak| weak.strong_count() > 0);
        tasks.insert(task.id(), Arc::downgrade(task));
        Ok(())
    }

    /// Look up a live task
    pub fn get(&self, id: TaskId) -> Result<Option<Arc<dyn CancellableTask>>> {
        self.ensure_active()?;
        Ok(self.read().get(&id).and_then(Weak::upgrade))
    }

    /// Unregister a task, returning it if it was still alive
    pub fn remove(&self, id: TaskId) -> Result<Option<Arc<dyn CancellableTask>>> {
        self.ensure_active()?;
        Ok(self.write().remove(&id).and_then(|weak| weak.upgrade()))
    }

    /// Live tasks whose parent is `parent`
    pub fn children(&self, parent: TaskId) -> Result<Vec<Arc<dyn CancellableTask>>> {
        self.ensure_active()?;
        Ok(self
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|task| task.handle().parent() == parent)
            .collect())
    }

    /// Snapshot of a live task
    pub fn snapshot(&self, id: TaskId) -> Result<Option<TaskSnapshot>> {
        Ok(self.get(id)?.map(|task| task.handle().snapshot()))
    }

    /// Number of live registered tasks
    pub fn len(&self) -> usize {
        self.read()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Whether no live task is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deactivate and cancel every task still registered
    pub fn close(&self) {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<_> = self.write().drain().map(|(_, weak)| weak).collect();
        let mut cancelled = 0usize;
        for task in drained.iter().filter_map(Weak::upgrade) {
            if !task.handle().is_finished() {
                task.cancel();
                cancelled += 1;
            }
        }
        tracing::debug!(cancelled, "task registry closed");
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::NotStarted {
                component: COMPONENT,
            })
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, Weak<dyn CancellableTask>>> {
        self.inner.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, Weak<dyn CancellableTask>>> {
        self.inner.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("active", &self.is_active())
            .field("tasks", &self.len())
            .finish()
    }
}
