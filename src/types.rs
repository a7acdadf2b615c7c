//! Core types for report-ingest

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a cancellable task
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Parent id used when a task has no parent (the all-zero UUID)
    pub const ROOT: TaskId = TaskId(Uuid::nil());

    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Whether this is the all-zero root id
    pub fn is_root(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Lifecycle state of a cancellable task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Constructed, not yet handed to a runner
    Created,
    /// Body is executing
    Running,
    /// Body returned successfully
    Completed,
    /// Body returned an error or panicked
    Failed,
    /// Cancellation was observed before the body finished
    Cancelled,
}

impl TaskState {
    /// Whether the task can no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Whether the task finished, successfully or not (cancellation excluded)
    pub fn is_done(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Point-in-time view of a task, for callers polling through the registry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task identity
    pub id: TaskId,
    /// Parent identity ([`TaskId::ROOT`] when none)
    pub parent: TaskId,
    /// Lifecycle state
    pub state: TaskState,
    /// Progress in percent, terminal states clamped to 0 or 100
    pub progress: f32,
    /// Free-form status text
    pub status: String,
    /// Whether the task recorded an error
    pub error: bool,
    /// When the task was constructed
    pub created_at: DateTime<Utc>,
    /// When the task reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

/// Credentials presented to a report backend
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Account name
    pub username: String,
    /// Account secret
    pub password: String,
}

impl Credentials {
    /// Create credentials
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Whether either field is empty after trimming
    pub fn is_blank(&self) -> bool {
        self.username.trim().is_empty() || self.password.trim().is_empty()
    }
}

// Never print the secret
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One document extracted from a bulk backend response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedReport {
    /// Globally unique report id (used as the file stem)
    pub global_id: String,
    /// Ontology (template) the report conforms to
    pub ontology_id: String,
    /// File extension without the dot (None = configured default)
    pub extension: Option<String>,
    /// Document contents
    pub bytes: Vec<u8>,
}
