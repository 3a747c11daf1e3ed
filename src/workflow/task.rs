//! Task definitions for the workflow graph.
//!
//! - `Task`: A node in the workflow graph
//! - `TaskAction`: Named handler plus positional arguments to run
//! - `TaskStatus`: Lifecycle state of a task

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default timeout for a task body.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default number of attempts before a task is marked failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies.
    Pending,
    /// All dependencies completed; queued for dispatch.
    Ready,
    /// Body is executing on a worker.
    Running,
    /// Body returned a result.
    Completed,
    /// Failed after exhausting retries, or an ancestor failed.
    Failed,
    /// Failed an attempt and is waiting out its backoff delay.
    Retrying,
    /// Cancelled before completion.
    Cancelled,
}

impl TaskStatus {
    /// Returns whether the status can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Retrying => write!(f, "retrying"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Reference to the executable unit of a task.
///
/// The handler is looked up by name in the engine's registry, which keeps the
/// graph itself serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAction {
    /// Registered handler name (e.g. "batch.validate").
    pub handler: String,
    /// Positional arguments passed to the handler.
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

impl TaskAction {
    /// Creates an action with no arguments.
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            args: Vec::new(),
        }
    }

    /// Appends a positional argument.
    pub fn arg(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.args.push(value.into());
        self
    }
}

/// A node in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Identifier, unique within its workflow.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Handler and arguments to execute.
    pub action: TaskAction,
    /// Ids of tasks that must complete before this one may run.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Maximum time a single attempt may run.
    pub timeout: Duration,
    /// Maximum number of attempts.
    pub max_retries: u32,
    /// Number of failed attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Current status.
    pub status: TaskStatus,
    /// When the latest attempt started.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Value returned by the handler.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Error text of the latest failure.
    #[serde(default)]
    pub error: Option<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Task {
    /// Creates a pending task with default timeout and retry budget.
    pub fn new(id: impl Into<String>, name: impl Into<String>, action: TaskAction) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            action,
            depends_on: BTreeSet::new(),
            timeout: DEFAULT_TASK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// Adds a single dependency.
    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.depends_on.insert(task_id.into());
        self
    }

    /// Adds several dependencies.
    pub fn depends_on_all<I, S>(mut self, task_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(task_ids.into_iter().map(Into::into));
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Wall-clock time spent in the latest attempt, if it started.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.completed_at.unwrap_or(now) - started)
    }

    /// Clears runtime state so the task can be submitted fresh.
    pub(crate) fn reset(&mut self) {
        self.retry_count = 0;
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.result = None;
        self.error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_new_defaults() {
        let task = Task::new("prepare", "Prepare batch", TaskAction::new("batch.prepare"));

        assert_eq!(task.id, "prepare");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.timeout, DEFAULT_TASK_TIMEOUT);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.retry_count, 0);
        assert!(task.depends_on.is_empty());
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new(
            "consolidate",
            "Consolidate",
            TaskAction::new("batch.consolidate").arg("x"),
        )
        .depends_on_all(["validate_0", "validate_1"])
        .depends_on("validate_0")
        .with_timeout(Duration::from_secs(5))
        .with_max_retries(1)
        .with_metadata("stage", serde_json::json!("consolidation"));

        assert_eq!(task.depends_on.len(), 2);
        assert_eq!(task.timeout, Duration::from_secs(5));
        assert_eq!(task.max_retries, 1);
        assert_eq!(task.action.args, vec![serde_json::json!("x")]);
        assert_eq!(task.metadata["stage"], "consolidation");
    }

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Retrying).expect("serialize");
        assert_eq!(json, "\"retrying\"");
        assert_eq!(TaskStatus::Ready.to_string(), "ready");
    }

    #[test]
    fn test_elapsed() {
        let mut task = Task::new("t", "t", TaskAction::new("noop"));
        let now = Utc::now();
        assert!(task.elapsed(now).is_none());

        task.started_at = Some(now - chrono::Duration::seconds(90));
        assert_eq!(task.elapsed(now), Some(chrono::Duration::seconds(90)));
    }
}
