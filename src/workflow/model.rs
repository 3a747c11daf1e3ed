//! Workflow definitions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::Task;

/// Default cap on concurrently running tasks of one workflow.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 3;

/// Lifecycle state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Submitted, no task dispatched yet.
    Pending,
    /// At least one task has been dispatched.
    Running,
    /// Every task completed.
    Completed,
    /// At least one task ended failed.
    Failed,
    /// Explicitly cancelled before natural completion.
    Cancelled,
}

impl WorkflowStatus {
    /// Returns whether the status can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A named graph of tasks executed as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Scheduling priority (higher values are dispatched sooner).
    pub priority: i32,
    /// Maximum number of tasks of this workflow running at once.
    pub max_concurrent_tasks: usize,
    /// Whether failed tasks are retried.
    pub auto_retry: bool,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Tasks in definition order.
    pub tasks: Vec<Task>,
    /// Overall status.
    pub status: WorkflowStatus,
    /// When the workflow object was created.
    pub created_at: DateTime<Utc>,
    /// When the first task was dispatched.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the workflow reached a terminal status.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Creates an empty workflow with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            priority: 0,
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            auto_retry: true,
            metadata: HashMap::new(),
            tasks: Vec::new(),
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Overrides the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the per-workflow concurrency cap.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Enables or disables retries.
    pub fn with_auto_retry(mut self, auto_retry: bool) -> Self {
        self.auto_retry = auto_retry;
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Appends a task.
    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Appends a task in place.
    pub fn add_task(&mut self, task: Task) {
        self.tasks.push(task);
    }

    /// Looks up a task by id.
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}
