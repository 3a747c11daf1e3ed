//! Read-only views of workflow state returned by the engine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::{Task, TaskStatus, Workflow, WorkflowStatus};

/// Point-in-time copy of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub handler: String,
    pub status: TaskStatus,
    pub depends_on: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            handler: task.action.handler.clone(),
            status: task.status,
            depends_on: task.depends_on.iter().cloned().collect(),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            started_at: task.started_at,
            completed_at: task.completed_at,
            error: task.error.clone(),
            result: task.result.clone(),
        }
    }
}

/// Progress counters of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    /// Completed share in percent (100 for an empty workflow).
    pub percent: f64,
}

/// Point-in-time copy of a workflow and its tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub priority: i32,
    pub max_concurrent_tasks: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub tasks: Vec<TaskSnapshot>,
}

impl From<&Workflow> for WorkflowSnapshot {
    fn from(workflow: &Workflow) -> Self {
        Self {
            id: workflow.id.clone(),
            name: workflow.name.clone(),
            status: workflow.status,
            priority: workflow.priority,
            max_concurrent_tasks: workflow.max_concurrent_tasks,
            created_at: workflow.created_at,
            started_at: workflow.started_at,
            completed_at: workflow.completed_at,
            metadata: workflow.metadata.clone(),
            tasks: workflow.tasks.iter().map(TaskSnapshot::from).collect(),
        }
    }
}

impl WorkflowSnapshot {
    /// Number of tasks currently in `status`.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn total_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn completed_tasks(&self) -> usize {
        self.count(TaskStatus::Completed)
    }

    pub fn failed_tasks(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    pub fn running_tasks(&self) -> usize {
        self.count(TaskStatus::Running)
    }

    pub fn progress(&self) -> Progress {
        let completed = self.completed_tasks();
        let total = self.total_tasks();
        let percent = if total == 0 {
            100.0
        } else {
            completed as f64 / total as f64 * 100.0
        };
        Progress {
            completed,
            total,
            percent,
        }
    }

    /// `(task id, error)` for every failed task.
    pub fn errors(&self) -> Vec<(String, String)> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .filter_map(|t| t.error.clone().map(|e| (t.id.clone(), e)))
            .collect()
    }

    pub fn task(&self, id: &str) -> Option<&TaskSnapshot> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
