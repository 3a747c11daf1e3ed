//! Per-workflow metrics derived from engine snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::WorkflowSnapshot;
use crate::workflow::WorkflowStatus;

use super::resources::ResourceSample;

/// Metrics of one workflow, refreshed on every poll while it is active and
/// frozen once it reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    /// Completed share of all tasks, in percent.
    pub success_rate: f64,
    /// Mean wall time of tasks that have both started and finished.
    pub average_task_duration_secs: f64,
    /// Highest process memory observed while the workflow was active.
    pub peak_memory_mb: f64,
    /// Process CPU usage at the latest refresh.
    pub cpu_percent: f64,
}

impl WorkflowMetrics {
    /// Starts tracking a workflow.
    pub fn new(snapshot: &WorkflowSnapshot, now: DateTime<Utc>, sample: ResourceSample) -> Self {
        let mut metrics = Self {
            workflow_id: snapshot.id.clone(),
            workflow_name: snapshot.name.clone(),
            status: snapshot.status,
            start_time: snapshot.started_at.unwrap_or(snapshot.created_at),
            end_time: None,
            duration_secs: 0.0,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            success_rate: 0.0,
            average_task_duration_secs: 0.0,
            peak_memory_mb: 0.0,
            cpu_percent: 0.0,
        };
        metrics.refresh(snapshot, now, sample);
        metrics
    }

    /// Updates the metrics from a newer snapshot.
    pub fn refresh(&mut self, snapshot: &WorkflowSnapshot, now: DateTime<Utc>, sample: ResourceSample) {
        if let Some(started) = snapshot.started_at {
            self.start_time = started;
        }
        self.status = snapshot.status;
        self.end_time = snapshot.completed_at;

        let end = self.end_time.unwrap_or(now);
        self.duration_secs = seconds_between(self.start_time, end);

        self.total_tasks = snapshot.total_tasks();
        self.completed_tasks = snapshot.completed_tasks();
        self.failed_tasks = snapshot.failed_tasks();
        self.success_rate = if self.total_tasks == 0 {
            0.0
        } else {
            self.completed_tasks as f64 / self.total_tasks as f64 * 100.0
        };

        let durations: Vec<f64> = snapshot
            .tasks
            .iter()
            .filter_map(|t| Some(seconds_between(t.started_at?, t.completed_at?)))
            .collect();
        self.average_task_duration_secs = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        self.peak_memory_mb = self.peak_memory_mb.max(sample.memory_mb);
        self.cpu_percent = sample.cpu_percent;
    }

    /// Failed share of all tasks as a ratio in `[0, 1]`.
    pub fn failure_ratio(&self) -> f64 {
        if self.total_tasks == 0 {
            0.0
        } else {
            self.failed_tasks as f64 / self.total_tasks as f64
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    ((end - start).num_milliseconds() as f64 / 1000.0).max(0.0)
}
