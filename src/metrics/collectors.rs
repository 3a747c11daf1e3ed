//! Metric recording facade used by the engine and the monitor.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics. Every method is a
//! no-op until `init_metrics()` has run, so library users who never export
//! metrics pay nothing beyond a `OnceLock` read.

use super::prometheus::{
    ACTIVE_WORKFLOWS, ALERTS_TOTAL, READY_QUEUE_DEPTH, RUNNING_TASKS, TASKS_TOTAL, TASK_DURATION,
    TASK_RETRIES_TOTAL, WORKFLOWS_TOTAL,
};

/// Metrics collector for recording scheduler and monitor metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a finished task attempt.
    ///
    /// # Arguments
    ///
    /// * `status` - Outcome ("completed", "failed", "timeout", "cancelled")
    /// * `handler` - Handler name of the task
    /// * `duration_secs` - Attempt duration in seconds
    pub fn record_task(&self, status: &str, handler: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[status, handler]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[handler])
                .observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            handler = handler,
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    /// Record a scheduled retry.
    pub fn record_retry(&self, handler: &str) {
        if let Some(retries) = TASK_RETRIES_TOTAL.get() {
            retries.with_label_values(&[handler]).inc();
        }
    }

    /// Record a workflow reaching a terminal status.
    pub fn record_workflow(&self, status: &str) {
        if let Some(workflows_total) = WORKFLOWS_TOTAL.get() {
            workflows_total.with_label_values(&[status]).inc();
        }

        tracing::trace!(status = status, "Recorded workflow metric");
    }

    /// Record an alert raised by the monitor.
    pub fn record_alert(&self, alert_type: &str, severity: &str) {
        if let Some(alerts_total) = ALERTS_TOTAL.get() {
            alerts_total.with_label_values(&[alert_type, severity]).inc();
        }
    }

    /// Update the scheduler gauges.
    ///
    /// # Arguments
    ///
    /// * `ready` - Tasks waiting in the ready queue
    /// * `running` - Task bodies currently executing
    pub fn update_scheduler(&self, ready: usize, running: usize) {
        if let Some(depth) = READY_QUEUE_DEPTH.get() {
            depth.set(ready as f64);
        }

        if let Some(running_tasks) = RUNNING_TASKS.get() {
            running_tasks.set(running as f64);
        }

        tracing::trace!(ready = ready, running = running, "Updated scheduler metrics");
    }

    /// Update the number of active workflows.
    pub fn update_active_workflows(&self, count: usize) {
        if let Some(active) = ACTIVE_WORKFLOWS.get() {
            active.set(count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_task_and_retry() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_task("completed", "batch.validate", 0.4);
        collector.record_task("failed", "batch.process", 12.0);
        collector.record_retry("batch.process");

        let text = export_metrics();
        assert!(text.contains("quoteflow_tasks_total"));
        assert!(text.contains("quoteflow_task_retries_total"));
    }

    #[test]
    fn test_record_workflow_and_alert() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_workflow("completed");
        collector.record_alert("task_timeout", "medium");

        let text = export_metrics();
        assert!(text.contains("quoteflow_workflows_total"));
        assert!(text.contains("quoteflow_alerts_total"));
    }

    #[test]
    fn test_update_gauges() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_scheduler(5, 2);
        collector.update_active_workflows(3);
    }
}
