//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by quoteflow and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all quoteflow metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Task attempts finished, labeled by outcome status and handler.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task attempt duration in seconds, labeled by handler.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Retries scheduled, labeled by handler.
pub static TASK_RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of tasks waiting in the ready queue.
pub static READY_QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of task bodies currently executing.
pub static RUNNING_TASKS: OnceLock<Gauge> = OnceLock::new();

/// Workflows that reached a terminal status, labeled by status.
pub static WORKFLOWS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of workflows the monitor currently tracks as active.
pub static ACTIVE_WORKFLOWS: OnceLock<Gauge> = OnceLock::new();

/// Alerts raised by the monitor, labeled by type and severity.
pub static ALERTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Calling it
/// again is harmless: the first registered set stays in effect.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Task metrics
    let tasks_total = CounterVec::new(
        Opts::new("quoteflow_tasks_total", "Total number of task attempts finished"),
        &["status", "handler"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "quoteflow_task_duration_seconds",
            "Task attempt duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0]),
        &["handler"],
    )?;

    let task_retries_total = CounterVec::new(
        Opts::new("quoteflow_task_retries_total", "Total number of retries scheduled"),
        &["handler"],
    )?;

    // Scheduler metrics
    let ready_queue_depth = Gauge::new(
        "quoteflow_ready_queue_depth",
        "Number of tasks waiting for a worker",
    )?;

    let running_tasks = Gauge::new(
        "quoteflow_running_tasks",
        "Number of task bodies currently executing",
    )?;

    // Workflow metrics
    let workflows_total = CounterVec::new(
        Opts::new(
            "quoteflow_workflows_total",
            "Total number of workflows that reached a terminal status",
        ),
        &["status"],
    )?;

    let active_workflows = Gauge::new(
        "quoteflow_active_workflows",
        "Number of workflows tracked as active by the monitor",
    )?;

    // Alert metrics
    let alerts_total = CounterVec::new(
        Opts::new("quoteflow_alerts_total", "Total number of alerts raised"),
        &["alert_type", "severity"],
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(task_retries_total.clone()))?;
    registry.register(Box::new(ready_queue_depth.clone()))?;
    registry.register(Box::new(running_tasks.clone()))?;
    registry.register(Box::new(workflows_total.clone()))?;
    registry.register(Box::new(active_workflows.clone()))?;
    registry.register(Box::new(alerts_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = TASK_RETRIES_TOTAL.set(task_retries_total);
    let _ = READY_QUEUE_DEPTH.set(ready_queue_depth);
    let _ = RUNNING_TASKS.set(running_tasks);
    let _ = WORKFLOWS_TOTAL.set(workflows_total);
    let _ = ACTIVE_WORKFLOWS.set(active_workflows);
    let _ = ALERTS_TOTAL.set(alerts_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem instead.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        assert!(!metrics.starts_with("# Error"));
    }
}
