//! Metrics module for Prometheus-based monitoring.
//!
//! Counters, gauges and histograms for task attempts, retries, scheduler
//! queue depth, workflow outcomes and alerts.
//!
//! # Example
//!
//! ```ignore
//! use quoteflow::metrics::{export_metrics, init_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run workflows ...
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    ACTIVE_WORKFLOWS, ALERTS_TOTAL, READY_QUEUE_DEPTH, REGISTRY, RUNNING_TASKS, TASKS_TOTAL,
    TASK_DURATION, TASK_RETRIES_TOTAL, WORKFLOWS_TOTAL,
};
