//! Workflow monitoring: metrics, alerts and the dashboard.
//!
//! The [`WorkflowMonitor`] polls the engine on a fixed interval, keeps
//! [`WorkflowMetrics`] for every active workflow, archives finished ones,
//! evaluates the alert rules and serves [`DashboardData`].
//!
//! # Alert rules
//!
//! | Type                | Trigger                                     | Severity |
//! |---------------------|---------------------------------------------|----------|
//! | `workflow_timeout`  | workflow running longer than the threshold  | high     |
//! | `task_timeout`      | a running task older than the threshold     | medium   |
//! | `high_failure_rate` | failed/total tasks above the threshold      | medium   |
//! | `high_memory`       | process memory above the threshold          | medium   |
//! | `high_cpu`          | process CPU above the threshold             | low      |
//!
//! Repeats of the same `(workflow, type)` pair are suppressed for the dedup
//! window. Host-level alerts use the workflow id `"system"`.

mod alerts;
mod config;
mod metrics;
mod records;
mod resources;
mod service;

pub use alerts::{
    AlertDeduplicator, AlertHandler, AlertSeverity, AlertType, WorkflowAlert, SYSTEM_WORKFLOW_ID,
};
pub use config::MonitorConfig;
pub use metrics::WorkflowMetrics;
pub use records::{read_records, RecordEntry, RecordWriter, ALERTS_RECORD_FILE, METRICS_RECORD_FILE};
pub use resources::{ProcessSampler, ResourceSample, ResourceSampler, StaticSampler};
pub use service::{DashboardData, PollReport, WorkflowMonitor, WorkflowProgress};
