//! quoteflow: workflow orchestration core for quote-file batch processing.
//!
//! This library compiles batches of quote files into dependency-graph
//! workflows, executes them on a bounded worker pool with retries and
//! timeouts, and monitors them with deduplicated alerts, metrics history
//! and dashboard summaries.

// Core modules
pub mod batch;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod workflow;

// Re-export commonly used types
pub use batch::{BatchCompiler, BatchJob, ConfigMap, FileCheckProcessor, QuoteProcessor};
pub use config::ConfigError;
pub use engine::{handler_fn, Engine, EngineConfig, TaskContext, TaskHandler, WorkflowSnapshot};
pub use error::{
    BatchError, EngineError, MonitorError, OrchestratorError, SubmissionError, TaskError,
};
pub use monitor::{AlertType, MonitorConfig, WorkflowAlert, WorkflowMonitor};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use workflow::{Task, TaskAction, TaskStatus, Workflow, WorkflowStatus};
