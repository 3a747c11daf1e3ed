//! Error types for quoteflow operations.
//!
//! Defines error types for each subsystem:
//! - Workflow submission and graph validation
//! - Task execution (failures, timeouts, cancellation)
//! - Engine lifecycle
//! - Batch compilation
//! - Monitoring and record persistence

use std::time::Duration;

use thiserror::Error;

/// Errors raised synchronously by `Engine::submit`. Nothing is stored when one
/// of these is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("Workflow '{0}' already exists")]
    DuplicateWorkflow(String),

    #[error("Task '{0}' is defined more than once")]
    DuplicateTask(String),

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    MissingDependency { task: String, dependency: String },

    #[error("Circular dependency detected between tasks: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    #[error("Task '{task}' references unregistered handler '{handler}'")]
    UnknownHandler { task: String, handler: String },

    #[error("Workflow '{0}' must allow at least one concurrent task")]
    ZeroConcurrency(String),
}

/// Errors produced while running a single task body.
///
/// `Execution` and `Timeout` are consumed by the retry policy; `Cancelled` is
/// terminal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("{0}")]
    Execution(String),

    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task was cancelled")]
    Cancelled,
}

impl TaskError {
    /// Builds an execution error from anything displayable.
    pub fn execution(message: impl std::fmt::Display) -> Self {
        TaskError::Execution(message.to_string())
    }

    /// Returns whether the retry policy may run the task again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TaskError::Cancelled)
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Execution(format!("{:#}", err))
    }
}

/// Errors related to the engine lifecycle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Engine is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}; running tasks were signalled to cancel")]
    ShutdownTimeout(Duration),

    #[error("Workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("Timed out after {0:?} waiting for workflow to finish")]
    WaitTimeout(Duration),
}

/// Errors that can occur while compiling or scheduling a batch.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Batch contains no input files")]
    NoFiles,

    #[error("Invalid value for config option '{key}': {message}")]
    InvalidConfig { key: String, message: String },

    #[error("Submission rejected: {0}")]
    Submission(#[from] SubmissionError),
}

/// Errors raised by the workflow monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Monitor is already running")]
    AlreadyRunning,

    #[error("Monitor is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the orchestrator lifecycle.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_error_display() {
        let err = SubmissionError::MissingDependency {
            task: "process".to_string(),
            dependency: "ghost".to_string(),
        };
        assert!(err.to_string().contains("ghost"));

        let err = SubmissionError::CycleDetected(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            err.to_string(),
            "Circular dependency detected between tasks: a, b"
        );
    }

    #[test]
    fn test_task_error_retryable() {
        assert!(TaskError::execution("boom").is_retryable());
        assert!(TaskError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!TaskError::Cancelled.is_retryable());
    }

    #[test]
    fn test_task_error_from_anyhow() {
        let err: TaskError = anyhow::anyhow!("disk full").context("writing sheet").into();
        assert_eq!(err, TaskError::Execution("writing sheet: disk full".to_string()));
    }

    #[test]
    fn test_batch_error_from_submission() {
        let err: BatchError = SubmissionError::DuplicateTask("prepare".to_string()).into();
        assert!(err.to_string().contains("prepare"));
    }
}
