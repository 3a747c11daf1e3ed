//! Typed view of a batch configuration map.

use std::time::Duration;

use serde_json::Value;

use crate::error::BatchError;
use crate::workflow::{DEFAULT_MAX_CONCURRENT_TASKS, DEFAULT_MAX_RETRIES, DEFAULT_TASK_TIMEOUT};

use super::job::ConfigMap;

/// Default number of files per processing group.
pub const DEFAULT_GROUP_SIZE: usize = 5;

/// Batches with more files than this are processed in groups.
pub const DEFAULT_GROUP_THRESHOLD: usize = 5;

/// Options recognised in a batch configuration map.
///
/// Keys are camelCase to match what callers put in the map:
/// `maxConcurrentTasksPerWorkflow`, `groupSize`, `groupThreshold`,
/// `taskTimeoutMinutes`, `maxRetries`, `autoRetry`, `skipInvalidFiles`.
/// Unknown keys are left alone and still reach the processor.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSettings {
    /// Explicit per-workflow concurrency cap.
    pub max_concurrent_tasks: Option<usize>,
    pub group_size: usize,
    pub group_threshold: usize,
    pub task_timeout: Duration,
    pub max_retries: u32,
    pub auto_retry: bool,
    pub skip_invalid_files: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: None,
            group_size: DEFAULT_GROUP_SIZE,
            group_threshold: DEFAULT_GROUP_THRESHOLD,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            auto_retry: true,
            skip_invalid_files: false,
        }
    }
}

impl BatchSettings {
    /// Parses the recognised options out of `config`.
    ///
    /// # Errors
    ///
    /// Returns `BatchError::InvalidConfig` when a recognised key has a value
    /// of the wrong type or out of range.
    pub fn from_config(config: &ConfigMap) -> Result<Self, BatchError> {
        let mut settings = Self::default();

        if let Some(max) = positive(config, "maxConcurrentTasksPerWorkflow")? {
            settings.max_concurrent_tasks = Some(max as usize);
        }
        if let Some(size) = positive(config, "groupSize")? {
            settings.group_size = size as usize;
        }
        if let Some(threshold) = unsigned(config, "groupThreshold")? {
            settings.group_threshold = threshold as usize;
        }
        if let Some(minutes) = number(config, "taskTimeoutMinutes")? {
            if !minutes.is_finite() || minutes <= 0.0 {
                return Err(invalid(
                    "taskTimeoutMinutes",
                    "must be a finite number greater than 0",
                ));
            }
            settings.task_timeout = Duration::try_from_secs_f64(minutes * 60.0)
                .map_err(|_| invalid("taskTimeoutMinutes", "value is too large"))?;
        }
        if let Some(retries) = positive(config, "maxRetries")? {
            settings.max_retries = u32::try_from(retries)
                .map_err(|_| invalid("maxRetries", "value is too large"))?;
        }
        if let Some(auto_retry) = boolean(config, "autoRetry")? {
            settings.auto_retry = auto_retry;
        }
        if let Some(skip) = boolean(config, "skipInvalidFiles")? {
            settings.skip_invalid_files = skip;
        }

        Ok(settings)
    }

    /// Concurrency cap for a batch of `file_count` files: the configured
    /// value, or `min(3, file_count)`, never below 1.
    pub fn concurrency_for(&self, file_count: usize) -> usize {
        self.max_concurrent_tasks
            .unwrap_or_else(|| DEFAULT_MAX_CONCURRENT_TASKS.min(file_count))
            .max(1)
    }

    /// Whether `file_count` files are processed in groups.
    pub fn uses_groups(&self, file_count: usize) -> bool {
        file_count > self.group_threshold
    }
}

fn invalid(key: &str, message: impl Into<String>) -> BatchError {
    BatchError::InvalidConfig {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Numeric option; numbers and numeric strings are accepted.
fn number(config: &ConfigMap, key: &str) -> Result<Option<f64>, BatchError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| invalid(key, "not a finite number")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|e| invalid(key, format!("'{}': {}", s, e))),
        Some(other) => Err(invalid(key, format!("expected a number, got {}", other))),
    }
}

fn unsigned(config: &ConfigMap, key: &str) -> Result<Option<u64>, BatchError> {
    let Some(value) = number(config, key)? else {
        return Ok(None);
    };
    if value < 0.0 || value.fract() != 0.0 || !value.is_finite() {
        return Err(invalid(key, format!("expected a non-negative integer, got {}", value)));
    }
    Ok(Some(value as u64))
}

fn positive(config: &ConfigMap, key: &str) -> Result<Option<u64>, BatchError> {
    match unsigned(config, key)? {
        Some(0) => Err(invalid(key, "must be greater than 0")),
        other => Ok(other),
    }
}

fn boolean(config: &ConfigMap, key: &str) -> Result<Option<bool>, BatchError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(invalid(key, format!("'{}' is not a boolean", s))),
        },
        Some(other) => Err(invalid(key, format!("expected a boolean, got {}", other))),
    }
}
