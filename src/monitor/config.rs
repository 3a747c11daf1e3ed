//! Monitor configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::{env_value, ConfigError};

/// Configuration for the workflow monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Interval between polls of the engine.
    pub poll_interval: Duration,
    /// A RUNNING task older than this raises `task_timeout`.
    pub task_timeout: Duration,
    /// A workflow running longer than this raises `workflow_timeout`.
    pub workflow_timeout: Duration,
    /// Process memory above this raises `high_memory`.
    pub memory_threshold_mb: f64,
    /// Process CPU above this raises `high_cpu`.
    pub cpu_threshold_percent: f64,
    /// Failed/total task ratio above this raises `high_failure_rate`.
    pub failure_rate_threshold: f64,
    /// Number of archived workflow metrics kept in memory.
    pub history_capacity: usize,
    /// Repeats of the same (workflow, alert type) inside this window are
    /// suppressed.
    pub dedup_window: Duration,
    /// Acknowledged alerts older than this are purged.
    pub alert_retention: Duration,
    /// Directory for `workflow_metrics.jsonl` and `workflow_alerts.jsonl`.
    /// Nothing is persisted when unset.
    pub records_dir: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            task_timeout: Duration::from_secs(30 * 60),
            workflow_timeout: Duration::from_secs(4 * 60 * 60),
            memory_threshold_mb: 1000.0,
            cpu_threshold_percent: 80.0,
            failure_rate_threshold: 0.2,
            history_capacity: 100,
            dedup_window: Duration::from_secs(300),
            alert_retention: Duration::from_secs(24 * 60 * 60),
            records_dir: None,
        }
    }
}

/// camelCase option names accepted by [`MonitorConfig::apply_options`].
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonitorOptions {
    task_timeout_minutes: Option<f64>,
    workflow_timeout_hours: Option<f64>,
    #[serde(rename = "memoryThresholdMB")]
    memory_threshold_mb: Option<f64>,
    cpu_threshold_percent: Option<f64>,
    failure_rate_threshold: Option<f64>,
    poll_interval_seconds: Option<f64>,
    completed_history_capacity: Option<usize>,
    alert_dedup_window_seconds: Option<f64>,
}

impl MonitorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `QUOTEFLOW_POLL_INTERVAL_SECS`: Poll interval (default: 5)
    /// - `QUOTEFLOW_TASK_TIMEOUT_MINUTES`: Task alert threshold (default: 30)
    /// - `QUOTEFLOW_WORKFLOW_TIMEOUT_HOURS`: Workflow alert threshold (default: 4)
    /// - `QUOTEFLOW_MEMORY_THRESHOLD_MB`: Memory alert threshold (default: 1000)
    /// - `QUOTEFLOW_CPU_THRESHOLD_PERCENT`: CPU alert threshold (default: 80)
    /// - `QUOTEFLOW_FAILURE_RATE_THRESHOLD`: Failure ratio threshold (default: 0.2)
    /// - `QUOTEFLOW_HISTORY_CAPACITY`: Archived metrics kept (default: 100)
    /// - `QUOTEFLOW_ALERT_DEDUP_SECS`: Dedup window (default: 300)
    /// - `QUOTEFLOW_RECORDS_DIR`: Directory for JSONL records (default: unset)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(secs) = env_value::<f64>("QUOTEFLOW_POLL_INTERVAL_SECS")? {
            config.poll_interval = seconds("QUOTEFLOW_POLL_INTERVAL_SECS", secs)?;
        }
        if let Some(minutes) = env_value::<f64>("QUOTEFLOW_TASK_TIMEOUT_MINUTES")? {
            config.task_timeout = seconds("QUOTEFLOW_TASK_TIMEOUT_MINUTES", minutes * 60.0)?;
        }
        if let Some(hours) = env_value::<f64>("QUOTEFLOW_WORKFLOW_TIMEOUT_HOURS")? {
            config.workflow_timeout =
                seconds("QUOTEFLOW_WORKFLOW_TIMEOUT_HOURS", hours * 3600.0)?;
        }
        if let Some(mb) = env_value("QUOTEFLOW_MEMORY_THRESHOLD_MB")? {
            config.memory_threshold_mb = mb;
        }
        if let Some(percent) = env_value("QUOTEFLOW_CPU_THRESHOLD_PERCENT")? {
            config.cpu_threshold_percent = percent;
        }
        if let Some(ratio) = env_value("QUOTEFLOW_FAILURE_RATE_THRESHOLD")? {
            config.failure_rate_threshold = ratio;
        }
        if let Some(capacity) = env_value("QUOTEFLOW_HISTORY_CAPACITY")? {
            config.history_capacity = capacity;
        }
        if let Some(secs) = env_value::<f64>("QUOTEFLOW_ALERT_DEDUP_SECS")? {
            config.dedup_window = seconds("QUOTEFLOW_ALERT_DEDUP_SECS", secs)?;
        }
        if let Ok(dir) = std::env::var("QUOTEFLOW_RECORDS_DIR") {
            if !dir.trim().is_empty() {
                config.records_dir = Some(PathBuf::from(dir));
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Overrides values from a camelCase option map such as
    /// `{"taskTimeoutMinutes": 10, "memoryThresholdMB": 2048}`.
    ///
    /// Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a recognised key has the wrong type or the
    /// result fails validation.
    pub fn apply_options(mut self, options: &Map<String, Value>) -> Result<Self, ConfigError> {
        let parsed: MonitorOptions = serde_json::from_value(Value::Object(options.clone()))
            .map_err(|e| ConfigError::InvalidValue {
                key: "monitor options".to_string(),
                message: e.to_string(),
            })?;

        if let Some(minutes) = parsed.task_timeout_minutes {
            self.task_timeout = seconds("taskTimeoutMinutes", minutes * 60.0)?;
        }
        if let Some(hours) = parsed.workflow_timeout_hours {
            self.workflow_timeout = seconds("workflowTimeoutHours", hours * 3600.0)?;
        }
        if let Some(mb) = parsed.memory_threshold_mb {
            self.memory_threshold_mb = mb;
        }
        if let Some(percent) = parsed.cpu_threshold_percent {
            self.cpu_threshold_percent = percent;
        }
        if let Some(ratio) = parsed.failure_rate_threshold {
            self.failure_rate_threshold = ratio;
        }
        if let Some(secs) = parsed.poll_interval_seconds {
            self.poll_interval = seconds("pollIntervalSeconds", secs)?;
        }
        if let Some(capacity) = parsed.completed_history_capacity {
            self.history_capacity = capacity;
        }
        if let Some(secs) = parsed.alert_dedup_window_seconds {
            self.dedup_window = seconds("alertDedupWindowSeconds", secs)?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.history_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "history_capacity must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(ConfigError::ValidationFailed(format!(
                "failure_rate_threshold must be between 0 and 1, got {}",
                self.failure_rate_threshold
            )));
        }

        if self.memory_threshold_mb <= 0.0 || self.cpu_threshold_percent <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "resource thresholds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the task and workflow timeout thresholds.
    pub fn with_timeouts(mut self, task: Duration, workflow: Duration) -> Self {
        self.task_timeout = task;
        self.workflow_timeout = workflow;
        self
    }

    /// Builder method to set the resource thresholds.
    pub fn with_resource_thresholds(mut self, memory_mb: f64, cpu_percent: f64) -> Self {
        self.memory_threshold_mb = memory_mb;
        self.cpu_threshold_percent = cpu_percent;
        self
    }

    /// Builder method to set the failure rate threshold.
    pub fn with_failure_rate_threshold(mut self, ratio: f64) -> Self {
        self.failure_rate_threshold = ratio;
        self
    }

    /// Builder method to set the archive capacity.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Builder method to set the dedup window.
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Builder method to set the records directory.
    pub fn with_records_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.records_dir = Some(dir.into());
        self
    }
}

fn seconds(key: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.task_timeout, Duration::from_secs(1800));
        assert_eq!(config.workflow_timeout, Duration::from_secs(14_400));
        assert_eq!(config.memory_threshold_mb, 1000.0);
        assert_eq!(config.cpu_threshold_percent, 80.0);
        assert_eq!(config.failure_rate_threshold, 0.2);
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.dedup_window, Duration::from_secs(300));
        assert!(config.records_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_apply_options() {
        let options = json!({
            "taskTimeoutMinutes": 10,
            "workflowTimeoutHours": 0.5,
            "memoryThresholdMB": 2048,
            "pollIntervalSeconds": 1,
            "completedHistoryCapacity": 10,
            "alertDedupWindowSeconds": 60,
            "groupSize": 5
        });

        let config = MonitorConfig::default()
            .apply_options(options.as_object().unwrap())
            .unwrap();

        assert_eq!(config.task_timeout, Duration::from_secs(600));
        assert_eq!(config.workflow_timeout, Duration::from_secs(1800));
        assert_eq!(config.memory_threshold_mb, 2048.0);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.history_capacity, 10);
        assert_eq!(config.dedup_window, Duration::from_secs(60));
    }

    #[test]
    fn test_apply_options_rejects_bad_values() {
        let wrong_type = json!({ "cpuThresholdPercent": "high" });
        assert!(MonitorConfig::default()
            .apply_options(wrong_type.as_object().unwrap())
            .is_err());

        let out_of_range = json!({ "failureRateThreshold": 1.5 });
        assert!(matches!(
            MonitorConfig::default().apply_options(out_of_range.as_object().unwrap()),
            Err(ConfigError::ValidationFailed(_))
        ));

        let negative = json!({ "pollIntervalSeconds": -1 });
        assert!(MonitorConfig::default()
            .apply_options(negative.as_object().unwrap())
            .is_err());
    }

    #[test]
    fn test_validation() {
        assert!(MonitorConfig::default()
            .with_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(MonitorConfig::default()
            .with_history_capacity(0)
            .validate()
            .is_err());
    }
}
