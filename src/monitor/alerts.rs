//! Alert model, handlers and deduplication.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Workflow id used for host-level alerts.
pub const SYSTEM_WORKFLOW_ID: &str = "system";

/// Kinds of alerts the monitor raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    WorkflowTimeout,
    TaskTimeout,
    HighFailureRate,
    HighMemory,
    HighCpu,
}

impl AlertType {
    pub const ALL: [AlertType; 5] = [
        AlertType::WorkflowTimeout,
        AlertType::TaskTimeout,
        AlertType::HighFailureRate,
        AlertType::HighMemory,
        AlertType::HighCpu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::WorkflowTimeout => "workflow_timeout",
            AlertType::TaskTimeout => "task_timeout",
            AlertType::HighFailureRate => "high_failure_rate",
            AlertType::HighMemory => "high_memory",
            AlertType::HighCpu => "high_cpu",
        }
    }

    /// Severity attached to alerts of this type.
    pub fn severity(&self) -> AlertSeverity {
        match self {
            AlertType::WorkflowTimeout => AlertSeverity::High,
            AlertType::TaskTimeout | AlertType::HighFailureRate | AlertType::HighMemory => {
                AlertSeverity::Medium
            }
            AlertType::HighCpu => AlertSeverity::Low,
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// An alert raised by the monitor.
///
/// Alerts are immutable apart from acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAlert {
    pub id: String,
    /// Workflow the alert is about, or [`SYSTEM_WORKFLOW_ID`].
    pub workflow_id: String,
    pub alert_type: AlertType,
    pub message: String,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowAlert {
    /// Creates an unacknowledged alert with the type's default severity.
    pub fn new(
        workflow_id: impl Into<String>,
        alert_type: AlertType,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            alert_type,
            message: message.into(),
            severity: alert_type.severity(),
            timestamp,
            acknowledged: false,
            metadata: HashMap::new(),
        }
    }

    pub fn with_severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_system(&self) -> bool {
        self.workflow_id == SYSTEM_WORKFLOW_ID
    }
}

/// Callback invoked synchronously when an alert fires.
///
/// Errors and panics are logged by the monitor and never propagated.
pub type AlertHandler = Arc<dyn Fn(&WorkflowAlert) -> anyhow::Result<()> + Send + Sync>;

/// Suppresses repeats of a `(workflow, alert type)` pair inside a window.
#[derive(Debug)]
pub struct AlertDeduplicator {
    window: Duration,
    last_fired: HashMap<(String, AlertType), DateTime<Utc>>,
}

impl AlertDeduplicator {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or(Duration::MAX),
            last_fired: HashMap::new(),
        }
    }

    /// Returns whether the pair may fire at `now`, recording it if so.
    pub fn should_fire(&mut self, workflow_id: &str, alert_type: AlertType, now: DateTime<Utc>) -> bool {
        let key = (workflow_id.to_string(), alert_type);
        match self.last_fired.get(&key) {
            Some(&last) if now - last < self.window => false,
            _ => {
                self.last_fired.insert(key, now);
                true
            }
        }
    }

    /// Drops entries whose window has passed.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.last_fired.retain(|_, &mut last| now - last < window);
    }

    pub fn len(&self) -> usize {
        self.last_fired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_fired.is_empty()
    }
}
