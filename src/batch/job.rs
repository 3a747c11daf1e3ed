//! Batch job definition.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BatchError;
use crate::workflow::DEFAULT_MAX_RETRIES;

use super::settings::BatchSettings;

/// Free-form batch configuration, as supplied by the caller.
pub type ConfigMap = serde_json::Map<String, Value>;

/// Default priority for batches (0 is normal priority).
const DEFAULT_PRIORITY: i32 = 0;

/// A caller-supplied file list plus configuration, compiled into exactly one
/// workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    /// Unique identifier for the job.
    pub id: String,
    pub name: String,
    /// Input files, in caller order.
    pub files: Vec<PathBuf>,
    pub config: ConfigMap,
    /// Higher values are scheduled sooner.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// When the job should be submitted; `None` means immediately.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub auto_retry: bool,
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl BatchJob {
    /// Creates a job with default priority and retry policy.
    pub fn new(name: impl Into<String>, files: Vec<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            files,
            config: ConfigMap::new(),
            priority: DEFAULT_PRIORITY,
            created_at: Utc::now(),
            scheduled_at: None,
            auto_retry: true,
            max_retries: DEFAULT_MAX_RETRIES,
            metadata: HashMap::new(),
        }
    }

    /// Sets the configuration map and adopts its retry options.
    ///
    /// # Errors
    ///
    /// Returns `BatchError::InvalidConfig` if a recognised option is invalid.
    pub fn with_config(mut self, config: ConfigMap) -> Result<Self, BatchError> {
        let settings = BatchSettings::from_config(&config)?;
        self.auto_retry = settings.auto_retry;
        self.max_retries = settings.max_retries;
        self.config = config;
        Ok(self)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_schedule(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Parsed view of the job's configuration.
    pub fn settings(&self) -> Result<BatchSettings, BatchError> {
        BatchSettings::from_config(&self.config)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Whether the job should wait for its scheduled time at `now`.
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_some_and(|at| at > now)
    }
}
