//! Compiles batch jobs into workflows and submits them to the engine.
//!
//! Every batch compiles to the same shape:
//!
//! ```text
//! prepare -> validate_0..validate_{n-1} -> consolidate -> process stage -> finalize
//! ```
//!
//! The process stage holds one `process_<i>` task per file, or, for batches
//! above the group threshold, one `process_group_<i>` task per chunk of
//! `groupSize` files.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::error::BatchError;
use crate::workflow::{Task, TaskAction, Workflow};

use super::handlers::{
    register_batch_handlers, CONSOLIDATE_HANDLER, CONSOLIDATE_TASK, FINALIZE_HANDLER,
    PREPARE_HANDLER, PROCESS_HANDLER, VALIDATE_HANDLER,
};
use super::job::{BatchJob, ConfigMap};
use super::processor::QuoteProcessor;

/// Name given to batches created without one.
pub const DEFAULT_BATCH_NAME: &str = "PDF processing batch";

/// Where a scheduled batch currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScheduleState {
    /// Waiting for its scheduled time.
    Waiting { at: DateTime<Utc> },
    /// Compiled and handed to the engine.
    Submitted { workflow_id: String },
    /// Cancelled before it fired.
    Cancelled,
    /// Compilation or submission failed when it fired.
    Failed { error: String },
}

struct ScheduledBatch {
    job: BatchJob,
    state: ScheduleState,
    cancel: CancellationToken,
}

type ScheduleTable = Arc<Mutex<HashMap<String, ScheduledBatch>>>;

/// Turns file lists into batch workflows.
pub struct BatchCompiler {
    engine: Arc<Engine>,
    scheduled: ScheduleTable,
}

impl BatchCompiler {
    /// Creates a compiler and registers the batch handlers with `engine`.
    pub fn new(engine: Arc<Engine>, processor: Arc<dyn QuoteProcessor>) -> Self {
        register_batch_handlers(&engine, processor);
        Self {
            engine,
            scheduled: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Builds the workflow for `job` without submitting it.
    ///
    /// # Errors
    ///
    /// Returns `BatchError::NoFiles` for an empty file list and
    /// `BatchError::InvalidConfig` for bad configuration values.
    pub fn compile(job: &BatchJob) -> Result<Workflow, BatchError> {
        if job.files.is_empty() {
            return Err(BatchError::NoFiles);
        }

        let settings = job.settings()?;
        let file_count = job.files.len();
        let paths: Vec<String> = job
            .files
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let config = Value::Object(job.config.clone());

        let stage = |task: Task| {
            task.with_timeout(settings.task_timeout)
                .with_max_retries(job.max_retries)
        };

        let mut workflow = Workflow::new(job.name.clone())
            .with_description(format!("Process {} quote file(s)", file_count))
            .with_priority(job.priority)
            .with_max_concurrent_tasks(settings.concurrency_for(file_count))
            .with_auto_retry(job.auto_retry)
            .with_metadata("batch_job_id", json!(job.id))
            .with_metadata("file_count", json!(file_count));
        for (key, value) in &job.metadata {
            workflow = workflow.with_metadata(key.clone(), value.clone());
        }

        workflow.add_task(stage(Task::new(
            "prepare",
            "Prepare input files",
            TaskAction::new(PREPARE_HANDLER).arg(json!(paths)),
        )));

        let mut validation_ids = Vec::with_capacity(file_count);
        for (i, path) in paths.iter().enumerate() {
            let id = format!("validate_{}", i);
            workflow.add_task(
                stage(Task::new(
                    id.clone(),
                    format!("Validate {}", path),
                    TaskAction::new(VALIDATE_HANDLER).arg(path.as_str()),
                ))
                .depends_on("prepare"),
            );
            validation_ids.push(id);
        }

        workflow.add_task(
            stage(Task::new(
                CONSOLIDATE_TASK,
                "Consolidate validation results",
                TaskAction::new(CONSOLIDATE_HANDLER),
            ))
            .depends_on_all(validation_ids),
        );

        let groups: Vec<(String, String, &[String])> = if settings.uses_groups(file_count) {
            paths
                .chunks(settings.group_size)
                .enumerate()
                .map(|(i, chunk)| {
                    (
                        format!("process_group_{}", i),
                        format!("Process group {} ({} files)", i + 1, chunk.len()),
                        chunk,
                    )
                })
                .collect()
        } else {
            paths
                .chunks(1)
                .enumerate()
                .map(|(i, chunk)| (format!("process_{}", i), format!("Process {}", chunk[0]), chunk))
                .collect()
        };

        let mut processing_ids = Vec::with_capacity(groups.len());
        for (id, name, chunk) in groups {
            workflow.add_task(
                stage(Task::new(
                    id.clone(),
                    name,
                    TaskAction::new(PROCESS_HANDLER)
                        .arg(json!(chunk))
                        .arg(config.clone()),
                ))
                .depends_on(CONSOLIDATE_TASK),
            );
            processing_ids.push(id);
        }

        workflow.add_task(
            stage(Task::new(
                "finalize",
                "Finalize batch",
                TaskAction::new(FINALIZE_HANDLER),
            ))
            .depends_on_all(processing_ids),
        );

        Ok(workflow)
    }

    /// Compiles and submits a batch. Returns the workflow id.
    ///
    /// # Errors
    ///
    /// Returns `BatchError` if the job cannot be compiled or the engine
    /// rejects the workflow.
    pub fn create_pdf_processing_batch(
        &self,
        files: Vec<PathBuf>,
        config: ConfigMap,
        name: Option<&str>,
        priority: i32,
    ) -> Result<String, BatchError> {
        let job = BatchJob::new(name.unwrap_or(DEFAULT_BATCH_NAME), files)
            .with_config(config)?
            .with_priority(priority);
        self.submit_job(&job)
    }

    /// Compiles and submits an already built job. Returns the workflow id.
    pub fn submit_job(&self, job: &BatchJob) -> Result<String, BatchError> {
        submit(&self.engine, job)
    }

    /// Creates a batch that is submitted at `schedule_time`. Returns the job id.
    ///
    /// A time in the past submits immediately.
    ///
    /// # Errors
    ///
    /// Returns `BatchError` for an empty file list or invalid configuration,
    /// and for a failed submission when the batch is due at once.
    pub fn create_scheduled_batch(
        &self,
        files: Vec<PathBuf>,
        config: ConfigMap,
        schedule_time: DateTime<Utc>,
        name: Option<&str>,
    ) -> Result<String, BatchError> {
        if files.is_empty() {
            return Err(BatchError::NoFiles);
        }

        let job = BatchJob::new(name.unwrap_or(DEFAULT_BATCH_NAME), files)
            .with_config(config)?
            .with_schedule(schedule_time);
        let job_id = job.id.clone();
        let now = Utc::now();

        if !job.is_deferred(now) {
            let workflow_id = self.submit_job(&job)?;
            self.table().insert(
                job_id.clone(),
                ScheduledBatch {
                    job,
                    state: ScheduleState::Submitted { workflow_id },
                    cancel: CancellationToken::new(),
                },
            );
            return Ok(job_id);
        }

        let delay = (schedule_time - now).to_std().unwrap_or_default();
        let cancel = CancellationToken::new();
        self.table().insert(
            job_id.clone(),
            ScheduledBatch {
                job,
                state: ScheduleState::Waiting { at: schedule_time },
                cancel: cancel.clone(),
            },
        );

        info!(
            job_id = %job_id,
            scheduled_at = %schedule_time,
            delay_secs = delay.as_secs(),
            "Batch scheduled"
        );

        let engine = Arc::clone(&self.engine);
        let table = Arc::clone(&self.scheduled);
        let id = job_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            fire_scheduled(&engine, &table, &id);
        });

        Ok(job_id)
    }

    /// Cancels a batch that is still waiting for its time.
    pub fn cancel_scheduled(&self, job_id: &str) -> bool {
        let mut table = self.table();
        let Some(entry) = table.get_mut(job_id) else {
            return false;
        };
        if !matches!(entry.state, ScheduleState::Waiting { .. }) {
            return false;
        }

        entry.cancel.cancel();
        entry.state = ScheduleState::Cancelled;
        info!(job_id = %job_id, "Scheduled batch cancelled");
        true
    }

    /// Workflow id of a scheduled job once it has been submitted.
    pub fn scheduled_workflow(&self, job_id: &str) -> Option<String> {
        match self.schedule_state(job_id)? {
            ScheduleState::Submitted { workflow_id } => Some(workflow_id),
            _ => None,
        }
    }

    pub fn schedule_state(&self, job_id: &str) -> Option<ScheduleState> {
        self.table().get(job_id).map(|e| e.state.clone())
    }

    /// All scheduled jobs with their state, oldest first.
    pub fn scheduled_jobs(&self) -> Vec<(BatchJob, ScheduleState)> {
        let mut jobs: Vec<(BatchJob, ScheduleState)> = self
            .table()
            .values()
            .map(|e| (e.job.clone(), e.state.clone()))
            .collect();
        jobs.sort_by_key(|(job, _)| job.created_at);
        jobs
    }

    /// Drops scheduled jobs that are no longer waiting and returns how many
    /// were removed. Waiting jobs are kept.
    pub fn prune_scheduled(&self) -> usize {
        let mut table = self.table();
        let before = table.len();
        table.retain(|_, e| matches!(e.state, ScheduleState::Waiting { .. }));
        let pruned = before - table.len();
        if pruned > 0 {
            debug!(pruned = pruned, "Pruned settled scheduled batches");
        }
        pruned
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, ScheduledBatch>> {
        self.scheduled.lock().expect("lock not poisoned")
    }
}

impl std::fmt::Debug for BatchCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCompiler")
            .field("scheduled", &self.table().len())
            .finish()
    }
}

fn submit(engine: &Engine, job: &BatchJob) -> Result<String, BatchError> {
    let workflow = BatchCompiler::compile(job)?;
    let task_count = workflow.tasks.len();
    let workflow_id = engine.submit(workflow)?;

    info!(
        job_id = %job.id,
        workflow_id = %workflow_id,
        files = job.files.len(),
        tasks = task_count,
        "Batch submitted"
    );
    Ok(workflow_id)
}

fn fire_scheduled(engine: &Engine, table: &ScheduleTable, job_id: &str) {
    let job = {
        let table = table.lock().expect("lock not poisoned");
        match table.get(job_id) {
            Some(entry) if matches!(entry.state, ScheduleState::Waiting { .. }) => {
                entry.job.clone()
            }
            _ => {
                warn!(job_id = %job_id, "Scheduled batch no longer waiting");
                return;
            }
        }
    };

    let state = match submit(engine, &job) {
        Ok(workflow_id) => ScheduleState::Submitted { workflow_id },
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Scheduled batch failed to submit");
            ScheduleState::Failed {
                error: e.to_string(),
            }
        }
    };

    let mut table = table.lock().expect("lock not poisoned");
    if let Some(entry) = table.get_mut(job_id) {
        entry.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::processor::FileCheckProcessor;
    use crate::engine::EngineConfig;
    use std::time::Duration;

    fn files(n: usize) -> Vec<PathBuf> {
        (0..n)
            .map(|i| PathBuf::from(format!("/quotes/q{}.pdf", i)))
            .collect()
    }

    fn compiler() -> BatchCompiler {
        let engine = Arc::new(Engine::new(EngineConfig::default()));
        BatchCompiler::new(engine, Arc::new(FileCheckProcessor::new()))
    }

    fn config(value: Value) -> ConfigMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_twelve_files_make_three_groups() {
        let job = BatchJob::new("big", files(12))
            .with_config(config(json!({ "groupThreshold": 5, "groupSize": 5 })))
            .unwrap();
        let workflow = BatchCompiler::compile(&job).unwrap();

        let groups: Vec<&Task> = workflow
            .tasks
            .iter()
            .filter(|t| t.id.starts_with("process_group_"))
            .collect();
        assert_eq!(groups.len(), 3);
        for group in &groups {
            assert_eq!(group.depends_on.iter().collect::<Vec<_>>(), ["consolidate"]);
        }
        assert_eq!(groups[2].action.args[0].as_array().map(Vec::len), Some(2));

        let finalize = workflow.task("finalize").unwrap();
        assert_eq!(finalize.depends_on.len(), 3);
        assert_eq!(workflow.task("consolidate").unwrap().depends_on.len(), 12);
        assert_eq!(workflow.max_concurrent_tasks, 3);
        // prepare + 12 validations + consolidate + 3 groups + finalize
        assert_eq!(workflow.tasks.len(), 18);
    }

    #[test]
    fn test_small_batch_processes_per_file() {
        let job = BatchJob::new("small", files(2));
        let workflow = BatchCompiler::compile(&job).unwrap();

        assert!(workflow.task("process_0").is_some());
        assert!(workflow.task("process_1").is_some());
        assert!(workflow.task("process_group_0").is_none());
        assert_eq!(workflow.max_concurrent_tasks, 2);
        assert_eq!(
            workflow.task("validate_1").unwrap().depends_on.iter().collect::<Vec<_>>(),
            ["prepare"]
        );
        assert_eq!(
            workflow.metadata.get("batch_job_id"),
            Some(&json!(job.id))
        );
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let workflow = BatchCompiler::compile(&BatchJob::new("five", files(5))).unwrap();
        assert_eq!(
            workflow
                .tasks
                .iter()
                .filter(|t| t.action.handler == PROCESS_HANDLER)
                .count(),
            5
        );
    }

    #[test]
    fn test_config_applies_to_tasks() {
        let job = BatchJob::new("cfg", files(3))
            .with_config(config(json!({
                "maxConcurrentTasksPerWorkflow": 7,
                "taskTimeoutMinutes": 2,
                "maxRetries": 4,
                "autoRetry": false
            })))
            .unwrap()
            .with_priority(9);
        let workflow = BatchCompiler::compile(&job).unwrap();

        assert_eq!(workflow.max_concurrent_tasks, 7);
        assert_eq!(workflow.priority, 9);
        assert!(!workflow.auto_retry);
        for task in &workflow.tasks {
            assert_eq!(task.timeout, Duration::from_secs(120));
            assert_eq!(task.max_retries, 4);
        }
    }

    #[test]
    fn test_no_files_rejected() {
        let compiler = compiler();
        assert!(matches!(
            compiler.create_pdf_processing_batch(Vec::new(), ConfigMap::new(), None, 0),
            Err(BatchError::NoFiles)
        ));
        assert!(matches!(
            compiler.create_scheduled_batch(Vec::new(), ConfigMap::new(), Utc::now(), None),
            Err(BatchError::NoFiles)
        ));
    }

    #[test]
    fn test_create_batch_submits_to_engine() {
        let compiler = compiler();
        let id = compiler
            .create_pdf_processing_batch(files(3), ConfigMap::new(), Some("quotes"), 1)
            .unwrap();

        let snapshot = compiler.engine.status(&id).expect("stored");
        assert_eq!(snapshot.name, "quotes");
        assert_eq!(snapshot.total_tasks(), 1 + 3 + 1 + 3 + 1);
    }

    #[tokio::test]
    async fn test_past_schedule_submits_immediately() {
        let compiler = compiler();
        let job_id = compiler
            .create_scheduled_batch(
                files(1),
                ConfigMap::new(),
                Utc::now() - chrono::Duration::seconds(5),
                None,
            )
            .unwrap();

        let workflow_id = compiler.scheduled_workflow(&job_id).expect("submitted");
        assert!(compiler.engine.status(&workflow_id).is_some());
        assert!(!compiler.cancel_scheduled(&job_id));
    }

    #[tokio::test]
    async fn test_future_schedule_fires() {
        let compiler = compiler();
        let job_id = compiler
            .create_scheduled_batch(
                files(1),
                ConfigMap::new(),
                Utc::now() + chrono::Duration::milliseconds(50),
                Some("later"),
            )
            .unwrap();
        assert!(matches!(
            compiler.schedule_state(&job_id),
            Some(ScheduleState::Waiting { .. })
        ));

        let mut workflow_id = None;
        for _ in 0..100 {
            workflow_id = compiler.scheduled_workflow(&job_id);
            if workflow_id.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let workflow_id = workflow_id.expect("fired");
        assert_eq!(
            compiler.engine.status(&workflow_id).map(|s| s.name),
            Some("later".to_string())
        );
    }

    #[tokio::test]
    async fn test_cancel_scheduled_prevents_submission() {
        let compiler = compiler();
        let job_id = compiler
            .create_scheduled_batch(
                files(1),
                ConfigMap::new(),
                Utc::now() + chrono::Duration::milliseconds(30),
                None,
            )
            .unwrap();

        assert!(compiler.cancel_scheduled(&job_id));
        assert!(!compiler.cancel_scheduled(&job_id));
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(compiler.schedule_state(&job_id), Some(ScheduleState::Cancelled));
        assert!(compiler.engine.snapshots().is_empty());
        assert_eq!(compiler.scheduled_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_prune_scheduled_keeps_waiting_jobs() {
        let compiler = compiler();
        let submitted = compiler
            .create_scheduled_batch(files(1), ConfigMap::new(), Utc::now(), None)
            .unwrap();
        let cancelled = compiler
            .create_scheduled_batch(
                files(1),
                ConfigMap::new(),
                Utc::now() + chrono::Duration::hours(1),
                None,
            )
            .unwrap();
        let waiting = compiler
            .create_scheduled_batch(
                files(1),
                ConfigMap::new(),
                Utc::now() + chrono::Duration::hours(1),
                None,
            )
            .unwrap();
        assert!(compiler.cancel_scheduled(&cancelled));

        assert_eq!(compiler.prune_scheduled(), 2);
        assert_eq!(compiler.schedule_state(&submitted), None);
        assert_eq!(compiler.schedule_state(&cancelled), None);
        assert!(matches!(
            compiler.schedule_state(&waiting),
            Some(ScheduleState::Waiting { .. })
        ));
        assert_eq!(compiler.prune_scheduled(), 0);
        assert!(compiler.cancel_scheduled(&waiting));
    }
}
