//! Task handlers behind the compiled batch stages.
//!
//! Every batch workflow references these by name. Per-file work is delegated
//! to a [`QuoteProcessor`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::engine::{Engine, TaskContext, TaskHandler};
use crate::error::TaskError;

use super::job::ConfigMap;
use super::processor::{FileCheck, QuoteProcessor};
use super::settings::BatchSettings;

pub const PREPARE_HANDLER: &str = "batch.prepare";
pub const VALIDATE_HANDLER: &str = "batch.validate";
pub const CONSOLIDATE_HANDLER: &str = "batch.consolidate";
pub const PROCESS_HANDLER: &str = "batch.process";
pub const FINALIZE_HANDLER: &str = "batch.finalize";

/// Task id of the consolidation barrier.
pub(crate) const CONSOLIDATE_TASK: &str = "consolidate";

/// Registers the five batch handlers with `engine`.
pub fn register_batch_handlers(engine: &Engine, processor: Arc<dyn QuoteProcessor>) {
    engine.register_handler(PREPARE_HANDLER, Arc::new(PrepareHandler));
    engine.register_handler(
        VALIDATE_HANDLER,
        Arc::new(ValidateHandler {
            processor: Arc::clone(&processor),
        }),
    );
    engine.register_handler(CONSOLIDATE_HANDLER, Arc::new(ConsolidateHandler));
    engine.register_handler(PROCESS_HANDLER, Arc::new(ProcessHandler { processor }));
    engine.register_handler(FINALIZE_HANDLER, Arc::new(FinalizeHandler));
}

/// Decodes a JSON array of path strings.
fn paths_arg(ctx: &TaskContext, index: usize) -> Result<Vec<PathBuf>, TaskError> {
    let values = ctx.arg(index).and_then(Value::as_array).ok_or_else(|| {
        TaskError::execution(format!(
            "task '{}' expects a file list at position {}",
            ctx.task_id, index
        ))
    })?;

    values
        .iter()
        .map(|v| {
            v.as_str().map(PathBuf::from).ok_or_else(|| {
                TaskError::execution(format!("task '{}' got a non-string path", ctx.task_id))
            })
        })
        .collect()
}

fn config_arg(ctx: &TaskContext, index: usize) -> ConfigMap {
    ctx.arg(index)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Checks that the input files exist. Fails only when none of them do.
struct PrepareHandler;

#[async_trait]
impl TaskHandler for PrepareHandler {
    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        let files = paths_arg(&ctx, 0)?;
        let mut existing = Vec::new();
        let mut missing = Vec::new();

        for path in &files {
            let display = path.display().to_string();
            match tokio::fs::try_exists(path).await {
                Ok(true) => existing.push(display),
                Ok(false) => missing.push(display),
                Err(e) => {
                    return Err(TaskError::execution(format!(
                        "failed to check {}: {}",
                        display, e
                    )))
                }
            }
        }

        if existing.is_empty() {
            return Err(TaskError::execution(format!(
                "none of the {} input files exist",
                files.len()
            )));
        }

        info!(
            workflow_id = %ctx.workflow_id,
            existing = existing.len(),
            missing = missing.len(),
            "Batch inputs prepared"
        );

        Ok(json!({
            "total": files.len(),
            "existing": existing,
            "missing": missing,
        }))
    }
}

struct ValidateHandler {
    processor: Arc<dyn QuoteProcessor>,
}

#[async_trait]
impl TaskHandler for ValidateHandler {
    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        let path = PathBuf::from(ctx.str_arg(0)?);
        let check = self.processor.validate(&path).await?;

        if !check.valid {
            debug!(
                workflow_id = %ctx.workflow_id,
                path = %check.path,
                reason = check.reason.as_deref().unwrap_or_default(),
                "File failed validation"
            );
        }

        serde_json::to_value(check).map_err(TaskError::execution)
    }
}

/// Barrier after validation; summarises which files are usable.
struct ConsolidateHandler;

#[async_trait]
impl TaskHandler for ConsolidateHandler {
    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        let ordered: BTreeMap<&String, &Value> = ctx.upstream.iter().collect();
        let mut valid = Vec::new();
        let mut invalid = Vec::new();

        for value in ordered.into_values() {
            let Ok(check) = serde_json::from_value::<FileCheck>(value.clone()) else {
                continue;
            };
            if check.valid {
                valid.push(check.path);
            } else {
                invalid.push(json!({
                    "path": check.path,
                    "reason": check.reason,
                }));
            }
        }

        info!(
            workflow_id = %ctx.workflow_id,
            valid = valid.len(),
            invalid = invalid.len(),
            "Validation consolidated"
        );

        Ok(json!({
            "total": valid.len() + invalid.len(),
            "valid": valid,
            "invalid": invalid,
        }))
    }
}

/// Runs the processor over one file or one group of files.
struct ProcessHandler {
    processor: Arc<dyn QuoteProcessor>,
}

impl ProcessHandler {
    /// Paths the consolidation step found unusable.
    fn invalid_paths(ctx: &TaskContext) -> Vec<String> {
        ctx.upstream
            .get(CONSOLIDATE_TASK)
            .and_then(|summary| summary.get("invalid"))
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.get("path").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl TaskHandler for ProcessHandler {
    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        let files = paths_arg(&ctx, 0)?;
        let config = config_arg(&ctx, 1);
        let settings = BatchSettings::from_config(&config).map_err(TaskError::execution)?;

        let (files, skipped): (Vec<PathBuf>, Vec<PathBuf>) = if settings.skip_invalid_files {
            let invalid = Self::invalid_paths(&ctx);
            files
                .into_iter()
                .partition(|p| !invalid.contains(&p.display().to_string()))
        } else {
            (files, Vec::new())
        };

        let skipped: Vec<String> = skipped.iter().map(|p| p.display().to_string()).collect();
        if !skipped.is_empty() {
            info!(
                workflow_id = %ctx.workflow_id,
                task_id = %ctx.task_id,
                skipped = skipped.len(),
                "Skipping invalid files"
            );
        }

        let output = if files.is_empty() {
            Value::Null
        } else {
            self.processor
                .process(&files, &config, ctx.cancellation_token())
                .await?
        };

        Ok(json!({
            "files": files.len(),
            "skipped": skipped,
            "output": output,
        }))
    }
}

/// Aggregates the processing outputs into the batch result.
struct FinalizeHandler;

#[async_trait]
impl TaskHandler for FinalizeHandler {
    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        let ordered: BTreeMap<&String, &Value> = ctx.upstream.iter().collect();
        let mut files_processed = 0u64;
        let mut files_skipped = 0usize;
        let mut outputs = serde_json::Map::new();

        for (task_id, value) in ordered {
            files_processed += value.get("files").and_then(Value::as_u64).unwrap_or(0);
            files_skipped += value
                .get("skipped")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            outputs.insert(
                task_id.clone(),
                value.get("output").cloned().unwrap_or(Value::Null),
            );
        }

        info!(
            workflow_id = %ctx.workflow_id,
            files_processed = files_processed,
            files_skipped = files_skipped,
            "Batch finalized"
        );

        Ok(json!({
            "processing_tasks": outputs.len(),
            "files_processed": files_processed,
            "files_skipped": files_skipped,
            "outputs": outputs,
        }))
    }
}
