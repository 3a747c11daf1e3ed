//! CLI command definitions for quoteflow.
//!
//! `run` compiles a batch from the given quote files, executes it with the
//! built-in file-check processor and prints the final status and the
//! monitor dashboard. `plan` compiles the same batch and prints its task
//! graph without executing anything.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::batch::{BatchCompiler, BatchJob, ConfigMap, FileCheckProcessor, DEFAULT_BATCH_NAME};
use crate::engine::WorkflowSnapshot;
use crate::metrics::{export_metrics, init_metrics};
use crate::monitor::DashboardData;
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::workflow::{TaskGraph, WorkflowStatus};

/// Default time `run` waits for the batch to finish.
const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Quote batch orchestration.
#[derive(Parser)]
#[command(name = "quoteflow")]
#[command(about = "Compile and run quote-file batches as dependency-graph workflows")]
#[command(version)]
#[command(
    long_about = "quoteflow compiles a list of quote files into a workflow of prepare, validate, consolidate, process and finalize tasks and runs it on a bounded worker pool.\n\nExample usage:\n  quoteflow run quotes/*.pdf --config batch.yaml --records-dir ./records"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Compile and execute a batch, then print status and dashboard.
    Run(RunArgs),

    /// Compile a batch and print its task graph without executing it.
    Plan(PlanArgs),
}

/// Batch inputs shared by `run` and `plan`.
#[derive(clap::Args, Debug)]
pub struct BatchArgs {
    /// Quote files to process.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// YAML or JSON file with batch options (groupSize, maxRetries, ...).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Batch name.
    #[arg(short, long)]
    pub name: Option<String>,

    /// Batch priority; higher runs sooner.
    #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
    pub priority: i32,
}

/// Arguments for `quoteflow run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub batch: BatchArgs,

    /// Seconds to wait for the batch to finish.
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Number of task bodies executed at once (overrides QUOTEFLOW_WORKER_POOL_SIZE).
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Directory for the JSONL metrics and alert records.
    #[arg(long, env = "QUOTEFLOW_RECORDS_DIR")]
    pub records_dir: Option<PathBuf>,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,

    /// Output JSON to stdout instead of a text summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `quoteflow plan`.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub batch: BatchArgs,

    /// Output JSON to stdout instead of a text listing.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Result of `quoteflow run` in JSON mode.
#[derive(Debug, Serialize)]
struct RunOutput<'a> {
    workflow: &'a WorkflowSnapshot,
    dashboard: &'a DashboardData,
}

/// One line of `quoteflow plan`.
#[derive(Debug, Serialize)]
struct PlannedTask {
    id: String,
    handler: String,
    depends_on: Vec<String>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_batch_command(args).await,
        Commands::Plan(args) => run_plan_command(args),
    }
}

// ============================================================================
// Command Implementation
// ============================================================================

async fn run_batch_command(args: RunArgs) -> anyhow::Result<()> {
    if args.metrics {
        init_metrics().context("Failed to initialize metrics")?;
    }

    let options = load_options(args.batch.config.as_deref())?;
    let job = build_job(&args.batch, options.clone())?;

    let mut config = OrchestratorConfig::from_env()?.apply_options(&options)?;
    if let Some(workers) = args.workers {
        config.engine.worker_pool_size = workers;
    }
    if let Some(dir) = &args.records_dir {
        config.monitor.records_dir = Some(dir.clone());
    }
    config.validate()?;

    let orchestrator = Orchestrator::new(config, Arc::new(FileCheckProcessor::new()));
    orchestrator.start().await?;

    let outcome = async {
        let workflow_id = orchestrator.compiler().submit_job(&job)?;
        info!(workflow_id = %workflow_id, files = job.file_count(), "Batch submitted");
        let mut finished = orchestrator
            .wait_all(&[workflow_id], Duration::from_secs(args.timeout))
            .await?;
        finished
            .pop()
            .context("engine returned no snapshot for the submitted batch")
    }
    .await;

    if let Err(e) = orchestrator.stop().await {
        warn!(error = %e, "Orchestrator did not stop cleanly");
    }
    let snapshot = outcome?;
    let dashboard = orchestrator.monitor().dashboard();

    if args.json {
        let output = RunOutput {
            workflow: &snapshot,
            dashboard: &dashboard,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_summary(&snapshot, &dashboard);
    }

    if args.metrics {
        println!("{}", export_metrics());
    }

    if snapshot.status != WorkflowStatus::Completed {
        anyhow::bail!("Batch '{}' finished with status {}", snapshot.name, snapshot.status);
    }
    Ok(())
}

fn run_plan_command(args: PlanArgs) -> anyhow::Result<()> {
    let options = load_options(args.batch.config.as_deref())?;
    let job = build_job(&args.batch, options)?;
    let workflow = BatchCompiler::compile(&job)?;
    let graph = TaskGraph::build(&workflow.tasks)?;

    let planned: Vec<PlannedTask> = graph
        .topological_order()
        .iter()
        .filter_map(|id| workflow.task(id))
        .map(|task| PlannedTask {
            id: task.id.clone(),
            handler: task.action.handler.clone(),
            depends_on: task.depends_on.iter().cloned().collect(),
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&planned)?);
        return Ok(());
    }

    println!(
        "{} ({} files, {} tasks, max {} concurrent)",
        workflow.name,
        job.file_count(),
        planned.len(),
        workflow.max_concurrent_tasks
    );
    for task in &planned {
        if task.depends_on.is_empty() {
            println!("  {:<20} {}", task.id, task.handler);
        } else {
            println!(
                "  {:<20} {:<20} <- {}",
                task.id,
                task.handler,
                task.depends_on.join(", ")
            );
        }
    }
    Ok(())
}

/// Reads a YAML or JSON options file into a configuration map.
fn load_options(path: Option<&Path>) -> anyhow::Result<ConfigMap> {
    let Some(path) = path else {
        return Ok(ConfigMap::new());
    };

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_options(&contents).with_context(|| format!("Invalid config file {}", path.display()))
}

/// Parses YAML (a superset of JSON) options; an empty document is an empty map.
fn parse_options(contents: &str) -> anyhow::Result<ConfigMap> {
    if contents.trim().is_empty() {
        return Ok(ConfigMap::new());
    }
    let value: Value = serde_yaml::from_str(contents)?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(ConfigMap::new()),
        other => anyhow::bail!("expected a mapping of options, got {}", other),
    }
}

fn build_job(args: &BatchArgs, options: ConfigMap) -> anyhow::Result<BatchJob> {
    let name = args.name.as_deref().unwrap_or(DEFAULT_BATCH_NAME);
    let job = BatchJob::new(name, args.files.clone())
        .with_config(options)?
        .with_priority(args.priority);
    Ok(job)
}

fn print_summary(snapshot: &WorkflowSnapshot, dashboard: &DashboardData) {
    let progress = snapshot.progress();
    println!("Workflow: {} ({})", snapshot.name, snapshot.id);
    println!("Status:   {}", snapshot.status);
    println!(
        "Progress: {}/{} tasks ({:.0}%)",
        progress.completed, progress.total, progress.percent
    );

    let errors = snapshot.errors();
    if !errors.is_empty() {
        println!("Failed tasks: {}", errors.len());
        for (task_id, error) in &errors {
            println!("  {}: {}", task_id, error);
        }
    }

    if let Some(result) = snapshot.task("finalize").and_then(|t| t.result.as_ref()) {
        if let Some(processed) = result.get("files_processed") {
            println!("Files processed: {}", processed);
        }
    }

    println!();
    println!("Dashboard");
    println!("  Active workflows:  {}", dashboard.active_workflows);
    println!("  Finished today:    {}", dashboard.completed_today);
    println!("  Success rate:      {:.1}%", dashboard.success_rate_today);
    println!(
        "  Alerts:            {} active, {} critical",
        dashboard.active_alerts, dashboard.critical_alerts
    );
    for alert in &dashboard.recent_alerts {
        println!(
            "    [{}] {} {}",
            alert.severity, alert.alert_type, alert.message
        );
    }
}
