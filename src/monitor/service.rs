//! The monitor service: poll loop, alert rules, archive and dashboard.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, WorkflowSnapshot};
use crate::error::MonitorError;
use crate::metrics::MetricsCollector;
use crate::workflow::{TaskStatus, WorkflowStatus};

use super::alerts::{
    AlertDeduplicator, AlertHandler, AlertSeverity, AlertType, WorkflowAlert, SYSTEM_WORKFLOW_ID,
};
use super::config::MonitorConfig;
use super::metrics::WorkflowMetrics;
use super::records::RecordWriter;
use super::resources::{ProcessSampler, ResourceSample, ResourceSampler};

/// Number of unacknowledged alerts listed on the dashboard.
const DASHBOARD_RECENT_ALERTS: usize = 10;

/// Progress line of one active workflow on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub workflow_id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub total_tasks: usize,
    pub progress_percent: f64,
    pub duration_secs: f64,
}

/// Summary served to dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardData {
    pub generated_at: DateTime<Utc>,
    pub active_workflows: usize,
    /// Workflows that finished (any terminal status) today, UTC.
    pub completed_today: usize,
    /// Share of today's finished workflows that completed successfully.
    pub success_rate_today: f64,
    /// Unacknowledged alerts.
    pub active_alerts: usize,
    /// Unacknowledged alerts with critical severity.
    pub critical_alerts: usize,
    pub workflows: Vec<WorkflowProgress>,
    /// Most recent unacknowledged alerts, newest first.
    pub recent_alerts: Vec<WorkflowAlert>,
}

/// What a single poll did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    /// Workflows whose metrics were refreshed while still active.
    pub refreshed: usize,
    /// Workflows moved into the archive.
    pub archived: Vec<String>,
    /// Alerts raised (after deduplication).
    pub alerts: Vec<WorkflowAlert>,
    /// Acknowledged alerts purged.
    pub purged: usize,
}

struct MonitorState {
    active: HashMap<String, WorkflowMetrics>,
    history: VecDeque<WorkflowMetrics>,
    archived: HashSet<String>,
    alerts: Vec<WorkflowAlert>,
    dedup: AlertDeduplicator,
}

struct MonitorInner {
    engine: Arc<Engine>,
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    handlers: Mutex<HashMap<AlertType, Vec<AlertHandler>>>,
    sampler: Arc<dyn ResourceSampler>,
    records: Option<RecordWriter>,
    metrics: MetricsCollector,
}

struct PollLoop {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Watches the engine's workflows, raises alerts and keeps history.
///
/// The monitor only reads engine state through snapshots.
pub struct WorkflowMonitor {
    inner: Arc<MonitorInner>,
    poller: Mutex<Option<PollLoop>>,
}

impl WorkflowMonitor {
    /// Creates a monitor sampling the current process.
    pub fn new(engine: Arc<Engine>, config: MonitorConfig) -> Self {
        Self::with_sampler(engine, config, Arc::new(ProcessSampler::new()))
    }

    /// Creates a monitor with a custom resource sampler.
    pub fn with_sampler(
        engine: Arc<Engine>,
        config: MonitorConfig,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Self {
        let records = config.records_dir.clone().map(RecordWriter::new);
        let dedup = AlertDeduplicator::new(config.dedup_window);
        Self {
            inner: Arc::new(MonitorInner {
                engine,
                state: Mutex::new(MonitorState {
                    active: HashMap::new(),
                    history: VecDeque::with_capacity(config.history_capacity),
                    archived: HashSet::new(),
                    alerts: Vec::new(),
                    dedup,
                }),
                config,
                handlers: Mutex::new(HashMap::new()),
                sampler,
                records,
                metrics: MetricsCollector::new(),
            }),
            poller: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Starts the periodic poll loop.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::AlreadyRunning` if the loop is already active.
    pub async fn start_monitoring(&self) -> Result<(), MonitorError> {
        let mut poller = self.poller.lock().expect("lock not poisoned");
        if poller.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(Arc::clone(&self.inner), shutdown.clone()));
        *poller = Some(PollLoop { shutdown, handle });

        info!(
            interval_secs = self.inner.config.poll_interval.as_secs_f64(),
            "Workflow monitoring started"
        );
        Ok(())
    }

    /// Stops the poll loop.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::NotRunning` if the loop was not started.
    pub async fn stop_monitoring(&self) -> Result<(), MonitorError> {
        let poller = self.poller.lock().expect("lock not poisoned").take();
        let Some(poller) = poller else {
            return Err(MonitorError::NotRunning);
        };

        poller.shutdown.cancel();
        if let Err(e) = poller.handle.await {
            error!(error = %e, "Monitor loop terminated abnormally");
        }
        info!("Workflow monitoring stopped");
        Ok(())
    }

    pub fn is_monitoring(&self) -> bool {
        self.poller.lock().expect("lock not poisoned").is_some()
    }

    /// Runs one poll cycle now.
    pub fn poll_once(&self) -> PollReport {
        self.poll_at(Utc::now())
    }

    /// Runs one poll cycle as if the current time were `now`.
    pub(crate) fn poll_at(&self, now: DateTime<Utc>) -> PollReport {
        self.inner.poll(now)
    }

    /// Registers a callback for alerts of `alert_type`.
    pub fn add_alert_handler(&self, alert_type: AlertType, handler: AlertHandler) {
        self.inner
            .handlers
            .lock()
            .expect("lock not poisoned")
            .entry(alert_type)
            .or_default()
            .push(handler);
    }

    /// Marks an alert acknowledged. Returns `false` for unknown ids;
    /// acknowledging twice is harmless.
    pub fn acknowledge_alert(&self, alert_id: &str) -> bool {
        let mut state = self.inner.lock();
        match state.alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                if !alert.acknowledged {
                    alert.acknowledged = true;
                    debug!(alert_id = %alert_id, "Alert acknowledged");
                }
                true
            }
            None => false,
        }
    }

    /// All stored alerts, oldest first.
    pub fn alerts(&self) -> Vec<WorkflowAlert> {
        self.inner.lock().alerts.clone()
    }

    /// Metrics of the workflows currently tracked as active.
    pub fn active_metrics(&self) -> Vec<WorkflowMetrics> {
        let mut active: Vec<WorkflowMetrics> = self.inner.lock().active.values().cloned().collect();
        active.sort_by_key(|m| m.start_time);
        active
    }

    /// Archived metrics of workflows started within the last `hours`,
    /// newest first.
    pub fn workflow_history(&self, hours: u32) -> Vec<WorkflowMetrics> {
        self.history_at(hours, Utc::now())
    }

    fn history_at(&self, hours: u32, now: DateTime<Utc>) -> Vec<WorkflowMetrics> {
        let cutoff = now - chrono::Duration::hours(i64::from(hours));
        let mut history: Vec<WorkflowMetrics> = self
            .inner
            .lock()
            .history
            .iter()
            .filter(|m| m.start_time >= cutoff)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        history
    }

    /// Dashboard summary as of now.
    pub fn dashboard(&self) -> DashboardData {
        self.dashboard_at(Utc::now())
    }

    pub(crate) fn dashboard_at(&self, now: DateTime<Utc>) -> DashboardData {
        let state = self.inner.lock();
        let today = now.date_naive();

        let finished_today: Vec<&WorkflowMetrics> = state
            .history
            .iter()
            .filter(|m| m.end_time.is_some_and(|end| end.date_naive() == today))
            .collect();
        let succeeded = finished_today
            .iter()
            .filter(|m| m.status == WorkflowStatus::Completed)
            .count();
        let success_rate_today = if finished_today.is_empty() {
            0.0
        } else {
            succeeded as f64 / finished_today.len() as f64 * 100.0
        };

        let mut workflows: Vec<WorkflowProgress> = state
            .active
            .values()
            .map(|m| WorkflowProgress {
                workflow_id: m.workflow_id.clone(),
                name: m.workflow_name.clone(),
                status: m.status,
                completed_tasks: m.completed_tasks,
                failed_tasks: m.failed_tasks,
                total_tasks: m.total_tasks,
                progress_percent: m.success_rate,
                duration_secs: m.duration_secs,
            })
            .collect();
        workflows.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));

        let mut unacknowledged: Vec<&WorkflowAlert> =
            state.alerts.iter().filter(|a| !a.acknowledged).collect();
        unacknowledged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        DashboardData {
            generated_at: now,
            active_workflows: state.active.len(),
            completed_today: finished_today.len(),
            success_rate_today,
            active_alerts: unacknowledged.len(),
            critical_alerts: unacknowledged
                .iter()
                .filter(|a| a.severity == AlertSeverity::Critical)
                .count(),
            workflows,
            recent_alerts: unacknowledged
                .into_iter()
                .take(DASHBOARD_RECENT_ALERTS)
                .cloned()
                .collect(),
        }
    }
}

impl Drop for WorkflowMonitor {
    fn drop(&mut self) {
        if let Ok(mut poller) = self.poller.lock() {
            if let Some(poller) = poller.take() {
                poller.shutdown.cancel();
            }
        }
    }
}

impl std::fmt::Debug for WorkflowMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowMonitor")
            .field("config", &self.inner.config)
            .field("monitoring", &self.is_monitoring())
            .finish()
    }
}

impl MonitorInner {
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().expect("lock not poisoned")
    }

    fn poll(&self, now: DateTime<Utc>) -> PollReport {
        let snapshots = self.engine.snapshots();
        let sample = self.sampler.sample();

        let (report, archived_metrics, active_count) = {
            let mut state = self.lock();
            let report = self.evaluate(&mut state, &snapshots, sample, now);
            let archived: Vec<WorkflowMetrics> = report
                .archived
                .iter()
                .filter_map(|id| state.history.iter().rev().find(|m| &m.workflow_id == id))
                .cloned()
                .collect();
            (report, archived, state.active.len())
        };

        self.metrics.update_active_workflows(active_count);
        self.persist(&archived_metrics, &report.alerts, now);
        for alert in &report.alerts {
            self.metrics
                .record_alert(alert.alert_type.as_str(), &alert.severity.to_string());
            self.dispatch(alert);
        }

        debug!(
            refreshed = report.refreshed,
            archived = report.archived.len(),
            alerts = report.alerts.len(),
            purged = report.purged,
            "Monitor poll complete"
        );
        report
    }

    /// Refreshes metrics and evaluates the alert rules under the state lock.
    fn evaluate(
        &self,
        state: &mut MonitorState,
        snapshots: &[WorkflowSnapshot],
        sample: ResourceSample,
        now: DateTime<Utc>,
    ) -> PollReport {
        let config = &self.config;
        let mut report = PollReport::default();
        let mut candidates = Vec::new();

        for snapshot in snapshots {
            if state.archived.contains(&snapshot.id) {
                continue;
            }
            if snapshot.status == WorkflowStatus::Pending && snapshot.started_at.is_none() {
                continue;
            }

            let metrics = state
                .active
                .entry(snapshot.id.clone())
                .and_modify(|m| m.refresh(snapshot, now, sample))
                .or_insert_with(|| WorkflowMetrics::new(snapshot, now, sample));

            if metrics.is_terminal() {
                if let Some(finished) = state.active.remove(&snapshot.id) {
                    info!(
                        workflow_id = %finished.workflow_id,
                        status = %finished.status,
                        duration_secs = finished.duration_secs,
                        "Workflow archived"
                    );
                    if state.history.len() >= config.history_capacity {
                        state.history.pop_front();
                    }
                    state.history.push_back(finished);
                }
                state.archived.insert(snapshot.id.clone());
                report.archived.push(snapshot.id.clone());
                continue;
            }

            report.refreshed += 1;
            candidates.extend(workflow_alerts(config, snapshot, metrics, now));
        }

        // Engine-forgotten workflows no longer need an archive marker, and
        // ones forgotten before their final status was observed are dropped.
        let known: HashSet<&str> = snapshots.iter().map(|s| s.id.as_str()).collect();
        state.archived.retain(|id| known.contains(id.as_str()));
        state.active.retain(|id, _| {
            let keep = known.contains(id.as_str());
            if !keep {
                debug!(workflow_id = %id, "Dropping metrics for forgotten workflow");
            }
            keep
        });

        candidates.extend(host_alerts(config, sample, now));

        for alert in candidates {
            if state.dedup.should_fire(&alert.workflow_id, alert.alert_type, now) {
                warn!(
                    workflow_id = %alert.workflow_id,
                    alert_type = %alert.alert_type,
                    severity = %alert.severity,
                    message = %alert.message,
                    "Alert raised"
                );
                state.alerts.push(alert.clone());
                report.alerts.push(alert);
            }
        }
        state.dedup.prune(now);

        let retention = chrono::Duration::from_std(config.alert_retention)
            .unwrap_or(chrono::Duration::MAX);
        let before = state.alerts.len();
        state
            .alerts
            .retain(|a| !(a.acknowledged && now - a.timestamp > retention));
        report.purged = before - state.alerts.len();

        report
    }

    fn persist(&self, metrics: &[WorkflowMetrics], alerts: &[WorkflowAlert], now: DateTime<Utc>) {
        let Some(records) = &self.records else {
            return;
        };

        if let Err(e) = records.append_metrics(metrics, now) {
            warn!(error = %e, path = %records.metrics_path().display(), "Failed to append metrics records");
        }
        if let Err(e) = records.append_alerts(alerts, now) {
            warn!(error = %e, path = %records.alerts_path().display(), "Failed to append alert records");
        }
    }

    /// Invokes the handlers registered for the alert's type.
    fn dispatch(&self, alert: &WorkflowAlert) {
        let handlers = self
            .handlers
            .lock()
            .expect("lock not poisoned")
            .get(&alert.alert_type)
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(alert))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(alert_id = %alert.id, alert_type = %alert.alert_type, error = %e, "Alert handler failed");
                }
                Err(_) => {
                    error!(alert_id = %alert.id, alert_type = %alert.alert_type, "Alert handler panicked");
                }
            }
        }
    }
}

/// Timeout and failure-rate rules for one active workflow.
fn workflow_alerts(
    config: &MonitorConfig,
    snapshot: &WorkflowSnapshot,
    metrics: &WorkflowMetrics,
    now: DateTime<Utc>,
) -> Vec<WorkflowAlert> {
    let mut alerts = Vec::new();

    let workflow_limit = config.workflow_timeout.as_secs_f64();
    if metrics.duration_secs > workflow_limit {
        alerts.push(
            WorkflowAlert::new(
                &snapshot.id,
                AlertType::WorkflowTimeout,
                format!(
                    "Workflow '{}' has been running for {:.1} hours",
                    snapshot.name,
                    metrics.duration_secs / 3600.0
                ),
                now,
            )
            .with_metadata("duration_secs", json!(metrics.duration_secs))
            .with_metadata("threshold_secs", json!(workflow_limit)),
        );
    }

    let task_limit = config.task_timeout.as_secs_f64();
    let overdue: Vec<(&str, f64)> = snapshot
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Running)
        .filter_map(|t| {
            let elapsed = (now - t.started_at?).num_milliseconds() as f64 / 1000.0;
            (elapsed > task_limit).then_some((t.id.as_str(), elapsed))
        })
        .collect();
    if !overdue.is_empty() {
        let ids: Vec<&str> = overdue.iter().map(|(id, _)| *id).collect();
        let longest = overdue.iter().map(|(_, e)| *e).fold(0.0, f64::max);
        alerts.push(
            WorkflowAlert::new(
                &snapshot.id,
                AlertType::TaskTimeout,
                format!(
                    "Task(s) {} in workflow '{}' running longer than {:.0} minutes",
                    ids.join(", "),
                    snapshot.name,
                    task_limit / 60.0
                ),
                now,
            )
            .with_metadata("tasks", json!(ids))
            .with_metadata("longest_secs", json!(longest)),
        );
    }

    let ratio = metrics.failure_ratio();
    if ratio > config.failure_rate_threshold {
        alerts.push(
            WorkflowAlert::new(
                &snapshot.id,
                AlertType::HighFailureRate,
                format!(
                    "Workflow '{}' has {} of {} tasks failed ({:.0}%)",
                    snapshot.name,
                    metrics.failed_tasks,
                    metrics.total_tasks,
                    ratio * 100.0
                ),
                now,
            )
            .with_metadata("failure_ratio", json!(ratio)),
        );
    }

    alerts
}

/// Host memory and CPU rules.
fn host_alerts(
    config: &MonitorConfig,
    sample: ResourceSample,
    now: DateTime<Utc>,
) -> Vec<WorkflowAlert> {
    let mut alerts = Vec::new();

    if sample.memory_mb > config.memory_threshold_mb {
        alerts.push(
            WorkflowAlert::new(
                SYSTEM_WORKFLOW_ID,
                AlertType::HighMemory,
                format!(
                    "Memory usage {:.0} MB exceeds {:.0} MB",
                    sample.memory_mb, config.memory_threshold_mb
                ),
                now,
            )
            .with_metadata("memory_mb", json!(sample.memory_mb)),
        );
    }

    if sample.cpu_percent > config.cpu_threshold_percent {
        alerts.push(
            WorkflowAlert::new(
                SYSTEM_WORKFLOW_ID,
                AlertType::HighCpu,
                format!(
                    "CPU usage {:.0}% exceeds {:.0}%",
                    sample.cpu_percent, config.cpu_threshold_percent
                ),
                now,
            )
            .with_metadata("cpu_percent", json!(sample.cpu_percent)),
        );
    }

    alerts
}

async fn poll_loop(inner: Arc<MonitorInner>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                inner.poll(Utc::now());
            }
        }
    }
}
