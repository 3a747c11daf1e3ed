//! The workflow engine: submission, dispatch loop and task workers.
//!
//! A single background dispatch loop pulls READY tasks from the shared ready
//! queue and hands each to a worker task. The number of concurrently running
//! bodies is bounded by a semaphore sized to `worker_pool_size`; per-workflow
//! caps are enforced by the ready queue itself.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = Engine::new(EngineConfig::default());
//! engine.register_handler("noop", handler_fn(|_ctx| async { Ok(Value::Null) }));
//! engine.start().await?;
//!
//! let id = engine.submit(workflow)?;
//! let snapshot = engine.wait_for(&id, Duration::from_secs(60)).await?;
//! engine.stop().await?;
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, SubmissionError, TaskError};
use crate::metrics::MetricsCollector;
use crate::workflow::{TaskGraph, TaskStatus, Workflow, WorkflowStatus};

use super::config::EngineConfig;
use super::handler::{HandlerRegistry, TaskContext, TaskHandler};
use super::snapshot::WorkflowSnapshot;
use super::state::{Dispatch, EngineState, Settlement};

/// State shared between the engine handle, the dispatch loop and workers.
struct Shared {
    config: EngineConfig,
    state: Mutex<EngineState>,
    registry: HandlerRegistry,
    /// Wakes the dispatch loop.
    wake: Notify,
    /// Fired whenever a workflow reaches a terminal status.
    settled: Notify,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    metrics: MetricsCollector,
}

struct DispatchLoop {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// In-memory dependency-graph scheduler.
pub struct Engine {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<DispatchLoop>>,
}

impl Engine {
    /// Creates a stopped engine. Call [`Engine::start`] to begin dispatching.
    pub fn new(config: EngineConfig) -> Self {
        let permits = config.worker_pool_size.max(1);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(EngineState::new()),
                registry: HandlerRegistry::new(),
                wake: Notify::new(),
                settled: Notify::new(),
                workers: Arc::new(Semaphore::new(permits)),
                tracker: TaskTracker::new(),
                metrics: MetricsCollector::new(),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Registers a named task handler. Tasks reference handlers by this name.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.shared.registry.register(name, handler);
    }

    /// Names of all registered handlers.
    pub fn handler_names(&self) -> Vec<String> {
        self.shared.registry.names()
    }

    /// Validates and stores a workflow, marking its root tasks READY.
    ///
    /// Returns the workflow id. Submission works whether or not the engine is
    /// started; tasks simply wait in the ready queue until it is.
    ///
    /// # Errors
    ///
    /// Returns `SubmissionError` for duplicate ids, missing dependencies,
    /// cycles, a zero concurrency cap or an unregistered handler. Nothing is
    /// stored in that case.
    pub fn submit(&self, workflow: Workflow) -> Result<String, SubmissionError> {
        if workflow.max_concurrent_tasks == 0 {
            return Err(SubmissionError::ZeroConcurrency(workflow.id));
        }

        let graph = TaskGraph::build(&workflow.tasks)?;

        if let Some(task) = workflow
            .tasks
            .iter()
            .find(|t| !self.shared.registry.contains(&t.action.handler))
        {
            return Err(SubmissionError::UnknownHandler {
                task: task.id.clone(),
                handler: task.action.handler.clone(),
            });
        }

        let id = workflow.id.clone();
        let name = workflow.name.clone();
        let task_count = workflow.tasks.len();
        let priority = workflow.priority;

        let finished = {
            let mut state = self.shared.lock();
            let finished = state.insert(workflow, graph, Utc::now())?;
            self.shared.publish_gauges(&state);
            finished
        };

        info!(
            workflow_id = %id,
            name = %name,
            tasks = task_count,
            priority = priority,
            "Workflow submitted"
        );

        if finished {
            self.shared.workflow_finished(&id, WorkflowStatus::Completed);
        }
        self.shared.wake.notify_one();

        Ok(id)
    }

    /// Starts the background dispatch loop.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::AlreadyRunning` if the loop is already active.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut dispatcher = self.dispatcher.lock().expect("lock not poisoned");
        if dispatcher.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(dispatch_loop(Arc::clone(&self.shared), shutdown.clone()));
        *dispatcher = Some(DispatchLoop { shutdown, handle });

        info!(
            workers = self.shared.config.worker_pool_size,
            "Engine started"
        );
        Ok(())
    }

    /// Stops the dispatch loop and waits for in-flight tasks.
    ///
    /// Tasks still running after the grace period are signalled to cancel.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotRunning` if the engine was not started, or
    /// `EngineError::ShutdownTimeout` if tasks outlived the grace period.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let dispatcher = self.dispatcher.lock().expect("lock not poisoned").take();
        let Some(dispatcher) = dispatcher else {
            return Err(EngineError::NotRunning);
        };

        info!("Stopping engine");
        dispatcher.shutdown.cancel();
        if let Err(e) = dispatcher.handle.await {
            error!(error = %e, "Dispatch loop terminated abnormally");
        }

        let grace = self.shared.config.shutdown_grace_period;
        self.shared.tracker.close();
        let result = match tokio::time::timeout(grace, self.shared.tracker.wait()).await {
            Ok(()) => {
                info!("Engine stopped");
                Ok(())
            }
            Err(_) => {
                let signalled = self.shared.lock().signal_running();
                warn!(
                    signalled = signalled,
                    grace_secs = grace.as_secs_f64(),
                    "Shutdown grace period elapsed, cancelling running tasks"
                );
                Err(EngineError::ShutdownTimeout(grace))
            }
        };
        self.shared.tracker.reopen();

        result
    }

    /// Returns whether the dispatch loop is active.
    pub fn is_running(&self) -> bool {
        self.dispatcher.lock().expect("lock not poisoned").is_some()
    }

    /// Current state of a workflow, or `None` if it is unknown.
    pub fn status(&self, workflow_id: &str) -> Option<WorkflowSnapshot> {
        self.shared.lock().snapshot(workflow_id)
    }

    /// Snapshots of every stored workflow in submission order.
    pub fn snapshots(&self) -> Vec<WorkflowSnapshot> {
        self.shared.lock().snapshots()
    }

    /// Cancels a workflow.
    ///
    /// Returns `false` if the workflow is unknown or already terminal.
    pub fn cancel(&self, workflow_id: &str) -> bool {
        let cancelled = {
            let mut state = self.shared.lock();
            let cancelled = state.cancel(workflow_id, Utc::now());
            self.shared.publish_gauges(&state);
            cancelled
        };

        if cancelled {
            self.shared
                .workflow_finished(workflow_id, WorkflowStatus::Cancelled);
            self.shared.wake.notify_one();
        }
        cancelled
    }

    /// Drops a terminal workflow from memory.
    pub fn forget(&self, workflow_id: &str) -> bool {
        let forgotten = self.shared.lock().forget(workflow_id);
        if forgotten {
            debug!(workflow_id = %workflow_id, "Workflow forgotten");
        }
        forgotten
    }

    /// Waits until the workflow reaches a terminal status.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::WorkflowNotFound` for unknown ids and
    /// `EngineError::WaitTimeout` if `timeout` elapses first.
    pub async fn wait_for(
        &self,
        workflow_id: &str,
        timeout: Duration,
    ) -> Result<WorkflowSnapshot, EngineError> {
        let wait = async {
            loop {
                let notified = self.shared.settled.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match self.status(workflow_id) {
                    None => return Err(EngineError::WorkflowNotFound(workflow_id.to_string())),
                    Some(snapshot) if snapshot.is_terminal() => return Ok(snapshot),
                    Some(_) => {}
                }

                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| EngineError::WaitTimeout(timeout))?
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Ok(mut dispatcher) = self.dispatcher.lock() {
            if let Some(dispatcher) = dispatcher.take() {
                dispatcher.shutdown.cancel();
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.shared.config)
            .field("registry", &self.shared.registry)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("lock not poisoned")
    }

    fn publish_gauges(&self, state: &EngineState) {
        self.metrics
            .update_scheduler(state.ready_len(), state.running());
    }

    fn workflow_finished(&self, workflow_id: &str, status: WorkflowStatus) {
        info!(workflow_id = %workflow_id, status = %status, "Workflow finished");
        self.metrics.record_workflow(&status.to_string());
        self.settled.notify_waiters();
    }

    /// Starts as many ready tasks as there are free workers.
    fn dispatch_ready(self: &Arc<Self>) {
        loop {
            let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
                return;
            };

            let dispatch = {
                let mut state = self.lock();
                let dispatch = state.next_dispatch(Utc::now());
                self.publish_gauges(&state);
                dispatch
            };
            let Some(dispatch) = dispatch else {
                return;
            };

            let shared = Arc::clone(self);
            self.tracker.spawn(shared.run_task(dispatch, permit));
        }
    }

    /// Runs one task attempt and feeds its outcome back into the state.
    async fn run_task(self: Arc<Self>, dispatch: Dispatch, permit: OwnedSemaphorePermit) {
        let Dispatch {
            workflow_id,
            task_id,
            handler,
            args,
            attempt,
            timeout,
            upstream,
            cancel,
        } = dispatch;

        debug!(
            workflow_id = %workflow_id,
            task_id = %task_id,
            handler = %handler,
            attempt = attempt,
            "Task started"
        );

        let ctx = TaskContext::new(workflow_id.clone(), task_id.clone(), args)
            .with_attempt(attempt)
            .with_upstream(upstream)
            .with_cancellation(cancel.clone());

        let started = Instant::now();
        let outcome = self.execute(&handler, ctx, timeout, &cancel).await;
        let elapsed = started.elapsed();

        let label = match &outcome {
            Ok(_) => "completed",
            Err(TaskError::Timeout(_)) => "timeout",
            Err(TaskError::Cancelled) => "cancelled",
            Err(TaskError::Execution(_)) => "failed",
        };
        self.metrics
            .record_task(label, &handler, elapsed.as_secs_f64());

        if let Err(e) = &outcome {
            warn!(
                workflow_id = %workflow_id,
                task_id = %task_id,
                attempt = attempt,
                error = %e,
                "Task attempt did not succeed"
            );
        } else {
            debug!(
                workflow_id = %workflow_id,
                task_id = %task_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Task completed"
            );
        }

        let settlement = {
            let mut state = self.lock();
            let settlement = state.complete(&workflow_id, &task_id, outcome, Utc::now(), |n| {
                self.config.retry_delay(n)
            });
            self.publish_gauges(&state);
            settlement
        };
        drop(permit);

        if let Some(settlement) = settlement {
            self.settle(&workflow_id, &task_id, &handler, settlement);
        }
        self.wake.notify_one();
    }

    async fn execute(
        &self,
        handler: &str,
        ctx: TaskContext,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, TaskError> {
        let Some(body) = self.registry.get(handler) else {
            return Err(TaskError::execution(format!(
                "No handler registered under '{}'",
                handler
            )));
        };

        let guarded = AssertUnwindSafe(async move { body.run(ctx).await }).catch_unwind();
        match tokio::time::timeout(timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TaskError::execution("task body panicked")),
            Err(_) => {
                cancel.cancel();
                Err(TaskError::Timeout(timeout))
            }
        }
    }

    fn settle(
        self: &Arc<Self>,
        workflow_id: &str,
        task_id: &str,
        handler: &str,
        settlement: Settlement,
    ) {
        if let Some(delay) = settlement.retry_after {
            self.metrics.record_retry(handler);
            info!(
                workflow_id = %workflow_id,
                task_id = %task_id,
                delay_ms = delay.as_millis() as u64,
                "Scheduling task retry"
            );
            self.schedule_retry(workflow_id.to_string(), task_id.to_string(), delay);
        } else if settlement.task_status == TaskStatus::Failed {
            warn!(
                workflow_id = %workflow_id,
                task_id = %task_id,
                "Task failed, retries exhausted"
            );
        }

        if let Some(status) = settlement.workflow_status {
            self.workflow_finished(workflow_id, status);
        }
    }

    fn schedule_retry(self: &Arc<Self>, workflow_id: String, task_id: String, delay: Duration) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let requeued = shared.lock().requeue(&workflow_id, &task_id);
            if requeued {
                shared.wake.notify_one();
            } else {
                debug!(
                    workflow_id = %workflow_id,
                    task_id = %task_id,
                    "Retry dropped, task no longer waiting"
                );
            }
        });
    }
}

async fn dispatch_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    debug!("Dispatch loop running");

    loop {
        shared.dispatch_ready();

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(shared.config.dispatch_tick) => {}
        }
    }

    debug!("Dispatch loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::handler_fn;
    use crate::workflow::{Task, TaskAction};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn fast_config() -> EngineConfig {
        EngineConfig::default()
            .with_retry_delays(Duration::from_millis(5), Duration::from_millis(20))
            .with_dispatch_tick(Duration::from_millis(10))
            .with_shutdown_grace_period(Duration::from_millis(200))
    }

    fn noop_engine() -> Engine {
        let engine = Engine::new(fast_config());
        engine.register_handler("noop", handler_fn(|_| async { Ok(Value::Null) }));
        engine
    }

    fn task(id: &str, handler: &str, deps: &[&str]) -> Task {
        Task::new(id, id, TaskAction::new(handler)).depends_on_all(deps.iter().copied())
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_cycle_rejected_and_not_stored() {
        let engine = noop_engine();
        let workflow = Workflow::new("cyclic")
            .with_task(task("a", "noop", &["b"]))
            .with_task(task("b", "noop", &["a"]));
        let id = workflow.id.clone();

        let err = engine.submit(workflow).unwrap_err();
        assert!(matches!(err, SubmissionError::CycleDetected(_)));
        assert!(engine.status(&id).is_none());
    }

    #[tokio::test]
    async fn test_unknown_handler_and_zero_cap_rejected() {
        let engine = noop_engine();

        let err = engine
            .submit(Workflow::new("w").with_task(task("a", "missing", &[])))
            .unwrap_err();
        assert_eq!(
            err,
            SubmissionError::UnknownHandler {
                task: "a".to_string(),
                handler: "missing".to_string()
            }
        );

        let err = engine
            .submit(
                Workflow::new("w")
                    .with_max_concurrent_tasks(0)
                    .with_task(task("a", "noop", &[])),
            )
            .unwrap_err();
        assert!(matches!(err, SubmissionError::ZeroConcurrency(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let engine = noop_engine();

        assert!(matches!(engine.stop().await, Err(EngineError::NotRunning)));
        engine.start().await.expect("start");
        assert!(engine.is_running());
        assert!(matches!(engine.start().await, Err(EngineError::AlreadyRunning)));
        engine.stop().await.expect("stop");
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_dependencies_run_in_order() {
        let engine = Engine::new(fast_config());
        let order = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&order);
        engine.register_handler(
            "record",
            handler_fn(move |ctx| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().expect("lock").push(ctx.task_id.clone());
                    Ok(json!(ctx.upstream.len()))
                }
            }),
        );
        engine.start().await.expect("start");

        let id = engine
            .submit(
                Workflow::new("chain")
                    .with_task(task("a", "record", &[]))
                    .with_task(task("b", "record", &["a"]))
                    .with_task(task("c", "record", &["b"])),
            )
            .expect("submit");

        let snapshot = engine.wait_for(&id, WAIT).await.expect("finished");
        assert_eq!(snapshot.status, WorkflowStatus::Completed);
        assert_eq!(*order.lock().expect("lock"), ["a", "b", "c"]);
        assert_eq!(snapshot.task("b").and_then(|t| t.result.clone()), Some(json!(1)));

        engine.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_always_failing_task_attempted_max_retries_times() {
        let engine = Engine::new(fast_config());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        engine.register_handler(
            "flaky",
            handler_fn(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TaskError::execution("parse failure"))
                }
            }),
        );
        engine.start().await.expect("start");

        let id = engine
            .submit(Workflow::new("w").with_task(task("a", "flaky", &[]).with_max_retries(3)))
            .expect("submit");

        let snapshot = engine.wait_for(&id, WAIT).await.expect("finished");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(snapshot.status, WorkflowStatus::Failed);
        let a = snapshot.task("a").expect("task a");
        assert_eq!(a.status, TaskStatus::Failed);
        assert_eq!(a.retry_count, 3);
        assert_eq!(a.error.as_deref(), Some("parse failure"));

        engine.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_panicking_body_fails_after_retries() {
        let engine = Engine::new(fast_config());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        engine.register_handler(
            "boom",
            handler_fn(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt <= 2 {
                        panic!("corrupt quote table on attempt {}", attempt);
                    }
                    Ok(Value::Null)
                }
            }),
        );
        engine.register_handler("noop", handler_fn(|_| async { Ok(Value::Null) }));
        engine.start().await.expect("start");

        let id = engine
            .submit(
                Workflow::new("w")
                    .with_task(task("a", "boom", &[]).with_max_retries(2))
                    .with_task(task("b", "noop", &["a"])),
            )
            .expect("submit");

        let snapshot = engine.wait_for(&id, WAIT).await.expect("finished");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(snapshot.status, WorkflowStatus::Failed);
        let a = snapshot.task("a").expect("task a");
        assert_eq!(a.status, TaskStatus::Failed);
        assert_eq!(a.retry_count, 2);
        assert_eq!(a.error.as_deref(), Some("task body panicked"));
        assert_eq!(
            snapshot.task("b").map(|t| t.status),
            Some(TaskStatus::Failed)
        );

        engine.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let engine = Engine::new(fast_config());
        engine.register_handler(
            "slow",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Value::Null)
            }),
        );
        engine.start().await.expect("start");

        let id = engine
            .submit(
                Workflow::new("w").with_task(
                    task("a", "slow", &[])
                        .with_timeout(Duration::from_millis(20))
                        .with_max_retries(2),
                ),
            )
            .expect("submit");

        let snapshot = engine.wait_for(&id, WAIT).await.expect("finished");
        let a = snapshot.task("a").expect("task a");
        assert_eq!(a.status, TaskStatus::Failed);
        assert_eq!(a.retry_count, 2);
        assert!(a.error.as_deref().is_some_and(|e| e.contains("timed out")));

        engine.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_running_never_exceeds_workflow_cap() {
        let engine = Engine::new(fast_config().with_worker_pool_size(8));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (cur, pk) = (Arc::clone(&current), Arc::clone(&peak));
        engine.register_handler(
            "busy",
            handler_fn(move |_| {
                let (cur, pk) = (Arc::clone(&cur), Arc::clone(&pk));
                async move {
                    let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
                    pk.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    cur.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        );
        engine.start().await.expect("start");

        let workflow = (0..10).fold(Workflow::new("wide").with_max_concurrent_tasks(2), |wf, i| {
            wf.with_task(task(&format!("t{}", i), "busy", &[]))
        });
        let id = engine.submit(workflow).expect("submit");

        let snapshot = engine.wait_for(&id, WAIT).await.expect("finished");
        assert_eq!(snapshot.status, WorkflowStatus::Completed);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);

        engine.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_cancel_running_and_pending() {
        let engine = Engine::new(fast_config());
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        engine.register_handler(
            "wait",
            handler_fn(move |ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ctx.cancelled().await;
                    Err(TaskError::Cancelled)
                }
            }),
        );
        engine.register_handler("noop", handler_fn(|_| async { Ok(Value::Null) }));
        engine.start().await.expect("start");

        let id = engine
            .submit(
                Workflow::new("w")
                    .with_task(task("r1", "wait", &[]))
                    .with_task(task("r2", "wait", &[]))
                    .with_task(task("p1", "noop", &["r1"]))
                    .with_task(task("p2", "noop", &["r2"]))
                    .with_task(task("p3", "noop", &["r1", "r2"])),
            )
            .expect("submit");

        for _ in 0..200 {
            if started.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(started.load(Ordering::SeqCst), 2);

        assert!(engine.cancel(&id));
        let snapshot = engine.status(&id).expect("stored");
        assert_eq!(snapshot.status, WorkflowStatus::Cancelled);
        for pending in ["p1", "p2", "p3"] {
            assert_eq!(
                snapshot.task(pending).map(|t| t.status),
                Some(TaskStatus::Cancelled)
            );
        }

        let mut settled = false;
        for _ in 0..200 {
            let snapshot = engine.status(&id).expect("stored");
            if snapshot.count(TaskStatus::Cancelled) == 5 {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(settled);
        assert!(!engine.cancel(&id));

        engine.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_stop_times_out_on_stuck_task() {
        let engine = Engine::new(fast_config());
        engine.register_handler(
            "stuck",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(Value::Null)
            }),
        );
        engine.start().await.expect("start");
        let id = engine
            .submit(Workflow::new("w").with_task(task("a", "stuck", &[])))
            .expect("submit");

        for _ in 0..200 {
            if engine.status(&id).is_some_and(|s| s.running_tasks() == 1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(matches!(
            engine.stop().await,
            Err(EngineError::ShutdownTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_unknown_and_empty() {
        let engine = noop_engine();

        assert!(matches!(
            engine.wait_for("nope", WAIT).await,
            Err(EngineError::WorkflowNotFound(_))
        ));

        let id = engine.submit(Workflow::new("empty")).expect("submit");
        let snapshot = engine.wait_for(&id, WAIT).await.expect("finished");
        assert_eq!(snapshot.status, WorkflowStatus::Completed);
        assert!(engine.forget(&id));
        assert!(engine.snapshots().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_times_out_when_not_started() {
        let engine = noop_engine();
        let id = engine
            .submit(Workflow::new("w").with_task(task("a", "noop", &[])))
            .expect("submit");

        assert!(matches!(
            engine.wait_for(&id, Duration::from_millis(30)).await,
            Err(EngineError::WaitTimeout(_))
        ));
    }
}
