//! The engine's workflow table and ready queue.
//!
//! `EngineState` is the single piece of contended mutable state in the
//! scheduler. The engine wraps it in one mutex and every operation here is
//! synchronous, so the lock is never held across an await point.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{SubmissionError, TaskError};
use crate::workflow::{TaskGraph, TaskStatus, Workflow, WorkflowStatus};

use super::snapshot::WorkflowSnapshot;

/// Dispatch order of a workflow's lane: priority descending, then
/// submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct LaneKey {
    priority: Reverse<i32>,
    seq: u64,
}

#[derive(Debug)]
struct Lane {
    workflow_id: String,
    tasks: VecDeque<String>,
}

/// Ready tasks of all workflows, one FIFO lane per workflow.
#[derive(Debug, Default)]
struct ReadyQueue {
    lanes: BTreeMap<LaneKey, Lane>,
    len: usize,
}

impl ReadyQueue {
    fn push(&mut self, key: LaneKey, workflow_id: &str, task_id: String) {
        self.lanes
            .entry(key)
            .or_insert_with(|| Lane {
                workflow_id: workflow_id.to_string(),
                tasks: VecDeque::new(),
            })
            .tasks
            .push_back(task_id);
        self.len += 1;
    }

    fn remove_lane(&mut self, key: LaneKey) {
        if let Some(lane) = self.lanes.remove(&key) {
            self.len -= lane.tasks.len();
        }
    }

    /// Pops the head of the first lane whose workflow passes `eligible`.
    fn pop_first(&mut self, eligible: impl Fn(&str) -> bool) -> Option<(String, String)> {
        let key = self
            .lanes
            .iter()
            .find(|(_, lane)| eligible(&lane.workflow_id))
            .map(|(key, _)| *key)?;

        let lane = self.lanes.get_mut(&key)?;
        let task_id = lane.tasks.pop_front()?;
        let workflow_id = lane.workflow_id.clone();
        if lane.tasks.is_empty() {
            self.lanes.remove(&key);
        }
        self.len -= 1;
        Some((workflow_id, task_id))
    }
}

#[derive(Debug)]
struct WorkflowEntry {
    workflow: Workflow,
    graph: TaskGraph,
    index: HashMap<String, usize>,
    key: LaneKey,
    running: usize,
    cancel: CancellationToken,
    attempts: HashMap<String, CancellationToken>,
}

impl WorkflowEntry {
    fn has_capacity(&self) -> bool {
        self.running < self.workflow.max_concurrent_tasks
    }
}

/// A task handed to a worker.
#[derive(Debug)]
pub(crate) struct Dispatch {
    pub workflow_id: String,
    pub task_id: String,
    pub handler: String,
    pub args: Vec<Value>,
    pub attempt: u32,
    pub timeout: Duration,
    pub upstream: HashMap<String, Value>,
    pub cancel: CancellationToken,
}

/// What happened when a worker reported a task outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Settlement {
    pub task_status: TaskStatus,
    pub retry_after: Option<Duration>,
    /// Set when this outcome finished the workflow.
    pub workflow_status: Option<WorkflowStatus>,
}

#[derive(Debug, Default)]
pub(crate) struct EngineState {
    workflows: HashMap<String, WorkflowEntry>,
    ready: ReadyQueue,
    next_seq: u64,
    running: usize,
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a validated workflow and queues its root tasks.
    ///
    /// Returns `true` when the workflow finished on the spot (no tasks).
    pub fn insert(
        &mut self,
        mut workflow: Workflow,
        graph: TaskGraph,
        now: DateTime<Utc>,
    ) -> Result<bool, SubmissionError> {
        if self.workflows.contains_key(&workflow.id) {
            return Err(SubmissionError::DuplicateWorkflow(workflow.id));
        }

        let key = LaneKey {
            priority: Reverse(workflow.priority),
            seq: self.next_seq,
        };
        self.next_seq += 1;

        workflow.status = WorkflowStatus::Pending;
        workflow.started_at = None;
        workflow.completed_at = None;
        for task in &mut workflow.tasks {
            task.reset();
        }

        let finished = workflow.tasks.is_empty();
        if finished {
            workflow.status = WorkflowStatus::Completed;
            workflow.started_at = Some(now);
            workflow.completed_at = Some(now);
        }

        for task in workflow.tasks.iter_mut().filter(|t| t.depends_on.is_empty()) {
            task.status = TaskStatus::Ready;
            self.ready.push(key, &workflow.id, task.id.clone());
        }

        let index = workflow
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        self.workflows.insert(
            workflow.id.clone(),
            WorkflowEntry {
                workflow,
                graph,
                index,
                key,
                running: 0,
                cancel: CancellationToken::new(),
                attempts: HashMap::new(),
            },
        );

        Ok(finished)
    }

    /// Picks the next task to run and marks it RUNNING.
    ///
    /// Lanes are visited in priority/submission order; a workflow already at
    /// its `max_concurrent_tasks` is skipped.
    pub fn next_dispatch(&mut self, now: DateTime<Utc>) -> Option<Dispatch> {
        loop {
            let workflows = &self.workflows;
            let (workflow_id, task_id) = self
                .ready
                .pop_first(|id| workflows.get(id).is_some_and(WorkflowEntry::has_capacity))?;

            let Some(entry) = self.workflows.get_mut(&workflow_id) else {
                continue;
            };
            let Some(&idx) = entry.index.get(&task_id) else {
                continue;
            };
            if entry.workflow.tasks[idx].status != TaskStatus::Ready {
                continue;
            }

            let upstream: HashMap<String, Value> = entry
                .graph
                .dependencies_of(&task_id)
                .iter()
                .filter_map(|dep| {
                    let task = &entry.workflow.tasks[*entry.index.get(dep)?];
                    task.result.clone().map(|r| (dep.clone(), r))
                })
                .collect();

            let cancel = entry.cancel.child_token();
            entry.attempts.insert(task_id.clone(), cancel.clone());
            entry.running += 1;
            self.running += 1;

            if entry.workflow.started_at.is_none() {
                entry.workflow.started_at = Some(now);
            }
            if entry.workflow.status == WorkflowStatus::Pending {
                entry.workflow.status = WorkflowStatus::Running;
            }

            let task = &mut entry.workflow.tasks[idx];
            task.status = TaskStatus::Running;
            task.started_at = Some(now);
            task.completed_at = None;

            return Some(Dispatch {
                workflow_id,
                task_id,
                handler: task.action.handler.clone(),
                args: task.action.args.clone(),
                attempt: task.retry_count + 1,
                timeout: task.timeout,
                upstream,
                cancel,
            });
        }
    }

    /// Records the outcome of a task attempt.
    ///
    /// Success readies dependents whose dependencies are now all complete.
    /// A retryable failure with budget left moves the task to RETRYING and
    /// returns the backoff delay; an exhausted failure marks the task and all
    /// of its transitive dependents FAILED.
    pub fn complete(
        &mut self,
        workflow_id: &str,
        task_id: &str,
        outcome: Result<Value, TaskError>,
        now: DateTime<Utc>,
        retry_delay: impl Fn(u32) -> Duration,
    ) -> Option<Settlement> {
        let entry = self.workflows.get_mut(workflow_id)?;
        let idx = *entry.index.get(task_id)?;

        entry.running = entry.running.saturating_sub(1);
        self.running = self.running.saturating_sub(1);
        entry.attempts.remove(task_id);

        let workflow_cancelled = entry.workflow.status == WorkflowStatus::Cancelled;
        let auto_retry = entry.workflow.auto_retry;
        let task = &mut entry.workflow.tasks[idx];
        let mut retry_after = None;
        let mut propagate = None;

        if workflow_cancelled {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(now);
        } else {
            match outcome {
                Ok(value) => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(value);
                    task.error = None;
                    task.completed_at = Some(now);
                }
                Err(TaskError::Cancelled) => {
                    task.status = TaskStatus::Cancelled;
                    task.error = Some(TaskError::Cancelled.to_string());
                    task.completed_at = Some(now);
                    propagate = Some((
                        TaskStatus::Cancelled,
                        format!("dependency '{}' was cancelled", task_id),
                    ));
                }
                Err(err) => {
                    task.retry_count += 1;
                    task.error = Some(err.to_string());
                    if auto_retry && task.retry_count < task.max_retries {
                        task.status = TaskStatus::Retrying;
                        retry_after = Some(retry_delay(task.retry_count));
                    } else {
                        task.status = TaskStatus::Failed;
                        task.completed_at = Some(now);
                        propagate = Some((
                            TaskStatus::Failed,
                            format!("dependency '{}' failed", task_id),
                        ));
                    }
                }
            }
        }
        let task_status = task.status;

        if task_status == TaskStatus::Completed {
            let mut newly_ready = Vec::new();
            for child in entry.graph.dependents_of(task_id) {
                let Some(&child_idx) = entry.index.get(child) else {
                    continue;
                };
                let deps_done = entry.graph.dependencies_of(child).iter().all(|dep| {
                    entry
                        .index
                        .get(dep)
                        .is_some_and(|&i| entry.workflow.tasks[i].status == TaskStatus::Completed)
                });
                let child_task = &mut entry.workflow.tasks[child_idx];
                if deps_done && child_task.status == TaskStatus::Pending {
                    child_task.status = TaskStatus::Ready;
                    newly_ready.push(child.clone());
                }
            }
            for child in newly_ready {
                self.ready.push(entry.key, workflow_id, child);
            }
        }

        if let Some((status, reason)) = propagate {
            for dependent in entry.graph.transitive_dependents(task_id) {
                let Some(&i) = entry.index.get(&dependent) else {
                    continue;
                };
                let task = &mut entry.workflow.tasks[i];
                if !task.status.is_terminal() {
                    task.status = status;
                    task.error = Some(reason.clone());
                    task.completed_at = Some(now);
                }
            }
        }

        let workflow_status = settle(&mut entry.workflow, now);

        Some(Settlement {
            task_status,
            retry_after,
            workflow_status,
        })
    }

    /// Moves a RETRYING task back into the ready queue once its backoff
    /// expired. Returns `false` if the task was cancelled in the meantime.
    pub fn requeue(&mut self, workflow_id: &str, task_id: &str) -> bool {
        let Some(entry) = self.workflows.get_mut(workflow_id) else {
            return false;
        };
        let Some(&idx) = entry.index.get(task_id) else {
            return false;
        };
        let task = &mut entry.workflow.tasks[idx];
        if task.status != TaskStatus::Retrying {
            return false;
        }
        task.status = TaskStatus::Ready;
        self.ready.push(entry.key, workflow_id, task_id.to_string());
        true
    }

    /// Cancels a non-terminal workflow.
    ///
    /// Waiting tasks become CANCELLED at once; running attempts are signalled
    /// and recorded CANCELLED when their bodies return.
    pub fn cancel(&mut self, workflow_id: &str, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.workflows.get_mut(workflow_id) else {
            return false;
        };
        if entry.workflow.status.is_terminal() {
            return false;
        }

        for task in &mut entry.workflow.tasks {
            if matches!(
                task.status,
                TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Retrying
            ) {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(now);
            }
        }

        self.ready.remove_lane(entry.key);
        entry.cancel.cancel();
        entry.workflow.status = WorkflowStatus::Cancelled;
        entry.workflow.completed_at = Some(now);
        true
    }

    /// Signals every running attempt to stop. Returns how many were signalled.
    pub fn signal_running(&self) -> usize {
        let mut signalled = 0;
        for entry in self.workflows.values() {
            for token in entry.attempts.values() {
                token.cancel();
                signalled += 1;
            }
        }
        signalled
    }

    /// Drops a terminal workflow with no attempts in flight.
    pub fn forget(&mut self, workflow_id: &str) -> bool {
        let removable = self
            .workflows
            .get(workflow_id)
            .is_some_and(|e| e.workflow.status.is_terminal() && e.running == 0);
        if removable {
            if let Some(entry) = self.workflows.remove(workflow_id) {
                self.ready.remove_lane(entry.key);
            }
        }
        removable
    }

    pub fn snapshot(&self, workflow_id: &str) -> Option<WorkflowSnapshot> {
        self.workflows
            .get(workflow_id)
            .map(|e| WorkflowSnapshot::from(&e.workflow))
    }

    /// Snapshots of all workflows in submission order.
    pub fn snapshots(&self) -> Vec<WorkflowSnapshot> {
        let mut entries: Vec<&WorkflowEntry> = self.workflows.values().collect();
        entries.sort_by_key(|e| e.key.seq);
        entries
            .into_iter()
            .map(|e| WorkflowSnapshot::from(&e.workflow))
            .collect()
    }

    pub fn contains(&self, workflow_id: &str) -> bool {
        self.workflows.contains_key(workflow_id)
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len
    }

    pub fn running(&self) -> usize {
        self.running
    }
}

/// Decides the workflow's terminal status once no task can change any more.
fn settle(workflow: &mut Workflow, now: DateTime<Utc>) -> Option<WorkflowStatus> {
    if workflow.status.is_terminal() || !workflow.tasks.iter().all(|t| t.status.is_terminal()) {
        return None;
    }

    let status = if workflow.tasks.iter().any(|t| t.status == TaskStatus::Failed) {
        WorkflowStatus::Failed
    } else if workflow
        .tasks
        .iter()
        .any(|t| t.status == TaskStatus::Cancelled)
    {
        WorkflowStatus::Cancelled
    } else {
        WorkflowStatus::Completed
    };

    workflow.status = status;
    workflow.completed_at = Some(now);
    Some(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Task, TaskAction};
    use serde_json::json;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, id, TaskAction::new("noop")).depends_on_all(deps.iter().copied())
    }

    fn submit(state: &mut EngineState, workflow: Workflow) -> String {
        let graph = TaskGraph::build(&workflow.tasks).expect("valid graph");
        let id = workflow.id.clone();
        state.insert(workflow, graph, Utc::now()).expect("insert");
        id
    }

    fn with_tasks(workflow: Workflow, tasks: Vec<Task>) -> Workflow {
        tasks.into_iter().fold(workflow, Workflow::with_task)
    }

    fn no_delay(_: u32) -> Duration {
        Duration::ZERO
    }

    fn status_of(state: &EngineState, wf: &str, task: &str) -> TaskStatus {
        state
            .snapshot(wf)
            .and_then(|s| s.task(task).map(|t| t.status))
            .expect("task exists")
    }

    #[test]
    fn test_roots_are_ready_after_insert() {
        let mut state = EngineState::new();
        let wf = submit(
            &mut state,
            with_tasks(Workflow::new("w"), vec![task("a", &[]), task("b", &["a"])]),
        );

        assert_eq!(status_of(&state, &wf, "a"), TaskStatus::Ready);
        assert_eq!(status_of(&state, &wf, "b"), TaskStatus::Pending);
        assert_eq!(state.ready_len(), 1);
    }

    #[test]
    fn test_duplicate_workflow_rejected() {
        let mut state = EngineState::new();
        submit(&mut state, Workflow::new("w").with_id("dup"));

        let again = Workflow::new("w").with_id("dup");
        let graph = TaskGraph::build(&again.tasks).expect("valid graph");
        assert_eq!(
            state.insert(again, graph, Utc::now()).unwrap_err(),
            SubmissionError::DuplicateWorkflow("dup".to_string())
        );
    }

    #[test]
    fn test_empty_workflow_completes_immediately() {
        let mut state = EngineState::new();
        let wf = Workflow::new("empty");
        let graph = TaskGraph::build(&wf.tasks).expect("valid graph");
        let id = wf.id.clone();

        assert!(state.insert(wf, graph, Utc::now()).expect("insert"));
        assert_eq!(
            state.snapshot(&id).map(|s| s.status),
            Some(WorkflowStatus::Completed)
        );
    }

    #[test]
    fn test_priority_then_submission_order() {
        let mut state = EngineState::new();
        let low = submit(
            &mut state,
            Workflow::new("low").with_priority(1).with_task(task("l", &[])),
        );
        let high_first = submit(
            &mut state,
            Workflow::new("high1").with_priority(5).with_task(task("h1", &[])),
        );
        let high_second = submit(
            &mut state,
            Workflow::new("high2").with_priority(5).with_task(task("h2", &[])),
        );

        let now = Utc::now();
        let order: Vec<String> = std::iter::from_fn(|| state.next_dispatch(now))
            .map(|d| d.workflow_id)
            .collect();
        assert_eq!(order, vec![high_first, high_second, low]);
    }

    #[test]
    fn test_per_workflow_cap_respected() {
        let mut state = EngineState::new();
        let capped = submit(
            &mut state,
            with_tasks(
                Workflow::new("capped")
                    .with_priority(10)
                    .with_max_concurrent_tasks(2),
                vec![task("a", &[]), task("b", &[]), task("c", &[])],
            ),
        );
        let other = submit(&mut state, Workflow::new("other").with_task(task("x", &[])));

        let now = Utc::now();
        let first = state.next_dispatch(now).expect("dispatch");
        let second = state.next_dispatch(now).expect("dispatch");
        let third = state.next_dispatch(now).expect("dispatch");
        assert_eq!(first.workflow_id, capped);
        assert_eq!(second.workflow_id, capped);
        // Capped workflow is full, so the lower priority one gets the slot.
        assert_eq!(third.workflow_id, other);
        assert!(state.next_dispatch(now).is_none());

        state.complete(&capped, &first.task_id, Ok(json!(1)), now, no_delay);
        let fourth = state.next_dispatch(now).expect("slot freed");
        assert_eq!(fourth.task_id, "c");
    }

    #[test]
    fn test_completion_readies_dependents_with_upstream() {
        let mut state = EngineState::new();
        let wf = submit(
            &mut state,
            with_tasks(Workflow::new("w"), vec![
                task("prep", &[]),
                task("v1", &["prep"]),
                task("v2", &["prep"]),
                task("join", &["v1", "v2"]),
            ]),
        );
        let now = Utc::now();

        let prep = state.next_dispatch(now).expect("prep");
        assert!(state.next_dispatch(now).is_none());
        state.complete(&wf, &prep.task_id, Ok(json!("ok")), now, no_delay);

        let v1 = state.next_dispatch(now).expect("v1");
        let v2 = state.next_dispatch(now).expect("v2");
        assert_eq!(v1.upstream.get("prep"), Some(&json!("ok")));

        state.complete(&wf, &v1.task_id, Ok(json!(1)), now, no_delay);
        assert_eq!(status_of(&state, &wf, "join"), TaskStatus::Pending);
        state.complete(&wf, &v2.task_id, Ok(json!(2)), now, no_delay);
        assert_eq!(status_of(&state, &wf, "join"), TaskStatus::Ready);

        let join = state.next_dispatch(now).expect("join");
        assert_eq!(join.upstream.len(), 2);
        let settlement = state
            .complete(&wf, &join.task_id, Ok(Value::Null), now, no_delay)
            .expect("settlement");
        assert_eq!(settlement.workflow_status, Some(WorkflowStatus::Completed));
    }

    #[test]
    fn test_failure_retries_then_propagates() {
        let mut state = EngineState::new();
        let wf = submit(
            &mut state,
            with_tasks(Workflow::new("w"), vec![
                task("a", &[]).with_max_retries(2),
                task("b", &["a"]),
                task("c", &["b"]),
                task("side", &[]),
            ]),
        );
        let now = Utc::now();
        let delay = |attempt: u32| Duration::from_millis(10 * attempt as u64);

        let a = state.next_dispatch(now).expect("a");
        let side = state.next_dispatch(now).expect("side");
        let first = state
            .complete(&wf, &a.task_id, Err(TaskError::execution("boom")), now, delay)
            .expect("settlement");
        assert_eq!(first.task_status, TaskStatus::Retrying);
        assert_eq!(first.retry_after, Some(Duration::from_millis(10)));

        assert!(state.requeue(&wf, "a"));
        let retry = state.next_dispatch(now).expect("retry");
        assert_eq!(retry.attempt, 2);
        let second = state
            .complete(&wf, "a", Err(TaskError::Timeout(Duration::from_secs(1))), now, delay)
            .expect("settlement");
        assert_eq!(second.task_status, TaskStatus::Failed);
        assert_eq!(second.workflow_status, None);

        assert_eq!(status_of(&state, &wf, "b"), TaskStatus::Failed);
        assert_eq!(status_of(&state, &wf, "c"), TaskStatus::Failed);

        let last = state
            .complete(&wf, &side.task_id, Ok(Value::Null), now, delay)
            .expect("settlement");
        assert_eq!(last.workflow_status, Some(WorkflowStatus::Failed));

        let snapshot = state.snapshot(&wf).expect("snapshot");
        assert_eq!(snapshot.failed_tasks(), 3);
        assert!(snapshot
            .task("c")
            .and_then(|t| t.error.clone())
            .is_some_and(|e| e.contains("'b'")));
    }

    #[test]
    fn test_no_retry_when_auto_retry_disabled() {
        let mut state = EngineState::new();
        let wf = submit(
            &mut state,
            Workflow::new("w").with_auto_retry(false).with_task(task("a", &[])),
        );
        let now = Utc::now();

        state.next_dispatch(now).expect("a");
        let settlement = state
            .complete(&wf, "a", Err(TaskError::execution("boom")), now, no_delay)
            .expect("settlement");
        assert_eq!(settlement.task_status, TaskStatus::Failed);
        assert_eq!(settlement.workflow_status, Some(WorkflowStatus::Failed));
    }

    #[test]
    fn test_cancel_marks_waiting_tasks_and_defers_running() {
        let mut state = EngineState::new();
        let wf = submit(
            &mut state,
            with_tasks(Workflow::new("w"), vec![
                task("r1", &[]),
                task("r2", &[]),
                task("p1", &["r1"]),
                task("p2", &["r1", "r2"]),
                task("p3", &["p2"]),
            ]),
        );
        let now = Utc::now();
        let r1 = state.next_dispatch(now).expect("r1");
        state.next_dispatch(now).expect("r2");

        assert!(state.cancel(&wf, now));
        assert!(!state.cancel(&wf, now));
        assert!(r1.cancel.is_cancelled());
        assert_eq!(state.ready_len(), 0);
        for id in ["p1", "p2", "p3"] {
            assert_eq!(status_of(&state, &wf, id), TaskStatus::Cancelled);
        }
        assert_eq!(status_of(&state, &wf, "r1"), TaskStatus::Running);

        state.complete(&wf, "r1", Ok(Value::Null), now, no_delay);
        state.complete(&wf, "r2", Err(TaskError::Cancelled), now, no_delay);
        assert_eq!(status_of(&state, &wf, "r1"), TaskStatus::Cancelled);
        assert_eq!(status_of(&state, &wf, "r2"), TaskStatus::Cancelled);
        assert_eq!(
            state.snapshot(&wf).map(|s| s.status),
            Some(WorkflowStatus::Cancelled)
        );
        assert_eq!(state.running(), 0);
    }

    #[test]
    fn test_requeue_after_cancel_is_noop() {
        let mut state = EngineState::new();
        let wf = submit(&mut state, Workflow::new("w").with_task(task("a", &[])));
        let now = Utc::now();

        state.next_dispatch(now).expect("a");
        state.complete(&wf, "a", Err(TaskError::execution("x")), now, no_delay);
        assert!(state.cancel(&wf, now));
        assert!(!state.requeue(&wf, "a"));
        assert_eq!(state.ready_len(), 0);
    }

    #[test]
    fn test_forget_only_terminal() {
        let mut state = EngineState::new();
        let wf = submit(&mut state, Workflow::new("w").with_task(task("a", &[])));

        assert!(!state.forget(&wf));
        state.cancel(&wf, Utc::now());
        assert!(state.forget(&wf));
        assert!(!state.contains(&wf));
    }
}
