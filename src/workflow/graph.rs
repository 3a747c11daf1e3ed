//! Dependency graph validation and traversal.
//!
//! `TaskGraph::build` checks a task list for duplicate ids, dangling
//! dependencies and cycles (Kahn's algorithm), and precomputes the reverse
//! edges the engine needs to find dependents on completion or failure.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::SubmissionError;

use super::task::Task;

/// Validated adjacency of a workflow's tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    dependencies: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

impl TaskGraph {
    /// Validates the tasks and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns `SubmissionError` on duplicate task ids, dependencies on unknown
    /// ids, or any cycle (including self-dependency).
    pub fn build(tasks: &[Task]) -> Result<Self, SubmissionError> {
        let mut dependencies: HashMap<String, Vec<String>> = HashMap::with_capacity(tasks.len());
        for task in tasks {
            if dependencies.contains_key(&task.id) {
                return Err(SubmissionError::DuplicateTask(task.id.clone()));
            }
            dependencies.insert(task.id.clone(), task.depends_on.iter().cloned().collect());
        }

        let mut dependents: HashMap<String, Vec<String>> =
            tasks.iter().map(|t| (t.id.clone(), Vec::new())).collect();
        for task in tasks {
            for dep in &task.depends_on {
                match dependents.get_mut(dep) {
                    Some(children) => children.push(task.id.clone()),
                    None => {
                        return Err(SubmissionError::MissingDependency {
                            task: task.id.clone(),
                            dependency: dep.clone(),
                        })
                    }
                }
            }
        }

        let order = topological_order(tasks, &dependents)?;

        Ok(Self {
            dependencies,
            dependents,
            order,
        })
    }

    /// Direct dependencies of a task.
    pub fn dependencies_of(&self, task_id: &str) -> &[String] {
        self.dependencies
            .get(task_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Tasks that directly depend on `task_id`.
    pub fn dependents_of(&self, task_id: &str) -> &[String] {
        self.dependents
            .get(task_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every task that transitively depends on `task_id`, breadth-first.
    pub fn transitive_dependents(&self, task_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([task_id]);
        let mut result = Vec::new();

        while let Some(current) = queue.pop_front() {
            for child in self.dependents_of(current) {
                if seen.insert(child.as_str()) {
                    result.push(child.clone());
                    queue.push_back(child.as_str());
                }
            }
        }

        result
    }

    /// Task ids in a valid execution order.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    /// Returns whether the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}

fn topological_order(
    tasks: &[Task],
    dependents: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>, SubmissionError> {
    let mut in_degree: HashMap<&str, usize> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.depends_on.len()))
        .collect();

    // Seed in definition order so the result is deterministic.
    let mut queue: VecDeque<&str> = tasks
        .iter()
        .filter(|t| t.depends_on.is_empty())
        .map(|t| t.id.as_str())
        .collect();
    let mut order = Vec::with_capacity(tasks.len());

    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());
        for child in &dependents[current] {
            if let Some(degree) = in_degree.get_mut(child.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(child.as_str());
                }
            }
        }
    }

    if order.len() == tasks.len() {
        return Ok(order);
    }

    let placed: HashSet<&str> = order.iter().map(String::as_str).collect();
    let remaining: Vec<&Task> = tasks
        .iter()
        .filter(|t| !placed.contains(t.id.as_str()))
        .collect();
    Err(SubmissionError::CycleDetected(cycle_members(&remaining)))
}

/// Narrows the unplaced tasks down to those on a cycle by peeling off tasks
/// that nothing else in the remainder depends on.
fn cycle_members(remaining: &[&Task]) -> Vec<String> {
    let mut alive: HashSet<&str> = remaining.iter().map(|t| t.id.as_str()).collect();

    loop {
        let needed: HashSet<&str> = remaining
            .iter()
            .filter(|t| alive.contains(t.id.as_str()))
            .flat_map(|t| t.depends_on.iter().map(String::as_str))
            .filter(|dep| alive.contains(dep))
            .collect();
        let before = alive.len();
        alive.retain(|id| needed.contains(id));
        if alive.len() == before {
            break;
        }
    }

    let mut members: Vec<String> = alive.into_iter().map(str::to_string).collect();
    members.sort();
    members
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::task::TaskAction;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, id, TaskAction::new("noop")).depends_on_all(deps.iter().copied())
    }

    #[test]
    fn test_build_linear_graph() {
        let tasks = vec![task("prep", &[]), task("v1", &["prep"]), task("c", &["v1"])];
        let graph = TaskGraph::build(&tasks).expect("valid graph");

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.topological_order(), ["prep", "v1", "c"]);
        assert_eq!(graph.dependents_of("prep"), ["v1"]);
        assert_eq!(graph.dependencies_of("c"), ["v1"]);
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let tasks = vec![task("a", &[]), task("a", &[])];
        assert_eq!(
            TaskGraph::build(&tasks).unwrap_err(),
            SubmissionError::DuplicateTask("a".to_string())
        );
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let tasks = vec![task("a", &["ghost"])];
        assert_eq!(
            TaskGraph::build(&tasks).unwrap_err(),
            SubmissionError::MissingDependency {
                task: "a".to_string(),
                dependency: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_two_node_cycle_rejected() {
        let tasks = vec![task("a", &["b"]), task("b", &["a"])];
        assert_eq!(
            TaskGraph::build(&tasks).unwrap_err(),
            SubmissionError::CycleDetected(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_self_dependency_rejected() {
        let tasks = vec![task("a", &["a"])];
        assert!(matches!(
            TaskGraph::build(&tasks),
            Err(SubmissionError::CycleDetected(ids)) if ids == vec!["a".to_string()]
        ));
    }

    #[test]
    fn test_cycle_report_excludes_downstream_tasks() {
        let tasks = vec![
            task("root", &[]),
            task("x", &["root", "z"]),
            task("y", &["x"]),
            task("z", &["y"]),
            task("tail", &["z"]),
        ];
        assert_eq!(
            TaskGraph::build(&tasks).unwrap_err(),
            SubmissionError::CycleDetected(vec![
                "x".to_string(),
                "y".to_string(),
                "z".to_string()
            ])
        );
    }

    #[test]
    fn test_transitive_dependents() {
        let tasks = vec![
            task("prep", &[]),
            task("v1", &["prep"]),
            task("v2", &["prep"]),
            task("c", &["v1", "v2"]),
            task("f", &["c"]),
            task("other", &[]),
        ];
        let graph = TaskGraph::build(&tasks).expect("valid graph");

        let mut deps = graph.transitive_dependents("v1");
        deps.sort();
        assert_eq!(deps, ["c", "f"]);
        assert_eq!(graph.transitive_dependents("prep").len(), 4);
        assert!(graph.transitive_dependents("other").is_empty());
    }

    #[test]
    fn test_empty_graph() {
        let graph = TaskGraph::build(&[]).expect("empty graph is valid");
        assert!(graph.is_empty());
    }
}
