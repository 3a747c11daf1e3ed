//! Task graph model.
//!
//! Plain data describing what the engine executes:
//!
//! - **Workflow**: A named, prioritised collection of tasks executed as a unit
//! - **Task**: A node with a handler reference, dependencies, timeout and retry budget
//! - **TaskGraph**: Validated dependency adjacency (no duplicates, dangling edges or cycles)
//!
//! # Example
//!
//! ```rust,ignore
//! use quoteflow::workflow::{Task, TaskAction, Workflow};
//!
//! let workflow = Workflow::new("quotes")
//!     .with_max_concurrent_tasks(3)
//!     .with_task(Task::new("prep", "Prepare", TaskAction::new("batch.prepare")))
//!     .with_task(Task::new("v1", "Validate", TaskAction::new("batch.validate")).depends_on("prep"));
//! ```

pub mod graph;
pub mod model;
pub mod task;

pub use graph::TaskGraph;
pub use model::{Workflow, WorkflowStatus, DEFAULT_MAX_CONCURRENT_TASKS};
pub use task::{Task, TaskAction, TaskStatus, DEFAULT_MAX_RETRIES, DEFAULT_TASK_TIMEOUT};
