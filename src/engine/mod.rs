//! Dependency-graph task scheduler.
//!
//! This module provides the [`Engine`], which accepts validated workflows,
//! dispatches ready tasks to a bounded worker pool, retries failures with
//! exponential backoff, enforces per-task timeouts and answers status
//! queries through [`WorkflowSnapshot`]s.
//!
//! # Architecture
//!
//! - [`Engine`]: submission, lifecycle and query API
//! - [`EngineConfig`]: worker pool size, retry backoff, shutdown grace period
//! - [`TaskHandler`] / [`HandlerRegistry`]: named executable task bodies
//! - [`TaskContext`]: what a task body sees about its invocation
//! - [`WorkflowSnapshot`] / [`TaskSnapshot`]: read-only state copies

mod config;
mod handler;
mod scheduler;
mod snapshot;
mod state;

pub use config::EngineConfig;
pub use handler::{handler_fn, FnHandler, HandlerRegistry, TaskContext, TaskHandler};
pub use scheduler::Engine;
pub use snapshot::{Progress, TaskSnapshot, WorkflowSnapshot};
