//! Task handlers and the named handler registry.
//!
//! Tasks reference their executable unit by name (`TaskAction::handler`).
//! The engine resolves the name against a `HandlerRegistry` at dispatch time
//! and invokes the handler with a `TaskContext`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

/// Everything a task body gets to see about its invocation.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Owning workflow.
    pub workflow_id: String,
    /// Task being executed.
    pub task_id: String,
    /// Positional arguments from the task's action.
    pub args: Vec<Value>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Results of the task's direct dependencies, keyed by task id.
    pub upstream: HashMap<String, Value>,
    cancel: CancellationToken,
}

impl TaskContext {
    /// Creates a context. Mostly useful for exercising handlers directly.
    pub fn new(
        workflow_id: impl Into<String>,
        task_id: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_id: task_id.into(),
            args,
            attempt: 1,
            upstream: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the dependency results.
    pub fn with_upstream(mut self, upstream: HashMap<String, Value>) -> Self {
        self.upstream = upstream;
        self
    }

    /// Sets the attempt number.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Sets the cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Positional argument `index`, if present.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Positional argument `index` as a string.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::Execution` if the argument is missing or not a string.
    pub fn str_arg(&self, index: usize) -> Result<&str, TaskError> {
        self.arg(index).and_then(Value::as_str).ok_or_else(|| {
            TaskError::Execution(format!(
                "task '{}' expects a string argument at position {}",
                self.task_id, index
            ))
        })
    }

    /// Returns whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// The token task bodies can hand to their own sub-operations.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// An executable task body.
///
/// Returning `Err(TaskError::Execution(..))` or timing out counts against the
/// task's retry budget; `Err(TaskError::Cancelled)` ends the task immediately.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError>;
}

/// Adapter turning an async closure into a `TaskHandler`.
pub struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send,
{
    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        (self.func)(ctx).await
    }
}

/// Wraps an async closure as a shareable handler.
///
/// ```rust,ignore
/// engine.register_handler("noop", handler_fn(|_ctx| async { Ok(serde_json::Value::Null) }));
/// ```
pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    Arc::new(FnHandler { func })
}

/// Name to handler lookup shared by submission and dispatch.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a handler.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let name = name.into();
        tracing::debug!(handler = %name, "Registered task handler");
        self.handlers
            .write()
            .expect("lock not poisoned")
            .insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .expect("lock not poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .expect("lock not poisoned")
            .contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .expect("lock not poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handler_fn_runs_closure() {
        let handler = handler_fn(|ctx: TaskContext| async move {
            Ok(json!({ "task": ctx.task_id, "first": ctx.arg(0).cloned() }))
        });

        let ctx = TaskContext::new("w1", "t1", vec![json!("quote.pdf")]);
        let value = handler.run(ctx).await.expect("handler should succeed");

        assert_eq!(value, json!({ "task": "t1", "first": "quote.pdf" }));
    }

    #[test]
    fn test_registry_register_and_lookup() {
        let registry = HandlerRegistry::new();
        registry.register("b.noop", handler_fn(|_| async { Ok(Value::Null) }));
        registry.register("a.noop", handler_fn(|_| async { Ok(Value::Null) }));

        assert!(registry.contains("a.noop"));
        assert!(registry.get("b.noop").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), ["a.noop", "b.noop"]);
    }

    #[test]
    fn test_context_str_arg() {
        let ctx = TaskContext::new("w1", "t1", vec![json!("a.pdf"), json!(3)]);

        assert_eq!(ctx.str_arg(0).unwrap(), "a.pdf");
        assert!(ctx.str_arg(1).is_err());
        assert!(ctx.str_arg(2).is_err());
    }

    #[tokio::test]
    async fn test_context_cancellation() {
        let token = CancellationToken::new();
        let ctx = TaskContext::new("w1", "t1", Vec::new()).with_cancellation(token.clone());

        assert!(!ctx.is_cancelled());
        token.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }
}
