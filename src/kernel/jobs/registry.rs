//! Task registry (§4.B): name -> builtin dispatch, frozen after start-up so
//! steady-state reads never lock.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),
    #[error("task cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<String, TaskError>> + Send>>;
type BoxedHandler = Box<dyn Fn(CancellationToken, HashMap<String, String>) -> HandlerFuture + Send + Sync>;

/// Builder-phase registry. Populate with `register`, then `freeze` before the
/// first Executor iteration — registration after freeze is not possible by
/// construction (no `&mut` access survives `freeze`).
pub struct TaskRegistry {
    handlers: HashMap<String, BoxedHandler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a task implementation under a normalized name. Panics on a
    /// duplicate name — a programmer error caught at start-up, not a runtime one.
    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(CancellationToken, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, TaskError>> + Send + 'static,
    {
        let normalized = normalize(name);
        let boxed: BoxedHandler = Box::new(move |ctx, params| Box::pin(handler(ctx, params)));
        if self.handlers.insert(normalized.clone(), boxed).is_some() {
            panic!("duplicate task registration for '{normalized}'");
        }
    }

    pub fn freeze(self) -> FrozenTaskRegistry {
        FrozenTaskRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FrozenTaskRegistry {
    handlers: Arc<HashMap<String, BoxedHandler>>,
}

impl FrozenTaskRegistry {
    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(&normalize(name))
    }

    pub async fn run_builtin(
        &self,
        ctx: CancellationToken,
        name: &str,
        params: HashMap<String, String>,
    ) -> Result<String, TaskError> {
        let handler = self
            .handlers
            .get(&normalize(name))
            .ok_or_else(|| TaskError::UnknownTask(name.to_string()))?;
        handler(ctx, params).await
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Registers the reference builtins (`echo`, `http_request`, `send_email`)
/// the registry contract is exercised against.
pub fn default_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register("echo", crate::kernel::jobs::builtins::echo);
    registry.register("http_request", crate::kernel::jobs::builtins::http_request);
    registry.register("send_email", crate::kernel::jobs::builtins::send_email);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_builtin_dispatches_registered_handler() {
        let mut registry = TaskRegistry::new();
        registry.register("noop", |_ctx, params| async move {
            Ok(params.get("x").cloned().unwrap_or_default())
        });
        let frozen = registry.freeze();

        let mut params = HashMap::new();
        params.insert("x".to_string(), "hi".to_string());
        let output = frozen
            .run_builtin(CancellationToken::new(), "NOOP", params)
            .await
            .unwrap();
        assert_eq!(output, "hi");
    }

    #[tokio::test]
    async fn run_builtin_unknown_name_fails() {
        let frozen = TaskRegistry::new().freeze();
        let err = frozen
            .run_builtin(CancellationToken::new(), "ghost", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::UnknownTask(_)));
    }

    #[test]
    #[should_panic(expected = "duplicate task registration")]
    fn duplicate_registration_panics() {
        let mut registry = TaskRegistry::new();
        registry.register("dup", |_ctx, _params| async move { Ok(String::new()) });
        registry.register("dup", |_ctx, _params| async move { Ok(String::new()) });
    }
}
