use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

/// A client-side function bound by tool name. The server dispatches
/// `tool_invocation` frames to it; errors are plain strings because they
/// travel back over the wire as `tool_error.message`.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, params: serde_json::Value) -> Result<serde_json::Value, String>;
}

struct FnExecutor<F>(F);

#[async_trait]
impl<F, Fut> ToolExecutor for FnExecutor<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, String>> + Send,
{
    async fn execute(&self, params: serde_json::Value) -> Result<serde_json::Value, String> {
        (self.0)(params).await
    }
}

/// Wrap an async closure as a [`ToolExecutor`].
pub fn executor_fn<F, Fut>(f: F) -> Arc<dyn ToolExecutor>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
{
    Arc::new(FnExecutor(f))
}

/// Executors registered on this client, keyed by tool id.
#[derive(Default)]
pub struct ExecutorMap {
    executors: DashMap<String, Arc<dyn ToolExecutor>>,
}

impl ExecutorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the executor for `tool_id`. Re-registering the
    /// same executor instance is a no-op; returns whether the map changed.
    pub fn register(&self, tool_id: &str, executor: Arc<dyn ToolExecutor>) -> bool {
        if let Some(existing) = self.executors.get(tool_id) {
            if Arc::ptr_eq(&existing, &executor) {
                debug!(tool_id = %tool_id, "executor already registered; no-op");
                return false;
            }
        }
        self.executors.insert(tool_id.to_string(), executor);
        true
    }

    pub fn unregister(&self, tool_id: &str) -> bool {
        self.executors.remove(tool_id).is_some()
    }

    pub fn get(&self, tool_id: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.executors.get(tool_id).map(|e| Arc::clone(&e))
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
