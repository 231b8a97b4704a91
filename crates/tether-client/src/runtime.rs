use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tether_core::context::ClientContext;
use tether_core::protocol::{ClientFrame, ServerFrame};

use crate::executors::{ExecutorMap, ToolExecutor};
use crate::scopes::ScopedContext;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Local budget for one executor run before a `tool_error` is emitted.
    pub default_tool_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

/// The client half of the runtime: owns the executor bindings and the
/// scoped context, speaks the wire protocol over a duplex channel pair.
/// The transport framing itself (WebSocket or otherwise) lives outside.
pub struct ClientRuntime {
    executors: Arc<ExecutorMap>,
    scopes: Mutex<ScopedContext>,
    outbound: mpsc::Sender<ClientFrame>,
    connected: AtomicBool,
    config: RuntimeConfig,
}

impl ClientRuntime {
    pub fn new(outbound: mpsc::Sender<ClientFrame>, config: RuntimeConfig) -> Self {
        Self {
            executors: Arc::new(ExecutorMap::new()),
            scopes: Mutex::new(ScopedContext::new()),
            outbound,
            connected: AtomicBool::new(false),
            config,
        }
    }

    pub fn register_executor(&self, tool_id: &str, executor: Arc<dyn ToolExecutor>) -> bool {
        self.executors.register(tool_id, executor)
    }

    pub fn unregister_executor(&self, tool_id: &str) -> bool {
        self.executors.unregister(tool_id)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Mark the connection live and push the merged context before any
    /// other traffic. Called again on every reconnect.
    pub async fn connect(&self) {
        self.connected.store(true, Ordering::Relaxed);
        self.sync_context().await;
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    /// Contribute a scope's partial context. While connected, every change
    /// re-sends the merged context.
    pub async fn set_scope(&self, scope: impl Into<String>, partial: ClientContext) {
        self.scopes.lock().set(scope, partial);
        if self.is_connected() {
            self.sync_context().await;
        }
    }

    pub async fn remove_scope(&self, scope: &str) {
        if self.scopes.lock().remove(scope) && self.is_connected() {
            self.sync_context().await;
        }
    }

    pub fn merged_context(&self) -> ClientContext {
        self.scopes.lock().merged()
    }

    async fn sync_context(&self) {
        let merged = self.merged_context();
        if self
            .outbound
            .send(ClientFrame::ContextUpdate(merged))
            .await
            .is_err()
        {
            warn!("outbound channel closed; context update dropped");
        }
    }

    /// Route one inbound server frame. Tool invocations are handled here
    /// (the executor runs on its own task so a slow tool never blocks the
    /// inbound loop); anything else is handed back for the embedding UI.
    pub fn handle_frame(&self, frame: ServerFrame) -> Option<ServerFrame> {
        match frame {
            ServerFrame::ToolInvocation {
                tool_id,
                call_id,
                params,
            } => {
                self.spawn_invocation(tool_id, call_id, params);
                None
            }
            other => Some(other),
        }
    }

    fn spawn_invocation(&self, tool_id: String, call_id: String, params: serde_json::Value) {
        let executors = Arc::clone(&self.executors);
        let outbound = self.outbound.clone();
        let timeout = self.config.default_tool_timeout;

        tokio::spawn(async move {
            let frame = run_invocation(&executors, timeout, tool_id, call_id, params).await;
            if outbound.send(frame).await.is_err() {
                debug!("outbound channel closed; tool reply dropped");
            }
        });
    }
}

async fn run_invocation(
    executors: &ExecutorMap,
    timeout: Duration,
    tool_id: String,
    call_id: String,
    params: serde_json::Value,
) -> ClientFrame {
    let Some(executor) = executors.get(&tool_id) else {
        return ClientFrame::ToolError {
            message: format!("Tool '{tool_id}' is not available in the current client version"),
            tool_id,
            call_id,
        };
    };

    match tokio::time::timeout(timeout, executor.execute(params)).await {
        Ok(Ok(result)) => ClientFrame::ToolResult {
            tool_id,
            call_id,
            result,
        },
        Ok(Err(message)) => {
            warn!(tool_id = %tool_id, %message, "executor failed");
            ClientFrame::ToolError {
                tool_id,
                call_id,
                message,
            }
        }
        Err(_) => {
            warn!(tool_id = %tool_id, timeout_ms = timeout.as_millis() as u64, "executor timed out");
            ClientFrame::ToolError {
                message: format!("Tool Timeout ({}ms)", timeout.as_millis()),
                tool_id,
                call_id,
            }
        }
    }
}
