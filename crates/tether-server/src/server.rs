use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use tether_core::ids::ConnectionId;
use tether_core::provider::Provider;
use tether_core::tools::{handler_fn, ToolDefinition, ToolError};
use tether_engine::registry::{SharedRegistry, ToolRouter};
use tether_engine::session::{SessionConfig, SessionHandle};
use tether_store::SessionStore;

use crate::connection;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9292,
            max_send_queue: 256,
            session: SessionConfig::default(),
        }
    }
}

/// The server façade: owns the tool registry and the injected provider and
/// store, accepts connections, and runs one session orchestrator per
/// connection.
pub struct AgentServer {
    pub(crate) registry: SharedRegistry,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) sessions: Arc<DashMap<ConnectionId, Arc<SessionHandle>>>,
    pub(crate) config: ServerConfig,
}

impl AgentServer {
    pub fn new(
        config: ServerConfig,
        provider: Arc<dyn Provider>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let registry = SharedRegistry::default();
        registry.register(current_context_tool());

        Self {
            registry,
            provider,
            store,
            sessions: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn register(&self, tool: ToolDefinition) {
        self.registry.register(tool);
    }

    pub fn register_all(&self, tools: Vec<ToolDefinition>) {
        self.registry.register_all(tools);
    }

    pub fn use_router(&self, router: ToolRouter) {
        self.registry.use_router(router);
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Bind and serve. Port 0 asks the OS for a free port (used by tests).
    pub async fn start(self: Arc<Self>) -> std::io::Result<ServerHandle> {
        let router = build_router(Arc::clone(&self));
        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        info!(port = local_addr.port(), "tether server started");

        let shutdown = CancellationToken::new();
        let shutdown_for_axum = shutdown.clone();
        let server_task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_for_axum.cancelled().await;
                })
                .await
                .ok();
        });

        Ok(ServerHandle {
            port: local_addr.port(),
            shutdown,
            server: server_task,
            sessions: Arc::clone(&self.sessions),
        })
    }
}

/// The implicit server-side tool: lets the LLM inspect the current client
/// context without a client round trip.
fn current_context_tool() -> ToolDefinition {
    ToolDefinition::server(
        "get_current_context",
        "Returns the current client context (page, tab, capabilities, metadata).",
        serde_json::json!({"type": "object", "properties": {}}),
        handler_fn(|_args, context| async move {
            serde_json::to_value(&context).map_err(|e| ToolError::ExecutionFailed(e.to_string()))
        }),
    )
}

/// Build the axum router with all routes.
pub fn build_router(server: Arc<AgentServer>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(server)
        .layer(CorsLayer::permissive())
}

/// WebSocket upgrade handler. An optional `?session=` query parameter is
/// the handshake slot for resuming a persisted session.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(server): State<Arc<AgentServer>>,
) -> impl IntoResponse {
    let session = params.get("session").cloned();
    ws.on_upgrade(move |socket| connection::handle_socket(socket, server, session))
}

/// Health check HTTP endpoint.
async fn health_handler(State(server): State<Arc<AgentServer>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "connections": server.connection_count(),
        "tools": server.registry.names(),
    }))
}

/// Handle returned by `start()` — keeps the accept loop alive.
///
/// Call `shutdown()` to stop accepting new connections, then `drain()` to
/// wait for the server task and tear down remaining sessions.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    sessions: Arc<DashMap<ConnectionId, Arc<SessionHandle>>>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        info!("server shutdown initiated");
        self.shutdown.cancel();
    }

    pub async fn drain(self) {
        let _ = self.server.await;

        for entry in self.sessions.iter() {
            entry.value().close();
        }
        self.sessions.clear();
        info!("server drained");
    }
}
