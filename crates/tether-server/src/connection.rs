use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use tether_core::ids::{ConnectionId, SessionId};
use tether_core::protocol::{ClientFrame, ServerFrame};
use tether_engine::session::SessionOrchestrator;

use crate::server::AgentServer;

/// Drive one WebSocket connection: spawn the session, pump outbound frames
/// on a writer task, and feed inbound frames to the orchestrator in arrival
/// order on this task.
pub(crate) async fn handle_socket(
    socket: WebSocket,
    server: Arc<AgentServer>,
    session_param: Option<String>,
) {
    let connection_id = ConnectionId::new();
    // Session identity comes from the handshake when provided, else the
    // transport-assigned connection id. A returning client that presents
    // the same session id gets its persisted history back.
    let session_id = session_param
        .map(SessionId::from_raw)
        .unwrap_or_else(|| SessionId::from_raw(connection_id.as_str()));

    info!(connection_id = %connection_id, session_id = %session_id, "client connected");

    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(server.config.max_send_queue);
    let handle = Arc::new(
        SessionOrchestrator::spawn(
            session_id,
            server.registry.clone(),
            Arc::clone(&server.provider),
            Arc::clone(&server.store),
            out_tx,
            server.config.session.clone(),
        )
        .await,
    );
    server
        .sessions
        .insert(connection_id.clone(), Arc::clone(&handle));

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: serialize outbound frames onto the socket.
    let writer_cid = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_tx.send(WsMessage::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(connection_id = %writer_cid, error = %e, "failed to serialize frame")
                }
            }
        }
    });

    // Inbound frames apply strictly in arrival order; protocol noise is
    // logged and dropped without touching session state.
    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            WsMessage::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => handle.handle_frame(frame).await,
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "invalid frame dropped")
                }
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    // Disconnection is silent: free the in-memory session, keep the
    // persisted snapshot for a later reconnect.
    if let Some((_, session)) = server.sessions.remove(&connection_id) {
        session.close();
    }
    writer.abort();
    let _ = writer.await;

    info!(connection_id = %connection_id, "client disconnected");
}
