use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use tether_core::context::ClientContext;
use tether_core::ids::SessionId;
use tether_core::messages::{ChatMessage, ToolCallRecord};
use tether_core::protocol::{ClientFrame, ServerFrame};
use tether_core::provider::{Provider, ProviderEvent};
use tether_core::tools::{ExecutionSide, ToolDefinition};
use tether_store::{SessionSnapshot, SessionStore};

use crate::pending::PendingCalls;
use crate::registry::SharedRegistry;

/// History entry recorded when a tool call is suppressed because its
/// availability filter no longer matches the dispatch-time context.
pub const GHOST_EXECUTION_ERROR: &str =
    "Error: User is no longer on the valid page. The tool cannot be executed in the current context.";

/// Terminal frame content when the per-message turn cap is exhausted with
/// the provider still requesting tools.
pub const TURN_LIMIT_MESSAGE: &str = "Turn limit reached";

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant embedded in this application. \
     Use the available tools to act on the user's behalf.";

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard cap on provider calls per user message — the bounded-runaway guard.
const DEFAULT_MAX_TURNS: u32 = 5;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub system_prompt: String,
    pub default_tool_timeout: Duration,
    pub max_turns: u32,
    /// User messages queued behind an active loop before new ones are shed.
    pub prompt_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            default_tool_timeout: DEFAULT_TOOL_TIMEOUT,
            max_turns: DEFAULT_MAX_TURNS,
            prompt_queue: 32,
        }
    }
}

struct ToolCallRequest {
    tool_name: String,
    call_id: String,
    args: serde_json::Value,
}

/// Per-connection session state machine: owns the history, runs the agent
/// loop, and correlates client-tool round trips.
///
/// Inbound frames are routed immediately on the caller's task — a
/// `context_update` always wins and is visible to tool dispatches already
/// in flight this turn. User messages are queued onto the session task,
/// which serializes agent loops: a second message arriving mid-loop waits
/// for the first to finish.
pub struct SessionOrchestrator {
    session_id: SessionId,
    registry: SharedRegistry,
    provider: Arc<dyn Provider>,
    store: Arc<dyn SessionStore>,
    outbound: mpsc::Sender<ServerFrame>,
    config: SessionConfig,

    current_context: RwLock<ClientContext>,
    history: Mutex<Vec<ChatMessage>>,
    pending: PendingCalls,
    prompt_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

/// Handle owning a running session task.
pub struct SessionHandle {
    orchestrator: Arc<SessionOrchestrator>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.orchestrator.session_id
    }

    /// Route one inbound frame into the session.
    pub async fn handle_frame(&self, frame: ClientFrame) {
        self.orchestrator.handle_frame(frame).await;
    }

    /// Tear the session down: rejects pending waiters and stops the loop at
    /// its next await. Persisted state survives for a later reconnect.
    pub fn close(&self) {
        self.orchestrator.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close and wait for the session task to exit.
    pub async fn shutdown(self) {
        self.orchestrator.cancel.cancel();
        let _ = self.task.await;
    }
}

impl SessionOrchestrator {
    /// Restore (or seed) the session and start its task.
    pub async fn spawn(
        session_id: SessionId,
        registry: SharedRegistry,
        provider: Arc<dyn Provider>,
        store: Arc<dyn SessionStore>,
        outbound: mpsc::Sender<ServerFrame>,
        config: SessionConfig,
    ) -> SessionHandle {
        let (prompt_tx, prompt_rx) = mpsc::channel(config.prompt_queue.max(1));

        let orchestrator = Arc::new(Self {
            session_id,
            registry,
            provider,
            store,
            outbound,
            config,
            current_context: RwLock::new(ClientContext::default()),
            history: Mutex::new(Vec::new()),
            pending: PendingCalls::new(),
            prompt_tx,
            cancel: CancellationToken::new(),
        });

        orchestrator.initialize().await;

        let task = tokio::spawn(Arc::clone(&orchestrator).run(prompt_rx));
        SessionHandle { orchestrator, task }
    }

    async fn initialize(&self) {
        match self.store.get(&self.session_id).await {
            Ok(Some(snapshot)) => {
                debug!(
                    session_id = %self.session_id,
                    messages = snapshot.messages.len(),
                    "restored session from store"
                );
                *self.current_context.write() = snapshot.context;
                *self.history.lock() = snapshot.messages;
            }
            Ok(None) => {
                self.history
                    .lock()
                    .push(ChatMessage::system(&self.config.system_prompt));
                self.persist().await;
            }
            Err(e) => {
                // Storage trouble is never fatal; start fresh in memory and
                // let the next successful write heal durability.
                warn!(session_id = %self.session_id, error = %e, "session restore failed");
                self.history
                    .lock()
                    .push(ChatMessage::system(&self.config.system_prompt));
            }
        }
    }

    async fn run(self: Arc<Self>, mut prompts: mpsc::Receiver<String>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                prompt = prompts.recv() => match prompt {
                    Some(content) => self.run_agent_loop(content).await,
                    None => break,
                },
            }
        }
        let aborted = self.pending.abort_all();
        if aborted > 0 {
            debug!(session_id = %self.session_id, aborted, "rejected pending tool calls on teardown");
        }
    }

    /// Route one inbound frame. Context updates and tool replies take
    /// effect immediately; user messages queue behind the active loop.
    pub async fn handle_frame(&self, frame: ClientFrame) {
        match frame {
            ClientFrame::ContextUpdate(context) => self.handle_context_update(context).await,
            ClientFrame::UserMessage { content } => {
                if self.prompt_tx.try_send(content).is_err() {
                    warn!(session_id = %self.session_id, "prompt queue full; user message dropped");
                }
            }
            ClientFrame::ToolResult { call_id, result, .. } => {
                if !self.pending.resolve_result(&call_id, result) {
                    debug!(session_id = %self.session_id, call_id = %call_id, "unmatched tool result");
                }
            }
            ClientFrame::ToolError { call_id, message, .. } => {
                if !self.pending.resolve_error(&call_id, message) {
                    debug!(session_id = %self.session_id, call_id = %call_id, "unmatched tool error");
                }
            }
        }
    }

    async fn handle_context_update(&self, context: ClientContext) {
        *self.current_context.write() = context.clone();
        self.persist().await;

        let available_tools = self
            .registry
            .tools_for_context(&context)
            .iter()
            .map(|tool| tool.name.clone())
            .collect();
        self.send(ServerFrame::ContextSync {
            context,
            available_tools,
        })
        .await;
    }

    #[instrument(skip(self, content), fields(session_id = %self.session_id))]
    async fn run_agent_loop(&self, content: String) {
        self.history.lock().push(ChatMessage::user(content));
        self.persist().await;

        for turn in 1..=self.config.max_turns {
            if self.cancel.is_cancelled() {
                return;
            }

            // Availability is computed from the context as of this turn;
            // dispatch re-checks it per call below.
            let context = self.current_context.read().clone();
            let tools = self.registry.provider_tools_for_context(&context);
            let messages = self.history.lock().clone();

            let events = match self.provider.run(&messages, &tools).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, turn, "provider call failed");
                    self.send(ServerFrame::done(format!("Error: {e}"), None)).await;
                    return;
                }
            };

            let mut text = String::new();
            let mut calls: Vec<ToolCallRequest> = Vec::new();
            let mut suggested: Option<Vec<String>> = None;
            let mut turn_error: Option<String> = None;

            for event in events {
                match event {
                    ProviderEvent::Text {
                        content,
                        suggested_actions,
                        ..
                    } => {
                        if !content.is_empty() {
                            self.send(ServerFrame::partial(content.clone())).await;
                            text.push_str(&content);
                        }
                        if suggested_actions.is_some() {
                            suggested = suggested_actions;
                        }
                    }
                    ProviderEvent::ToolCall {
                        tool_name,
                        call_id,
                        args,
                    } => calls.push(ToolCallRequest {
                        tool_name,
                        call_id,
                        args,
                    }),
                    ProviderEvent::Error { message } => {
                        turn_error = Some(message);
                        break;
                    }
                }
            }

            if let Some(message) = turn_error {
                warn!(error = %message, turn, "provider emitted error event");
                self.send(ServerFrame::done(format!("Error: {message}"), None))
                    .await;
                return;
            }

            let records: Vec<ToolCallRecord> = calls
                .iter()
                .map(|call| ToolCallRecord {
                    id: call.call_id.clone(),
                    name: call.tool_name.clone(),
                    arguments: serde_json::to_string(&call.args)
                        .unwrap_or_else(|_| "{}".into()),
                })
                .collect();
            let turn_text = if text.is_empty() { None } else { Some(text) };
            self.history
                .lock()
                .push(ChatMessage::assistant_turn(turn_text, records));
            self.persist().await;

            if calls.is_empty() {
                self.send(ServerFrame::done("", suggested)).await;
                return;
            }

            // Strictly sequential, in provider order: some call sequences
            // are only coherent in order, and the LLM expects its own
            // ordering preserved in the history.
            for call in &calls {
                let entry = self.dispatch_tool_call(call).await;
                self.history.lock().push(entry);
            }
            self.persist().await;
        }

        // A silent exit here would leave clients stuck on a spinner, so a
        // synthesized terminal frame closes the turn.
        warn!(max_turns = self.config.max_turns, "turn cap reached with tool calls pending");
        self.send(ServerFrame::done(TURN_LIMIT_MESSAGE, None)).await;
    }

    async fn dispatch_tool_call(&self, call: &ToolCallRequest) -> ChatMessage {
        // Dispatch-time availability check, against the *current* context —
        // the user may have navigated away since the provider emitted the
        // call, and mid-turn context updates must be honored.
        let context = self.current_context.read().clone();
        if !self.registry.is_available(&call.tool_name, &context) {
            debug!(tool = %call.tool_name, call_id = %call.call_id, "suppressed unavailable tool call");
            return ChatMessage::tool(call.call_id.as_str(), GHOST_EXECUTION_ERROR);
        }

        let Some(tool) = self.registry.by_name(&call.tool_name) else {
            // Unknown names already fail is_available; this arm guards a
            // racing unregister between the two reads.
            return ChatMessage::tool(call.call_id.as_str(), GHOST_EXECUTION_ERROR);
        };

        let outcome = match &tool.side {
            ExecutionSide::Server { handler } => handler
                .call(call.args.clone(), &context)
                .await
                .map_err(|e| e.to_string()),
            ExecutionSide::Client { .. } => self.invoke_client_tool(&tool, call).await,
        };

        match outcome {
            Ok(value) => match self.registry.validate_result(&call.tool_name, value) {
                Ok(validated) => ChatMessage::tool(
                    call.call_id.as_str(),
                    serde_json::to_string(&validated).unwrap_or_else(|_| "null".into()),
                ),
                Err(reason) => {
                    warn!(tool = %call.tool_name, %reason, "tool result rejected");
                    ChatMessage::tool(
                        call.call_id.as_str(),
                        serde_json::json!({ "error": reason }).to_string(),
                    )
                }
            },
            Err(message) => {
                warn!(tool = %call.tool_name, error = %message, "tool dispatch failed");
                ChatMessage::tool(call.call_id.as_str(), format!("Error: {message}"))
            }
        }
    }

    /// Emit a `tool_invocation` and await the correlated reply, the
    /// per-tool timeout, or session teardown — whichever comes first. Every
    /// path removes the waiter before returning.
    async fn invoke_client_tool(
        &self,
        tool: &ToolDefinition,
        call: &ToolCallRequest,
    ) -> Result<serde_json::Value, String> {
        let timeout = tool.timeout.unwrap_or(self.config.default_tool_timeout);
        let reply = self.pending.insert(&call.call_id);

        let frame = ServerFrame::ToolInvocation {
            tool_id: call.tool_name.clone(),
            call_id: call.call_id.clone(),
            params: call.args.clone(),
        };
        if self.outbound.send(frame).await.is_err() {
            self.pending.abandon(&call.call_id);
            return Err("client disconnected".into());
        }

        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.pending.abandon(&call.call_id);
                Err("session closed".into())
            }
            received = reply => match received {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(message),
                Err(_) => Err("session closed".into()),
            },
            _ = tokio::time::sleep(timeout) => {
                self.pending.abandon(&call.call_id);
                Err(format!("Tool Timeout ({}ms)", timeout.as_millis()))
            }
        }
    }

    async fn persist(&self) {
        let snapshot = SessionSnapshot {
            context: self.current_context.read().clone(),
            messages: self.history.lock().clone(),
        };
        if let Err(e) = self.store.set(&self.session_id, &snapshot).await {
            warn!(session_id = %self.session_id, error = %e, "failed to persist session snapshot");
        }
    }

    async fn send(&self, frame: ServerFrame) {
        if self.outbound.send(frame).await.is_err() {
            debug!(session_id = %self.session_id, "outbound channel closed; frame dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::timeout;

    use tether_core::messages::Role;
    use tether_core::provider::{ProviderError, ProviderTool};
    use tether_core::tools::handler_fn;
    use tether_llm::mock::{MockProvider, MockTurn};
    use tether_store::MemoryStore;

    use crate::registry::ToolRegistry;

    const TICK: Duration = Duration::from_secs(2);

    struct Harness {
        handle: SessionHandle,
        frames: mpsc::Receiver<ServerFrame>,
        store: Arc<MemoryStore>,
        session_id: SessionId,
    }

    async fn spawn_session(
        registry: ToolRegistry,
        provider: Arc<dyn Provider>,
        config: SessionConfig,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        spawn_session_with_store(registry, provider, config, store).await
    }

    async fn spawn_session_with_store(
        registry: ToolRegistry,
        provider: Arc<dyn Provider>,
        config: SessionConfig,
        store: Arc<MemoryStore>,
    ) -> Harness {
        let session_id = SessionId::new();
        let (out_tx, out_rx) = mpsc::channel(64);
        let handle = SessionOrchestrator::spawn(
            session_id.clone(),
            SharedRegistry::new(registry),
            provider,
            store.clone() as Arc<dyn SessionStore>,
            out_tx,
            config,
        )
        .await;

        Harness {
            handle,
            frames: out_rx,
            store,
            session_id,
        }
    }

    impl Harness {
        async fn say(&self, content: &str) {
            self.handle
                .handle_frame(ClientFrame::UserMessage {
                    content: content.into(),
                })
                .await;
        }

        /// Collect frames until a terminal agent_response arrives.
        async fn frames_until_done(&mut self) -> Vec<ServerFrame> {
            let mut frames = Vec::new();
            loop {
                let frame = timeout(TICK, self.frames.recv())
                    .await
                    .expect("timed out waiting for terminal frame")
                    .expect("outbound channel closed");
                let done = matches!(frame, ServerFrame::AgentResponse { done: true, .. });
                frames.push(frame);
                if done {
                    return frames;
                }
            }
        }

        async fn next_frame(&mut self) -> ServerFrame {
            timeout(TICK, self.frames.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("outbound channel closed")
        }

        async fn snapshot(&self) -> SessionSnapshot {
            self.store
                .get(&self.session_id)
                .await
                .unwrap()
                .expect("no persisted snapshot")
        }
    }

    fn weather_tool() -> ToolDefinition {
        ToolDefinition::server(
            "weather",
            "Look up the weather",
            json!({"type": "object", "properties": {"city": {"type": "string"}}}),
            handler_fn(|args, _ctx| async move {
                let city = args["city"].as_str().unwrap_or("nowhere").to_string();
                Ok(json!(format!("Weather in {city} is sunny")))
            }),
        )
    }

    fn dark_mode_tool() -> ToolDefinition {
        ToolDefinition::client(
            "toggleDarkMode",
            "Toggle dark mode",
            json!({"type": "object"}),
        )
        .with_filter(|ctx| ctx.page_id.as_deref() == Some("settings"))
        .with_result_schema(json!({
            "type": "object",
            "properties": {"darkMode": {"type": "boolean"}},
            "required": ["darkMode"]
        }))
    }

    fn settings_context() -> ClientContext {
        ClientContext {
            page_id: Some("settings".into()),
            ..Default::default()
        }
    }

    fn terminal(frames: &[ServerFrame]) -> &ServerFrame {
        frames.last().expect("no frames")
    }

    // Scenario: server tool only — one tool call turn, then a text turn.
    #[tokio::test]
    async fn server_tool_round_trip() {
        let mut registry = ToolRegistry::new();
        registry.register(weather_tool());

        let provider = Arc::new(MockProvider::new(vec![
            MockTurn::tool_call("weather", "c1", json!({"city": "Paris"})),
            MockTurn::text("It's sunny in Paris."),
        ]));

        let mut harness =
            spawn_session(registry, provider.clone(), SessionConfig::default()).await;
        harness.say("weather in Paris").await;

        let frames = harness.frames_until_done().await;
        match terminal(&frames) {
            ServerFrame::AgentResponse { content, done, .. } => {
                assert_eq!(content, "");
                assert!(done);
            }
            other => panic!("expected terminal response, got {other:?}"),
        }
        // The text turn streams one intermediate frame before the terminal.
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::AgentResponse { content, done: false, .. } if content == "It's sunny in Paris."
        )));

        let snapshot = harness.snapshot().await;
        let messages = &snapshot.messages;
        assert_eq!(messages.len(), 5); // system, user, assistant+call, tool, assistant

        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[2].tool_calls[0].id, "c1");
        assert_eq!(messages[2].tool_calls[0].name, "weather");

        assert_eq!(messages[3].role, Role::Tool);
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(
            messages[3].content.as_deref(),
            Some(r#""Weather in Paris is sunny""#)
        );

        assert_eq!(
            messages[4].content.as_deref(),
            Some("It's sunny in Paris.")
        );
        assert_eq!(provider.call_count(), 2);
    }

    // Scenario: client tool with a result schema, happy path.
    #[tokio::test]
    async fn client_tool_round_trip_with_schema() {
        let mut registry = ToolRegistry::new();
        registry.register(dark_mode_tool());

        let provider = Arc::new(MockProvider::new(vec![
            MockTurn::tool_call("toggleDarkMode", "c1", json!({})),
            MockTurn::text("Dark mode is on."),
        ]));

        let mut harness = spawn_session(registry, provider, SessionConfig::default()).await;
        harness
            .handle
            .handle_frame(ClientFrame::ContextUpdate(settings_context()))
            .await;
        // Drain the context_sync ack.
        let ack = harness.next_frame().await;
        assert!(matches!(ack, ServerFrame::ContextSync { .. }));

        harness.say("turn on dark mode").await;

        // The invocation goes out; reply like a well-behaved client.
        let invocation = harness.next_frame().await;
        match &invocation {
            ServerFrame::ToolInvocation {
                tool_id, call_id, ..
            } => {
                assert_eq!(tool_id, "toggleDarkMode");
                assert_eq!(call_id, "c1");
            }
            other => panic!("expected tool invocation, got {other:?}"),
        }
        harness
            .handle
            .handle_frame(ClientFrame::ToolResult {
                tool_id: "toggleDarkMode".into(),
                call_id: "c1".into(),
                result: json!({"darkMode": true}),
            })
            .await;

        let frames = harness.frames_until_done().await;
        assert!(matches!(
            terminal(&frames),
            ServerFrame::AgentResponse { done: true, .. }
        ));

        let snapshot = harness.snapshot().await;
        let tool_entry = snapshot
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert_eq!(tool_entry.content.as_deref(), Some(r#"{"darkMode":true}"#));
    }

    // A provider that flips the page to "todos" between emitting the tool
    // call and the orchestrator dispatching it.
    struct ContextFlippingProvider {
        orchestrator: parking_lot::Mutex<Option<Arc<SessionOrchestrator>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Provider for ContextFlippingProvider {
        fn name(&self) -> &str {
            "context-flipper"
        }

        async fn run(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ProviderTool],
        ) -> Result<Vec<ProviderEvent>, ProviderError> {
            if self.calls.fetch_add(1, Ordering::Relaxed) == 0 {
                let orchestrator = self.orchestrator.lock().clone();
                if let Some(orchestrator) = orchestrator {
                    orchestrator
                        .handle_context_update(ClientContext {
                            page_id: Some("todos".into()),
                            ..Default::default()
                        })
                        .await;
                }
                Ok(vec![ProviderEvent::ToolCall {
                    tool_name: "toggleDarkMode".into(),
                    call_id: "c1".into(),
                    args: json!({}),
                }])
            } else {
                Ok(vec![ProviderEvent::Text {
                    content: "Understood.".into(),
                    done: true,
                    suggested_actions: None,
                }])
            }
        }
    }

    // Scenario: ghost execution — the context changed between provider
    // emission and dispatch, so nothing must be invoked.
    #[tokio::test]
    async fn ghost_execution_is_suppressed() {
        let mut registry = ToolRegistry::new();
        registry.register(dark_mode_tool());

        let provider = Arc::new(ContextFlippingProvider {
            orchestrator: parking_lot::Mutex::new(None),
            calls: AtomicUsize::new(0),
        });

        let mut harness = spawn_session(
            registry,
            provider.clone() as Arc<dyn Provider>,
            SessionConfig::default(),
        )
        .await;
        *provider.orchestrator.lock() = Some(Arc::clone(&harness.handle.orchestrator));

        harness
            .handle
            .handle_frame(ClientFrame::ContextUpdate(settings_context()))
            .await;
        let _ack = harness.next_frame().await;

        harness.say("turn on dark mode").await;
        let frames = harness.frames_until_done().await;

        // No invocation may have been emitted.
        assert!(
            !frames
                .iter()
                .any(|f| matches!(f, ServerFrame::ToolInvocation { .. })),
            "ghost execution: tool_invocation was emitted: {frames:?}"
        );

        let snapshot = harness.snapshot().await;
        let tool_entry = snapshot
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert_eq!(tool_entry.content.as_deref(), Some(GHOST_EXECUTION_ERROR));

        // The loop continued to the second (text) turn.
        assert_eq!(provider.calls.load(Ordering::Relaxed), 2);
    }

    // Scenario: client never replies; the per-tool timeout folds into the
    // history and the provider is called again with it.
    #[tokio::test]
    async fn client_timeout_is_recorded() {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDefinition::client("slowTool", "Never answers", json!({"type": "object"}))
                .with_timeout(Duration::from_millis(50)),
        );

        let provider = Arc::new(MockProvider::new(vec![
            MockTurn::tool_call("slowTool", "c1", json!({})),
            MockTurn::text("Giving up on that."),
        ]));

        let mut harness =
            spawn_session(registry, provider.clone(), SessionConfig::default()).await;
        harness.say("do the slow thing").await;

        let frames = harness.frames_until_done().await;
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerFrame::ToolInvocation { .. })));

        let snapshot = harness.snapshot().await;
        let tool_entry = snapshot
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert_eq!(
            tool_entry.content.as_deref(),
            Some("Error: Tool Timeout (50ms)")
        );
        assert_eq!(provider.call_count(), 2);
    }

    // Scenario: result schema failure — the history gets {"error": ...}.
    #[tokio::test]
    async fn result_schema_failure_is_encoded() {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDefinition::client("lookup", "Looks things up", json!({"type": "object"}))
                .with_result_schema(json!({
                    "type": "object",
                    "properties": {"id": {"type": "integer"}},
                    "required": ["id"]
                })),
        );

        let provider = Arc::new(MockProvider::new(vec![
            MockTurn::tool_call("lookup", "c1", json!({})),
            MockTurn::text("That went badly."),
        ]));

        let mut harness = spawn_session(registry, provider, SessionConfig::default()).await;
        harness.say("look it up").await;

        let invocation = harness.next_frame().await;
        assert!(matches!(invocation, ServerFrame::ToolInvocation { .. }));
        harness
            .handle
            .handle_frame(ClientFrame::ToolResult {
                tool_id: "lookup".into(),
                call_id: "c1".into(),
                result: json!({"id": "x"}),
            })
            .await;

        let _frames = harness.frames_until_done().await;

        let snapshot = harness.snapshot().await;
        let tool_entry = snapshot
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(tool_entry.content.as_deref().unwrap()).unwrap();
        let object = parsed.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert!(object["error"]
            .as_str()
            .unwrap()
            .contains("Result validation failed"));
    }

    // Scenario: turn cap — five provider calls, then a synthesized
    // terminal frame.
    #[tokio::test]
    async fn turn_cap_stops_after_five_provider_calls() {
        let mut registry = ToolRegistry::new();
        registry.register(weather_tool());

        let turns = (0..6)
            .map(|i| MockTurn::tool_call("weather", &format!("c{i}"), json!({"city": "Paris"})))
            .collect();
        let provider = Arc::new(MockProvider::new(turns));

        let mut harness =
            spawn_session(registry, provider.clone(), SessionConfig::default()).await;
        harness.say("keep checking the weather").await;

        let frames = harness.frames_until_done().await;
        match terminal(&frames) {
            ServerFrame::AgentResponse { content, done, .. } => {
                assert_eq!(content, TURN_LIMIT_MESSAGE);
                assert!(done);
            }
            other => panic!("expected terminal response, got {other:?}"),
        }

        assert_eq!(provider.call_count(), 5);

        let snapshot = harness.snapshot().await;
        let assistants = snapshot
            .messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count();
        let tools = snapshot
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .count();
        assert_eq!(assistants, 5);
        assert_eq!(tools, 5);
    }

    #[tokio::test]
    async fn text_only_turn_emits_partial_then_terminal() {
        let provider = Arc::new(MockProvider::new(vec![MockTurn::Events(vec![
            ProviderEvent::Text {
                content: "Hello there.".into(),
                done: true,
                suggested_actions: Some(vec!["Ask me more".into()]),
            },
        ])]));

        let mut harness =
            spawn_session(ToolRegistry::new(), provider, SessionConfig::default()).await;
        harness.say("hi").await;

        let frames = harness.frames_until_done().await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            &frames[0],
            ServerFrame::AgentResponse { content, done: false, .. } if content == "Hello there."
        ));
        match &frames[1] {
            ServerFrame::AgentResponse {
                content,
                done,
                suggested_actions,
            } => {
                assert_eq!(content, "");
                assert!(done);
                assert_eq!(
                    suggested_actions.as_deref(),
                    Some(["Ask me more".to_string()].as_slice())
                );
            }
            other => panic!("expected terminal response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn provider_error_event_terminates_turn() {
        let provider = Arc::new(MockProvider::new(vec![MockTurn::error_event("overloaded")]));
        let mut harness =
            spawn_session(ToolRegistry::new(), provider.clone(), SessionConfig::default()).await;
        harness.say("hi").await;

        let frames = harness.frames_until_done().await;
        match terminal(&frames) {
            ServerFrame::AgentResponse { content, done, .. } => {
                assert_eq!(content, "Error: overloaded");
                assert!(done);
            }
            other => panic!("expected terminal response, got {other:?}"),
        }
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn provider_failure_terminates_turn() {
        let provider = Arc::new(MockProvider::new(vec![MockTurn::Fail(
            ProviderError::RateLimited,
        )]));
        let mut harness =
            spawn_session(ToolRegistry::new(), provider, SessionConfig::default()).await;
        harness.say("hi").await;

        let frames = harness.frames_until_done().await;
        match terminal(&frames) {
            ServerFrame::AgentResponse { content, done, .. } => {
                assert!(content.starts_with("Error:"), "got: {content}");
                assert!(done);
            }
            other => panic!("expected terminal response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_handler_error_folds_into_history() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolDefinition::server(
            "failing",
            "Always fails",
            json!({"type": "object"}),
            handler_fn(|_, _| async {
                Err(tether_core::tools::ToolError::ExecutionFailed(
                    "backend unavailable".into(),
                ))
            }),
        ));

        let provider = Arc::new(MockProvider::new(vec![
            MockTurn::tool_call("failing", "c1", json!({})),
            MockTurn::text("Noted the failure."),
        ]));

        let mut harness = spawn_session(registry, provider, SessionConfig::default()).await;
        harness.say("try it").await;
        let _frames = harness.frames_until_done().await;

        let snapshot = harness.snapshot().await;
        let tool_entry = snapshot
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert_eq!(
            tool_entry.content.as_deref(),
            Some("Error: backend unavailable")
        );
    }

    #[tokio::test]
    async fn context_update_acks_with_available_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(weather_tool());
        registry.register(dark_mode_tool());

        let provider = Arc::new(MockProvider::new(vec![]));
        let mut harness = spawn_session(registry, provider, SessionConfig::default()).await;

        harness
            .handle
            .handle_frame(ClientFrame::ContextUpdate(settings_context()))
            .await;
        match harness.next_frame().await {
            ServerFrame::ContextSync {
                context,
                available_tools,
            } => {
                assert_eq!(context.page_id.as_deref(), Some("settings"));
                assert_eq!(available_tools, vec!["weather", "toggleDarkMode"]);
            }
            other => panic!("expected context_sync, got {other:?}"),
        }

        // Off the settings page the filtered tool disappears.
        harness
            .handle
            .handle_frame(ClientFrame::ContextUpdate(ClientContext::default()))
            .await;
        match harness.next_frame().await {
            ServerFrame::ContextSync {
                available_tools, ..
            } => assert_eq!(available_tools, vec!["weather"]),
            other => panic!("expected context_sync, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn queued_user_messages_run_in_order() {
        let provider = Arc::new(MockProvider::new(vec![
            MockTurn::delayed(Duration::from_millis(50), MockTurn::text("first answer")),
            MockTurn::text("second answer"),
        ]));

        let mut harness =
            spawn_session(ToolRegistry::new(), provider.clone(), SessionConfig::default()).await;
        harness.say("first").await;
        harness.say("second").await;

        let first = harness.frames_until_done().await;
        let second = harness.frames_until_done().await;

        assert!(first.iter().any(|f| matches!(
            f,
            ServerFrame::AgentResponse { content, .. } if content == "first answer"
        )));
        assert!(second.iter().any(|f| matches!(
            f,
            ServerFrame::AgentResponse { content, .. } if content == "second answer"
        )));
        assert_eq!(provider.call_count(), 2);

        let snapshot = harness.snapshot().await;
        let users: Vec<_> = snapshot
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.clone().unwrap())
            .collect();
        assert_eq!(users, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn session_restores_history_from_store() {
        let store = Arc::new(MemoryStore::new());
        let session_id = SessionId::new();
        let prior = SessionSnapshot {
            context: settings_context(),
            messages: vec![
                ChatMessage::system("You are helpful."),
                ChatMessage::user("earlier question"),
                ChatMessage::assistant("earlier answer"),
            ],
        };
        store.set(&session_id, &prior).await.unwrap();

        let provider = Arc::new(MockProvider::new(vec![MockTurn::text("with history")]));
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let handle = SessionOrchestrator::spawn(
            session_id.clone(),
            SharedRegistry::new(ToolRegistry::new()),
            provider,
            store.clone() as Arc<dyn SessionStore>,
            out_tx,
            SessionConfig::default(),
        )
        .await;

        handle
            .handle_frame(ClientFrame::UserMessage {
                content: "follow-up".into(),
            })
            .await;

        // Drain until terminal.
        loop {
            let frame = timeout(TICK, out_rx.recv()).await.unwrap().unwrap();
            if matches!(frame, ServerFrame::AgentResponse { done: true, .. }) {
                break;
            }
        }

        let snapshot = store.get(&session_id).await.unwrap().unwrap();
        assert_eq!(snapshot.messages[1].content.as_deref(), Some("earlier question"));
        assert_eq!(snapshot.messages[3].content.as_deref(), Some("follow-up"));
        // Restored context is still the settings page.
        assert_eq!(snapshot.context.page_id.as_deref(), Some("settings"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn fresh_session_is_seeded_with_system_prompt() {
        let provider = Arc::new(MockProvider::new(vec![]));
        let config = SessionConfig {
            system_prompt: "Custom prompt.".into(),
            ..Default::default()
        };
        let harness = spawn_session(ToolRegistry::new(), provider, config).await;

        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].role, Role::System);
        assert_eq!(snapshot.messages[0].content.as_deref(), Some("Custom prompt."));
    }

    #[tokio::test]
    async fn close_rejects_pending_and_stops_task() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolDefinition::client(
            "waitForever",
            "Never answered",
            json!({"type": "object"}),
        ));

        let provider = Arc::new(MockProvider::new(vec![MockTurn::tool_call(
            "waitForever",
            "c1",
            json!({}),
        )]));

        let mut harness = spawn_session(registry, provider, SessionConfig::default()).await;
        harness.say("wait").await;

        // The invocation is in flight; tear the session down.
        let invocation = harness.next_frame().await;
        assert!(matches!(invocation, ServerFrame::ToolInvocation { .. }));

        harness.handle.close();
        timeout(TICK, async {
            while !harness.handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session task did not stop after close");

        assert!(harness.handle.orchestrator.pending.is_empty());
    }

    #[tokio::test]
    async fn unmatched_tool_replies_are_ignored() {
        let provider = Arc::new(MockProvider::new(vec![MockTurn::text("fine")]));
        let mut harness =
            spawn_session(ToolRegistry::new(), provider, SessionConfig::default()).await;

        // No pending call: these must be dropped without effect.
        harness
            .handle
            .handle_frame(ClientFrame::ToolResult {
                tool_id: "anything".into(),
                call_id: "nope".into(),
                result: json!(1),
            })
            .await;
        harness
            .handle
            .handle_frame(ClientFrame::ToolError {
                tool_id: "anything".into(),
                call_id: "nope".into(),
                message: "spurious".into(),
            })
            .await;

        harness.say("hi").await;
        let frames = harness.frames_until_done().await;
        assert!(matches!(
            terminal(&frames),
            ServerFrame::AgentResponse { done: true, .. }
        ));
    }

    #[tokio::test]
    async fn tool_history_order_matches_provider_order() {
        let mut registry = ToolRegistry::new();
        registry.register(weather_tool());

        let provider = Arc::new(MockProvider::new(vec![
            MockTurn::Events(vec![
                ProviderEvent::ToolCall {
                    tool_name: "weather".into(),
                    call_id: "c1".into(),
                    args: json!({"city": "Paris"}),
                },
                ProviderEvent::ToolCall {
                    tool_name: "weather".into(),
                    call_id: "c2".into(),
                    args: json!({"city": "Oslo"}),
                },
            ]),
            MockTurn::text("Both checked."),
        ]));

        let mut harness = spawn_session(registry, provider, SessionConfig::default()).await;
        harness.say("compare weather").await;
        let _frames = harness.frames_until_done().await;

        let snapshot = harness.snapshot().await;
        let tool_ids: Vec<_> = snapshot
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.tool_call_id.clone().unwrap())
            .collect();
        assert_eq!(tool_ids, vec!["c1", "c2"]);

        // The assistant entry precedes its tool results.
        let assistant_idx = snapshot
            .messages
            .iter()
            .position(|m| m.has_tool_calls())
            .unwrap();
        let first_tool_idx = snapshot
            .messages
            .iter()
            .position(|m| m.role == Role::Tool)
            .unwrap();
        assert!(assistant_idx < first_tool_idx);
    }
}
