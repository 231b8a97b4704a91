use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::ClientContext;
use crate::provider::ProviderTool;

/// Predicate deciding whether a tool is visible for a given client context.
pub type ContextFilter = Arc<dyn Fn(&ClientContext) -> bool + Send + Sync>;

/// Trait implemented by server-side tool handlers. Runs in the session
/// process, no client round trip.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    async fn call(
        &self,
        args: serde_json::Value,
        context: &ClientContext,
    ) -> Result<serde_json::Value, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    ExecutionFailed(String),
}

/// Where a tool executes, and the side-specific contract that comes with it.
///
/// A server tool always carries its handler; a client tool never does —
/// the client binds an executor by name at its end. Client results may be
/// validated against `result_schema` before entering the LLM history;
/// server handlers are trusted and have no schema slot.
#[derive(Clone)]
pub enum ExecutionSide {
    Server { handler: Arc<dyn ServerHandler> },
    Client { result_schema: Option<serde_json::Value> },
}

/// A registered tool definition. `parameters` is an opaque JSON-Schema
/// shaped value forwarded verbatim to the provider — the core never
/// interprets it.
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub timeout: Option<Duration>,
    pub context_filter: Option<ContextFilter>,
    pub side: ExecutionSide,
}

impl ToolDefinition {
    pub fn server(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        handler: Arc<dyn ServerHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            timeout: None,
            context_filter: None,
            side: ExecutionSide::Server { handler },
        }
    }

    pub fn client(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            timeout: None,
            context_filter: None,
            side: ExecutionSide::Client { result_schema: None },
        }
    }

    pub fn with_filter(
        mut self,
        filter: impl Fn(&ClientContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.context_filter = Some(Arc::new(filter));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a result schema. Only meaningful for client-side tools; a
    /// server-side definition is left unchanged (its handler is trusted).
    pub fn with_result_schema(mut self, schema: serde_json::Value) -> Self {
        if let ExecutionSide::Client { result_schema } = &mut self.side {
            *result_schema = Some(schema);
        }
        self
    }

    pub fn is_client_side(&self) -> bool {
        matches!(self.side, ExecutionSide::Client { .. })
    }

    pub fn is_server_side(&self) -> bool {
        matches!(self.side, ExecutionSide::Server { .. })
    }

    /// True when the tool is visible under `context`: no filter, or the
    /// filter accepts.
    pub fn matches_context(&self, context: &ClientContext) -> bool {
        match &self.context_filter {
            Some(filter) => filter(context),
            None => true,
        }
    }

    /// The projection handed to the provider.
    pub fn to_provider_tool(&self) -> ProviderTool {
        ProviderTool {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("timeout", &self.timeout)
            .field("has_filter", &self.context_filter.is_some())
            .field(
                "side",
                &match &self.side {
                    ExecutionSide::Server { .. } => "server",
                    ExecutionSide::Client { .. } => "client",
                },
            )
            .finish()
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ServerHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, ClientContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, ToolError>> + Send,
{
    async fn call(
        &self,
        args: serde_json::Value,
        context: &ClientContext,
    ) -> Result<serde_json::Value, ToolError> {
        (self.0)(args, context.clone()).await
    }
}

/// Wrap an async closure as a [`ServerHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ServerHandler>
where
    F: Fn(serde_json::Value, ClientContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ToolError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings_only(ctx: &ClientContext) -> bool {
        ctx.page_id.as_deref() == Some("settings")
    }

    #[tokio::test]
    async fn handler_fn_invokes_closure() {
        let handler = handler_fn(|args, _ctx| async move {
            let city = args["city"].as_str().unwrap_or("nowhere").to_string();
            Ok(json!(format!("Weather in {city} is sunny")))
        });
        let result = handler
            .call(json!({"city": "Paris"}), &ClientContext::default())
            .await
            .unwrap();
        assert_eq!(result, json!("Weather in Paris is sunny"));
    }

    #[test]
    fn server_tool_has_handler() {
        let tool = ToolDefinition::server(
            "weather",
            "Look up the weather",
            json!({"type": "object"}),
            handler_fn(|_, _| async { Ok(json!("sunny")) }),
        );
        assert!(tool.is_server_side());
        assert!(!tool.is_client_side());
    }

    #[test]
    fn client_tool_takes_result_schema() {
        let tool = ToolDefinition::client("toggleDarkMode", "Toggle dark mode", json!({}))
            .with_result_schema(json!({
                "type": "object",
                "properties": {"darkMode": {"type": "boolean"}},
                "required": ["darkMode"]
            }));
        match &tool.side {
            ExecutionSide::Client { result_schema } => assert!(result_schema.is_some()),
            _ => panic!("expected client side"),
        }
    }

    #[test]
    fn result_schema_ignored_on_server_tools() {
        let tool = ToolDefinition::server(
            "weather",
            "Look up the weather",
            json!({}),
            handler_fn(|_, _| async { Ok(json!("sunny")) }),
        )
        .with_result_schema(json!({"type": "object"}));
        assert!(tool.is_server_side());
    }

    #[test]
    fn context_filter_gates_visibility() {
        let tool = ToolDefinition::client("toggleDarkMode", "Toggle", json!({}))
            .with_filter(settings_only);

        let mut ctx = ClientContext::default();
        assert!(!tool.matches_context(&ctx));
        ctx.page_id = Some("settings".into());
        assert!(tool.matches_context(&ctx));
        ctx.page_id = Some("todos".into());
        assert!(!tool.matches_context(&ctx));
    }

    #[test]
    fn no_filter_always_matches() {
        let tool = ToolDefinition::client("anywhere", "Works everywhere", json!({}));
        assert!(tool.matches_context(&ClientContext::default()));
    }

    #[test]
    fn provider_projection_forwards_parameters_verbatim() {
        let params = json!({
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"]
        });
        let tool = ToolDefinition::client("weather", "Look up the weather", params.clone())
            .with_timeout(Duration::from_secs(5));
        let projected = tool.to_provider_tool();
        assert_eq!(projected.name, "weather");
        assert_eq!(projected.parameters, params);
    }
}
