use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use tether_core::context::ClientContext;
use tether_core::provider::ProviderTool;
use tether_core::tools::{ExecutionSide, ToolDefinition};

/// The registry is the sole source of truth for tool schemas and
/// availability. Enumeration is stable insertion order — providers may rely
/// on it for prompt caching — and replacement keeps the original position.
#[derive(Default)]
pub struct ToolRegistry {
    order: Vec<String>,
    tools: HashMap<String, Arc<ToolDefinition>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by name. Replacing an existing registration is
    /// legal but suspicious, so it logs a warning.
    pub fn register(&mut self, tool: ToolDefinition) {
        let name = tool.name.clone();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            warn!(tool = %name, "replacing existing tool registration");
        } else {
            self.order.push(name);
        }
    }

    pub fn register_all(&mut self, tools: Vec<ToolDefinition>) {
        for tool in tools {
            self.register(tool);
        }
    }

    /// Mount a router: a named bundle of definitions registered as a unit.
    pub fn use_router(&mut self, router: ToolRouter) {
        self.register_all(router.tools);
    }

    /// All tools visible under `context`, in stable insertion order.
    pub fn tools_for_context(&self, context: &ClientContext) -> Vec<Arc<ToolDefinition>> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .filter(|tool| tool.matches_context(context))
            .cloned()
            .collect()
    }

    /// The provider-facing projection of `tools_for_context`.
    pub fn provider_tools_for_context(&self, context: &ClientContext) -> Vec<ProviderTool> {
        self.tools_for_context(context)
            .iter()
            .map(|tool| tool.to_provider_tool())
            .collect()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        self.tools.get(name).cloned()
    }

    /// False for unknown names; true when the tool has no filter or its
    /// filter accepts the context.
    pub fn is_available(&self, name: &str, context: &ClientContext) -> bool {
        self.tools
            .get(name)
            .map(|tool| tool.matches_context(context))
            .unwrap_or(false)
    }

    /// Validate a value returned for `name` before it enters the LLM
    /// history. Server-side tools and schema-less client tools pass
    /// through unchanged — the schema is the trust boundary for
    /// client-returned results only.
    pub fn validate_result(
        &self,
        name: &str,
        value: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let Some(tool) = self.tools.get(name) else {
            return Err(format!("Unknown tool: {name}"));
        };

        let schema = match &tool.side {
            ExecutionSide::Server { .. } => return Ok(value),
            ExecutionSide::Client { result_schema } => match result_schema {
                Some(schema) => schema,
                None => return Ok(value),
            },
        };

        let validator = match jsonschema::options().build(schema) {
            Ok(v) => v,
            Err(e) => {
                return Err(format!(
                    "Result validation failed: invalid result schema: {e}"
                ))
            }
        };

        let errors: Vec<String> = validator
            .iter_errors(&value)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(value)
        } else {
            Err(format!("Result validation failed: {}", errors.join("; ")))
        }
    }

    /// Registered names in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// A trivial carrier bundling tool definitions so a feature area can export
/// its tools as one importable unit. No behavior beyond that.
pub struct ToolRouter {
    pub name: String,
    pub tools: Vec<ToolDefinition>,
}

impl ToolRouter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
        }
    }

    pub fn tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }
}

/// Registry handle shared between the façade and the per-connection
/// sessions. Immutable after startup in the common case; runtime mutation
/// goes through the write lock.
#[derive(Clone, Default)]
pub struct SharedRegistry(Arc<RwLock<ToolRegistry>>);

impl SharedRegistry {
    pub fn new(registry: ToolRegistry) -> Self {
        Self(Arc::new(RwLock::new(registry)))
    }

    pub fn register(&self, tool: ToolDefinition) {
        self.0.write().register(tool);
    }

    pub fn register_all(&self, tools: Vec<ToolDefinition>) {
        self.0.write().register_all(tools);
    }

    pub fn use_router(&self, router: ToolRouter) {
        self.0.write().use_router(router);
    }

    pub fn tools_for_context(&self, context: &ClientContext) -> Vec<Arc<ToolDefinition>> {
        self.0.read().tools_for_context(context)
    }

    pub fn provider_tools_for_context(&self, context: &ClientContext) -> Vec<ProviderTool> {
        self.0.read().provider_tools_for_context(context)
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        self.0.read().by_name(name)
    }

    pub fn is_available(&self, name: &str, context: &ClientContext) -> bool {
        self.0.read().is_available(name, context)
    }

    pub fn validate_result(
        &self,
        name: &str,
        value: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        self.0.read().validate_result(name, value)
    }

    pub fn names(&self) -> Vec<String> {
        self.0.read().names()
    }
}
