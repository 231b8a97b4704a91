use serde::{Deserialize, Serialize};

use crate::context::ClientContext;

// Wire event names. These are frozen for compatibility with existing
// clients — renaming any of them is a breaking protocol change.
pub const CONTEXT_UPDATE: &str = "agent:context_update";
pub const CONTEXT_SYNC: &str = "agent:context_sync";
pub const USER_MESSAGE: &str = "agent:user_message";
pub const AGENT_RESPONSE: &str = "agent:agent_response";
pub const TOOL_INVOCATION: &str = "agent:tool_invocation";
pub const TOOL_RESULT: &str = "agent:tool_result";
pub const TOOL_ERROR: &str = "agent:tool_error";

/// Frames sent by the client to the server.
///
/// A frame that fails to parse (unknown event name, malformed payload,
/// unknown context field) is logged and dropped by the receiver; it never
/// resolves a pending tool call or mutates session state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientFrame {
    #[serde(rename = "agent:context_update")]
    ContextUpdate(ClientContext),

    #[serde(rename = "agent:user_message")]
    UserMessage { content: String },

    #[serde(rename = "agent:tool_result")]
    ToolResult {
        #[serde(rename = "toolId")]
        tool_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        result: serde_json::Value,
    },

    #[serde(rename = "agent:tool_error")]
    ToolError {
        #[serde(rename = "toolId")]
        tool_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        message: String,
    },
}

/// Frames sent by the server to the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerFrame {
    /// Advisory acknowledgement of a context update. Clients must not gate
    /// UI on receiving it.
    #[serde(rename = "agent:context_sync")]
    ContextSync {
        context: ClientContext,
        #[serde(rename = "availableTools")]
        available_tools: Vec<String>,
    },

    #[serde(rename = "agent:agent_response")]
    AgentResponse {
        content: String,
        done: bool,
        #[serde(rename = "suggestedActions", skip_serializing_if = "Option::is_none")]
        suggested_actions: Option<Vec<String>>,
    },

    #[serde(rename = "agent:tool_invocation")]
    ToolInvocation {
        #[serde(rename = "toolId")]
        tool_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        params: serde_json::Value,
    },
}

impl ServerFrame {
    /// Terminal response frame closing out a user turn.
    pub fn done(content: impl Into<String>, suggested_actions: Option<Vec<String>>) -> Self {
        Self::AgentResponse {
            content: content.into(),
            done: true,
            suggested_actions,
        }
    }

    /// Intermediate streaming frame.
    pub fn partial(content: impl Into<String>) -> Self {
        Self::AgentResponse {
            content: content.into(),
            done: false,
            suggested_actions: None,
        }
    }
}
