use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::messages::ChatMessage;

/// The tool projection handed to a provider: name, description, and the
/// opaque JSON-Schema parameters, nothing else.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderTool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One event of a provider turn. A turn is a finite ordered list: any number
/// of `Text` events interleaved with any number of `ToolCall` events, with
/// `Error` aborting the turn — providers must not emit events after it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    Text {
        content: String,
        done: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggested_actions: Option<Vec<String>>,
    },
    ToolCall {
        tool_name: String,
        call_id: String,
        args: serde_json::Value,
    },
    Error {
        message: String,
    },
}

/// Provider-level failure taxonomy, classified for retry decisions.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    // Fatal — don't retry
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("rate limited")]
    RateLimited,
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ServerError { .. } | Self::NetworkError(_)
        )
    }

    /// Classify an HTTP status code into the appropriate variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            429 => Self::RateLimited,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Abstraction over the LLM. One call yields the complete, ordered event
/// list for one turn — responses are delivered per completed provider turn,
/// not token by token.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        messages: &[ChatMessage],
        tools: &[ProviderTool],
    ) -> Result<Vec<ProviderEvent>, ProviderError>;
}
