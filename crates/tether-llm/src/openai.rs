use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use tether_core::messages::ChatMessage;
use tether_core::provider::{Provider, ProviderError, ProviderEvent, ProviderTool};

/// Configuration for the OpenAI-compatible chat-completions adapter.
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Minimal non-streaming adapter over any OpenAI-compatible
/// `/chat/completions` endpoint. One request per turn; the single choice is
/// mapped into the provider event list.
pub struct OpenAiProvider {
    config: OpenAiConfig,
    http: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn run(
        &self,
        messages: &[ChatMessage],
        tools: &[ProviderTool],
    ) -> Result<Vec<ProviderEvent>, ProviderError> {
        let body = build_request(&self.config.model, messages, tools);
        let url = format!("{}/chat/completions", self.config.base_url);

        debug!(model = %self.config.model, tools = tools.len(), "provider request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(ProviderError::from_status(status, text));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidRequest(format!("malformed response: {e}")))?;
        Ok(parse_response(parsed))
    }
}

/// Build the chat-completions request body from history and tools.
fn build_request(model: &str, messages: &[ChatMessage], tools: &[ProviderTool]) -> Value {
    let messages: Vec<Value> = messages.iter().map(message_to_value).collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
    });
    if !tools.is_empty() {
        body["tools"] = Value::Array(
            tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect(),
        );
    }
    body
}

fn message_to_value(message: &ChatMessage) -> Value {
    let mut value = serde_json::to_value(message).unwrap_or(Value::Null);
    // The wire expects tool_calls in the function-call envelope shape.
    if message.has_tool_calls() {
        value["tool_calls"] = Value::Array(
            message
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {"name": tc.name, "arguments": tc.arguments}
                    })
                })
                .collect(),
        );
    }
    value
}

/// Map a completion response into the ordered event list for one turn.
fn parse_response(response: ChatCompletionResponse) -> Vec<ProviderEvent> {
    let Some(choice) = response.choices.into_iter().next() else {
        return vec![ProviderEvent::Error {
            message: "provider returned no choices".into(),
        }];
    };

    let mut events = Vec::new();
    if let Some(content) = choice.message.content.filter(|c| !c.is_empty()) {
        events.push(ProviderEvent::Text {
            content,
            done: true,
            suggested_actions: None,
        });
    }
    for call in choice.message.tool_calls {
        let args = serde_json::from_str(&call.function.arguments)
            .unwrap_or(Value::String(call.function.arguments));
        events.push(ProviderEvent::ToolCall {
            tool_name: call.function.name,
            call_id: call.id,
            args,
        });
    }
    events
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}
