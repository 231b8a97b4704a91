pub mod mock;
pub mod openai;

pub use mock::{MockProvider, MockTurn};
pub use openai::{OpenAiConfig, OpenAiProvider};

use async_trait::async_trait;

use tether_core::messages::ChatMessage;
use tether_core::provider::{Provider, ProviderError, ProviderEvent, ProviderTool};

/// Placeholder provider used when no credentials are configured. Every turn
/// fails with an authentication error so the session surfaces a clear
/// terminal response instead of hanging.
pub struct UnconfiguredProvider;

#[async_trait]
impl Provider for UnconfiguredProvider {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn run(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ProviderTool],
    ) -> Result<Vec<ProviderEvent>, ProviderError> {
        Err(ProviderError::AuthenticationFailed(
            "no provider credentials configured".into(),
        ))
    }
}
