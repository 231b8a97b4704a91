use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use tether_core::messages::ChatMessage;
use tether_core::provider::{Provider, ProviderError, ProviderEvent, ProviderTool};

/// Pre-programmed turns for deterministic testing without API calls.
#[derive(Clone)]
pub enum MockTurn {
    /// Yield this event list for one turn.
    Events(Vec<ProviderEvent>),
    /// Fail the `run()` call itself.
    Fail(ProviderError),
    /// Wait a duration, then yield the inner turn.
    Delayed(Duration, Box<MockTurn>),
}

impl MockTurn {
    /// Convenience: a single terminal text event.
    pub fn text(content: &str) -> Self {
        Self::Events(vec![ProviderEvent::Text {
            content: content.to_string(),
            done: true,
            suggested_actions: None,
        }])
    }

    /// Convenience: a single tool call.
    pub fn tool_call(tool_name: &str, call_id: &str, args: serde_json::Value) -> Self {
        Self::Events(vec![ProviderEvent::ToolCall {
            tool_name: tool_name.to_string(),
            call_id: call_id.to_string(),
            args,
        }])
    }

    /// Convenience: a turn ending in a provider error event.
    pub fn error_event(message: &str) -> Self {
        Self::Events(vec![ProviderEvent::Error {
            message: message.to_string(),
        }])
    }

    pub fn delayed(delay: Duration, inner: MockTurn) -> Self {
        Self::Delayed(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed turns in sequence. Exhausting
/// the script is an error — tests that over-call fail loudly.
pub struct MockProvider {
    turns: Vec<MockTurn>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            turns,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ProviderTool],
    ) -> Result<Vec<ProviderEvent>, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        let Some(turn) = self.turns.get(idx) else {
            return Err(ProviderError::InvalidRequest(format!(
                "MockProvider: no turn configured for call {idx}"
            )));
        };

        let mut current = turn;
        loop {
            match current {
                MockTurn::Events(events) => return Ok(events.clone()),
                MockTurn::Fail(error) => return Err(error.clone()),
                MockTurn::Delayed(delay, inner) => {
                    tokio::time::sleep(*delay).await;
                    current = inner;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn text_turn() {
        let mock = MockProvider::new(vec![MockTurn::text("hello world")]);
        let events = mock.run(&[], &[]).await.unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProviderEvent::Text { content, done, .. } => {
                assert_eq!(content, "hello world");
                assert!(done);
            }
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sequential_turns() {
        let mock = MockProvider::new(vec![
            MockTurn::tool_call("weather", "c1", serde_json::json!({"city": "Paris"})),
            MockTurn::text("It's sunny in Paris."),
        ]);

        let first = mock.run(&[], &[]).await.unwrap();
        assert!(matches!(first[0], ProviderEvent::ToolCall { .. }));
        assert_eq!(mock.call_count(), 1);

        let second = mock.run(&[], &[]).await.unwrap();
        assert!(matches!(second[0], ProviderEvent::Text { .. }));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_script_errors() {
        let mock = MockProvider::new(vec![MockTurn::text("only one")]);
        let _ = mock.run(&[], &[]).await;
        let result = mock.run(&[], &[]).await;
        assert!(matches!(result, Err(ProviderError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn fail_turn_propagates() {
        let mock = MockProvider::new(vec![MockTurn::Fail(ProviderError::RateLimited)]);
        let result = mock.run(&[], &[]).await;
        assert!(matches!(result, Err(ProviderError::RateLimited)));
    }

    #[tokio::test]
    async fn delayed_turn_waits() {
        let mock = MockProvider::new(vec![MockTurn::delayed(
            Duration::from_millis(50),
            MockTurn::text("after delay"),
        )]);

        let start = Instant::now();
        let events = mock.run(&[], &[]).await.unwrap();
        assert!(
            start.elapsed() >= Duration::from_millis(40),
            "delay should have waited ~50ms, got {:?}",
            start.elapsed()
        );
        assert_eq!(events.len(), 1);
    }
}
