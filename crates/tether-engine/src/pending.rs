use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A resolved client-tool round trip: the returned value, or the error
/// message the client (or the timeout path) produced.
pub type ToolReply = Result<serde_json::Value, String>;

/// One-shot waiters for in-flight client tool calls, keyed by the
/// provider-assigned call id. Waiters are created on emit and destroyed on
/// resolve, reject, abandon, or session teardown — never leaked past the
/// session. Keying by call id makes concurrent in-flight calls on one
/// connection safe.
#[derive(Default)]
pub struct PendingCalls {
    waiters: DashMap<String, oneshot::Sender<ToolReply>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `call_id` and return its receiving end.
    /// A stale waiter under the same id is dropped (its receiver resolves
    /// as cancelled).
    pub fn insert(&self, call_id: &str) -> oneshot::Receiver<ToolReply> {
        let (tx, rx) = oneshot::channel();
        if self.waiters.insert(call_id.to_string(), tx).is_some() {
            warn!(call_id = %call_id, "replaced stale waiter for call id");
        }
        rx
    }

    /// Resolve a waiter with a successful result. Returns false when no
    /// waiter matches — the reply is dropped, never misrouted.
    pub fn resolve_result(&self, call_id: &str, result: serde_json::Value) -> bool {
        self.finish(call_id, Ok(result))
    }

    /// Reject a waiter with a client-reported error message.
    pub fn resolve_error(&self, call_id: &str, message: String) -> bool {
        self.finish(call_id, Err(message))
    }

    fn finish(&self, call_id: &str, reply: ToolReply) -> bool {
        match self.waiters.remove(call_id) {
            Some((_, tx)) => {
                // A dropped receiver just means the dispatch path already
                // gave up (timeout or cancellation).
                let _ = tx.send(reply);
                true
            }
            None => {
                debug!(call_id = %call_id, "reply for unknown call id dropped");
                false
            }
        }
    }

    /// Remove a waiter without resolving it (timeout and teardown paths).
    pub fn abandon(&self, call_id: &str) {
        self.waiters.remove(call_id);
    }

    /// Drop every waiter, waking all dispatchers with a cancellation.
    pub fn abort_all(&self) -> usize {
        let count = self.waiters.len();
        self.waiters.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
