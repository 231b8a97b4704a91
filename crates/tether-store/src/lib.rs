pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tether_core::context::ClientContext;
use tether_core::ids::SessionId;
use tether_core::messages::ChatMessage;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// The durable state of one session: the latest validated client context
/// and the full message history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub context: ClientContext,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("io error: {0}")]
    Io(String),
}

/// Injectable persistence seam. Sessions are keyed by their id; the stored
/// value is a full snapshot written after each state mutation.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &SessionId) -> Result<Option<SessionSnapshot>, StoreError>;
    async fn set(&self, session_id: &SessionId, snapshot: &SessionSnapshot)
        -> Result<(), StoreError>;
    async fn delete(&self, session_id: &SessionId) -> Result<(), StoreError>;
}
