use async_trait::async_trait;
use dashmap::DashMap;

use tether_core::ids::SessionId;

use crate::{SessionSnapshot, SessionStore, StoreError};

/// In-memory session store. The default for development runs and the
/// backbone of the engine tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, SessionSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, session_id: &SessionId) -> Result<Option<SessionSnapshot>, StoreError> {
        Ok(self.entries.get(session_id.as_str()).map(|e| e.clone()))
    }

    async fn set(
        &self,
        session_id: &SessionId,
        snapshot: &SessionSnapshot,
    ) -> Result<(), StoreError> {
        self.entries
            .insert(session_id.as_str().to_string(), snapshot.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.entries.remove(session_id.as_str());
        Ok(())
    }
}
