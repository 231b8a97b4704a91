use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use tether_core::ids::SessionId;

use crate::{SessionSnapshot, SessionStore, StoreError};

/// Bumped when the sessions table changes shape; stamped into the SQLite
/// `user_version` pragma.
const USER_VERSION: i64 = 1;

/// SQLite-backed session store: one row per session, the snapshot as JSON,
/// last write wins. The connection sits behind a parking_lot mutex because
/// rusqlite connections cannot be shared across threads directly, and every
/// store operation is a single short statement.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open the store at `path`, creating the file and schema on first use.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        let store = Self::prepare(conn)?;
        info!(path = %path.display(), "session store opened");
        Ok(store)
    }

    /// A throwaway in-memory store for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::prepare(Connection::open_in_memory().map_err(db_err)?)
    }

    fn prepare(conn: Connection) -> Result<Self, StoreError> {
        // journal_mode is a row-returning pragma; in-memory databases
        // answer "memory" instead of "wal" and both are fine.
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(db_err)?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")
            .map_err(db_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                 session_id TEXT PRIMARY KEY,
                 snapshot   TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             )",
            [],
        )
        .map_err(db_err)?;

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(db_err)?;
        if version == 0 {
            conn.execute(&format!("PRAGMA user_version = {USER_VERSION}"), [])
                .map_err(db_err)?;
        } else if version != USER_VERSION {
            return Err(StoreError::Database(format!(
                "unsupported session store version {version} (expected {USER_VERSION})"
            )));
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
            .map_err(db_err)
    }
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn get(&self, session_id: &SessionId) -> Result<Option<SessionSnapshot>, StoreError> {
        let raw: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT snapshot FROM sessions WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn set(
        &self,
        session_id: &SessionId,
        snapshot: &SessionSnapshot,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.conn
            .lock()
            .execute(
                "INSERT INTO sessions (session_id, snapshot, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET
                     snapshot = excluded.snapshot,
                     updated_at = excluded.updated_at",
                rusqlite::params![session_id.as_str(), json, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM sessions WHERE session_id = ?1",
                [session_id.as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }
}
