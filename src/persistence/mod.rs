//! Session snapshot storage.
//!
//! The controller hands a snapshot to the configured [`SessionStore`]
//! whenever a turn ends. Storage is advisory: a failing store is logged and
//! never interrupts the pipeline.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::consistency::ConsistencySession;
use crate::errors::StoreError;

/// Storage for session snapshots.
pub trait SessionStore: Send + Sync + std::fmt::Debug {
    /// Append a snapshot of `session`.
    fn save_snapshot(&self, session: &ConsistencySession) -> Result<(), StoreError>;

    /// Most recent snapshot for `session_id`.
    fn load_latest(&self, session_id: Uuid) -> Result<Option<ConsistencySession>, StoreError>;

    /// Number of snapshots kept for `session_id`.
    fn snapshot_count(&self, session_id: Uuid) -> Result<usize, StoreError>;
}

/// Process-local store, mostly for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    snapshots: Mutex<HashMap<Uuid, Vec<ConsistencySession>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn save_snapshot(&self, session: &ConsistencySession) -> Result<(), StoreError> {
        self.snapshots
            .lock()
            .entry(session.session_id)
            .or_default()
            .push(session.clone());
        Ok(())
    }

    fn load_latest(&self, session_id: Uuid) -> Result<Option<ConsistencySession>, StoreError> {
        Ok(self
            .snapshots
            .lock()
            .get(&session_id)
            .and_then(|v| v.last().cloned()))
    }

    fn snapshot_count(&self, session_id: Uuid) -> Result<usize, StoreError> {
        Ok(self
            .snapshots
            .lock()
            .get(&session_id)
            .map(Vec::len)
            .unwrap_or(0))
    }
}

/// SQLite-backed store. Snapshots are kept as JSON rows.
#[derive(Debug)]
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Other {
                    message: format!("cannot create {}: {}", parent.display(), e),
                })?;
            }
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS session_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                pseudonym TEXT NOT NULL,
                status TEXT NOT NULL,
                saved_at TEXT NOT NULL,
                snapshot_json TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_session_snapshots_session
             ON session_snapshots(session_id)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SessionStore for SqliteSessionStore {
    fn save_snapshot(&self, session: &ConsistencySession) -> Result<(), StoreError> {
        let json = serde_json::to_string(session)?;
        self.conn.lock().execute(
            "INSERT INTO session_snapshots (session_id, pseudonym, status, saved_at, snapshot_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.session_id.to_string(),
                session.pseudonym.as_str(),
                session.status.to_string(),
                Utc::now().to_rfc3339(),
                json
            ],
        )?;
        Ok(())
    }

    fn load_latest(&self, session_id: Uuid) -> Result<Option<ConsistencySession>, StoreError> {
        let json: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT snapshot_json FROM session_snapshots
                 WHERE session_id = ?1 ORDER BY id DESC LIMIT 1",
                params![session_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn snapshot_count(&self, session_id: Uuid) -> Result<usize, StoreError> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM session_snapshots WHERE session_id = ?1",
            params![session_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::{AcceptReason, SessionStatus};
    use crate::pseudonym::Pseudonym;

    fn exercise(store: &dyn SessionStore) {
        let mut session = ConsistencySession::new(Pseudonym::new("p-1"));
        assert!(store.load_latest(session.session_id).unwrap().is_none());

        store.save_snapshot(&session).unwrap();
        session.accept(AcceptReason::ThresholdMet);
        store.save_snapshot(&session).unwrap();

        let latest = store.load_latest(session.session_id).unwrap().unwrap();
        assert_eq!(latest.status, SessionStatus::Accepted);
        assert_eq!(store.snapshot_count(session.session_id).unwrap(), 2);
    }

    #[test]
    fn test_in_memory_store() {
        exercise(&InMemorySessionStore::new());
    }

    #[test]
    fn test_sqlite_store_in_memory() {
        exercise(&SqliteSessionStore::in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.db");
        let session = ConsistencySession::new(Pseudonym::new("p-2"));
        {
            let store = SqliteSessionStore::open(&path).unwrap();
            store.save_snapshot(&session).unwrap();
        }
        let reopened = SqliteSessionStore::open(&path).unwrap();
        let loaded = reopened.load_latest(session.session_id).unwrap().unwrap();
        assert_eq!(loaded.pseudonym, session.pseudonym);
    }
}
