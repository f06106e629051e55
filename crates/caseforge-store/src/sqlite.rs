use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use caseforge_core::error::{CaseforgeError, Result};
use caseforge_core::traits::SessionStore;
use caseforge_core::types::{SessionId, SessionSummary, StateRecord};

/// Persistent session store backed by SQLite.
///
/// One row per session holding the serialized State Record; saves upsert.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open or create the session database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CaseforgeError::Persistence(format!("Failed to create session directory: {}", e))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            CaseforgeError::Persistence(format!("Failed to open session store: {}", e))
        })?;
        Self::init(conn)
    }

    /// Open an in-memory database (for tests).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(persistence)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS sessions (
                 session_id TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 state_json TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_sessions_updated
                 ON sessions(updated_at);",
        )
        .map_err(|e| {
            CaseforgeError::Persistence(format!("Failed to initialize session schema: {}", e))
        })?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CaseforgeError::Persistence(e.to_string()))?;
        f(&conn).map_err(persistence)
    }
}

fn persistence(e: rusqlite::Error) -> CaseforgeError {
    CaseforgeError::Persistence(e.to_string())
}

fn decode(json: &str) -> Result<StateRecord> {
    serde_json::from_str(json)
        .map_err(|e| CaseforgeError::Persistence(format!("Corrupt session record: {}", e)))
}

impl SessionStore for SqliteSessionStore {
    fn save(&self, state: &StateRecord) -> BoxFuture<'_, Result<()>> {
        // Serialize up front so the future does not borrow the record
        let row = serde_json::to_string(state).map(|json| {
            (
                state.session_id().0.clone(),
                state.status.as_str(),
                json,
                state.created_at.to_rfc3339(),
                state.updated_at.to_rfc3339(),
            )
        });

        Box::pin(async move {
            let (session_id, status, json, created_at, updated_at) = row?;
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO sessions (session_id, status, state_json, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(session_id) DO UPDATE SET
                         status = excluded.status,
                         state_json = excluded.state_json,
                         updated_at = excluded.updated_at",
                    params![session_id, status, json, created_at, updated_at],
                )
            })?;
            debug!(session_id = %session_id, status, "Session saved");
            Ok(())
        })
    }

    fn load(&self, session_id: &SessionId) -> BoxFuture<'_, Result<StateRecord>> {
        let id = session_id.0.clone();
        Box::pin(async move {
            let json: Option<String> = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT state_json FROM sessions WHERE session_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
            })?;
            match json {
                Some(json) => decode(&json),
                None => Err(CaseforgeError::SessionNotFound(id)),
            }
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<SessionSummary>>> {
        Box::pin(async move {
            let rows: Vec<String> = self.with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT state_json FROM sessions ORDER BY updated_at DESC")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect()
            })?;
            rows.iter()
                .map(|json| decode(json).map(|state| SessionSummary::from(&state)))
                .collect()
        })
    }

    fn delete(&self, session_id: &SessionId) -> BoxFuture<'_, Result<bool>> {
        let id = session_id.0.clone();
        Box::pin(async move {
            let deleted = self.with_conn(|conn| {
                conn.execute("DELETE FROM sessions WHERE session_id = ?1", params![id])
            })?;
            Ok(deleted > 0)
        })
    }

    fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<usize>> {
        let cutoff = cutoff.to_rfc3339();
        Box::pin(async move {
            // RFC 3339 timestamps in UTC compare correctly as text
            let removed = self.with_conn(|conn| {
                conn.execute("DELETE FROM sessions WHERE updated_at < ?1", params![cutoff])
            })?;
            if removed > 0 {
                debug!(removed, "Expired sessions removed");
            }
            Ok(removed)
        })
    }
}
