// SQLite-backed snapshot store and session index
//
// One file, two tables:
//
//   snapshots(id TEXT PK, parent_id TEXT, timestamp TEXT, payload BLOB, meta TEXT)
//   sessions(agent_id TEXT, session_id TEXT, snapshot_id TEXT, archived_at TEXT)
//
// WAL mode so readers are not blocked by writers. Payloads are stored
// verbatim; restore returns byte-identical content.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

use penguin_core::error::{CoreError, Result};
use penguin_core::snapshots::{
    SessionIndex, SessionRecord, SnapshotDescriptor, SnapshotMeta, SnapshotStore,
};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    id TEXT PRIMARY KEY,
    parent_id TEXT,
    timestamp TEXT NOT NULL,
    payload BLOB NOT NULL,
    meta TEXT
);

CREATE TABLE IF NOT EXISTS sessions (
    agent_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    snapshot_id TEXT NOT NULL,
    archived_at TEXT NOT NULL,
    PRIMARY KEY (agent_id, session_id)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON snapshots(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_sessions_agent ON sessions(agent_id, archived_at DESC);
"#;

/// Shared connection handle for both trait implementations
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database file and ensure the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::snapshot(format!("create db dir failed: {}", e)))?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA_SQL).map_err(db_err)?;
        debug!(path = %path.display(), "snapshot database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database (tests, ephemeral runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA_SQL).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Snapshot store view over this database
    pub fn snapshot_store(&self) -> SqliteSnapshotStore {
        SqliteSnapshotStore {
            conn: self.conn.clone(),
        }
    }

    /// Session index view over this database
    pub fn session_index(&self) -> SqliteSessionIndex {
        SqliteSessionIndex {
            conn: self.conn.clone(),
        }
    }
}

/// SnapshotStore implementation over the shared connection
pub struct SqliteSnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SnapshotStore for SqliteSnapshotStore {
    fn snapshot(
        &self,
        payload: &str,
        parent_id: Option<&str>,
        meta: Option<SnapshotMeta>,
    ) -> Result<String> {
        let id = Uuid::now_v7().simple().to_string();
        let timestamp = Utc::now().to_rfc3339();
        let meta_json = serde_json::to_string(&meta.unwrap_or_default())
            .map_err(|e| CoreError::snapshot(format!("meta serialize failed: {}", e)))?;

        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            "INSERT INTO snapshots (id, parent_id, timestamp, payload, meta) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, parent_id, timestamp, payload.as_bytes(), meta_json],
        )
        .map_err(db_err)?;
        debug!(snapshot_id = %id, parent = ?parent_id, bytes = payload.len(), "snapshot written");
        Ok(id)
    }

    fn restore(&self, snapshot_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let payload: Option<Vec<u8>> = conn
            .query_row(
                "SELECT payload FROM snapshots WHERE id = ?1",
                params![snapshot_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        match payload {
            Some(bytes) => {
                let text = String::from_utf8(bytes)
                    .map_err(|e| CoreError::snapshot(format!("payload not utf-8: {}", e)))?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    fn list(&self, limit: usize, offset: usize) -> Result<Vec<SnapshotDescriptor>> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, parent_id, timestamp, meta FROM snapshots \
                 ORDER BY timestamp DESC, id DESC LIMIT ?1 OFFSET ?2",
            )
            .map_err(db_err)?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(0);
        let rows = stmt
            .query_map(params![limit, offset], |row| {
                let id: String = row.get(0)?;
                let parent_id: Option<String> = row.get(1)?;
                let timestamp: String = row.get(2)?;
                let meta: Option<String> = row.get(3)?;
                Ok((id, parent_id, timestamp, meta))
            })
            .map_err(db_err)?;

        let mut descriptors = Vec::new();
        for row in rows {
            let (id, parent_id, timestamp, meta) = row.map_err(db_err)?;
            let meta: SnapshotMeta = meta
                .as_deref()
                .and_then(|m| serde_json::from_str(m).ok())
                .unwrap_or_default();
            descriptors.push(SnapshotDescriptor {
                id,
                parent_id,
                timestamp: parse_timestamp(&timestamp)?,
                name: meta.get("name").and_then(|v| v.as_str()).map(String::from),
                agent_id: meta
                    .get("agent_id")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            });
        }
        Ok(descriptors)
    }
}

/// SessionIndex implementation over the shared connection
pub struct SqliteSessionIndex {
    conn: Arc<Mutex<Connection>>,
}

impl SessionIndex for SqliteSessionIndex {
    fn record(&self, agent_id: &str, session_id: Uuid, snapshot_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            "INSERT INTO sessions (agent_id, session_id, snapshot_id, archived_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(agent_id, session_id) DO UPDATE SET \
                 snapshot_id = ?3, archived_at = ?4",
            params![
                agent_id,
                session_id.to_string(),
                snapshot_id,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn list(&self, agent_id: &str) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT session_id, snapshot_id, archived_at FROM sessions \
                 WHERE agent_id = ?1 ORDER BY archived_at DESC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![agent_id], |row| {
                let session_id: String = row.get(0)?;
                let snapshot_id: String = row.get(1)?;
                let archived_at: String = row.get(2)?;
                Ok((session_id, snapshot_id, archived_at))
            })
            .map_err(db_err)?;

        let mut records = Vec::new();
        for row in rows {
            let (session_id, snapshot_id, archived_at) = row.map_err(db_err)?;
            records.push(SessionRecord {
                session_id: session_id
                    .parse()
                    .map_err(|e| CoreError::snapshot(format!("bad session id: {}", e)))?,
                snapshot_id,
                archived_at: parse_timestamp(&archived_at)?,
            });
        }
        Ok(records)
    }

    fn get(&self, agent_id: &str, session_id: Uuid) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.query_row(
            "SELECT snapshot_id FROM sessions WHERE agent_id = ?1 AND session_id = ?2",
            params![agent_id, session_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }
}

fn db_err(e: rusqlite::Error) -> CoreError {
    CoreError::snapshot(e.to_string())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::snapshot(format!("bad timestamp '{}': {}", raw, e)))
}
