// Snapshot store seam
//
// Append-only keyed persistence of serialized conversation state with a
// parent pointer forming a forest. The trait is synchronous: snapshots
// are small and infrequent next to token streaming (callers needing
// async wrap in spawn_blocking). In-memory implementations live here for
// tests and ephemeral runs; the durable SQLite backend is provided by
// the storage crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Metadata attached to a snapshot
pub type SnapshotMeta = BTreeMap<String, Value>;

/// Listing entry for a stored snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub id: String,
    pub parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Meta "name" field, when present
    pub name: Option<String>,
    /// Meta "agent_id" field, when present
    pub agent_id: Option<String>,
}

/// Durable, append-only snapshot storage
pub trait SnapshotStore: Send + Sync {
    /// Persist a payload; returns the fresh snapshot id
    fn snapshot(
        &self,
        payload: &str,
        parent_id: Option<&str>,
        meta: Option<SnapshotMeta>,
    ) -> Result<String>;

    /// Fetch a payload. Missing ids yield `None`, not an error.
    fn restore(&self, snapshot_id: &str) -> Result<Option<String>>;

    /// Duplicate a snapshot as a child; returns (new_id, payload)
    fn branch_from(
        &self,
        snapshot_id: &str,
        meta: Option<SnapshotMeta>,
    ) -> Result<(String, String)> {
        let payload = self.restore(snapshot_id)?.ok_or_else(|| {
            CoreError::snapshot(format!("cannot branch: snapshot {} not found", snapshot_id))
        })?;
        let new_id = self.snapshot(&payload, Some(snapshot_id), meta)?;
        Ok((new_id, payload))
    }

    /// Descriptors ordered by timestamp descending
    fn list(&self, limit: usize, offset: usize) -> Result<Vec<SnapshotDescriptor>>;
}

/// Per-agent index of archived sessions and their latest snapshot
pub trait SessionIndex: Send + Sync {
    /// Record (or update) the snapshot backing a session
    fn record(&self, agent_id: &str, session_id: Uuid, snapshot_id: &str) -> Result<()>;

    /// Sessions for an agent, most recent first
    fn list(&self, agent_id: &str) -> Result<Vec<SessionRecord>>;

    /// Latest snapshot id for a session
    fn get(&self, agent_id: &str, session_id: Uuid) -> Result<Option<String>>;
}

/// One archived session reference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub snapshot_id: String,
    pub archived_at: DateTime<Utc>,
}

// ============================================================================
// In-memory implementations
// ============================================================================

#[derive(Clone)]
struct StoredSnapshot {
    parent_id: Option<String>,
    timestamp: DateTime<Utc>,
    payload: String,
    meta: SnapshotMeta,
}

/// In-memory snapshot store for tests and ephemeral runs
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<BTreeMap<String, StoredSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn snapshot(
        &self,
        payload: &str,
        parent_id: Option<&str>,
        meta: Option<SnapshotMeta>,
    ) -> Result<String> {
        let id = Uuid::now_v7().simple().to_string();
        self.snapshots
            .lock()
            .expect("snapshot lock poisoned")
            .insert(
                id.clone(),
                StoredSnapshot {
                    parent_id: parent_id.map(|p| p.to_string()),
                    timestamp: Utc::now(),
                    payload: payload.to_string(),
                    meta: meta.unwrap_or_default(),
                },
            );
        Ok(id)
    }

    fn restore(&self, snapshot_id: &str) -> Result<Option<String>> {
        Ok(self
            .snapshots
            .lock()
            .expect("snapshot lock poisoned")
            .get(snapshot_id)
            .map(|s| s.payload.clone()))
    }

    fn list(&self, limit: usize, offset: usize) -> Result<Vec<SnapshotDescriptor>> {
        let snapshots = self.snapshots.lock().expect("snapshot lock poisoned");
        let mut descriptors: Vec<SnapshotDescriptor> = snapshots
            .iter()
            .map(|(id, s)| SnapshotDescriptor {
                id: id.clone(),
                parent_id: s.parent_id.clone(),
                timestamp: s.timestamp,
                name: s.meta.get("name").and_then(|v| v.as_str()).map(String::from),
                agent_id: s
                    .meta
                    .get("agent_id")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            })
            .collect();
        descriptors.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(descriptors.into_iter().skip(offset).take(limit).collect())
    }
}

/// In-memory session index
#[derive(Default)]
pub struct MemorySessionIndex {
    sessions: Mutex<BTreeMap<String, Vec<SessionRecord>>>,
}

impl MemorySessionIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionIndex for MemorySessionIndex {
    fn record(&self, agent_id: &str, session_id: Uuid, snapshot_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session index lock poisoned");
        let records = sessions.entry(agent_id.to_string()).or_default();
        match records.iter().position(|r| r.session_id == session_id) {
            Some(pos) => {
                records[pos].snapshot_id = snapshot_id.to_string();
                records[pos].archived_at = Utc::now();
            }
            None => records.push(SessionRecord {
                session_id,
                snapshot_id: snapshot_id.to_string(),
                archived_at: Utc::now(),
            }),
        }
        Ok(())
    }

    fn list(&self, agent_id: &str) -> Result<Vec<SessionRecord>> {
        let sessions = self.sessions.lock().expect("session index lock poisoned");
        let mut records = sessions.get(agent_id).cloned().unwrap_or_default();
        records.sort_by(|a, b| b.archived_at.cmp(&a.archived_at));
        Ok(records)
    }

    fn get(&self, agent_id: &str, session_id: Uuid) -> Result<Option<String>> {
        let sessions = self.sessions.lock().expect("session index lock poisoned");
        Ok(sessions
            .get(agent_id)
            .and_then(|records| records.iter().find(|r| r.session_id == session_id))
            .map(|r| r.snapshot_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_restore_idempotent() {
        let store = MemorySnapshotStore::new();
        let id = store.snapshot("payload-bytes", None, None).unwrap();
        assert_eq!(store.restore(&id).unwrap().unwrap(), "payload-bytes");
        assert_eq!(store.restore(&id).unwrap().unwrap(), "payload-bytes");
    }

    #[test]
    fn test_missing_id_is_none() {
        let store = MemorySnapshotStore::new();
        assert!(store.restore("nope").unwrap().is_none());
    }

    #[test]
    fn test_branch_links_parent() {
        let store = MemorySnapshotStore::new();
        let root = store.snapshot("state-1", None, None).unwrap();
        let (child, payload) = store.branch_from(&root, None).unwrap();
        assert_eq!(payload, "state-1");
        assert_ne!(child, root);

        let listing = store.list(10, 0).unwrap();
        let child_entry = listing.iter().find(|d| d.id == child).unwrap();
        assert_eq!(child_entry.parent_id.as_deref(), Some(root.as_str()));
    }

    #[test]
    fn test_branch_missing_errors() {
        let store = MemorySnapshotStore::new();
        assert!(store.branch_from("nope", None).is_err());
    }

    #[test]
    fn test_list_orders_newest_first() {
        let store = MemorySnapshotStore::new();
        let a = store.snapshot("a", None, None).unwrap();
        let b = store.snapshot("b", None, None).unwrap();
        let listing = store.list(10, 0).unwrap();
        let pos_a = listing.iter().position(|d| d.id == a).unwrap();
        let pos_b = listing.iter().position(|d| d.id == b).unwrap();
        assert!(pos_b < pos_a);
    }

    #[test]
    fn test_session_index_tracks_latest() {
        let index = MemorySessionIndex::new();
        let session = Uuid::now_v7();
        index.record("default", session, "snap-1").unwrap();
        index.record("default", session, "snap-2").unwrap();
        assert_eq!(
            index.get("default", session).unwrap().as_deref(),
            Some("snap-2")
        );
        assert_eq!(index.list("default").unwrap().len(), 1);
    }
}
