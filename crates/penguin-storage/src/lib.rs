// SQLite storage layer
//
// Implements the core's SnapshotStore and SessionIndex traits on an
// embedded database. Writes are atomic per-snapshot (implicit
// transactions), ids are stable across restarts, and the connection is
// shared behind a mutex so concurrent agents can persist safely.

mod sqlite;

pub use sqlite::{SqliteSessionIndex, SqliteSnapshotStore, SqliteStorage};
