//! SQLite-backed event log.
//! Keeps a node's coordinator history across restarts.
//!
//! Enable with the `sqlite` feature flag:
//! ```toml
//! lamport-core = { path = "../lamport-core", features = ["sqlite"] }
//! ```

use parking_lot::Mutex;
use rusqlite::{Connection, params};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::events::{CoordinatorEvent, EventSink};
use crate::infrastructure_in_memory::RecordedEvent;
use crate::types::{NodeId, Timestamp};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Append-only event table. Uses WAL mode so readers do not stall the
/// recording node.
pub struct SqliteEventLog {
    conn: Mutex<Connection>,
}

impl SqliteEventLog {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id     INTEGER NOT NULL,
                clock       INTEGER NOT NULL,
                event       TEXT NOT NULL,
                detail      TEXT NOT NULL,
                recorded_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_node ON events(node_id, seq);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Self::open(":memory:")
    }

    /// Every event recorded for `node`, oldest first. Rows whose detail
    /// no longer parses are skipped.
    pub fn history(&self, node: NodeId) -> Result<Vec<RecordedEvent>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT clock, detail FROM events WHERE node_id = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![node.get()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut history = Vec::new();
        for row in rows {
            let (clock, detail) = row?;
            match serde_json::from_str::<CoordinatorEvent>(&detail) {
                Ok(event) => history.push(RecordedEvent {
                    node,
                    clock: clock as Timestamp,
                    event,
                }),
                Err(err) => tracing::warn!(node = %node, error = %err, "Skipping unreadable event row"),
            }
        }
        Ok(history)
    }

    pub fn count(&self) -> Result<usize, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
    }
}

impl EventSink for SqliteEventLog {
    fn record(&self, node: NodeId, clock: Timestamp, event: &CoordinatorEvent) {
        let detail = match serde_json::to_string(event) {
            Ok(detail) => detail,
            Err(err) => {
                tracing::warn!(node = %node, error = %err, "Failed to serialize event");
                return;
            }
        };

        let result = self.conn.lock().execute(
            "INSERT INTO events (node_id, clock, event, detail, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![node.get(), clock as i64, event.name(), detail, now_ms() as i64],
        );
        if let Err(err) = result {
            tracing::warn!(node = %node, error = %err, "Failed to persist event");
        }
    }
}
