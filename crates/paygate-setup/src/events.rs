use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

// ---------------------------------------------------------------------------
// Console event type
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
pub struct ConsoleEvent {
    pub id: u64,
    pub timestamp: String,
    pub source: String,
    pub kind: String,
    pub data: serde_json::Value,
}

pub fn now_ts() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60
    )
}

/// Append-only event log on disk (SQLite). Used for the history API and as
/// an audit trail.
pub struct EventLog {
    conn: std::sync::Mutex<Connection>,
}

impl EventLog {
    pub fn new(storage_dir: &str) -> Result<Self, rusqlite::Error> {
        let path = std::path::Path::new(storage_dir).join("console.db");
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS console_events (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                source    TEXT NOT NULL,
                kind      TEXT NOT NULL,
                data      TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    pub fn append(&self, event: &ConsoleEvent) -> Result<u64, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO console_events (timestamp, source, kind, data) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                event.timestamp,
                event.source,
                event.kind,
                serde_json::to_string(&event.data).unwrap_or_default(),
            ],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    pub fn query(
        &self,
        since_id: u64,
        limit: u32,
        source_filter: Option<&str>,
    ) -> Result<Vec<ConsoleEvent>, rusqlite::Error> {
        let limit = limit.min(1000);
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();

        let map_row = |row: &rusqlite::Row<'_>| {
            let data_str: String = row.get(4)?;
            let data = serde_json::from_str(&data_str).unwrap_or(serde_json::Value::Null);
            Ok(ConsoleEvent {
                id: row.get::<_, i64>(0)? as u64,
                timestamp: row.get(1)?,
                source: row.get(2)?,
                kind: row.get(3)?,
                data,
            })
        };

        if let Some(source) = source_filter {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, source, kind, data FROM console_events
                 WHERE id > ?1 AND source = ?2 ORDER BY id ASC LIMIT ?3",
            )?;
            let mapped = stmt.query_map(
                rusqlite::params![since_id as i64, source, limit as i32],
                map_row,
            )?;
            for row in mapped {
                out.push(row?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, source, kind, data FROM console_events
                 WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
            )?;
            let mapped =
                stmt.query_map(rusqlite::params![since_id as i64, limit as i32], map_row)?;
            for row in mapped {
                out.push(row?);
            }
        }
        Ok(out)
    }
}

/// Single path for emitting console events: persist to the log (if present)
/// then broadcast to live SSE subscribers.
#[derive(Clone)]
pub struct ConsoleEmitter {
    tx: broadcast::Sender<ConsoleEvent>,
    log: Option<Arc<EventLog>>,
}

impl ConsoleEmitter {
    pub fn new(log: Option<Arc<EventLog>>) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx, log }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.tx.subscribe()
    }

    pub fn event_log(&self) -> Option<Arc<EventLog>> {
        self.log.clone()
    }

    pub fn emit(&self, source: &str, kind: &str, data: serde_json::Value) {
        let mut event = ConsoleEvent {
            id: 0,
            timestamp: now_ts(),
            source: source.into(),
            kind: kind.into(),
            data,
        };
        if let Some(ref log) = self.log {
            if let Ok(id) = log.append(&event) {
                event.id = id;
            }
        }
        info!(source = %event.source, kind = %event.kind, data = %event.data, "console event");
        let _ = self.tx.send(event);
    }
}
