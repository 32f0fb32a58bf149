use chrono::{DateTime, SecondsFormat, Utc};
use rollcall_core::{AttendanceEvent, EventSink, SinkError};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS attendance (
        id            TEXT PRIMARY KEY,
        identity_name TEXT NOT NULL,
        camera_id     TEXT NOT NULL,
        occurred_at   TEXT NOT NULL,
        similarity    REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_attendance_identity_time
        ON attendance (identity_name, occurred_at);
";

/// SQLite-backed attendance log.
///
/// Timestamps are stored as fixed-width UTC RFC 3339 text so that string
/// order matches time order.
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

fn format_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn unavailable(e: rusqlite::Error) -> SinkError {
    SinkError::Unavailable(e.to_string())
}

impl SqliteEventStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| SinkError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(unavailable)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, SinkError> {
        Self::init(Connection::open_in_memory().map_err(unavailable)?)
    }

    fn init(conn: Connection) -> Result<Self, SinkError> {
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Most recent events for `identity`, newest first.
    pub fn recent_for_identity(&self, identity: &str, limit: usize) -> Result<Vec<AttendanceEvent>, SinkError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, identity_name, camera_id, occurred_at, similarity
                 FROM attendance WHERE identity_name = ?1
                 ORDER BY occurred_at DESC LIMIT ?2",
            )
            .map_err(unavailable)?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![identity, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                ))
            })
            .map_err(unavailable)?;

        let mut events = Vec::new();
        for row in rows {
            let (id, identity, camera_id, occurred_at, similarity) = row.map_err(unavailable)?;
            let id = Uuid::parse_str(&id).map_err(|e| SinkError::Unavailable(format!("bad event id {id}: {e}")))?;
            let occurred_at = DateTime::parse_from_rfc3339(&occurred_at)
                .map_err(|e| SinkError::Unavailable(format!("bad timestamp {occurred_at}: {e}")))?
                .with_timezone(&Utc);
            events.push(AttendanceEvent {
                id,
                identity,
                camera_id,
                occurred_at,
                similarity: similarity as f32,
            });
        }
        Ok(events)
    }

    pub fn count(&self) -> Result<u64, SinkError> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))
            .map_err(unavailable)?;
        Ok(n.max(0) as u64)
    }
}

impl EventSink for SqliteEventStore {
    fn log_event(&self, event: &AttendanceEvent) -> Result<(), SinkError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO attendance (id, identity_name, camera_id, occurred_at, similarity)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.id.to_string(),
                    event.identity,
                    event.camera_id,
                    format_time(&event.occurred_at),
                    event.similarity as f64,
                ],
            )
            .map_err(|e| SinkError::Write(e.to_string()))?;

        if inserted == 0 {
            tracing::debug!(event = %event.id, "event already stored");
        }
        Ok(())
    }
}
