//! SQLite connection setup and schema for the event hub.
//!
//! The embedding process opens and migrates the database once and hands the
//! shared connection to [`EventHub`](crate::EventHub).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSqlError, Type};
use rusqlite::{Connection, Result, Row};

/// Connection shared by the store, the poll loop and the cleanup loop.
pub type SharedConnection = Arc<Mutex<Connection>>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) a database at the given filesystem path and run migrations.
pub fn open(path: &Path) -> Result<SharedConnection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    migrate(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Open an in-memory database. Useful for testing.
pub fn open_in_memory() -> Result<SharedConnection> {
    let conn = Connection::open_in_memory()?;
    migrate(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Create the schema if it does not already exist.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS organization_states (
            organization_id TEXT PRIMARY KEY,
            version_id      TEXT NOT NULL DEFAULT '',
            updated_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS events (
            id                   INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id      TEXT NOT NULL,
            processed_timestamp  INTEGER NOT NULL,
            originated_timestamp INTEGER NOT NULL,
            event_type           TEXT NOT NULL,
            action               TEXT NOT NULL,
            entity_id            TEXT NOT NULL,
            correlation_id       TEXT,
            event_data           BLOB NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_org_processed
            ON events (organization_id, processed_timestamp);

        CREATE INDEX IF NOT EXISTS idx_events_processed
            ON events (processed_timestamp);",
    )
}

// ---------------------------------------------------------------------------
// Timestamp encoding: integer microseconds since the Unix epoch.
// ---------------------------------------------------------------------------

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

/// Read a microsecond timestamp column.
pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> Result<DateTime<Utc>> {
    let micros: i64 = row.get(idx)?;
    from_micros(micros).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            Box::new(FromSqlError::OutOfRange(micros)),
        )
    })
}
