//! SQLite persistence for organization versions and the event log.
//!
//! Pure SQL: no retries, no caching of results. Every query goes through the
//! connection's prepared statement cache keyed by [`StatementId`].

use chrono::{DateTime, Utc};
use gwctl_core::types::{Event, NewEvent, OrganizationState};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use uuid::Uuid;

use crate::db::{SharedConnection, timestamp_column, to_micros};
use crate::error::StoreError;
use crate::statements::StatementId;

type Result<T> = std::result::Result<T, StoreError>;

/// SQL access layer over `organization_states` and `events`.
#[derive(Clone)]
pub struct Store {
    conn: SharedConnection,
}

impl Store {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Run `f` with the connection locked.
    pub(crate) fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Insert an empty-version state row unless one already exists.
    ///
    /// Returns `true` when a row was created. Safe to call repeatedly.
    pub fn initialize_state(&self, organization_id: &str) -> Result<bool> {
        let id = StatementId::InsertState;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(id.sql()).map_err(StoreError::statement(id))?;
        let inserted = stmt
            .execute(params![organization_id, to_micros(Utc::now())])
            .map_err(StoreError::statement(id))?;
        Ok(inserted > 0)
    }

    /// Every organization's version row, in one round trip.
    pub fn all_states(&self) -> Result<Vec<OrganizationState>> {
        let id = StatementId::SelectAllStates;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(id.sql()).map_err(StoreError::statement(id))?;
        let rows = stmt
            .query_map([], state_from_row)
            .map_err(StoreError::statement(id))?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.map_err(StoreError::statement(id))?);
        }
        Ok(result)
    }

    /// Point lookup. `None` if the organization was never initialized.
    pub fn state(&self, organization_id: &str) -> Result<Option<OrganizationState>> {
        let id = StatementId::SelectState;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(id.sql()).map_err(StoreError::statement(id))?;
        stmt.query_row(params![organization_id], state_from_row)
            .optional()
            .map_err(StoreError::statement(id))
    }

    /// Append `event` and bump the organization's version in one transaction.
    ///
    /// Returns the new version token. Either both writes commit or neither
    /// does. The processed timestamp is strictly greater than any earlier
    /// event of the same organization.
    pub fn publish_event_atomic(&self, organization_id: &str, event: &NewEvent) -> Result<String> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::Transaction)?;

        let last_processed: Option<i64> = {
            let id = StatementId::SelectLastProcessed;
            let mut stmt = tx.prepare_cached(id.sql()).map_err(StoreError::statement(id))?;
            stmt.query_row(params![organization_id], |row| row.get(0))
                .map_err(StoreError::statement(id))?
        };
        let now = to_micros(Utc::now());
        let processed = match last_processed {
            Some(last) if last >= now => last + 1,
            _ => now,
        };

        {
            let id = StatementId::InsertEvent;
            let mut stmt = tx.prepare_cached(id.sql()).map_err(StoreError::statement(id))?;
            stmt.execute(params![
                organization_id,
                processed,
                to_micros(event.originated_timestamp),
                event.event_type,
                event.action,
                event.entity_id,
                event.correlation_id,
                event.payload,
            ])
            .map_err(StoreError::statement(id))?;
        }

        let version = Uuid::new_v4().to_string();
        {
            let id = StatementId::UpsertState;
            let mut stmt = tx.prepare_cached(id.sql()).map_err(StoreError::statement(id))?;
            stmt.execute(params![organization_id, version, processed])
                .map_err(StoreError::statement(id))?;
        }

        tx.commit().map_err(StoreError::Transaction)?;
        Ok(version)
    }

    /// Events with `processed_timestamp > since`, oldest first.
    pub fn events_since(&self, organization_id: &str, since: DateTime<Utc>) -> Result<Vec<Event>> {
        let id = StatementId::SelectEventsSince;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(id.sql()).map_err(StoreError::statement(id))?;
        let rows = stmt
            .query_map(params![organization_id, to_micros(since)], event_from_row)
            .map_err(StoreError::statement(id))?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.map_err(StoreError::statement(id))?);
        }
        Ok(result)
    }

    /// Delete every event processed before `cutoff`. Returns rows deleted.
    pub fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let id = StatementId::DeleteOlderThan;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(id.sql()).map_err(StoreError::statement(id))?;
        stmt.execute(params![to_micros(cutoff)])
            .map_err(StoreError::statement(id))
    }

    /// Delete events processed in `[from, to)`. Returns rows deleted.
    pub fn cleanup_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<usize> {
        if from >= to {
            return Ok(0);
        }
        let id = StatementId::DeleteRange;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(id.sql()).map_err(StoreError::statement(id))?;
        stmt.execute(params![to_micros(from), to_micros(to)])
            .map_err(StoreError::statement(id))
    }
}

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<OrganizationState> {
    Ok(OrganizationState {
        organization_id: row.get(0)?,
        version_id: row.get(1)?,
        updated_at: timestamp_column(row, 2)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        processed_timestamp: timestamp_column(row, 2)?,
        originated_timestamp: timestamp_column(row, 3)?,
        event_type: row.get(4)?,
        action: row.get(5)?,
        entity_id: row.get(6)?,
        correlation_id: row.get(7)?,
        payload: row.get(8)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
