//! Hot-path statement catalog and re-preparation.
//!
//! Each query the hub runs on a schedule is compiled once at initialization
//! and kept in the connection's statement cache. When SQLite reports that a
//! compiled statement was invalidated by a schema change, exactly that
//! statement is discarded, recompiled, and the call is retried once.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::Store;

/// Identifies one prepared statement. Indexes [`PreparedStatements`] slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementId {
    InsertState,
    SelectAllStates,
    SelectState,
    SelectLastProcessed,
    InsertEvent,
    UpsertState,
    SelectEventsSince,
    DeleteOlderThan,
    DeleteRange,
}

impl StatementId {
    pub const COUNT: usize = 9;

    pub const ALL: [StatementId; Self::COUNT] = [
        StatementId::InsertState,
        StatementId::SelectAllStates,
        StatementId::SelectState,
        StatementId::SelectLastProcessed,
        StatementId::InsertEvent,
        StatementId::UpsertState,
        StatementId::SelectEventsSince,
        StatementId::DeleteOlderThan,
        StatementId::DeleteRange,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            StatementId::InsertState => "insert_state",
            StatementId::SelectAllStates => "select_all_states",
            StatementId::SelectState => "select_state",
            StatementId::SelectLastProcessed => "select_last_processed",
            StatementId::InsertEvent => "insert_event",
            StatementId::UpsertState => "upsert_state",
            StatementId::SelectEventsSince => "select_events_since",
            StatementId::DeleteOlderThan => "delete_older_than",
            StatementId::DeleteRange => "delete_range",
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            StatementId::InsertState => {
                "INSERT INTO organization_states (organization_id, version_id, updated_at)
                 VALUES (?1, '', ?2)
                 ON CONFLICT(organization_id) DO NOTHING"
            }
            StatementId::SelectAllStates => {
                "SELECT organization_id, version_id, updated_at FROM organization_states"
            }
            StatementId::SelectState => {
                "SELECT organization_id, version_id, updated_at
                 FROM organization_states WHERE organization_id = ?1"
            }
            StatementId::SelectLastProcessed => {
                "SELECT MAX(processed_timestamp) FROM events WHERE organization_id = ?1"
            }
            StatementId::InsertEvent => {
                "INSERT INTO events
                    (organization_id, processed_timestamp, originated_timestamp,
                     event_type, action, entity_id, correlation_id, event_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            }
            StatementId::UpsertState => {
                "INSERT INTO organization_states (organization_id, version_id, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(organization_id) DO UPDATE
                    SET version_id = excluded.version_id,
                        updated_at = excluded.updated_at"
            }
            StatementId::SelectEventsSince => {
                "SELECT id, organization_id, processed_timestamp, originated_timestamp,
                        event_type, action, entity_id, correlation_id, event_data
                 FROM events
                 WHERE organization_id = ?1 AND processed_timestamp > ?2
                 ORDER BY processed_timestamp ASC, id ASC"
            }
            StatementId::DeleteOlderThan => "DELETE FROM events WHERE processed_timestamp < ?1",
            StatementId::DeleteRange => {
                "DELETE FROM events WHERE processed_timestamp >= ?1 AND processed_timestamp < ?2"
            }
        }
    }
}

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bookkeeping for one compiled statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementSlot {
    /// Bumped every time the statement is recompiled.
    pub generation: u64,
    pub prepared_at: Option<DateTime<Utc>>,
}

pub type Slots = [StatementSlot; StatementId::COUNT];

/// Fixed table of statement slots guarded by one lock.
///
/// Callers hold the shared lock for the duration of a store call; a
/// re-preparation takes the exclusive lock, so a statement is never swapped
/// under a running query. Lock order is always slots, then connection.
#[derive(Debug, Default)]
pub struct PreparedStatements {
    slots: RwLock<Slots>,
}

impl PreparedStatements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile every statement into the connection's cache.
    pub fn prepare_all(&self, store: &Store) -> Result<(), StoreError> {
        let mut slots = self.slots.write();
        store.with_connection(|conn| {
            conn.set_prepared_statement_cache_capacity(StatementId::COUNT.max(16));
            for id in StatementId::ALL {
                conn.prepare_cached(id.sql())
                    .map_err(StoreError::statement(id))?;
            }
            Ok(())
        })?;
        let now = Utc::now();
        for slot in slots.iter_mut() {
            slot.generation += 1;
            slot.prepared_at = Some(now);
        }
        debug!(count = StatementId::COUNT, "prepared eventhub statements");
        Ok(())
    }

    /// Discard the cached copy of `id` and compile it again.
    pub fn reprepare(&self, store: &Store, id: StatementId) -> Result<(), StoreError> {
        let mut slots = self.slots.write();
        store.with_connection(|conn| {
            conn.prepare_cached(id.sql())
                .map_err(StoreError::statement(id))?
                .discard();
            conn.prepare_cached(id.sql())
                .map_err(StoreError::statement(id))?;
            Ok(())
        })?;
        let slot = &mut slots[id.index()];
        slot.generation += 1;
        slot.prepared_at = Some(Utc::now());
        debug!(statement = %id, generation = slot.generation, "re-prepared statement");
        Ok(())
    }

    /// Drop every compiled statement. Slots go back to unprepared.
    pub fn release(&self, store: &Store) {
        let mut slots = self.slots.write();
        store.with_connection(|conn| conn.flush_prepared_statement_cache());
        for slot in slots.iter_mut() {
            slot.prepared_at = None;
        }
    }

    /// Shared access to the slot table, held while a store call runs.
    pub fn read(&self) -> RwLockReadGuard<'_, Slots> {
        self.slots.read()
    }

    pub fn slot(&self, id: StatementId) -> StatementSlot {
        self.slots.read()[id.index()]
    }

    pub fn is_prepared(&self, id: StatementId) -> bool {
        self.slot(id).prepared_at.is_some()
    }

    /// Run `op` against the store. If it fails because a statement was
    /// invalidated, re-prepare that statement and run `op` once more.
    pub fn execute<T>(
        &self,
        store: &Store,
        op: impl Fn(&Store) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let first = {
            let _slots = self.read();
            op(store)
        };
        match first {
            Err(err) if err.is_recoverable() => {
                let Some(id) = err.statement_id() else {
                    return Err(err);
                };
                warn!(statement = %id, error = %err, "statement invalidated, re-preparing");
                self.reprepare(store, id)?;
                let _slots = self.read();
                op(store)
            }
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
