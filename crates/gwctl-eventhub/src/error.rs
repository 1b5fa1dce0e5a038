use rusqlite::ErrorCode;
use thiserror::Error;

use crate::statements::StatementId;

/// Errors raised by the SQL layer.
///
/// Statement failures name the statement that failed so the caller can
/// re-prepare exactly that one.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("statement {statement} failed: {source}")]
    Statement {
        statement: StatementId,
        #[source]
        source: rusqlite::Error,
    },
    #[error("transaction failed: {0}")]
    Transaction(#[source] rusqlite::Error),
}

impl StoreError {
    pub(crate) fn statement(statement: StatementId) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| StoreError::Statement { statement, source }
    }

    /// The statement implicated by this error, if any.
    pub fn statement_id(&self) -> Option<StatementId> {
        match self {
            StoreError::Statement { statement, .. } => Some(*statement),
            StoreError::Transaction(_) => None,
        }
    }

    /// Whether re-preparing the implicated statement and retrying can succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            StoreError::Statement { source, .. } => is_statement_invalidated(source),
            StoreError::Transaction(_) => false,
        }
    }
}

/// SQLite reports `SQLITE_SCHEMA` when a compiled statement was invalidated
/// by a concurrent schema change.
pub fn is_statement_invalidated(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::SchemaChanged
    )
}

#[derive(Debug, Error)]
pub enum EventHubError {
    #[error("organization not found: {0}")]
    NotFound(String),
    #[error("organization already exists: {0}")]
    AlreadyExists(String),
    #[error("event hub not initialized")]
    NotInitialized,
    #[error("event hub closed")]
    Closed,
    #[error("{operation}: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Config(#[from] gwctl_core::ConfigError),
}

pub type Result<T, E = EventHubError> = std::result::Result<T, E>;

#[cfg(test)]
pub(crate) fn schema_changed() -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_SCHEMA),
        Some("database schema has changed".into()),
    )
}
