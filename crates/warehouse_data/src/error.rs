//! Repository error taxonomy.

use crate::db::DbError;
use crate::entity::EntityKey;
use thiserror::Error;

pub type RepoResult<T> = Result<T, RepoError>;

/// Errors surfaced by repository and context operations.
#[derive(Debug, Error)]
pub enum RepoError {
    /// Point lookup or delete-by-key found no row.
    #[error("{table} not found: {key}")]
    NotFound {
        table: &'static str,
        key: EntityKey,
    },
    /// A staged insert collides with another tracked or stored row.
    #[error("duplicate key {key} in {table}")]
    DuplicateKey {
        table: &'static str,
        key: EntityKey,
    },
    /// Flush failed; every tracked entity keeps its staged state.
    #[error("commit failed: {source}")]
    CommitFailed { source: CommitFailure },
    #[error("invalid state transition for {table} {key}: {reason}")]
    InvalidStateTransition {
        table: &'static str,
        key: EntityKey,
        reason: &'static str,
    },
    #[error("{table} key expects {expected} part(s), got {actual}")]
    InvalidKey {
        table: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<CommitFailure> for RepoError {
    fn from(value: CommitFailure) -> Self {
        Self::CommitFailed { source: value }
    }
}

/// Underlying cause carried by `RepoError::CommitFailed`.
#[derive(Debug, Error)]
pub enum CommitFailure {
    #[error("{0}")]
    Storage(#[from] rusqlite::Error),
    #[error("{0}")]
    Db(#[from] DbError),
    /// An UPDATE or DELETE did not touch exactly the one row it targets.
    #[error("{operation} on {table} {key} affected {actual} rows, expected 1")]
    RowCount {
        operation: &'static str,
        table: &'static str,
        key: EntityKey,
        actual: usize,
    },
    #[error("commit was cancelled before the transaction completed")]
    Cancelled,
}
