//! SQLite storage bootstrap and schema migration entry points.
//!
//! # Responsibility
//! - Open and configure SQLite connections backing a persistence context.
//! - Apply caller-registered schema migrations in deterministic order.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - A context must not read/write entity tables before migrations succeed.

use serde::Deserialize;
use thiserror::Error;

pub mod migrations;
mod open;

pub use migrations::Migration;
pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

/// Storage-level failures raised below the repository layer.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database schema version {db_version} is newer than supported {latest_supported}")]
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    #[error("migration versions must be strictly increasing; {version} follows {previous}")]
    UnorderedMigrations { previous: u32, version: u32 },
    #[error("invalid database config: {0}")]
    InvalidConfig(String),
    #[error("connection has already been released")]
    ConnectionReleased,
    #[error("blocking storage task failed: {0}")]
    BlockingTask(String),
}

/// Connection settings applied when a context opens its database.
///
/// Every field has a default, so partial JSON/TOML documents deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    /// Enables `PRAGMA foreign_keys`.
    pub foreign_keys: bool,
    /// Optional `PRAGMA journal_mode` value such as `WAL`.
    pub journal_mode: Option<String>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            foreign_keys: true,
            journal_mode: None,
        }
    }
}
