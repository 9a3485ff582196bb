//! Generic unit-of-work persistence over SQLite.
//! Callers define entities; this crate tracks, stages and commits them.

pub mod context;
pub mod db;
pub mod entity;
pub mod error;
pub mod logging;
pub mod query;
pub mod repo;

pub use context::{Context, EntityState, SqliteContext, TableView};
pub use db::{open_db, open_db_in_memory, DbConfig, DbError, DbResult, Migration};
pub use entity::{Entity, EntityKey, KeyValue};
pub use error::{CommitFailure, RepoError, RepoResult};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use query::{Filter, QuerySpec, Tracking};
pub use repo::{Query, Repository};

/// Returns the crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
