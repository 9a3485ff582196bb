//! Connection bootstrap utilities for SQLite.
//!
//! # Responsibility
//! - Open file or in-memory SQLite connections.
//! - Apply `DbConfig` pragmas required by the context.
//! - Run schema migrations before returning a usable connection.
//!
//! # Invariants
//! - Returned connections have migrations fully applied.

use super::migrations::{apply_migrations, Migration};
use super::{DbConfig, DbError, DbResult};
use log::{error, info};
use rusqlite::Connection;
use std::path::Path;
use std::time::{Duration, Instant};

/// Opens a SQLite database file and applies all pending migrations.
///
/// # Side effects
/// - Emits `db_open` logging events with duration and status.
pub fn open_db(
    path: impl AsRef<Path>,
    config: &DbConfig,
    migrations: &[Migration],
) -> DbResult<Connection> {
    bootstrap("file", || Connection::open(path), config, migrations)
}

/// Opens an in-memory SQLite database and applies all pending migrations.
pub fn open_db_in_memory(config: &DbConfig, migrations: &[Migration]) -> DbResult<Connection> {
    bootstrap("memory", Connection::open_in_memory, config, migrations)
}

fn bootstrap(
    mode: &str,
    connect: impl FnOnce() -> rusqlite::Result<Connection>,
    config: &DbConfig,
    migrations: &[Migration],
) -> DbResult<Connection> {
    let started_at = Instant::now();
    info!("event=db_open module=db status=start mode={mode}");

    let mut conn = match connect() {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={mode} duration_ms={} error_code=db_open_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    };

    match configure_connection(&mut conn, config, migrations) {
        Ok(()) => {
            info!(
                "event=db_open module=db status=ok mode={mode} duration_ms={}",
                started_at.elapsed().as_millis()
            );
            Ok(conn)
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={mode} duration_ms={} error_code=db_bootstrap_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

fn configure_connection(
    conn: &mut Connection,
    config: &DbConfig,
    migrations: &[Migration],
) -> DbResult<()> {
    let foreign_keys = if config.foreign_keys { "ON" } else { "OFF" };
    conn.execute_batch(&format!("PRAGMA foreign_keys = {foreign_keys};"))?;
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    if let Some(mode) = config.journal_mode.as_deref() {
        if mode.is_empty() || !mode.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DbError::InvalidConfig(format!(
                "unsupported journal_mode `{mode}`"
            )));
        }
        // journal_mode returns the resulting mode as a row.
        conn.query_row(&format!("PRAGMA journal_mode = {mode};"), [], |_| Ok(()))?;
    }
    apply_migrations(conn, migrations)?;
    Ok(())
}
