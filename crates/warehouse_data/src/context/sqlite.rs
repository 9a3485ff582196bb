//! SQLite-backed persistence context.
//!
//! # Responsibility
//! - Hold the single connection of one unit of work.
//! - Resolve tracked identities before touching storage.
//! - Run blocking storage round-trips on tokio's blocking pool for async callers.
//!
//! # Invariants
//! - The connection sits behind one mutex; no guard lives across an `.await`.
//! - Tracker mutations happen only on the owning task, never on blocking threads.

use super::flush::{FlushError, FlushGate, FlushPlan, GatePhase};
use super::tracker::{Identity, Tracker};
use super::{Context, EntityState, TableView};
use crate::db::{open_db, open_db_in_memory, DbConfig, DbError, DbResult, Migration};
use crate::entity::{Entity, EntityKey};
use crate::error::{CommitFailure, RepoError, RepoResult};
use crate::query::{quote, QuerySpec, Tracking};
use log::{debug, error, info, warn};
use rusqlite::{params_from_iter, Connection};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

type SharedConnection = Arc<Mutex<Option<Connection>>>;

/// Unit-of-work context over one SQLite connection.
///
/// Not meant for concurrent mutation: every state-changing call takes
/// `&mut self`.
pub struct SqliteContext {
    conn: SharedConnection,
    tracker: Tracker,
}

impl SqliteContext {
    /// Wraps an already configured and migrated connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            tracker: Tracker::default(),
        }
    }

    /// Opens (and migrates) a database file.
    pub fn open(
        path: impl AsRef<Path>,
        config: &DbConfig,
        migrations: &[Migration],
    ) -> DbResult<Self> {
        open_db(path, config, migrations).map(Self::new)
    }

    /// Opens (and migrates) a private in-memory database.
    pub fn open_in_memory(config: &DbConfig, migrations: &[Migration]) -> DbResult<Self> {
        open_db_in_memory(config, migrations).map(Self::new)
    }

    /// Runs `f` against the raw connection, bypassing tracking.
    pub fn with_connection<R>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<R>,
    ) -> RepoResult<R> {
        let guard = lock_conn(&self.conn);
        let conn = guard.as_ref().ok_or(DbError::ConnectionReleased)?;
        Ok(f(conn)?)
    }

    /// Number of instances currently tracked, across all entity types.
    pub fn tracked_len(&self) -> usize {
        self.tracker.len()
    }

    /// Tracked copy for `key`: `Some(None)` when only a deleted entry exists.
    fn tracked_lookup<T: Entity>(&self, key: &EntityKey) -> Option<Option<T>> {
        let slots = self.tracker.slots_for(&Identity::of::<T>(key.clone()));
        if slots.is_empty() {
            return None;
        }
        let live = slots
            .iter()
            .filter_map(|slot| self.tracker.get(*slot))
            .filter(|entry| entry.state != EntityState::Deleted)
            .max_by_key(|entry| entry.seq);
        Some(live.and_then(|entry| entry.instance::<T>().cloned()))
    }

    /// Returns the tracked instance for `row`'s identity, or starts tracking
    /// `row` as `Unchanged`.
    fn resolve_loaded<T: Entity>(&mut self, row: T) -> T {
        let identity = Identity::of::<T>(row.key());
        let existing = self
            .tracker
            .slots_for(&identity)
            .iter()
            .filter_map(|slot| self.tracker.get(*slot))
            .max_by_key(|entry| entry.seq)
            .and_then(|entry| entry.instance::<T>().cloned());
        match existing {
            Some(tracked) => tracked,
            None => {
                self.tracker.insert(&row, EntityState::Unchanged);
                row
            }
        }
    }
}

impl Context for SqliteContext {
    fn resolve_table<T: Entity>(&self) -> TableView<T> {
        TableView::new(
            self.tracker
                .entries_of::<T>()
                .into_iter()
                .filter_map(|entry| {
                    entry
                        .instance::<T>()
                        .cloned()
                        .map(|instance| (instance, entry.state))
                })
                .collect(),
        )
    }

    fn state_of<T: Entity>(&self, entity: &T) -> EntityState {
        self.tracker
            .locate(entity)
            .and_then(|slot| self.tracker.get(slot))
            .map_or(EntityState::Detached, |entry| entry.state)
    }

    fn attach<T: Entity>(&mut self, entity: &T, state: EntityState) -> RepoResult<()> {
        let key = entity.key();
        check_key::<T>(&key)?;
        if state == EntityState::Detached {
            return Err(RepoError::InvalidStateTransition {
                table: T::table_name(),
                key,
                reason: "cannot attach an entity as detached",
            });
        }
        self.tracker.insert(entity, state);
        Ok(())
    }

    fn mark_state<T: Entity>(&mut self, entity: &T, state: EntityState) -> RepoResult<()> {
        let Some(slot) = self.tracker.locate(entity) else {
            return Err(RepoError::InvalidStateTransition {
                table: T::table_name(),
                key: entity.key(),
                reason: "entity is not tracked by this context",
            });
        };
        match state {
            EntityState::Detached => {
                self.tracker.remove(slot);
            }
            state => self.tracker.restage(slot, entity, state),
        }
        Ok(())
    }

    fn find<T: Entity>(&mut self, key: &EntityKey) -> RepoResult<Option<T>> {
        check_key::<T>(key)?;
        if let Some(tracked) = self.tracked_lookup::<T>(key) {
            return Ok(tracked);
        }

        let loaded = {
            let guard = lock_conn(&self.conn);
            let conn = guard.as_ref().ok_or(DbError::ConnectionReleased)?;
            load_by_key::<T>(conn, key)?
        };
        if let Some(entity) = &loaded {
            self.tracker.insert(entity, EntityState::Unchanged);
        }
        Ok(loaded)
    }

    fn find_async<T: Entity>(
        &mut self,
        key: EntityKey,
    ) -> impl Future<Output = RepoResult<Option<T>>> + Send {
        async move {
            check_key::<T>(&key)?;
            if let Some(tracked) = self.tracked_lookup::<T>(&key) {
                return Ok(tracked);
            }

            let conn = Arc::clone(&self.conn);
            let lookup_key = key.clone();
            let loaded = tokio::task::spawn_blocking(move || -> RepoResult<Option<T>> {
                let guard = lock_conn(&conn);
                let conn = guard.as_ref().ok_or(DbError::ConnectionReleased)?;
                Ok(load_by_key::<T>(conn, &lookup_key)?)
            })
            .await
            .map_err(|err| DbError::BlockingTask(err.to_string()))??;

            if let Some(entity) = &loaded {
                self.tracker.insert(entity, EntityState::Unchanged);
            }
            Ok(loaded)
        }
    }

    fn evaluate<T: Entity>(&mut self, spec: &QuerySpec) -> RepoResult<Vec<T>> {
        let (sql, params) = spec.build_select::<T>()?;
        let rows = {
            let guard = lock_conn(&self.conn);
            let conn = guard.as_ref().ok_or(DbError::ConnectionReleased)?;
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            let mut loaded = Vec::new();
            while let Some(row) = rows.next()? {
                loaded.push(T::from_row(row)?);
            }
            loaded
        };
        debug!(
            "event=ctx_query module=context status=ok table={} tracking={:?} rows={}",
            T::table_name(),
            spec.tracking(),
            rows.len()
        );

        match spec.tracking() {
            Tracking::NoTracking => Ok(rows),
            Tracking::Tracked => Ok(rows
                .into_iter()
                .map(|row| self.resolve_loaded(row))
                .collect()),
        }
    }

    fn count<T: Entity>(&mut self, spec: &QuerySpec) -> RepoResult<u64> {
        let (sql, params) = spec.build_count::<T>()?;
        let guard = lock_conn(&self.conn);
        let conn = guard.as_ref().ok_or(DbError::ConnectionReleased)?;
        let count: u64 = conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
        Ok(count)
    }

    fn has_changes(&self) -> bool {
        self.tracker.has_changes()
    }

    fn persist(&mut self) -> RepoResult<usize> {
        let started_at = Instant::now();
        let (plan, staged) = FlushPlan::build(&self.tracker).inspect_err(|err| {
            error!("event=ctx_commit module=context status=error mode=sync error_code=precheck_failed error={err}");
        })?;
        if plan.is_empty() {
            return Ok(0);
        }
        info!(
            "event=ctx_commit module=context status=start mode=sync statements={}",
            plan.len()
        );

        let result = {
            let mut guard = lock_conn(&self.conn);
            match guard.as_mut() {
                Some(conn) => plan.execute(conn, None),
                None => Err(FlushError::Failed(CommitFailure::Db(
                    DbError::ConnectionReleased,
                ))),
            }
        };

        match result {
            Ok(affected) => {
                self.tracker.accept(&staged);
                info!(
                    "event=ctx_commit module=context status=ok mode=sync duration_ms={} affected={affected}",
                    started_at.elapsed().as_millis()
                );
                Ok(affected)
            }
            Err(err) => {
                let err = RepoError::from(err);
                error!(
                    "event=ctx_commit module=context status=error mode=sync duration_ms={} error={err}",
                    started_at.elapsed().as_millis()
                );
                Err(err)
            }
        }
    }

    fn persist_async(&mut self) -> impl Future<Output = RepoResult<usize>> + Send {
        async move {
            let started_at = Instant::now();
            let (plan, staged) = FlushPlan::build(&self.tracker).inspect_err(|err| {
                error!("event=ctx_commit module=context status=error mode=async error_code=precheck_failed error={err}");
            })?;
            if plan.is_empty() {
                return Ok(0);
            }
            info!(
                "event=ctx_commit module=context status=start mode=async statements={}",
                plan.len()
            );

            let gate = Arc::new(FlushGate::default());
            let task_gate = Arc::clone(&gate);
            let conn = Arc::clone(&self.conn);
            let pending = PendingFlush {
                tracker: &mut self.tracker,
                staged,
                gate,
                started_at,
                settled: false,
            };

            let joined = tokio::task::spawn_blocking(move || {
                let mut guard = lock_conn(&conn);
                match guard.as_mut() {
                    Some(conn) => plan.execute(conn, Some(&task_gate)),
                    None => Err(FlushError::Failed(CommitFailure::Db(
                        DbError::ConnectionReleased,
                    ))),
                }
            })
            .await;

            let result = joined.unwrap_or_else(|err| {
                Err(FlushError::Failed(CommitFailure::Db(DbError::BlockingTask(
                    err.to_string(),
                ))))
            });
            pending.settle(result)
        }
    }

    fn release_connection(&mut self) {
        let Some(conn) = lock_conn(&self.conn).take() else {
            return;
        };
        if self.tracker.has_changes() {
            warn!(
                "event=ctx_release module=context status=discarding staged={}",
                self.tracker.staged().len()
            );
        }
        match conn.close() {
            Ok(()) => info!("event=ctx_release module=context status=ok"),
            Err((_, err)) => {
                warn!("event=ctx_release module=context status=error error={err}")
            }
        }
    }

    fn is_released(&self) -> bool {
        lock_conn(&self.conn).is_none()
    }
}

impl Drop for SqliteContext {
    fn drop(&mut self) {
        self.release_connection();
    }
}

/// Async flush in flight. Settles the tracker exactly once: through `settle`
/// when awaited to completion, or in `Drop` when the future is cancelled.
struct PendingFlush<'a> {
    tracker: &'a mut Tracker,
    staged: Vec<usize>,
    gate: Arc<FlushGate>,
    started_at: Instant,
    settled: bool,
}

impl PendingFlush<'_> {
    fn settle(mut self, result: Result<usize, FlushError>) -> RepoResult<usize> {
        self.settled = true;
        let outcome = match result {
            Ok(affected) => Ok(affected),
            // The transaction may have committed before the task failed.
            Err(err) => match self.gate.close() {
                GatePhase::Committed(affected) => Ok(affected),
                GatePhase::Open | GatePhase::Cancelled => Err(RepoError::from(err)),
            },
        };
        match &outcome {
            Ok(affected) => {
                self.tracker.accept(&self.staged);
                info!(
                    "event=ctx_commit module=context status=ok mode=async duration_ms={} affected={affected}",
                    self.started_at.elapsed().as_millis()
                );
            }
            Err(err) => error!(
                "event=ctx_commit module=context status=error mode=async duration_ms={} error={err}",
                self.started_at.elapsed().as_millis()
            ),
        }
        outcome
    }
}

impl Drop for PendingFlush<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        match self.gate.close() {
            GatePhase::Committed(affected) => {
                self.tracker.accept(&self.staged);
                warn!(
                    "event=ctx_commit module=context status=cancelled_after_commit mode=async affected={affected}"
                );
            }
            GatePhase::Open | GatePhase::Cancelled => {
                warn!("event=ctx_commit module=context status=cancelled mode=async");
            }
        }
    }
}

fn lock_conn(conn: &Mutex<Option<Connection>>) -> MutexGuard<'_, Option<Connection>> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn check_key<T: Entity>(key: &EntityKey) -> RepoResult<()> {
    let expected = T::key_columns().len();
    if key.len() != expected || expected == 0 {
        return Err(RepoError::InvalidKey {
            table: T::table_name(),
            expected,
            actual: key.len(),
        });
    }
    Ok(())
}

fn load_by_key<T: Entity>(conn: &Connection, key: &EntityKey) -> rusqlite::Result<Option<T>> {
    let columns: Vec<_> = T::columns().iter().map(|col| quote(col)).collect();
    let where_clause = T::key_columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| format!("{} = ?{}", quote(col), idx + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    let sql = format!(
        "SELECT {} FROM {} WHERE {where_clause} LIMIT 1",
        columns.join(", "),
        quote(T::table_name())
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(key.parts().iter()))?;
    match rows.next()? {
        Some(row) => Ok(Some(T::from_row(row)?)),
        None => Ok(None),
    }
}
