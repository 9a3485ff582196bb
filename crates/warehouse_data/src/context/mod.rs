//! Persistence context: connection ownership and change tracking.
//!
//! # Responsibility
//! - Own the physical connection and the table of tracked instances.
//! - Evaluate queries and point lookups against storage.
//! - Flush every staged state transition as one transaction.
//!
//! # Invariants
//! - A tracked instance has exactly one `EntityState`; untracked is `Detached`.
//! - `persist` is all-or-nothing; on failure no tracked state changes.
//! - Releasing the connection happens at most once.

use crate::entity::{Entity, EntityKey};
use crate::error::RepoResult;
use crate::query::QuerySpec;
use std::future::Future;

mod flush;
mod sqlite;
mod tracker;

pub use sqlite::SqliteContext;

/// Lifecycle tag of an entity instance within one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Tracked and identical to storage as of the last query or commit.
    Unchanged,
    /// Staged for insertion.
    Added,
    /// Staged for update.
    Modified,
    /// Staged for deletion.
    Deleted,
    /// Not tracked by this context.
    Detached,
}

/// Snapshot of the tracked instances of one entity type.
#[derive(Debug, Clone)]
pub struct TableView<T> {
    entries: Vec<(T, EntityState)>,
}

impl<T> TableView<T> {
    pub(crate) fn new(entries: Vec<(T, EntityState)>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&T, EntityState)> {
        self.entries.iter().map(|(entity, state)| (entity, *state))
    }

    /// Instances currently in `state`.
    pub fn in_state(&self, state: EntityState) -> impl Iterator<Item = &T> {
        self.entries
            .iter()
            .filter(move |(_, current)| *current == state)
            .map(|(entity, _)| entity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entities(self) -> Vec<T> {
        self.entries.into_iter().map(|(entity, _)| entity).collect()
    }
}

/// Unit-of-work boundary consumed by `Repository`.
///
/// State-setting primitives here are raw; the attach-then-mark rules live in
/// the repository.
pub trait Context: Send {
    /// Tracked view of `T`'s table, in staging order.
    fn resolve_table<T: Entity>(&self) -> TableView<T>;

    /// Current state of `entity`, `Detached` when untracked.
    fn state_of<T: Entity>(&self, entity: &T) -> EntityState;

    /// Starts tracking a snapshot of `entity` in `state`, even if another
    /// instance with the same key is already tracked.
    fn attach<T: Entity>(&mut self, entity: &T, state: EntityState) -> RepoResult<()>;

    /// Moves an already tracked `entity` to `state`, refreshing its snapshot.
    /// `Detached` stops tracking it.
    fn mark_state<T: Entity>(&mut self, entity: &T, state: EntityState) -> RepoResult<()>;

    /// Point lookup: tracked instances first, then storage. Rows loaded from
    /// storage are attached as `Unchanged`.
    fn find<T: Entity>(&mut self, key: &EntityKey) -> RepoResult<Option<T>>;

    /// `find` with the storage round-trip on the blocking pool.
    fn find_async<T: Entity>(
        &mut self,
        key: EntityKey,
    ) -> impl Future<Output = RepoResult<Option<T>>> + Send;

    /// Runs `spec` against `T`'s table.
    fn evaluate<T: Entity>(&mut self, spec: &QuerySpec) -> RepoResult<Vec<T>>;

    /// Counts rows matching `spec`'s filter.
    fn count<T: Entity>(&mut self, spec: &QuerySpec) -> RepoResult<u64>;

    fn has_changes(&self) -> bool;

    /// Flushes all staged changes atomically and returns the affected rows.
    fn persist(&mut self) -> RepoResult<usize>;

    /// `persist` with the storage round-trip on the blocking pool.
    fn persist_async(&mut self) -> impl Future<Output = RepoResult<usize>> + Send;

    /// Closes the connection. Later calls are no-ops.
    fn release_connection(&mut self);

    fn is_released(&self) -> bool;
}
