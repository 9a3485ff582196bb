//! Generic repository over one persistence context.
//!
//! # Responsibility
//! - Offer uniform query/get/add/update/delete/detach operations for any
//!   `Entity` type, generic per call.
//! - Apply the staging rules that map each operation onto context states.
//! - Expose atomic commit (sync and async) and scoped connection release.
//!
//! # Invariants
//! - Staging never touches storage; only queries, lookups and commits do.
//! - A repository owns its context; two repositories never share one.

use crate::context::{Context, EntityState, SqliteContext, TableView};
use crate::entity::{Entity, EntityKey, KeyValue};
use crate::error::{RepoError, RepoResult};
use crate::query::{Filter, QuerySpec, Tracking};
use log::debug;
use std::marker::PhantomData;

/// Uniform data access for every entity type reachable through `C`.
///
/// ```ignore
/// let mut repo = Repository::new(SqliteContext::open_in_memory(&DbConfig::default(), MIGRATIONS)?);
/// repo.add(&order)?;
/// let affected = repo.commit()?;
/// ```
pub struct Repository<C: Context = SqliteContext> {
    context: C,
}

impl<C: Context> Repository<C> {
    pub fn new(context: C) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    pub fn into_context(self) -> C {
        self.context
    }

    /// Lazy tracked query over `T`'s table.
    ///
    /// Rows enter the context as `Unchanged`; a row whose identity is already
    /// tracked resolves to the tracked instance instead.
    pub fn query_all<T: Entity>(&mut self) -> Query<'_, C, T> {
        Query::new(&mut self.context, Tracking::Tracked)
    }

    pub fn query_all_where<T: Entity>(&mut self, filter: Filter) -> Query<'_, C, T> {
        self.query_all::<T>().filter(filter)
    }

    /// Lazy query whose results are never tracked. Mutating them has no effect
    /// on commit.
    pub fn query_readonly<T: Entity>(&mut self) -> Query<'_, C, T> {
        Query::new(&mut self.context, Tracking::NoTracking)
    }

    pub fn query_readonly_where<T: Entity>(&mut self, filter: Filter) -> Query<'_, C, T> {
        self.query_readonly::<T>().filter(filter)
    }

    /// Point lookup by key; tracked instances are consulted before storage.
    ///
    /// # Errors
    /// - `NotFound` when no row exists, or the tracked instance is staged for
    ///   deletion.
    /// - `InvalidKey` when the key arity differs from `T::key_columns()`.
    pub fn get_by_id<T: Entity>(&mut self, key: impl Into<EntityKey>) -> RepoResult<T> {
        let key = key.into();
        self.context
            .find::<T>(&key)?
            .ok_or_else(|| RepoError::NotFound {
                table: T::table_name(),
                key,
            })
    }

    /// `get_by_id` with the storage round-trip off the async executor.
    pub async fn get_by_id_async<T: Entity>(
        &mut self,
        key: impl Into<EntityKey>,
    ) -> RepoResult<T> {
        let key = key.into();
        self.context
            .find_async::<T>(key.clone())
            .await?
            .ok_or_else(|| RepoError::NotFound {
                table: T::table_name(),
                key,
            })
    }

    /// Lookup by a composite key, parts in `T::key_columns()` order.
    pub fn get_by_composite_key<T, I, V>(&mut self, parts: I) -> RepoResult<T>
    where
        T: Entity,
        I: IntoIterator<Item = V>,
        V: Into<KeyValue>,
    {
        self.get_by_id::<T>(EntityKey::composite(parts))
    }

    pub async fn get_by_composite_key_async<T, I, V>(&mut self, parts: I) -> RepoResult<T>
    where
        T: Entity,
        I: IntoIterator<Item = V>,
        V: Into<KeyValue>,
    {
        let key = EntityKey::composite(parts);
        self.get_by_id_async::<T>(key).await
    }

    /// Stages `entity` for insertion. Key collisions surface at commit.
    pub fn add<T: Entity>(&mut self, entity: &T) -> RepoResult<()> {
        self.context.attach(entity, EntityState::Added)?;
        log_stage::<T>("add", entity);
        Ok(())
    }

    /// Stages each entity in order and returns how many were staged.
    ///
    /// Stops at the first rejected entity; the ones before it stay staged.
    pub fn add_many<'a, T: Entity>(
        &mut self,
        entities: impl IntoIterator<Item = &'a T>,
    ) -> RepoResult<usize> {
        let mut staged = 0;
        for entity in entities {
            self.add(entity)?;
            staged += 1;
        }
        Ok(staged)
    }

    /// Stages `entity`'s current values for update.
    ///
    /// A detached instance is attached first. A pending insert stays `Added`
    /// with refreshed values.
    pub fn update<T: Entity>(&mut self, entity: &T) -> RepoResult<()> {
        match self.context.state_of(entity) {
            EntityState::Detached => {
                self.context.attach(entity, EntityState::Unchanged)?;
                self.context.mark_state(entity, EntityState::Modified)?;
            }
            EntityState::Added => self.context.mark_state(entity, EntityState::Added)?,
            EntityState::Unchanged | EntityState::Modified | EntityState::Deleted => {
                self.context.mark_state(entity, EntityState::Modified)?;
            }
        }
        log_stage::<T>("update", entity);
        Ok(())
    }

    pub fn update_many<'a, T: Entity>(
        &mut self,
        entities: impl IntoIterator<Item = &'a T>,
    ) -> RepoResult<usize> {
        let mut staged = 0;
        for entity in entities {
            self.update(entity)?;
            staged += 1;
        }
        Ok(staged)
    }

    /// Stages `entity` for deletion.
    ///
    /// Deleting a pending insert simply forgets it; nothing reaches storage.
    pub fn delete<T: Entity>(&mut self, entity: &T) -> RepoResult<()> {
        match self.context.state_of(entity) {
            EntityState::Detached => {
                self.context.attach(entity, EntityState::Unchanged)?;
                self.context.mark_state(entity, EntityState::Deleted)?;
            }
            EntityState::Added => self.context.mark_state(entity, EntityState::Detached)?,
            EntityState::Deleted => return Ok(()),
            EntityState::Unchanged | EntityState::Modified => {
                self.context.mark_state(entity, EntityState::Deleted)?;
            }
        }
        log_stage::<T>("delete", entity);
        Ok(())
    }

    /// Looks the row up by key, then stages it for deletion.
    pub fn delete_by_id<T: Entity>(&mut self, key: impl Into<EntityKey>) -> RepoResult<()> {
        let entity = self.get_by_id::<T>(key)?;
        self.delete(&entity)
    }

    pub fn delete_many<'a, T: Entity>(
        &mut self,
        entities: impl IntoIterator<Item = &'a T>,
    ) -> RepoResult<usize> {
        let mut staged = 0;
        for entity in entities {
            self.delete(entity)?;
            staged += 1;
        }
        Ok(staged)
    }

    /// Stages every stored row matching `filter` for deletion and returns how
    /// many transitions were staged.
    pub fn delete_where<T: Entity>(&mut self, filter: Filter) -> RepoResult<usize> {
        let matched = self.query_all_where::<T>(filter).fetch()?;
        let mut staged = 0;
        for entity in &matched {
            if self.context.state_of(entity) == EntityState::Deleted {
                continue;
            }
            self.delete(entity)?;
            staged += 1;
        }
        Ok(staged)
    }

    /// Stops tracking `entity`. The instance itself stays usable.
    ///
    /// # Errors
    /// - `InvalidStateTransition` when this context does not track `entity`.
    pub fn detach<T: Entity>(&mut self, entity: &T) -> RepoResult<()> {
        self.context.mark_state(entity, EntityState::Detached)?;
        log_stage::<T>("detach", entity);
        Ok(())
    }

    pub fn state_of<T: Entity>(&self, entity: &T) -> EntityState {
        self.context.state_of(entity)
    }

    pub fn has_changes(&self) -> bool {
        self.context.has_changes()
    }

    /// Tracked instances of `T` with their states, in staging order.
    pub fn local<T: Entity>(&self) -> TableView<T> {
        self.context.resolve_table::<T>()
    }

    /// Flushes every staged change as one transaction.
    ///
    /// # Errors
    /// - `DuplicateKey` when a staged insert collides with a tracked or stored key.
    /// - `CommitFailed` for any other storage failure.
    ///
    /// On error nothing is persisted and every state stays staged.
    pub fn commit(&mut self) -> RepoResult<usize> {
        self.context.persist()
    }

    /// Async `commit`. Dropping the future before it resolves rolls the flush
    /// back unless storage already committed.
    pub async fn commit_async(&mut self) -> RepoResult<usize> {
        self.context.persist_async().await
    }

    /// Releases the underlying connection. Repeated calls are no-ops.
    pub fn release(&mut self) {
        self.context.release_connection();
    }

    pub fn is_released(&self) -> bool {
        self.context.is_released()
    }
}

fn log_stage<T: Entity>(op: &str, entity: &T) {
    debug!(
        "event=repo_stage module=repo status=ok op={op} table={} key={}",
        T::table_name(),
        entity.key()
    );
}

/// Lazily evaluated query over `T`'s table. Storage is only read by `fetch`,
/// `first` or `count`.
pub struct Query<'r, C: Context, T: Entity> {
    context: &'r mut C,
    spec: QuerySpec,
    _entity: PhantomData<fn() -> T>,
}

impl<'r, C: Context, T: Entity> Query<'r, C, T> {
    fn new(context: &'r mut C, tracking: Tracking) -> Self {
        Self {
            context,
            spec: QuerySpec::new(tracking),
            _entity: PhantomData,
        }
    }

    /// ANDs `filter` with the conditions already present.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.spec = self.spec.with_filter(filter);
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.spec = self.spec.with_order(column, ascending);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.spec = self.spec.with_limit(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.spec = self.spec.with_offset(offset);
        self
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn fetch(self) -> RepoResult<Vec<T>> {
        debug!(
            "event=repo_query module=repo status=start op=fetch table={} tracking={:?}",
            T::table_name(),
            self.spec.tracking()
        );
        self.context.evaluate::<T>(&self.spec)
    }

    pub fn first(self) -> RepoResult<Option<T>> {
        let spec = self.spec.with_limit(1);
        debug!(
            "event=repo_query module=repo status=start op=first table={} tracking={:?}",
            T::table_name(),
            spec.tracking()
        );
        Ok(self.context.evaluate::<T>(&spec)?.into_iter().next())
    }

    /// Number of stored rows matching the filter; limit and offset are ignored.
    pub fn count(self) -> RepoResult<u64> {
        debug!(
            "event=repo_query module=repo status=start op=count table={}",
            T::table_name()
        );
        self.context.count::<T>(&self.spec)
    }
}
