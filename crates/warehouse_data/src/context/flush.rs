//! Flush planning and transactional execution.
//!
//! # Responsibility
//! - Turn staged tracker entries into parameterized DML statements.
//! - Execute a plan inside one SQLite transaction.
//!
//! # Invariants
//! - Statement order is deletes, inserts, updates; each group in staging order.
//! - A failed or cancelled plan leaves the database untouched.
//! - Tracker state is never touched here; callers apply `Tracker::accept`.

use super::tracker::Tracker;
use super::EntityState;
use crate::entity::EntityKey;
use crate::error::{CommitFailure, RepoError};
use crate::query::quote;
use rusqlite::ffi::ErrorCode;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Delete,
    Insert,
    Update,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Insert => "insert",
            Self::Update => "update",
        }
    }
}

#[derive(Debug, Clone)]
struct Statement {
    operation: Operation,
    table: &'static str,
    key: EntityKey,
    sql: String,
    params: Vec<Value>,
}

/// Owned description of one unit of work, detached from the tracker so it can
/// move onto a blocking thread.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlushPlan {
    statements: Vec<Statement>,
}

impl FlushPlan {
    /// Builds the plan for every staged slot, refusing duplicate inserts.
    pub(crate) fn build(tracker: &Tracker) -> Result<(Self, Vec<usize>), RepoError> {
        if let Some(duplicate) = tracker.first_duplicate() {
            return Err(RepoError::DuplicateKey {
                table: duplicate.table,
                key: duplicate.key.clone(),
            });
        }

        let staged = tracker.staged();
        let mut deletes = Vec::new();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for slot in &staged {
            let Some(entry) = tracker.get(*slot) else {
                continue;
            };
            let where_clause = entry
                .key_columns
                .iter()
                .enumerate()
                .map(|(idx, col)| format!("{} = ?{}", quote(col), idx + 1))
                .collect::<Vec<_>>()
                .join(" AND ");
            match entry.state {
                EntityState::Deleted => deletes.push(Statement {
                    operation: Operation::Delete,
                    table: entry.table,
                    key: entry.key.clone(),
                    sql: format!("DELETE FROM {} WHERE {where_clause}", quote(entry.table)),
                    params: entry.key.to_values(),
                }),
                EntityState::Added => {
                    let columns: Vec<_> = entry.columns.iter().map(|col| quote(col)).collect();
                    let placeholders: Vec<_> =
                        (1..=columns.len()).map(|idx| format!("?{idx}")).collect();
                    inserts.push(Statement {
                        operation: Operation::Insert,
                        table: entry.table,
                        key: entry.key.clone(),
                        sql: format!(
                            "INSERT INTO {} ({}) VALUES ({})",
                            quote(entry.table),
                            columns.join(", "),
                            placeholders.join(", ")
                        ),
                        params: entry.values.clone(),
                    });
                }
                EntityState::Modified => {
                    let key_len = entry.key_columns.len();
                    let assignments: Vec<_> = entry
                        .columns
                        .iter()
                        .enumerate()
                        .map(|(idx, col)| format!("{} = ?{}", quote(col), key_len + idx + 1))
                        .collect();
                    let mut params = entry.key.to_values();
                    params.extend(entry.values.iter().cloned());
                    updates.push(Statement {
                        operation: Operation::Update,
                        table: entry.table,
                        key: entry.key.clone(),
                        sql: format!(
                            "UPDATE {} SET {} WHERE {where_clause}",
                            quote(entry.table),
                            assignments.join(", ")
                        ),
                        params,
                    });
                }
                EntityState::Unchanged | EntityState::Detached => {}
            }
        }

        let mut statements = deletes;
        statements.extend(inserts);
        statements.extend(updates);
        Ok((Self { statements }, staged))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.statements.len()
    }

    /// Runs the plan in one transaction and returns the affected row count.
    ///
    /// With a gate, the final `COMMIT` only happens if the gate is still open,
    /// and runs while holding it.
    pub(crate) fn execute(
        &self,
        conn: &mut Connection,
        gate: Option<&FlushGate>,
    ) -> Result<usize, FlushError> {
        let tx = conn.transaction().map_err(FlushError::storage)?;
        let mut affected = 0;
        for statement in &self.statements {
            let changed = tx
                .execute(&statement.sql, params_from_iter(statement.params.iter()))
                .map_err(|err| FlushError::from_statement(statement, err))?;
            if statement.operation != Operation::Insert && changed != 1 {
                return Err(FlushError::Failed(CommitFailure::RowCount {
                    operation: statement.operation.as_str(),
                    table: statement.table,
                    key: statement.key.clone(),
                    actual: changed,
                }));
            }
            affected += changed;
        }

        match gate {
            None => {
                tx.commit().map_err(FlushError::storage)?;
            }
            Some(gate) => {
                let mut phase = gate.lock();
                if *phase == GatePhase::Cancelled {
                    // Dropping `tx` rolls back.
                    return Err(FlushError::Failed(CommitFailure::Cancelled));
                }
                tx.commit().map_err(FlushError::storage)?;
                *phase = GatePhase::Committed(affected);
            }
        }
        Ok(affected)
    }
}

/// Failure while executing a plan, before conversion to `RepoError`.
#[derive(Debug)]
pub(crate) enum FlushError {
    Duplicate {
        table: &'static str,
        key: EntityKey,
    },
    Failed(CommitFailure),
}

impl FlushError {
    fn storage(err: rusqlite::Error) -> Self {
        Self::Failed(CommitFailure::Storage(err))
    }

    fn from_statement(statement: &Statement, err: rusqlite::Error) -> Self {
        let is_key_clash = matches!(
            &err,
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == ErrorCode::ConstraintViolation
                    && matches!(
                        code.extended_code,
                        rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                            | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    )
        );
        if is_key_clash && statement.operation == Operation::Insert {
            return Self::Duplicate {
                table: statement.table,
                key: statement.key.clone(),
            };
        }
        Self::storage(err)
    }
}

impl From<FlushError> for RepoError {
    fn from(value: FlushError) -> Self {
        match value {
            FlushError::Duplicate { table, key } => RepoError::DuplicateKey { table, key },
            FlushError::Failed(source) => RepoError::CommitFailed { source },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GatePhase {
    Open,
    Cancelled,
    Committed(usize),
}

/// Decides, under one lock, whether an async flush commits or rolls back.
///
/// The awaiting side closes the gate when its future is dropped; the blocking
/// side only commits while the gate is open.
#[derive(Debug)]
pub(crate) struct FlushGate {
    phase: Mutex<GatePhase>,
}

impl Default for FlushGate {
    fn default() -> Self {
        Self {
            phase: Mutex::new(GatePhase::Open),
        }
    }
}

impl FlushGate {
    pub(crate) fn lock(&self) -> MutexGuard<'_, GatePhase> {
        self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Closes an open gate and reports the phase observed before closing.
    pub(crate) fn close(&self) -> GatePhase {
        let mut phase = self.lock();
        let observed = *phase;
        if observed == GatePhase::Open {
            *phase = GatePhase::Cancelled;
        }
        observed
    }
}
