//! Data-level filters and query specifications.
//!
//! # Responsibility
//! - Express predicates as (column, operator, value) triples.
//! - Render them into parameterized SQLite statements for one entity table.
//!
//! # Invariants
//! - Every referenced column must be declared by the target entity.
//! - Values are always bound as parameters, never spliced into SQL text.

use crate::entity::Entity;
use crate::error::{RepoError, RepoResult};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::Value;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// Whether query results are attached to the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracking {
    /// Rows enter the context as `Unchanged` unless already tracked.
    Tracked,
    /// Rows are returned as plain values and never reach commit.
    NoTracking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Compare(String, CompareOp, Value),
    Like(String, String),
    In(String, Vec<Value>),
    IsNull(String),
    IsNotNull(String),
}

/// Conjunction of column conditions.
///
/// ```ignore
/// let pending = Filter::new().eq("count", 0).like("customer", "ACME%");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.compare(column, CompareOp::Eq, value.into())
    }

    pub fn not_eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.compare(column, CompareOp::NotEq, value.into())
    }

    pub fn gt(self, column: &str, value: impl Into<Value>) -> Self {
        self.compare(column, CompareOp::Gt, value.into())
    }

    pub fn gte(self, column: &str, value: impl Into<Value>) -> Self {
        self.compare(column, CompareOp::Gte, value.into())
    }

    pub fn lt(self, column: &str, value: impl Into<Value>) -> Self {
        self.compare(column, CompareOp::Lt, value.into())
    }

    pub fn lte(self, column: &str, value: impl Into<Value>) -> Self {
        self.compare(column, CompareOp::Lte, value.into())
    }

    pub fn like(mut self, column: &str, pattern: &str) -> Self {
        self.conditions.push(Condition::Like(column.to_string(), pattern.to_string()));
        self
    }

    pub fn is_in<V: Into<Value>>(
        mut self,
        column: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.conditions.push(Condition::In(
            column.to_string(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn is_null(mut self, column: &str) -> Self {
        self.conditions.push(Condition::IsNull(column.to_string()));
        self
    }

    pub fn is_not_null(mut self, column: &str) -> Self {
        self.conditions.push(Condition::IsNotNull(column.to_string()));
        self
    }

    /// Appends every condition of `other`.
    pub fn and(mut self, other: Filter) -> Self {
        self.conditions.extend(other.conditions);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    fn compare(mut self, column: &str, op: CompareOp, value: Value) -> Self {
        self.conditions.push(Condition::Compare(column.to_string(), op, value));
        self
    }

    fn append_where<T: Entity>(&self, sql: &mut String, params: &mut Vec<Value>) -> RepoResult<()> {
        if self.conditions.is_empty() {
            return Ok(());
        }
        sql.push_str(" WHERE ");
        let mut clauses = Vec::with_capacity(self.conditions.len());
        for cond in &self.conditions {
            let clause = match cond {
                Condition::Compare(col, op, value) => {
                    params.push(value.clone());
                    format!("{} {} ?{}", column::<T>(col)?, op.as_sql(), params.len())
                }
                Condition::Like(col, pattern) => {
                    params.push(Value::Text(pattern.clone()));
                    format!("{} LIKE ?{}", column::<T>(col)?, params.len())
                }
                Condition::In(col, values) if values.is_empty() => {
                    column::<T>(col)?;
                    "0 = 1".to_string()
                }
                Condition::In(col, values) => {
                    let col = column::<T>(col)?;
                    let placeholders: Vec<_> = values
                        .iter()
                        .map(|value| {
                            params.push(value.clone());
                            format!("?{}", params.len())
                        })
                        .collect();
                    format!("{col} IN ({})", placeholders.join(", "))
                }
                Condition::IsNull(col) => format!("{} IS NULL", column::<T>(col)?),
                Condition::IsNotNull(col) => format!("{} IS NOT NULL", column::<T>(col)?),
            };
            clauses.push(clause);
        }
        sql.push_str(&clauses.join(" AND "));
        Ok(())
    }
}

/// Everything needed to evaluate one query against one entity table.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    filter: Filter,
    order: Vec<(String, bool)>,
    limit: Option<u64>,
    offset: Option<u64>,
    tracking: Tracking,
}

impl QuerySpec {
    pub fn new(tracking: Tracking) -> Self {
        Self {
            filter: Filter::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            tracking,
        }
    }

    pub fn tracking(&self) -> Tracking {
        self.tracking
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = std::mem::take(&mut self.filter).and(filter);
        self
    }

    pub fn with_order(mut self, column: &str, ascending: bool) -> Self {
        self.order.push((column.to_string(), ascending));
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Renders `SELECT <columns> FROM <table> ...` for `T`.
    ///
    /// Without an explicit order the key columns ascending are used, so
    /// pagination stays stable.
    pub fn build_select<T: Entity>(&self) -> RepoResult<(String, Vec<Value>)> {
        let columns = T::columns()
            .iter()
            .map(|col| column::<T>(col))
            .collect::<RepoResult<Vec<_>>>()?;
        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), quote(T::table_name()));
        let mut params = Vec::new();
        self.filter.append_where::<T>(&mut sql, &mut params)?;

        let order = if self.order.is_empty() {
            T::key_columns()
                .iter()
                .map(|col| Ok(format!("{} ASC", column::<T>(col)?)))
                .collect::<RepoResult<Vec<_>>>()?
        } else {
            self.order
                .iter()
                .map(|(col, asc)| {
                    let direction = if *asc { "ASC" } else { "DESC" };
                    Ok(format!("{} {direction}", column::<T>(col)?))
                })
                .collect::<RepoResult<Vec<_>>>()?
        };
        if !order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }

        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            // SQLite needs a LIMIT clause before OFFSET.
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }
        Ok((sql, params))
    }

    /// Renders `SELECT COUNT(*)` over the filtered table, ignoring paging.
    pub fn build_count<T: Entity>(&self) -> RepoResult<(String, Vec<Value>)> {
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote(T::table_name()));
        let mut params = Vec::new();
        self.filter.append_where::<T>(&mut sql, &mut params)?;
        Ok((sql, params))
    }
}

/// Validates `name` against `T`'s declared columns and quotes it.
fn column<T: Entity>(name: &str) -> RepoResult<String> {
    if !IDENTIFIER_RE.is_match(name) {
        return Err(RepoError::InvalidFilter(format!(
            "`{name}` is not a valid column identifier"
        )));
    }
    if !T::columns().contains(&name) {
        return Err(RepoError::InvalidFilter(format!(
            "`{name}` is not a column of {}",
            T::table_name()
        )));
    }
    Ok(quote(name))
}

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
