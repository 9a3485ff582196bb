//! Entity contract and identity keys.
//!
//! # Responsibility
//! - Describe how a caller-defined record maps onto one SQLite table.
//! - Provide a hashable primary-key value used as tracking identity.
//!
//! # Invariants
//! - `Entity::columns()` contains every `Entity::key_columns()` entry.
//! - `Entity::to_row()` yields one value per `Entity::columns()` entry, in order.
//! - `Entity::key()` has exactly `Entity::key_columns().len()` parts.

use rusqlite::types::{ToSqlOutput, Value};
use rusqlite::{Row, ToSql};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// A caller-defined record persisted as one row of `table_name()`.
///
/// The context never looks past the key and the encoded row, so any record
/// shape works as long as the encoding is stable.
///
/// ```ignore
/// impl Entity for Order {
///     fn table_name() -> &'static str { "orders" }
///     fn key_columns() -> &'static [&'static str] { &["id"] }
///     fn columns() -> &'static [&'static str] { &["id", "customer", "count"] }
///     fn key(&self) -> EntityKey { EntityKey::from(self.id.as_str()) }
///     fn to_row(&self) -> Vec<Value> {
///         vec![self.id.clone().into(), self.customer.clone().into(), self.count.into()]
///     }
///     fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
///         Ok(Self { id: row.get("id")?, customer: row.get("customer")?, count: row.get("count")? })
///     }
/// }
/// ```
pub trait Entity: Clone + Send + Sync + 'static {
    fn table_name() -> &'static str;
    fn key_columns() -> &'static [&'static str];
    fn columns() -> &'static [&'static str];
    fn key(&self) -> EntityKey;
    fn to_row(&self) -> Vec<Value>;
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// One part of a primary key.
///
/// Restricted to exactly comparable SQLite storage classes so keys can be
/// hashed; floating point keys are not supported.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    Integer(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl KeyValue {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Integer(value) => Value::Integer(*value),
            Self::Text(value) => Value::Text(value.clone()),
            Self::Blob(value) => Value::Blob(value.clone()),
        }
    }
}

impl ToSql for KeyValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Self::Integer(value) => value.to_sql(),
            Self::Text(value) => value.to_sql(),
            Self::Blob(value) => value.to_sql(),
        }
    }
}

impl Display for KeyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
            Self::Blob(value) => {
                for byte in value {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for KeyValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for KeyValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

/// Uuids are stored in their hyphenated text form.
impl From<Uuid> for KeyValue {
    fn from(value: Uuid) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<u8>> for KeyValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

/// Primary key of an entity, possibly composite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey(Vec<KeyValue>);

impl EntityKey {
    /// Builds a key from its parts in `Entity::key_columns()` order.
    pub fn composite<I, V>(parts: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<KeyValue>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn to_values(&self) -> Vec<Value> {
        self.0.iter().map(KeyValue::to_value).collect()
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            parts => {
                write!(f, "(")?;
                for (idx, part) in parts.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<KeyValue> for EntityKey {
    fn from(value: KeyValue) -> Self {
        Self(vec![value])
    }
}

macro_rules! single_part_key {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for EntityKey {
                fn from(value: $ty) -> Self {
                    Self(vec![KeyValue::from(value)])
                }
            }
        )*
    };
}

single_part_key!(i64, i32, u32, &str, String, &String, Uuid, Vec<u8>);

impl<A, B> From<(A, B)> for EntityKey
where
    A: Into<KeyValue>,
    B: Into<KeyValue>,
{
    fn from((a, b): (A, B)) -> Self {
        Self(vec![a.into(), b.into()])
    }
}

impl<A, B, C> From<(A, B, C)> for EntityKey
where
    A: Into<KeyValue>,
    B: Into<KeyValue>,
    C: Into<KeyValue>,
{
    fn from((a, b, c): (A, B, C)) -> Self {
        Self(vec![a.into(), b.into(), c.into()])
    }
}
