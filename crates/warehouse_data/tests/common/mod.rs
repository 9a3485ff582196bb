#![allow(dead_code)]

use rusqlite::types::Value;
use rusqlite::{Connection, Row};
use warehouse_data::{DbConfig, Entity, EntityKey, Migration, Repository, SqliteContext};

pub const MIGRATIONS: &[Migration] = &[
    Migration::new(
        1,
        "CREATE TABLE orders (
            id TEXT PRIMARY KEY NOT NULL,
            customer TEXT NOT NULL,
            count INTEGER NOT NULL
        );",
    ),
    Migration::new(
        2,
        "CREATE TABLE deal_lines (
            deal TEXT NOT NULL,
            line_no INTEGER NOT NULL,
            sku TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            PRIMARY KEY (deal, line_no)
        );",
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub id: String,
    pub customer: String,
    pub count: i64,
}

impl Order {
    pub fn new(id: &str, customer: &str, count: i64) -> Self {
        Self {
            id: id.to_string(),
            customer: customer.to_string(),
            count,
        }
    }
}

impl Entity for Order {
    fn table_name() -> &'static str {
        "orders"
    }

    fn key_columns() -> &'static [&'static str] {
        &["id"]
    }

    fn columns() -> &'static [&'static str] {
        &["id", "customer", "count"]
    }

    fn key(&self) -> EntityKey {
        EntityKey::from(self.id.as_str())
    }

    fn to_row(&self) -> Vec<Value> {
        vec![
            self.id.clone().into(),
            self.customer.clone().into(),
            self.count.into(),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            customer: row.get("customer")?,
            count: row.get("count")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealLine {
    pub deal: String,
    pub line_no: i64,
    pub sku: String,
    pub quantity: i64,
}

impl DealLine {
    pub fn new(deal: &str, line_no: i64, sku: &str, quantity: i64) -> Self {
        Self {
            deal: deal.to_string(),
            line_no,
            sku: sku.to_string(),
            quantity,
        }
    }
}

impl Entity for DealLine {
    fn table_name() -> &'static str {
        "deal_lines"
    }

    fn key_columns() -> &'static [&'static str] {
        &["deal", "line_no"]
    }

    fn columns() -> &'static [&'static str] {
        &["deal", "line_no", "sku", "quantity"]
    }

    fn key(&self) -> EntityKey {
        EntityKey::from((self.deal.as_str(), self.line_no))
    }

    fn to_row(&self) -> Vec<Value> {
        vec![
            self.deal.clone().into(),
            self.line_no.into(),
            self.sku.clone().into(),
            self.quantity.into(),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            deal: row.get("deal")?,
            line_no: row.get("line_no")?,
            sku: row.get("sku")?,
            quantity: row.get("quantity")?,
        })
    }
}

pub fn memory_repo() -> Repository {
    let context = SqliteContext::open_in_memory(&DbConfig::default(), MIGRATIONS).unwrap();
    Repository::new(context)
}

/// Repository over a table already holding `orders`, written behind the
/// context's back so nothing is tracked yet.
pub fn seeded_repo(orders: &[Order]) -> Repository {
    let repo = memory_repo();
    repo.context()
        .with_connection(|conn: &Connection| {
            for order in orders {
                conn.execute(
                    "INSERT INTO orders (id, customer, count) VALUES (?1, ?2, ?3)",
                    rusqlite::params![order.id, order.customer, order.count],
                )?;
            }
            Ok(())
        })
        .unwrap();
    repo
}

pub fn stored_order_count(repo: &Repository) -> i64 {
    repo.context()
        .with_connection(|conn: &Connection| {
            conn.query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
        })
        .unwrap()
}

pub fn stored_order(repo: &Repository, id: &str) -> Option<Order> {
    repo.context()
        .with_connection(|conn: &Connection| {
            let mut stmt = conn.prepare("SELECT id, customer, count FROM orders WHERE id = ?1")?;
            let mut rows = stmt.query([id])?;
            let found = rows.next()?.map(Order::from_row).transpose();
            found
        })
        .unwrap()
}
