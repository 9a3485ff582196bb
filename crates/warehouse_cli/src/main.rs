//! CLI smoke entry point.
//!
//! # Responsibility
//! - Exercise `warehouse_data` end to end against an in-memory database.
//! - Keep output deterministic apart from generated order ids.

use rusqlite::types::Value;
use rusqlite::Row;
use uuid::Uuid;
use warehouse_data::{
    core_version, default_log_level, init_logging, DbConfig, Entity, EntityKey, Filter,
    Migration, RepoError, Repository, SqliteContext,
};

const MIGRATIONS: &[Migration] = &[Migration::new(
    1,
    "CREATE TABLE customer_orders (
        id TEXT PRIMARY KEY NOT NULL,
        customer TEXT NOT NULL,
        count INTEGER NOT NULL
    );",
)];

#[derive(Debug, Clone)]
struct CustomerOrder {
    id: Uuid,
    customer: String,
    count: i64,
}

impl CustomerOrder {
    fn new(customer: &str, count: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer: customer.to_string(),
            count,
        }
    }
}

impl Entity for CustomerOrder {
    fn table_name() -> &'static str {
        "customer_orders"
    }

    fn key_columns() -> &'static [&'static str] {
        &["id"]
    }

    fn columns() -> &'static [&'static str] {
        &["id", "customer", "count"]
    }

    fn key(&self) -> EntityKey {
        EntityKey::from(self.id)
    }

    fn to_row(&self) -> Vec<Value> {
        vec![
            self.id.to_string().into(),
            self.customer.clone().into(),
            self.count.into(),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let id: String = row.get("id")?;
        let id = Uuid::parse_str(&id).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
        })?;
        Ok(Self {
            id,
            customer: row.get("customer")?,
            count: row.get("count")?,
        })
    }
}

fn main() -> Result<(), RepoError> {
    if let Ok(log_dir) = std::env::var("WAREHOUSE_LOG_DIR") {
        if let Err(err) = init_logging(default_log_level(), &log_dir) {
            eprintln!("logging disabled: {err}");
        }
    }
    println!("warehouse_data version={}", core_version());

    let context = SqliteContext::open_in_memory(&DbConfig::default(), MIGRATIONS)?;
    let mut repo = Repository::new(context);

    let orders = [
        CustomerOrder::new("acme", 3),
        CustomerOrder::new("acme", 0),
        CustomerOrder::new("zenith", 7),
    ];
    repo.add_many(&orders)?;
    println!("commit inserted={}", repo.commit()?);

    let busiest = repo
        .query_all::<CustomerOrder>()
        .order_by("count", false)
        .first()?;
    if let Some(mut busiest) = busiest {
        busiest.count += 1;
        repo.update(&busiest)?;
    }
    let cleared = repo.delete_where::<CustomerOrder>(Filter::new().eq("count", 0_i64))?;
    println!("staged deletes={cleared}");
    println!("commit affected={}", repo.commit()?);

    let acme = repo
        .query_readonly_where::<CustomerOrder>(Filter::new().eq("customer", "acme".to_string()))
        .fetch()?;
    for order in &acme {
        println!("acme order count={}", order.count);
    }
    println!(
        "stored orders={}",
        repo.query_readonly::<CustomerOrder>().count()?
    );

    repo.release();
    Ok(())
}
