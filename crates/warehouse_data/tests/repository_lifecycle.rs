mod common;

use common::{memory_repo, seeded_repo, stored_order, stored_order_count, DealLine, Order};
use rusqlite::types::Value;
use rusqlite::Row;
use warehouse_data::{
    CommitFailure, DbError, Entity, EntityKey, EntityState, Filter, KeyValue, RepoError,
};

/// Tag whose blank name yields an empty key.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Tag {
    name: String,
}

impl Tag {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Entity for Tag {
    fn table_name() -> &'static str {
        "tags"
    }

    fn key_columns() -> &'static [&'static str] {
        &["name"]
    }

    fn columns() -> &'static [&'static str] {
        &["name"]
    }

    fn key(&self) -> EntityKey {
        EntityKey::composite((!self.name.is_empty()).then(|| self.name.clone()))
    }

    fn to_row(&self) -> Vec<Value> {
        vec![self.name.clone().into()]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get("name")?,
        })
    }
}

#[test]
fn add_commit_get_roundtrip() {
    let mut repo = memory_repo();
    let order = Order::new("A1", "acme", 3);

    repo.add(&order).unwrap();
    assert_eq!(repo.state_of(&order), EntityState::Added);
    assert_eq!(repo.commit().unwrap(), 1);

    let loaded = repo.get_by_id::<Order>("A1").unwrap();
    assert_eq!(loaded, order);
    assert_eq!(repo.state_of(&loaded), EntityState::Unchanged);
    assert_eq!(stored_order(&repo, "A1"), Some(order));
    assert!(!repo.has_changes());
}

#[test]
fn delete_after_add_detaches_without_io() {
    let mut repo = memory_repo();
    let order = Order::new("A1", "acme", 3);

    repo.add(&order).unwrap();
    repo.delete(&order).unwrap();

    assert_eq!(repo.state_of(&order), EntityState::Detached);
    assert!(!repo.has_changes());
    assert_eq!(repo.commit().unwrap(), 0);
    assert_eq!(stored_order_count(&repo), 0);
}

#[test]
fn update_on_detached_instance_issues_one_update() {
    let mut repo = seeded_repo(&[Order::new("A1", "acme", 3)]);
    let mut order = Order::new("A1", "acme", 3);
    assert_eq!(repo.state_of(&order), EntityState::Detached);

    order.count = 9;
    repo.update(&order).unwrap();
    assert_eq!(repo.state_of(&order), EntityState::Modified);
    assert_eq!(repo.commit().unwrap(), 1);

    assert_eq!(stored_order(&repo, "A1").unwrap().count, 9);
    assert_eq!(repo.state_of(&order), EntityState::Unchanged);
}

#[test]
fn readonly_results_never_reach_commit() {
    let mut repo = seeded_repo(&[Order::new("A1", "acme", 3), Order::new("A2", "zenith", 1)]);

    let mut rows = repo.query_readonly::<Order>().fetch().unwrap();
    assert_eq!(rows.len(), 2);
    rows[0].count = 100;

    assert!(repo.local::<Order>().is_empty());
    assert_eq!(repo.state_of(&rows[0]), EntityState::Detached);
    assert_eq!(repo.commit().unwrap(), 0);
    assert_eq!(stored_order(&repo, "A1").unwrap().count, 3);
}

#[test]
fn duplicate_of_unchanged_key_fails_and_stays_added() {
    let mut repo = seeded_repo(&[Order::new("A1", "acme", 3)]);
    let existing = repo.get_by_id::<Order>("A1").unwrap();
    let duplicate = Order::new("A1", "other", 1);

    repo.add(&duplicate).unwrap();
    let err = repo.commit().unwrap_err();
    match err {
        RepoError::DuplicateKey { table, key } => {
            assert_eq!(table, "orders");
            assert_eq!(key, EntityKey::from("A1"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(repo.state_of(&duplicate), EntityState::Added);
    assert_eq!(repo.state_of(&existing), EntityState::Unchanged);
    assert_eq!(stored_order(&repo, "A1").unwrap().customer, "acme");
}

#[test]
fn duplicate_of_untracked_stored_row_is_reported_by_storage() {
    let mut repo = seeded_repo(&[Order::new("A1", "acme", 3)]);
    let duplicate = Order::new("A1", "other", 1);
    let fresh = Order::new("A2", "zenith", 2);

    repo.add(&fresh).unwrap();
    repo.add(&duplicate).unwrap();
    assert!(matches!(
        repo.commit().unwrap_err(),
        RepoError::DuplicateKey { table: "orders", .. }
    ));

    assert_eq!(repo.state_of(&duplicate), EntityState::Added);
    assert_eq!(repo.state_of(&fresh), EntityState::Added);
    assert_eq!(stored_order_count(&repo), 1);
}

#[test]
fn two_adds_with_same_key_fail_until_one_is_removed() {
    let mut repo = memory_repo();
    let first = Order::new("B1", "acme", 1);
    let second = Order::new("B1", "zenith", 2);

    repo.add(&first).unwrap();
    repo.add(&second).unwrap();
    assert!(matches!(
        repo.commit().unwrap_err(),
        RepoError::DuplicateKey { .. }
    ));
    assert_eq!(stored_order_count(&repo), 0);

    repo.delete(&second).unwrap();
    assert_eq!(repo.local::<Order>().into_entities(), vec![first.clone()]);
    assert_eq!(repo.commit().unwrap(), 1);
    assert_eq!(stored_order(&repo, "B1").unwrap().customer, "acme");
}

#[test]
fn delete_where_stages_every_match() {
    let mut repo = seeded_repo(&[
        Order::new("A1", "acme", 0),
        Order::new("A2", "acme", 0),
        Order::new("A3", "zenith", 0),
        Order::new("A4", "zenith", 5),
    ]);

    let staged = repo
        .delete_where::<Order>(Filter::new().eq("count", 0_i64))
        .unwrap();
    assert_eq!(staged, 3);
    assert_eq!(repo.commit().unwrap(), 3);

    let remaining = repo
        .query_all_where::<Order>(Filter::new().eq("count", 0_i64))
        .fetch()
        .unwrap();
    assert!(remaining.is_empty());
    assert_eq!(stored_order_count(&repo), 1);
}

#[test]
fn delete_where_with_no_match_stages_nothing() {
    let mut repo = seeded_repo(&[Order::new("A1", "acme", 2)]);
    let staged = repo
        .delete_where::<Order>(Filter::new().gt("count", 10_i64))
        .unwrap();
    assert_eq!(staged, 0);
    assert_eq!(repo.commit().unwrap(), 0);
}

#[test]
fn delete_of_detached_instance_attaches_then_deletes() {
    let mut repo = seeded_repo(&[Order::new("A1", "acme", 3)]);
    let order = Order::new("A1", "acme", 3);

    repo.delete(&order).unwrap();
    assert_eq!(repo.state_of(&order), EntityState::Deleted);
    repo.delete(&order).unwrap();
    assert_eq!(repo.commit().unwrap(), 1);

    assert_eq!(repo.state_of(&order), EntityState::Detached);
    assert!(repo.local::<Order>().is_empty());
    assert_eq!(stored_order_count(&repo), 0);
}

#[test]
fn delete_by_id_looks_up_then_deletes() {
    let mut repo = seeded_repo(&[Order::new("A1", "acme", 3)]);

    repo.delete_by_id::<Order>("A1").unwrap();
    assert!(matches!(
        repo.get_by_id::<Order>("A1").unwrap_err(),
        RepoError::NotFound { table: "orders", .. }
    ));
    assert_eq!(repo.commit().unwrap(), 1);

    assert!(matches!(
        repo.delete_by_id::<Order>("A1").unwrap_err(),
        RepoError::NotFound { .. }
    ));
}

#[test]
fn get_by_id_reports_missing_rows() {
    let mut repo = memory_repo();
    match repo.get_by_id::<Order>("nope").unwrap_err() {
        RepoError::NotFound { table, key } => {
            assert_eq!(table, "orders");
            assert_eq!(key.to_string(), "nope");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn get_by_id_prefers_tracked_instance() {
    let mut repo = seeded_repo(&[Order::new("A1", "acme", 3)]);
    let mut order = repo.get_by_id::<Order>("A1").unwrap();
    order.count = 7;
    repo.update(&order).unwrap();

    assert_eq!(repo.get_by_id::<Order>("A1").unwrap().count, 7);
    let listed = repo.query_all::<Order>().fetch().unwrap();
    assert_eq!(listed, vec![order.clone()]);
    assert_eq!(repo.state_of(&order), EntityState::Modified);
}

#[test]
fn update_keeps_pending_insert_added_with_fresh_values() {
    let mut repo = memory_repo();
    let mut order = Order::new("A1", "acme", 1);
    repo.add(&order).unwrap();

    order.count = 10;
    repo.update(&order).unwrap();
    assert_eq!(repo.state_of(&order), EntityState::Added);
    assert_eq!(repo.commit().unwrap(), 1);
    assert_eq!(stored_order(&repo, "A1").unwrap().count, 10);
}

#[test]
fn update_after_delete_restages_as_modified() {
    let mut repo = seeded_repo(&[Order::new("A1", "acme", 3)]);
    let mut order = repo.get_by_id::<Order>("A1").unwrap();
    repo.delete(&order).unwrap();

    order.customer = "renamed".to_string();
    repo.update(&order).unwrap();
    assert_eq!(repo.state_of(&order), EntityState::Modified);
    assert_eq!(repo.commit().unwrap(), 1);
    assert_eq!(stored_order(&repo, "A1").unwrap().customer, "renamed");
}

#[test]
fn detach_requires_tracked_instance() {
    let mut repo = memory_repo();
    let order = Order::new("A1", "acme", 3);

    assert!(matches!(
        repo.detach(&order).unwrap_err(),
        RepoError::InvalidStateTransition { table: "orders", .. }
    ));

    repo.add(&order).unwrap();
    repo.detach(&order).unwrap();
    assert_eq!(repo.state_of(&order), EntityState::Detached);
    assert_eq!(order.customer, "acme");
    assert_eq!(repo.commit().unwrap(), 0);
}

#[test]
fn failed_commit_rolls_back_everything_and_keeps_states() {
    let mut repo = memory_repo();
    let fresh = Order::new("A2", "acme", 1);
    let ghost = Order::new("Z9", "nobody", 0);

    repo.add(&fresh).unwrap();
    repo.update(&ghost).unwrap();
    match repo.commit().unwrap_err() {
        RepoError::CommitFailed {
            source:
                CommitFailure::RowCount {
                    operation, actual, ..
                },
        } => {
            assert_eq!(operation, "update");
            assert_eq!(actual, 0);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(stored_order_count(&repo), 0);
    assert_eq!(repo.state_of(&fresh), EntityState::Added);
    assert_eq!(repo.state_of(&ghost), EntityState::Modified);

    repo.detach(&ghost).unwrap();
    assert_eq!(repo.commit().unwrap(), 1);
}

#[test]
fn batch_staging_returns_staged_counts() {
    let mut repo = memory_repo();
    let orders = vec![Order::new("A1", "acme", 1), Order::new("A2", "acme", 2)];
    assert_eq!(repo.add_many(&orders).unwrap(), 2);
    assert_eq!(repo.commit().unwrap(), 2);

    let mut loaded = repo.query_all::<Order>().fetch().unwrap();
    for order in &mut loaded {
        order.count += 1;
    }
    assert_eq!(repo.update_many(&loaded).unwrap(), 2);
    assert_eq!(repo.commit().unwrap(), 2);
    assert_eq!(stored_order(&repo, "A2").unwrap().count, 3);

    assert_eq!(repo.delete_many(&loaded).unwrap(), 2);
    assert_eq!(repo.commit().unwrap(), 2);
    assert_eq!(stored_order_count(&repo), 0);
}

#[test]
fn batch_staging_stops_at_first_rejected_element() {
    let mut repo = memory_repo();
    let tags = [Tag::new("red"), Tag::new(""), Tag::new("blue")];

    match repo.add_many(&tags).unwrap_err() {
        RepoError::InvalidKey {
            table,
            expected,
            actual,
        } => {
            assert_eq!(table, "tags");
            assert_eq!(expected, 1);
            assert_eq!(actual, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(repo.state_of(&tags[0]), EntityState::Added);
    assert_eq!(repo.state_of(&tags[2]), EntityState::Detached);
    assert_eq!(repo.local::<Tag>().into_entities(), vec![tags[0].clone()]);

    let doomed = [Tag::new("green"), Tag::new(""), Tag::new("gray")];
    assert!(matches!(
        repo.delete_many(&doomed).unwrap_err(),
        RepoError::InvalidKey { .. }
    ));
    assert_eq!(repo.state_of(&doomed[0]), EntityState::Deleted);
    assert_eq!(repo.state_of(&doomed[2]), EntityState::Detached);
}

#[test]
fn count_reads_stored_rows_and_propagates_storage_errors() {
    let mut repo = seeded_repo(&[Order::new("A1", "acme", 0), Order::new("A2", "acme", 4)]);
    assert_eq!(repo.query_readonly::<Order>().count().unwrap(), 2);
    let none = repo
        .query_readonly_where::<Order>(Filter::new().gt("count", 10_i64))
        .count()
        .unwrap();
    assert_eq!(none, 0);

    repo.release();
    assert!(matches!(
        repo.query_readonly::<Order>().count().unwrap_err(),
        RepoError::Db(DbError::ConnectionReleased)
    ));
}

#[test]
fn readding_a_tracked_instance_resolves_to_the_staged_insert() {
    let mut repo = seeded_repo(&[Order::new("A1", "acme", 3)]);
    let order = repo.get_by_id::<Order>("A1").unwrap();

    repo.add(&order).unwrap();
    assert_eq!(repo.state_of(&order), EntityState::Added);
    assert!(matches!(
        repo.commit().unwrap_err(),
        RepoError::DuplicateKey { .. }
    ));

    repo.detach(&order).unwrap();
    assert_eq!(repo.state_of(&order), EntityState::Unchanged);
    assert_eq!(repo.commit().unwrap(), 0);
}

#[test]
fn deleting_a_readded_instance_drops_only_the_staged_insert() {
    let mut repo = seeded_repo(&[Order::new("A1", "acme", 3)]);
    let order = repo.get_by_id::<Order>("A1").unwrap();

    repo.add(&order).unwrap();
    repo.delete(&order).unwrap();
    assert_eq!(repo.state_of(&order), EntityState::Unchanged);
    assert!(!repo.has_changes());

    assert_eq!(repo.commit().unwrap(), 0);
    assert_eq!(stored_order(&repo, "A1"), Some(order.clone()));
    assert_eq!(repo.state_of(&order), EntityState::Unchanged);
}

#[test]
fn composite_keys_round_trip() {
    let mut repo = memory_repo();
    let lines = vec![
        DealLine::new("D1", 1, "sku-a", 4),
        DealLine::new("D1", 2, "sku-b", 1),
    ];
    repo.add_many(&lines).unwrap();
    repo.add(&Order::new("A1", "acme", 2)).unwrap();
    assert_eq!(repo.commit().unwrap(), 3);

    let second = repo
        .get_by_composite_key::<DealLine, _, _>([KeyValue::from("D1"), KeyValue::from(2_i64)])
        .unwrap();
    assert_eq!(second, lines[1]);
    let first = repo.get_by_id::<DealLine>(("D1", 1_i64)).unwrap();
    assert_eq!(first.sku, "sku-a");

    match repo.get_by_id::<DealLine>("D1").unwrap_err() {
        RepoError::InvalidKey {
            table,
            expected,
            actual,
        } => {
            assert_eq!(table, "deal_lines");
            assert_eq!(expected, 2);
            assert_eq!(actual, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn queries_filter_order_and_page() {
    let mut repo = seeded_repo(&[
        Order::new("A1", "acme", 5),
        Order::new("A2", "zenith", 1),
        Order::new("A3", "acme", 9),
        Order::new("A4", "acme", 0),
    ]);

    let acme = repo
        .query_readonly_where::<Order>(Filter::new().eq("customer", "acme".to_string()))
        .order_by("count", false)
        .fetch()
        .unwrap();
    let ids: Vec<_> = acme.iter().map(|order| order.id.as_str()).collect();
    assert_eq!(ids, vec!["A3", "A1", "A4"]);

    let paged = repo
        .query_readonly::<Order>()
        .limit(2)
        .offset(1)
        .fetch()
        .unwrap();
    let ids: Vec<_> = paged.iter().map(|order| order.id.as_str()).collect();
    assert_eq!(ids, vec!["A2", "A3"]);

    let busy = repo
        .query_all::<Order>()
        .filter(Filter::new().gte("count", 1_i64))
        .filter(Filter::new().like("customer", "ac%"))
        .count()
        .unwrap();
    assert_eq!(busy, 2);

    let top = repo
        .query_all::<Order>()
        .order_by("count", false)
        .first()
        .unwrap()
        .unwrap();
    assert_eq!(top.id, "A3");
    assert_eq!(repo.state_of(&top), EntityState::Unchanged);
    assert_eq!(repo.local::<Order>().len(), 1);

    assert!(matches!(
        repo.query_all::<Order>()
            .filter(Filter::new().eq("price", 1_i64))
            .fetch()
            .unwrap_err(),
        RepoError::InvalidFilter(_)
    ));
}

#[test]
fn local_view_reports_states_in_staging_order() {
    let mut repo = seeded_repo(&[Order::new("A1", "acme", 3), Order::new("A2", "acme", 4)]);
    let first = repo.get_by_id::<Order>("A1").unwrap();
    let second = repo.get_by_id::<Order>("A2").unwrap();
    repo.delete(&second).unwrap();
    repo.add(&Order::new("A3", "zenith", 1)).unwrap();

    let local = repo.local::<Order>();
    let states: Vec<_> = local.iter().map(|(order, state)| (order.id.clone(), state)).collect();
    assert_eq!(
        states,
        vec![
            ("A1".to_string(), EntityState::Unchanged),
            ("A2".to_string(), EntityState::Deleted),
            ("A3".to_string(), EntityState::Added),
        ]
    );
    assert_eq!(local.in_state(EntityState::Deleted).count(), 1);
    assert!(local.in_state(EntityState::Modified).next().is_none());
    assert_eq!(repo.state_of(&first), EntityState::Unchanged);

    assert_eq!(repo.commit().unwrap(), 2);
    assert_eq!(repo.local::<Order>().len(), 2);
}

#[test]
fn release_is_idempotent_and_blocks_storage_access() {
    let mut repo = memory_repo();
    let order = Order::new("A1", "acme", 3);
    repo.add(&order).unwrap();

    repo.release();
    repo.release();
    assert!(repo.is_released());

    match repo.commit().unwrap_err() {
        RepoError::CommitFailed {
            source: CommitFailure::Db(DbError::ConnectionReleased),
        } => {}
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(repo.state_of(&order), EntityState::Added);

    assert!(matches!(
        repo.query_readonly::<Order>().fetch().unwrap_err(),
        RepoError::Db(DbError::ConnectionReleased)
    ));
}
