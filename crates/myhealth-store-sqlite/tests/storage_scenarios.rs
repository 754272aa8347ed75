use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{anyhow, Result};
use myhealth_core::{Backup, Context, StorageError, Weight, WeightBackup};
use myhealth_store_sqlite::{SqliteStore, StoreOptions, LATEST_MIGRATION_ID};
use proptest::prelude::*;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open_store() -> Result<(TempDir, SqliteStore)> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("testdb.sqlite3");
    let store = SqliteStore::open(&path, StoreOptions::default())?;
    Ok((dir, store))
}

fn expect_empty(result: Result<Vec<Weight>, StorageError>) {
    match result {
        Err(err) => assert!(err.is_empty_result(), "expected empty result, got {err}"),
        Ok(list) => panic!("expected empty result, got {list:?}"),
    }
}

fn record(user_id: i64, timestamp: i64, value: f64) -> WeightBackup {
    WeightBackup::new(user_id, Weight::new(timestamp, value))
}

fn joined<T>(handle: thread::ScopedJoinHandle<'_, Result<T, StorageError>>) -> Result<T> {
    match handle.join() {
        Ok(result) => Ok(result?),
        Err(_) => Err(anyhow!("worker thread panicked")),
    }
}

#[test]
fn fresh_store_reports_latest_migration() -> Result<()> {
    let (_dir, store) = open_store()?;
    let recorded = store.last_migration_id(&Context::new())?;
    assert_eq!(recorded, Some(LATEST_MIGRATION_ID));
    assert_eq!(LATEST_MIGRATION_ID, 2);
    store.close()?;
    Ok(())
}

#[test]
fn weight_crud_scenario() -> Result<()> {
    let (_dir, store) = open_store()?;
    let ctx = Context::new();

    expect_empty(store.get_weight_list(&ctx, 1, 1000, 2000));

    store.set_weight(&ctx, 1, &Weight::new(1000, 94.3))?;
    store.set_weight(&ctx, 1, &Weight::new(2000, 94.0))?;
    store.set_weight(&ctx, 1, &Weight::new(3000, 96.0))?;
    store.set_weight(&ctx, 2, &Weight::new(1000, 87.0))?;

    assert_eq!(
        store.get_weight_list(&ctx, 1, 1000, 4000)?,
        vec![
            Weight::new(1000, 94.3),
            Weight::new(2000, 94.0),
            Weight::new(3000, 96.0),
        ]
    );
    assert_eq!(
        store.get_weight_list(&ctx, 2, 1000, 4000)?,
        vec![Weight::new(1000, 87.0)]
    );

    store.set_weight(&ctx, 1, &Weight::new(1000, 104.3))?;
    assert_eq!(
        store.get_weight_list(&ctx, 1, 1000, 1000)?,
        vec![Weight::new(1000, 104.3)]
    );

    store.delete_weight(&ctx, 2, 1000)?;
    expect_empty(store.get_weight_list(&ctx, 2, 1000, 4000));

    // Deleting again is not an error.
    store.delete_weight(&ctx, 2, 1000)?;
    store.close()?;
    Ok(())
}

#[test]
fn backup_restore_scenario() -> Result<()> {
    let (_dir, store) = open_store()?;
    let ctx = Context::new();
    store.set_weight(&ctx, 3, &Weight::new(5000, 65.0))?;

    let backup = Backup::new(
        1000,
        vec![
            record(1, 1000, 90.1),
            record(1, 2000, 92.1),
            record(2, 1000, 87.8),
        ],
    );

    store.restore(&ctx, &backup)?;

    assert_eq!(
        store.get_weight_list(&ctx, 1, 1000, 3000)?,
        vec![Weight::new(1000, 90.1), Weight::new(2000, 92.1)]
    );
    assert_eq!(
        store.get_weight_list(&ctx, 2, 1000, 3000)?,
        vec![Weight::new(1000, 87.8)]
    );
    expect_empty(store.get_weight_list(&ctx, 3, 0, 10_000));

    let second = store.backup(&ctx)?;
    assert_eq!(second.weight, backup.weight);
    assert_eq!(store.backup(&ctx)?.weight, second.weight);
    store.close()?;
    Ok(())
}

#[test]
fn snapshot_survives_json_transport() -> Result<()> {
    let (_dir, source) = open_store()?;
    let ctx = Context::new();
    source.set_weight(&ctx, 1, &Weight::new(1000, 0.1 + 0.2))?;
    source.set_weight(&ctx, 4, &Weight::new(-50, 123.456_789))?;

    let payload = source.backup(&ctx)?.to_json()?;

    let (_target_dir, target) = open_store()?;
    target.restore(&ctx, &Backup::from_json(&payload)?)?;
    assert_eq!(target.backup(&ctx)?.weight, source.backup(&ctx)?.weight);
    Ok(())
}

#[test]
fn store_opens_against_partially_migrated_file() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("legacy.sqlite3");
    seed_schema_at_migration_one(&path)?;

    let store = SqliteStore::open(&path, StoreOptions::default())?;
    let ctx = Context::new();
    assert_eq!(store.last_migration_id(&ctx)?, Some(LATEST_MIGRATION_ID));
    assert_eq!(
        store.get_weight_list(&ctx, 1, 0, 10)?,
        vec![Weight::new(5, 77.7)]
    );
    Ok(())
}

#[test]
fn store_refuses_newer_schema() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("future.sqlite3");
    SqliteStore::open(&path, StoreOptions::default())?.close()?;
    run_sql(
        &path,
        &format!(
            "DELETE FROM system; INSERT INTO system(migration_id) VALUES ({});",
            LATEST_MIGRATION_ID + 1
        ),
    )?;

    match SqliteStore::open(&path, StoreOptions::default()) {
        Err(StorageError::UnsupportedSchema { found, latest }) => {
            assert_eq!(found, LATEST_MIGRATION_ID + 1);
            assert_eq!(latest, LATEST_MIGRATION_ID);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("store opened a database from a newer schema"),
    }
    Ok(())
}

fn seed_schema_at_migration_one(path: &Path) -> Result<()> {
    let store = SqliteStore::open(path, StoreOptions::default())?;
    store.set_weight(&Context::new(), 1, &Weight::new(5, 77.7))?;
    store.close()?;
    // Roll the schema back to what migration 1 alone produces.
    run_sql(
        path,
        "DROP INDEX weight_timestamp_idx;
         DELETE FROM system;
         INSERT INTO system(migration_id) VALUES (1);",
    )
}

fn run_sql(path: &Path, sql: &str) -> Result<()> {
    let conn = rusqlite::Connection::open(path)?;
    conn.execute_batch(sql)?;
    Ok(())
}

#[test]
fn migrating_twice_is_a_no_op() -> Result<()> {
    let (_dir, store) = open_store()?;
    let ctx = Context::new();
    let before = store.last_migration_id(&ctx)?;
    assert!(store.migrate(&ctx)?.is_empty());
    assert!(store.migrate(&ctx)?.is_empty());
    assert_eq!(store.last_migration_id(&ctx)?, before);
    Ok(())
}

#[test]
fn racing_set_and_delete_leave_one_whole_outcome() -> Result<()> {
    let (_dir, store) = open_store()?;
    let rounds: i32 = 200;
    let written = |weight: &Weight| {
        weight.timestamp == 1000
            && weight.value.fract() == 0.0
            && (0.0..f64::from(rounds)).contains(&weight.value)
    };

    thread::scope(|scope| -> Result<()> {
        let writer = scope.spawn(|| -> Result<(), StorageError> {
            let ctx = Context::new();
            for round in 0..rounds {
                store.set_weight(&ctx, 1, &Weight::new(1000, f64::from(round)))?;
            }
            Ok(())
        });
        let deleter = scope.spawn(|| -> Result<(), StorageError> {
            let ctx = Context::new();
            for _ in 0..rounds {
                store.delete_weight(&ctx, 1, 1000)?;
            }
            Ok(())
        });
        let reader = scope.spawn(|| -> Result<(), StorageError> {
            let ctx = Context::new();
            for _ in 0..rounds {
                match store.get_weight_list(&ctx, 1, 0, 2000) {
                    Ok(list) => assert!(
                        list.len() == 1 && written(&list[0]),
                        "reader saw {list:?}"
                    ),
                    Err(err) if err.is_empty_result() => {}
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        });

        joined(writer)?;
        joined(deleter)?;
        joined(reader)?;
        Ok(())
    })?;

    match store.get_weight_list(&Context::new(), 1, 0, 2000) {
        Ok(list) => assert!(list.len() == 1 && written(&list[0]), "final {list:?}"),
        Err(err) => assert!(err.is_empty_result(), "unexpected error: {err}"),
    }
    assert!(store.backup(&Context::new())?.weight.len() <= 1);
    Ok(())
}

fn dataset(timestamps: Range<i64>, value: f64) -> Backup {
    let rows = timestamps
        .clone()
        .map(|timestamp| record(1, timestamp, value))
        .collect();
    Backup::new(timestamps.start, rows)
}

#[test]
fn readers_never_see_a_half_restored_dataset() -> Result<()> {
    let (_dir, store) = open_store()?;
    let old = dataset(0..60, 1.0);
    let new = dataset(30..100, 2.0);
    store.restore(&Context::new(), &old)?;

    let old_list: Vec<Weight> = old.weight.iter().map(WeightBackup::weight).collect();
    let new_list: Vec<Weight> = new.weight.iter().map(WeightBackup::weight).collect();
    let done = AtomicBool::new(false);

    let (store, done) = (&store, &done);
    let (old, new) = (&old, &new);
    let (old_list, new_list) = (&old_list, &new_list);
    thread::scope(|scope| -> Result<()> {
        let restorer = scope.spawn(move || {
            let ctx = Context::new();
            let outcome = (0..40).try_for_each(|round| {
                let target = if round % 2 == 0 { &new } else { &old };
                store.restore(&ctx, target)
            });
            done.store(true, Ordering::SeqCst);
            outcome
        });

        let readers: Vec<_> = (0..3)
            .map(|_| {
                scope.spawn(move || -> Result<(), StorageError> {
                    let ctx = Context::new();
                    while !done.load(Ordering::SeqCst) {
                        let taken = store.backup(&ctx)?;
                        assert!(
                            taken.weight == old.weight || taken.weight == new.weight,
                            "backup saw a mixed dataset of {} rows",
                            taken.weight.len()
                        );
                        let list = store.get_weight_list(&ctx, 1, 0, 200)?;
                        assert!(
                            list == *old_list || list == *new_list,
                            "range query saw a mixed dataset of {} rows",
                            list.len()
                        );
                    }
                    Ok(())
                })
            })
            .collect();

        joined(restorer)?;
        for reader in readers {
            joined(reader)?;
        }
        Ok(())
    })?;

    assert_eq!(store.backup(&Context::new())?.weight, old.weight);
    Ok(())
}

fn snapshot_strategy() -> impl Strategy<Value = BTreeMap<(i64, i64), f64>> {
    prop::collection::btree_map(
        (1_i64..5, -10_000_i64..10_000),
        -1.0e6_f64..1.0e6,
        0..40,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn restore_then_backup_returns_the_snapshot(records in snapshot_strategy()) {
        let (_dir, store) = open_store().map_err(|err| TestCaseError::fail(err.to_string()))?;
        let ctx = Context::new();
        let snapshot = Backup::new(
            1,
            records
                .iter()
                .map(|(&(user_id, timestamp), &value)| record(user_id, timestamp, value))
                .collect(),
        );

        store.restore(&ctx, &snapshot).map_err(|err| TestCaseError::fail(err.to_string()))?;
        let taken = store.backup(&ctx).map_err(|err| TestCaseError::fail(err.to_string()))?;
        prop_assert_eq!(taken.weight, snapshot.weight);
    }

    #[test]
    fn range_queries_filter_and_sort(
        records in snapshot_strategy(),
        user_id in 1_i64..5,
        from in -12_000_i64..12_000,
        span in 0_i64..12_000,
    ) {
        let (_dir, store) = open_store().map_err(|err| TestCaseError::fail(err.to_string()))?;
        let ctx = Context::new();
        for (&(owner, timestamp), &value) in &records {
            store
                .set_weight(&ctx, owner, &Weight::new(timestamp, value))
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
        }

        let to = from + span;
        let expected: Vec<Weight> = records
            .iter()
            .filter(|((owner, timestamp), _)| *owner == user_id && (from..=to).contains(timestamp))
            .map(|(&(_, timestamp), &value)| Weight::new(timestamp, value))
            .collect();

        match store.get_weight_list(&ctx, user_id, from, to) {
            Ok(list) => {
                prop_assert_eq!(list, expected);
            }
            Err(err) => {
                prop_assert!(err.is_empty_result(), "unexpected error: {}", err);
                prop_assert!(expected.is_empty());
            }
        }
    }
}
