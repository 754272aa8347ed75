use myhealth_core::{Context, MigrationId, StorageError};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::EngineResultExt;

const CREATE_SYSTEM_SQL: &str = r"
CREATE TABLE IF NOT EXISTS system (
  migration_id INTEGER NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE weight (
  userid INTEGER NOT NULL,
  timestamp INTEGER NOT NULL,
  value REAL NOT NULL,
  PRIMARY KEY (userid, timestamp)
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX weight_timestamp_idx ON weight(timestamp);
";

pub(crate) struct Migration {
    pub(crate) id: MigrationId,
    pub(crate) name: &'static str,
    pub(crate) sql: &'static str,
}

/// Every known migration, strictly increasing by id and without gaps.
pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        name: "create_weight",
        sql: MIGRATION_001_SQL,
    },
    Migration {
        id: 2,
        name: "index_weight_timestamp",
        sql: MIGRATION_002_SQL,
    },
];

pub const LATEST_MIGRATION_ID: MigrationId = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current: Option<MigrationId>,
    pub latest: MigrationId,
    pub pending: Vec<MigrationId>,
}

/// Highest applied migration id, or `None` when nothing has been applied yet.
pub(crate) fn last_migration_id(conn: &Connection) -> Result<Option<MigrationId>, StorageError> {
    conn.execute_batch(CREATE_SYSTEM_SQL)
        .engine_context("failed to create system table")?;
    conn.query_row("SELECT MAX(migration_id) FROM system", [], |row| {
        row.get::<_, Option<MigrationId>>(0)
    })
    .engine_context("failed to read last migration id")
}

pub(crate) fn schema_status(conn: &Connection) -> Result<SchemaStatus, StorageError> {
    let current = last_migration_id(conn)?;
    Ok(SchemaStatus {
        current,
        latest: LATEST_MIGRATION_ID,
        pending: pending(current).map(|migration| migration.id).collect(),
    })
}

/// Apply every migration newer than the recorded one, in order. Returns the applied ids.
pub(crate) fn migrate(
    conn: &mut Connection,
    ctx: &Context,
) -> Result<Vec<MigrationId>, StorageError> {
    let current = last_migration_id(conn)?;
    if let Some(found) = current {
        if found > LATEST_MIGRATION_ID {
            return Err(StorageError::UnsupportedSchema {
                found,
                latest: LATEST_MIGRATION_ID,
            });
        }
    }

    let mut applied = Vec::new();
    for migration in pending(current) {
        ctx.check()?;
        if let Err(err) = apply(conn, migration) {
            warn!(
                migration_id = migration.id,
                name = migration.name,
                error = %err,
                "migration failed"
            );
            return Err(StorageError::Migration {
                id: migration.id,
                source: Box::new(err),
            });
        }
        info!(
            migration_id = migration.id,
            name = migration.name,
            "applied schema migration"
        );
        applied.push(migration.id);
    }

    Ok(applied)
}

fn pending(current: Option<MigrationId>) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS
        .iter()
        .filter(move |migration| current.map_or(true, |last| migration.id > last))
}

fn apply(conn: &mut Connection, migration: &Migration) -> Result<(), StorageError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .engine_context("failed to start migration transaction")?;

    tx.execute_batch(migration.sql)
        .with_engine_context(|| format!("failed to apply migration {}", migration.name))?;
    tx.execute("DELETE FROM system", [])
        .engine_context("failed to clear migration id")?;
    tx.execute(
        "INSERT INTO system(migration_id) VALUES (?1)",
        params![migration.id],
    )
    .engine_context("failed to record migration id")?;

    tx.commit().engine_context("failed to commit migration")
}
