use myhealth_core::{Backup, Context, StorageError, Timestamp, WeightBackup};
use rusqlite::{params, Connection, TransactionBehavior};

use crate::engine::EngineResultExt;

const SELECT_ALL_WEIGHT_SQL: &str = r"
SELECT userid, timestamp, value
FROM weight
ORDER BY userid ASC, timestamp ASC
";

const INSERT_WEIGHT_SQL: &str =
    "INSERT INTO weight(userid, timestamp, value) VALUES (?1, ?2, ?3)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RestoreSummary {
    pub(crate) removed: usize,
    pub(crate) inserted: usize,
}

/// Read every weight row, ordered by `(userid, timestamp)` so repeated snapshots of the same
/// data are identical.
pub(crate) fn backup(
    conn: &Connection,
    ctx: &Context,
    created_at: Timestamp,
) -> Result<Backup, StorageError> {
    let mut stmt = conn
        .prepare(SELECT_ALL_WEIGHT_SQL)
        .engine_context("failed to prepare weight dump")?;
    let mut rows = stmt
        .query([])
        .engine_context("failed to query weight dump")?;

    let mut weight = Vec::new();
    while let Some(row) = rows.next().engine_context("failed to read weight row")? {
        ctx.check()?;
        weight.push(WeightBackup {
            user_id: row.get(0).engine_context("failed to decode user id")?,
            timestamp: row.get(1).engine_context("failed to decode timestamp")?,
            value: row.get(2).engine_context("failed to decode weight value")?,
        });
    }

    Ok(Backup::new(created_at, weight))
}

/// Replace the whole weight table with the snapshot inside one IMMEDIATE transaction.
///
/// Any error, including a cancelled context between rows or a duplicate key inside the
/// snapshot, drops the transaction and rolls back to the previous contents.
pub(crate) fn restore(
    conn: &mut Connection,
    ctx: &Context,
    backup: &Backup,
) -> Result<RestoreSummary, StorageError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .engine_context("failed to start restore transaction")?;

    let removed = tx
        .execute("DELETE FROM weight", [])
        .engine_context("failed to clear weight table")?;

    {
        let mut stmt = tx
            .prepare(INSERT_WEIGHT_SQL)
            .engine_context("failed to prepare weight insert")?;
        for record in &backup.weight {
            ctx.check()?;
            stmt.execute(params![record.user_id, record.timestamp, record.value])
                .with_engine_context(|| {
                    format!(
                        "failed to restore weight for user {} at {}",
                        record.user_id, record.timestamp
                    )
                })?;
        }
    }

    ctx.check()?;
    tx.commit()
        .engine_context("failed to commit restore transaction")?;

    Ok(RestoreSummary {
        removed,
        inserted: backup.weight.len(),
    })
}
