use myhealth_core::{Context, StorageError, Timestamp, UserId, Weight};
use rusqlite::{params, Connection};

use crate::engine::EngineResultExt;

const UPSERT_WEIGHT_SQL: &str = r"
INSERT INTO weight(userid, timestamp, value) VALUES (?1, ?2, ?3)
ON CONFLICT(userid, timestamp) DO UPDATE SET value = excluded.value
";

const SELECT_WEIGHT_RANGE_SQL: &str = r"
SELECT timestamp, value
FROM weight
WHERE userid = ?1 AND timestamp >= ?2 AND timestamp <= ?3
ORDER BY timestamp ASC
";

const DELETE_WEIGHT_SQL: &str = "DELETE FROM weight WHERE userid = ?1 AND timestamp = ?2";

pub(crate) fn set_weight(
    conn: &Connection,
    user_id: UserId,
    weight: &Weight,
) -> Result<(), StorageError> {
    conn.prepare_cached(UPSERT_WEIGHT_SQL)
        .engine_context("failed to prepare weight upsert")?
        .execute(params![user_id, weight.timestamp, weight.value])
        .engine_context("failed to upsert weight")?;
    Ok(())
}

/// An inverted range (`from > to`) matches nothing and reports `EmptyResult`.
pub(crate) fn get_weight_list(
    conn: &Connection,
    ctx: &Context,
    user_id: UserId,
    from: Timestamp,
    to: Timestamp,
) -> Result<Vec<Weight>, StorageError> {
    let mut stmt = conn
        .prepare_cached(SELECT_WEIGHT_RANGE_SQL)
        .engine_context("failed to prepare weight range query")?;
    let mut rows = stmt
        .query(params![user_id, from, to])
        .engine_context("failed to query weight range")?;

    let mut list = Vec::new();
    while let Some(row) = rows.next().engine_context("failed to read weight row")? {
        ctx.check()?;
        list.push(Weight {
            timestamp: row.get(0).engine_context("failed to decode timestamp")?,
            value: row.get(1).engine_context("failed to decode weight value")?,
        });
    }

    if list.is_empty() {
        return Err(StorageError::EmptyResult);
    }
    Ok(list)
}

/// Returns whether a row was removed; a missing key is not an error.
pub(crate) fn delete_weight(
    conn: &Connection,
    user_id: UserId,
    timestamp: Timestamp,
) -> Result<bool, StorageError> {
    let removed = conn
        .prepare_cached(DELETE_WEIGHT_SQL)
        .engine_context("failed to prepare weight delete")?
        .execute(params![user_id, timestamp])
        .engine_context("failed to delete weight")?;
    Ok(removed > 0)
}
