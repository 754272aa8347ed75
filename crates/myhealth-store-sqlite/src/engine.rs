use myhealth_core::{Context, StorageError};
use rusqlite::{Connection, ErrorCode};

/// Wraps `rusqlite` failures into `StorageError::Engine` with a "failed to ..." context.
pub(crate) trait EngineResultExt<T> {
    fn engine_context(self, context: &str) -> Result<T, StorageError>;

    fn with_engine_context<F>(self, context: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> String;
}

impl<T> EngineResultExt<T> for rusqlite::Result<T> {
    fn engine_context(self, context: &str) -> Result<T, StorageError> {
        self.map_err(|err| StorageError::engine(context, err))
    }

    fn with_engine_context<F>(self, context: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|err| StorageError::engine(context(), err))
    }
}

/// Interrupt running statements on `conn` once `ctx` is cancelled or past its deadline.
///
/// SQLite calls the handler every `interval` VM steps; returning `true` aborts the
/// statement with `SQLITE_INTERRUPT`.
pub(crate) fn install_cancel_handler(conn: &Connection, ctx: &Context, interval: i32) {
    let ctx = ctx.clone();
    conn.progress_handler(interval, Some(move || ctx.is_done()));
}

pub(crate) fn remove_cancel_handler(conn: &Connection) {
    conn.progress_handler(0, None::<fn() -> bool>);
}

/// Report an engine failure caused by the context ending as the context's own error.
///
/// Every other engine failure keeps its meaning, even when the context has ended meanwhile.
pub(crate) fn resolve_cancellation(ctx: &Context, err: StorageError) -> StorageError {
    if !is_interruption(&err) {
        return err;
    }
    match ctx.check() {
        Err(ended) => ended,
        Ok(()) => err,
    }
}

/// `SQLITE_INTERRUPT` from the progress handler, or a lock wait cut short by a busy timeout
/// bounded to the deadline.
fn is_interruption(err: &StorageError) -> bool {
    let StorageError::Engine { source, .. } = err else {
        return false;
    };
    match source.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
            failure.code,
            ErrorCode::OperationInterrupted | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}
