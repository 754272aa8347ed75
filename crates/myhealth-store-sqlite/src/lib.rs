//! SQLite-backed storage engine for myhealth.
//!
//! [`SqliteStore`] owns a single connection for its whole lifetime, brings the schema up to
//! date when opened, and implements [`myhealth_core::Storage`].

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use myhealth_core::{Backup, Context, MigrationId, Storage, StorageError, Timestamp, UserId, Weight};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

mod archive;
mod engine;
mod migrate;
mod options;
mod snapshot;
mod timeseries;

pub use archive::{ArchiveManifest, ArchivePayload, ARCHIVE_FORMAT_VERSION};
pub use migrate::{SchemaStatus, LATEST_MIGRATION_ID};
pub use options::{JournalMode, StoreOptions, Synchronous};

use engine::{install_cancel_handler, remove_cancel_handler, resolve_cancellation, EngineResultExt};

/// Longest single wait for the connection lock before the context is checked again.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    options: StoreOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, apply connection pragmas, and run every
    /// pending migration before handing out the store.
    ///
    /// # Errors
    /// Returns an engine error when the file cannot be opened or configured, and
    /// `Migration`/`UnsupportedSchema` when the schema cannot be brought to the latest version.
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self, StorageError> {
        let mut conn = Connection::open(path).with_engine_context(|| {
            format!("failed to open sqlite database at {}", path.display())
        })?;
        options::apply_pragmas(&conn, &options)?;

        let applied = migrate::migrate(&mut conn, &Context::new())?;
        info!(path = %path.display(), applied = ?applied, "opened weight store");

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            options,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Highest applied migration id; `None` when the tracking table holds nothing.
    ///
    /// # Errors
    /// Returns an error when the tracking table cannot be read.
    pub fn last_migration_id(&self, ctx: &Context) -> Result<Option<MigrationId>, StorageError> {
        self.with_conn(ctx, |conn| migrate::last_migration_id(conn))
    }

    /// Re-run the migrator. Returns the ids it applied, empty when already current.
    ///
    /// # Errors
    /// Returns `Migration` when a pending migration fails.
    pub fn migrate(&self, ctx: &Context) -> Result<Vec<MigrationId>, StorageError> {
        self.with_conn(ctx, |conn| migrate::migrate(conn, ctx))
    }

    /// # Errors
    /// Returns an error when migration metadata cannot be read.
    pub fn schema_status(&self, ctx: &Context) -> Result<SchemaStatus, StorageError> {
        self.with_conn(ctx, |conn| migrate::schema_status(conn))
    }

    /// Run `PRAGMA quick_check` and report it alongside the schema status.
    ///
    /// # Errors
    /// Returns an error when either check fails to execute.
    pub fn integrity_check(&self, ctx: &Context) -> Result<IntegrityReport, StorageError> {
        self.with_conn(ctx, |conn| {
            let quick_check_message: String = conn
                .query_row("PRAGMA quick_check", [], |row| row.get(0))
                .engine_context("failed to run PRAGMA quick_check")?;
            Ok(IntegrityReport {
                quick_check_ok: quick_check_message == "ok",
                quick_check_message,
                schema_status: migrate::schema_status(conn)?,
            })
        })
    }

    /// # Errors
    /// Returns an engine or cancellation error.
    pub fn set_weight(
        &self,
        ctx: &Context,
        user_id: UserId,
        weight: &Weight,
    ) -> Result<(), StorageError> {
        self.with_conn(ctx, |conn| timeseries::set_weight(conn, user_id, weight))?;
        debug!(user_id, timestamp = weight.timestamp, "stored weight");
        Ok(())
    }

    /// # Errors
    /// Returns `EmptyResult` when no record of `user_id` falls in `[from, to]`.
    pub fn get_weight_list(
        &self,
        ctx: &Context,
        user_id: UserId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Weight>, StorageError> {
        self.with_conn(ctx, |conn| {
            timeseries::get_weight_list(conn, ctx, user_id, from, to)
        })
    }

    /// # Errors
    /// Returns an engine or cancellation error; a missing key is not one.
    pub fn delete_weight(
        &self,
        ctx: &Context,
        user_id: UserId,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        let removed = self.with_conn(ctx, |conn| {
            timeseries::delete_weight(conn, user_id, timestamp)
        })?;
        debug!(user_id, timestamp, removed, "deleted weight");
        Ok(())
    }

    /// Snapshot every weight record, stamped with the current unix time.
    ///
    /// # Errors
    /// Returns an engine or cancellation error.
    pub fn backup(&self, ctx: &Context) -> Result<Backup, StorageError> {
        let created_at = OffsetDateTime::now_utc().unix_timestamp();
        let taken = self.with_conn(ctx, |conn| snapshot::backup(conn, ctx, created_at))?;
        info!(
            timestamp = created_at,
            records = taken.weight.len(),
            "created backup"
        );
        Ok(taken)
    }

    /// Replace all weight records with `backup.weight` as one transaction.
    ///
    /// # Errors
    /// Returns an engine or cancellation error; the previous data is kept on failure.
    pub fn restore(&self, ctx: &Context, backup: &Backup) -> Result<(), StorageError> {
        match self.with_conn(ctx, |conn| snapshot::restore(conn, ctx, backup)) {
            Ok(summary) => {
                info!(
                    snapshot_timestamp = backup.timestamp,
                    removed = summary.removed,
                    inserted = summary.inserted,
                    "restored backup"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    snapshot_timestamp = backup.timestamp,
                    error = %err,
                    "restore rolled back"
                );
                Err(err)
            }
        }
    }

    /// Release the connection. Consumes the store, so it can only happen once.
    ///
    /// # Errors
    /// Returns an engine error when SQLite refuses to close (e.g. unfinalized statements).
    pub fn close(self) -> Result<(), StorageError> {
        self.conn
            .into_inner()
            .close()
            .map_err(|(_, err)| {
                StorageError::engine("failed to close sqlite database", err)
            })?;
        info!(path = %self.path.display(), "closed weight store");
        Ok(())
    }

    /// Run `op` with exclusive access to the connection while `ctx` can interrupt it.
    ///
    /// Waiting for the lock, waiting on another connection's lock, and running statements all
    /// end once `ctx` is cancelled or past its deadline.
    fn with_conn<T, F>(&self, ctx: &Context, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError>,
    {
        let mut conn = self.lock_conn(ctx)?;
        ctx.check()?;

        // The progress handler does not run while SQLite sleeps in its busy handler.
        let busy_timeout = self.options.busy_timeout();
        // SQLite counts the busy timeout in whole milliseconds; round the remainder up.
        let bounded_wait = ctx
            .deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .map(|remaining| remaining + Duration::from_millis(1))
            .filter(|wait| *wait < busy_timeout);
        if let Some(wait) = bounded_wait {
            conn.busy_timeout(wait)
                .engine_context("failed to bound busy timeout")?;
        }

        install_cancel_handler(&conn, ctx, self.options.cancel_check_interval());
        let result = op(&mut *conn);
        remove_cancel_handler(&conn);

        if bounded_wait.is_some() {
            conn.busy_timeout(busy_timeout)
                .engine_context("failed to reset busy timeout")?;
        }

        result.map_err(|err| resolve_cancellation(ctx, err))
    }

    fn lock_conn(&self, ctx: &Context) -> Result<MutexGuard<'_, Connection>, StorageError> {
        loop {
            ctx.check()?;
            let wait = match ctx.deadline() {
                Some(deadline) => LOCK_POLL_INTERVAL
                    .min(deadline.saturating_duration_since(Instant::now())),
                None => LOCK_POLL_INTERVAL,
            };
            if let Some(conn) = self.conn.try_lock_for(wait) {
                return Ok(conn);
            }
        }
    }
}

impl Storage for SqliteStore {
    fn set_weight(
        &self,
        ctx: &Context,
        user_id: UserId,
        weight: &Weight,
    ) -> Result<(), StorageError> {
        SqliteStore::set_weight(self, ctx, user_id, weight)
    }

    fn get_weight_list(
        &self,
        ctx: &Context,
        user_id: UserId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Weight>, StorageError> {
        SqliteStore::get_weight_list(self, ctx, user_id, from, to)
    }

    fn delete_weight(
        &self,
        ctx: &Context,
        user_id: UserId,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        SqliteStore::delete_weight(self, ctx, user_id, timestamp)
    }

    fn backup(&self, ctx: &Context) -> Result<Backup, StorageError> {
        SqliteStore::backup(self, ctx)
    }

    fn restore(&self, ctx: &Context, backup: &Backup) -> Result<(), StorageError> {
        SqliteStore::restore(self, ctx, backup)
    }
}
