//! Domain types and the storage contract for myhealth.
//!
//! Backends (see `myhealth-store-sqlite`) implement [`Storage`]; callers branch on
//! [`StorageError`] kinds, most importantly [`StorageError::EmptyResult`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type Timestamp = i64;
pub type MigrationId = i64;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("empty result")]
    EmptyResult,
    #[error("{context}: {source}")]
    Engine {
        context: String,
        #[source]
        source: BoxError,
    },
    #[error("migration {id} failed: {source}")]
    Migration {
        id: MigrationId,
        #[source]
        source: Box<StorageError>,
    },
    #[error("database schema version {found} is newer than supported version {latest}")]
    UnsupportedSchema {
        found: MigrationId,
        latest: MigrationId,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation deadline exceeded")]
    DeadlineExceeded,
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid backup archive: {0}")]
    InvalidArchive(String),
}

impl StorageError {
    pub fn engine(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Engine {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when a read matched no rows. Callers treat this as "no data", not as an outage.
    #[must_use]
    pub fn is_empty_result(&self) -> bool {
        matches!(self, Self::EmptyResult)
    }

    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Per-call cancellation scope: a shared token plus an optional deadline.
///
/// Every storage operation takes a `&Context` and fails with [`StorageError::Cancelled`] or
/// [`StorageError::DeadlineExceeded`] once the scope ends, including while the engine is busy.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Bound the scope to `timeout` from now. An earlier deadline already set is kept.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }

    /// # Errors
    /// Returns `Cancelled` when the token fired, `DeadlineExceeded` when the deadline passed.
    pub fn check(&self) -> Result<(), StorageError> {
        if self.token.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StorageError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Weight {
    pub timestamp: Timestamp,
    pub value: f64,
}

impl Weight {
    #[must_use]
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WeightBackup {
    pub user_id: UserId,
    pub timestamp: Timestamp,
    pub value: f64,
}

impl WeightBackup {
    #[must_use]
    pub fn new(user_id: UserId, weight: Weight) -> Self {
        Self {
            user_id,
            timestamp: weight.timestamp,
            value: weight.value,
        }
    }

    #[must_use]
    pub fn weight(&self) -> Weight {
        Weight::new(self.timestamp, self.value)
    }
}

/// Point-in-time copy of every weight record across all users.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Backup {
    pub timestamp: Timestamp,
    pub weight: Vec<WeightBackup>,
}

impl Backup {
    #[must_use]
    pub fn new(timestamp: Timestamp, weight: Vec<WeightBackup>) -> Self {
        Self { timestamp, weight }
    }

    /// # Errors
    /// Returns `Serialization` when the snapshot cannot be encoded.
    pub fn to_json(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// # Errors
    /// Returns `Serialization` when `raw` is not a valid snapshot document.
    pub fn from_json(raw: &str) -> Result<Self, StorageError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Contract shared by every storage backend.
pub trait Storage {
    /// Insert or overwrite the record at `(user_id, weight.timestamp)`.
    ///
    /// # Errors
    /// Engine or cancellation failures.
    fn set_weight(&self, ctx: &Context, user_id: UserId, weight: &Weight)
        -> Result<(), StorageError>;

    /// Records of `user_id` with `from <= timestamp <= to`, ascending by timestamp.
    ///
    /// # Errors
    /// `EmptyResult` when nothing matches, otherwise engine or cancellation failures.
    fn get_weight_list(
        &self,
        ctx: &Context,
        user_id: UserId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Weight>, StorageError>;

    /// Remove the record at `(user_id, timestamp)`; a missing key is not an error.
    ///
    /// # Errors
    /// Engine or cancellation failures.
    fn delete_weight(
        &self,
        ctx: &Context,
        user_id: UserId,
        timestamp: Timestamp,
    ) -> Result<(), StorageError>;

    /// # Errors
    /// Engine or cancellation failures.
    fn backup(&self, ctx: &Context) -> Result<Backup, StorageError>;

    /// Atomically replace every weight record with the snapshot's records.
    ///
    /// # Errors
    /// Engine or cancellation failures; the previous data is kept on any failure.
    fn restore(&self, ctx: &Context, backup: &Backup) -> Result<(), StorageError>;
}
