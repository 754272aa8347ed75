use std::time::Duration;

use myhealth_core::StorageError;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::engine::EngineResultExt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    Wal,
    Delete,
    Truncate,
    Memory,
}

impl JournalMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
            Self::Memory => "MEMORY",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Synchronous {
    Off,
    Normal,
    Full,
}

impl Synchronous {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Normal => "NORMAL",
            Self::Full => "FULL",
        }
    }
}

/// Connection tuning applied when a store is opened.
///
/// Deserializes with defaults for every missing field, so hosts can embed it in their own
/// config documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreOptions {
    /// Longest wait on a lock held by another connection. Each operation caps it at the time
    /// left before its deadline.
    pub busy_timeout_ms: u64,
    pub journal_mode: JournalMode,
    pub synchronous: Synchronous,
    pub foreign_keys: bool,
    /// SQLite VM steps between cancellation checks while a statement runs.
    pub cancel_check_interval: i32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            journal_mode: JournalMode::Wal,
            synchronous: Synchronous::Normal,
            foreign_keys: true,
            cancel_check_interval: 1000,
        }
    }
}

impl StoreOptions {
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub(crate) fn cancel_check_interval(&self) -> i32 {
        self.cancel_check_interval.max(1)
    }
}

pub(crate) fn apply_pragmas(conn: &Connection, options: &StoreOptions) -> Result<(), StorageError> {
    conn.busy_timeout(options.busy_timeout())
        .engine_context("failed to set busy timeout")?;

    let foreign_keys = if options.foreign_keys { "ON" } else { "OFF" };
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = {};
         PRAGMA synchronous = {};
         PRAGMA foreign_keys = {foreign_keys};",
        options.journal_mode.as_str(),
        options.synchronous.as_str(),
    ))
    .engine_context("failed to configure sqlite pragmas")
}
