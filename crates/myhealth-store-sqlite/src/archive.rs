//! Backup archives on disk.
//!
//! An archive directory holds `weight.ndjson`, the snapshot rows as one `WeightBackup` JSON
//! object per `\n`-terminated line in `(user_id, timestamp)` order, and `manifest.json`,
//! which pins that file's exact byte length and SHA-256 along with the snapshot metadata.

use std::fs;
use std::path::Path;

use myhealth_core::{Backup, Context, MigrationId, StorageError, Timestamp, WeightBackup};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

use crate::SqliteStore;

pub const ARCHIVE_FORMAT_VERSION: i64 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const WEIGHT_FILE: &str = "weight.ndjson";

/// The row file of an archive as it was written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchivePayload {
    pub file: String,
    pub sha256: String,
    pub bytes: usize,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveManifest {
    pub format_version: i64,
    /// Migration id of the exporting store; an importing store must be at least this new.
    pub schema_version: MigrationId,
    pub snapshot_timestamp: Timestamp,
    pub exported_at: String,
    pub weight: ArchivePayload,
}

impl SqliteStore {
    /// Take a snapshot and write it to `out_dir` as an archive.
    ///
    /// # Errors
    /// Returns an error when the snapshot cannot be taken or the files cannot be written.
    pub fn export_backup(
        &self,
        ctx: &Context,
        out_dir: &Path,
    ) -> Result<ArchiveManifest, StorageError> {
        let schema_version = self.last_migration_id(ctx)?.unwrap_or_default();
        let snapshot = self.backup(ctx)?;
        let payload = encode_rows(&snapshot.weight)?;

        let manifest = ArchiveManifest {
            format_version: ARCHIVE_FORMAT_VERSION,
            schema_version,
            snapshot_timestamp: snapshot.timestamp,
            exported_at: format_export_time(OffsetDateTime::now_utc())?,
            weight: ArchivePayload {
                file: WEIGHT_FILE.to_string(),
                sha256: sha256_hex(&payload),
                bytes: payload.len(),
                records: snapshot.weight.len(),
            },
        };

        fs::create_dir_all(out_dir).map_err(|err| StorageError::io(out_dir, err))?;
        write_file(&out_dir.join(WEIGHT_FILE), &payload)?;
        write_file(
            &out_dir.join(MANIFEST_FILE),
            &serde_json::to_vec_pretty(&manifest)?,
        )?;

        info!(
            dir = %out_dir.display(),
            records = manifest.weight.records,
            bytes = manifest.weight.bytes,
            "exported backup archive"
        );
        Ok(manifest)
    }

    /// Verify the archive in `in_dir` and restore it, replacing all current records.
    ///
    /// Nothing is touched unless the manifest fits this store and the row file matches it
    /// byte for byte.
    ///
    /// # Errors
    /// Returns `InvalidArchive` for a malformed or tampered archive, otherwise the errors of
    /// [`SqliteStore::restore`].
    pub fn import_backup(
        &self,
        ctx: &Context,
        in_dir: &Path,
    ) -> Result<ArchiveManifest, StorageError> {
        let manifest_path = in_dir.join(MANIFEST_FILE);
        let manifest: ArchiveManifest = serde_json::from_slice(&read_file(&manifest_path)?)
            .map_err(|err| {
                StorageError::InvalidArchive(format!("failed to parse {MANIFEST_FILE}: {err}"))
            })?;
        let store_schema = self.last_migration_id(ctx)?.unwrap_or_default();
        check_manifest(&manifest, store_schema)?;

        // The rows restored are decoded from the same bytes the digest was checked against.
        let payload = read_file(&in_dir.join(WEIGHT_FILE))?;
        let weight = decode_payload(&manifest.weight, &payload)?;
        self.restore(ctx, &Backup::new(manifest.snapshot_timestamp, weight))?;

        info!(
            dir = %in_dir.display(),
            snapshot_timestamp = manifest.snapshot_timestamp,
            records = manifest.weight.records,
            "imported backup archive"
        );
        Ok(manifest)
    }
}

fn format_export_time(at: OffsetDateTime) -> Result<String, StorageError> {
    at.format(&Rfc3339).map_err(|err| {
        StorageError::InvalidArchive(format!("failed to format export time: {err}"))
    })
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    fs::write(path, bytes).map_err(|err| StorageError::io(path, err))
}

fn read_file(path: &Path) -> Result<Vec<u8>, StorageError> {
    fs::read(path).map_err(|err| StorageError::io(path, err))
}

fn encode_rows(rows: &[WeightBackup]) -> Result<Vec<u8>, StorageError> {
    let mut payload = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut payload, row)?;
        payload.push(b'\n');
    }
    Ok(payload)
}

fn check_manifest(
    manifest: &ArchiveManifest,
    store_schema: MigrationId,
) -> Result<(), StorageError> {
    if manifest.format_version != ARCHIVE_FORMAT_VERSION {
        return Err(StorageError::InvalidArchive(format!(
            "unsupported archive format version {}",
            manifest.format_version
        )));
    }
    if !(1..=store_schema).contains(&manifest.schema_version) {
        return Err(StorageError::InvalidArchive(format!(
            "archive schema version {} does not fit store schema version {store_schema}",
            manifest.schema_version
        )));
    }
    if manifest.weight.file != WEIGHT_FILE {
        return Err(StorageError::InvalidArchive(format!(
            "unexpected row file {:?}",
            manifest.weight.file
        )));
    }

    let exported_at = OffsetDateTime::parse(&manifest.exported_at, &Rfc3339).map_err(|err| {
        StorageError::InvalidArchive(format!(
            "invalid export time {:?}: {err}",
            manifest.exported_at
        ))
    })?;
    if manifest.snapshot_timestamp > exported_at.unix_timestamp() {
        return Err(StorageError::InvalidArchive(format!(
            "snapshot timestamp {} is later than export time {}",
            manifest.snapshot_timestamp, manifest.exported_at
        )));
    }

    Ok(())
}

fn decode_payload(
    expected: &ArchivePayload,
    payload: &[u8],
) -> Result<Vec<WeightBackup>, StorageError> {
    if payload.len() != expected.bytes {
        return Err(StorageError::InvalidArchive(format!(
            "{WEIGHT_FILE} is {} bytes, manifest records {}",
            payload.len(),
            expected.bytes
        )));
    }
    let actual = sha256_hex(payload);
    if actual != expected.sha256 {
        return Err(StorageError::InvalidArchive(format!(
            "digest mismatch for {WEIGHT_FILE}: expected {}, got {actual}",
            expected.sha256
        )));
    }

    let rows = parse_rows(payload)?;
    if rows.len() != expected.records {
        return Err(StorageError::InvalidArchive(format!(
            "{WEIGHT_FILE} holds {} records, manifest records {}",
            rows.len(),
            expected.records
        )));
    }
    Ok(rows)
}

/// Rows must be `\n`-terminated, free of blank or `\r`-terminated lines, and strictly
/// increasing by `(user_id, timestamp)`.
fn parse_rows(payload: &[u8]) -> Result<Vec<WeightBackup>, StorageError> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    let Some(body) = payload.strip_suffix(b"\n") else {
        return Err(StorageError::InvalidArchive(format!(
            "{WEIGHT_FILE} does not end with a newline"
        )));
    };

    let mut rows: Vec<WeightBackup> = Vec::new();
    for (index, line) in body.split(|byte| *byte == b'\n').enumerate() {
        let line_no = index + 1;
        if line.is_empty() || line.ends_with(b"\r") {
            return Err(StorageError::InvalidArchive(format!(
                "line {line_no} of {WEIGHT_FILE} is not a single LF-terminated record"
            )));
        }
        let row: WeightBackup = serde_json::from_slice(line).map_err(|err| {
            StorageError::InvalidArchive(format!(
                "failed to parse line {line_no} of {WEIGHT_FILE}: {err}"
            ))
        })?;
        if let Some(previous) = rows.last() {
            if (previous.user_id, previous.timestamp) >= (row.user_id, row.timestamp) {
                return Err(StorageError::InvalidArchive(format!(
                    "line {line_no} of {WEIGHT_FILE} breaks (user_id, timestamp) order"
                )));
            }
        }
        rows.push(row);
    }
    Ok(rows)
}
