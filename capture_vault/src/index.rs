//! Capture Vault - Capture Index
//!
//! Durable SQLite catalog of every capture held locally: status, size,
//! encryption metadata, retry bookkeeping and the transfer id registered for
//! the current (or last) upload. Every read-modify-write runs inside one
//! transaction under the connection mutex, so concurrent callers can never
//! lose an update.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};

use crate::crypto::EncryptionMetadata;
use crate::error::{StorageError, StorageResult};
use crate::status::CaptureStatus;

const COLUMNS: &str = "capture_id, queued_at, total_size, status, is_offline, key_id, iv, \
                       algorithm, encrypted_at, metadata, attempts, next_retry_at, last_error, \
                       transfer_id";

/// Kind of media captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Photo,
    Video,
}

/// Producer metadata forwarded untouched to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub media_type: MediaType,
    /// When the sensor captured the media
    pub captured_at: DateTime<Utc>,
    /// Whether a depth map is embedded in the payload
    #[serde(default)]
    pub has_depth: bool,
    /// Opaque base64 C2PA manifest
    #[serde(default)]
    pub manifest: Option<String>,
    /// Opaque device attestation token
    #[serde(default)]
    pub attestation: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CaptureMetadata {
    pub fn new(media_type: MediaType) -> Self {
        Self {
            media_type,
            captured_at: Utc::now(),
            has_depth: false,
            manifest: None,
            attestation: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// A capture about to be admitted
#[derive(Debug, Clone)]
pub struct NewCapture {
    pub capture_id: String,
    pub queued_at: DateTime<Utc>,
    /// Ciphertext + tag bytes
    pub total_size: u64,
    pub is_offline_capture: bool,
    pub encryption: EncryptionMetadata,
    pub metadata: CaptureMetadata,
}

/// Index entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureIndexEntry {
    pub capture_id: String,
    pub queued_at: DateTime<Utc>,
    pub total_size: u64,
    pub status: CaptureStatus,
    pub is_offline_capture: bool,
    pub encryption: EncryptionMetadata,
    pub metadata: CaptureMetadata,
    /// Upload attempts consumed so far
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Transfer registered by the current or last upload
    pub transfer_id: Option<String>,
}

impl CaptureIndexEntry {
    /// Whole hours since the capture was queued
    pub fn age_hours(&self, now: DateTime<Utc>) -> i64 {
        (now - self.queued_at).num_hours()
    }

    /// Whether a pending/failed entry may be claimed at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_uploadable() && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// Outcome applied to an entry that is `uploading`
#[derive(Debug, Clone, PartialEq)]
pub enum TransferResolution {
    Completed,
    Retry {
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        error: String,
    },
    PermanentlyFailed {
        attempts: u32,
        error: String,
    },
}

impl TransferResolution {
    pub fn status(&self) -> CaptureStatus {
        match self {
            TransferResolution::Completed => CaptureStatus::Completed,
            TransferResolution::Retry { .. } => CaptureStatus::Failed,
            TransferResolution::PermanentlyFailed { .. } => CaptureStatus::PermanentlyFailed,
        }
    }
}

/// Capture Index - durable catalog of local captures
pub struct CaptureIndex {
    /// Database connection
    conn: Mutex<Connection>,
    /// Database file, `None` when in memory
    path: Option<PathBuf>,
}

impl CaptureIndex {
    /// Open (or create) the index database at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Database(format!("{}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(path)?;
        Self::init(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Run `work` on the blocking pool. Commits fsync (`synchronous = FULL`),
    /// so async callers never touch the connection on a runtime thread.
    pub async fn run<T, F>(self: &Arc<Self>, work: F) -> StorageResult<T>
    where
        F: FnOnce(&CaptureIndex) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let index = Arc::clone(self);
        tokio::task::spawn_blocking(move || work(&index))
            .await
            .map_err(|e| StorageError::Database(format!("index task failed: {}", e)))?
    }

    /// Open an in-memory index (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    fn init(conn: &Connection) -> StorageResult<()> {
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS captures (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                capture_id TEXT NOT NULL UNIQUE,
                queued_at TEXT NOT NULL,
                total_size INTEGER NOT NULL,
                status TEXT NOT NULL,
                is_offline INTEGER NOT NULL,
                key_id TEXT NOT NULL,
                iv TEXT NOT NULL,
                algorithm TEXT NOT NULL,
                encrypted_at TEXT NOT NULL,
                metadata TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_retry_at TEXT,
                last_error TEXT,
                transfer_id TEXT UNIQUE
            );

            CREATE INDEX IF NOT EXISTS idx_captures_status ON captures(status);

            CREATE TABLE IF NOT EXISTS vault_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ENTRY LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert a new entry in `pending`
    pub fn admit(&self, capture: NewCapture) -> StorageResult<CaptureIndexEntry> {
        let metadata = serde_json::to_string(&capture.metadata)
            .map_err(|e| StorageError::Corrupted(format!("metadata: {}", e)))?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if select_entry(&tx, &capture.capture_id)?.is_some() {
            return Err(StorageError::DuplicateCaptureId(capture.capture_id));
        }

        tx.execute(
            r#"INSERT INTO captures
               (capture_id, queued_at, total_size, status, is_offline, key_id, iv, algorithm,
                encrypted_at, metadata)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                capture.capture_id,
                capture.queued_at.to_rfc3339(),
                capture.total_size as i64,
                CaptureStatus::Pending.as_str(),
                capture.is_offline_capture,
                capture.encryption.key_id,
                capture.encryption.iv,
                capture.encryption.algorithm,
                capture.encryption.created_at.to_rfc3339(),
                metadata,
            ],
        )?;

        let entry = require_entry(&tx, &capture.capture_id)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Get an entry by capture id
    pub fn get(&self, capture_id: &str) -> StorageResult<Option<CaptureIndexEntry>> {
        let conn = self.conn.lock();
        select_entry(&conn, capture_id)
    }

    /// Move an entry to `new_status`, enforcing the transition table
    pub fn update_status(
        &self,
        capture_id: &str,
        new_status: CaptureStatus,
    ) -> StorageResult<CaptureIndexEntry> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let entry = require_entry(&tx, capture_id)?;
        check_transition(&entry, new_status)?;

        tx.execute(
            "UPDATE captures SET status = ?1 WHERE capture_id = ?2",
            params![new_status.as_str(), capture_id],
        )?;

        let entry = require_entry(&tx, capture_id)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Atomically claim an entry for upload and register its transfer id.
    ///
    /// Fails with `InvalidTransition` when the entry is already `uploading`,
    /// which is what keeps a capture to at most one transfer in flight.
    pub fn begin_upload(
        &self,
        capture_id: &str,
        transfer_id: &str,
    ) -> StorageResult<CaptureIndexEntry> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let entry = require_entry(&tx, capture_id)?;
        check_transition(&entry, CaptureStatus::Uploading)?;

        tx.execute(
            "UPDATE captures SET status = ?1, transfer_id = ?2 WHERE capture_id = ?3",
            params![CaptureStatus::Uploading.as_str(), transfer_id, capture_id],
        )?;

        let entry = require_entry(&tx, capture_id)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Apply an upload outcome, only if the entry is still `uploading` under `transfer_id`.
    ///
    /// Returns `false` when the outcome is stale (entry gone, already resolved,
    /// or claimed by a newer transfer).
    pub fn resolve_transfer(
        &self,
        capture_id: &str,
        transfer_id: &str,
        resolution: &TransferResolution,
    ) -> StorageResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let Some(entry) = select_entry(&tx, capture_id)? else {
            return Ok(false);
        };
        if entry.status != CaptureStatus::Uploading
            || entry.transfer_id.as_deref() != Some(transfer_id)
        {
            return Ok(false);
        }

        match resolution {
            TransferResolution::Completed => {
                tx.execute(
                    "UPDATE captures SET status = ?1, last_error = NULL, next_retry_at = NULL
                     WHERE capture_id = ?2",
                    params![CaptureStatus::Completed.as_str(), capture_id],
                )?;
            }
            TransferResolution::Retry {
                attempts,
                next_retry_at,
                error,
            } => {
                tx.execute(
                    "UPDATE captures SET status = ?1, attempts = ?2, next_retry_at = ?3,
                     last_error = ?4 WHERE capture_id = ?5",
                    params![
                        CaptureStatus::Failed.as_str(),
                        attempts,
                        next_retry_at.to_rfc3339(),
                        error,
                        capture_id
                    ],
                )?;
            }
            TransferResolution::PermanentlyFailed { attempts, error } => {
                tx.execute(
                    "UPDATE captures SET status = ?1, attempts = ?2, next_retry_at = NULL,
                     last_error = ?3 WHERE capture_id = ?4",
                    params![
                        CaptureStatus::PermanentlyFailed.as_str(),
                        attempts,
                        error,
                        capture_id
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(true)
    }

    /// User-initiated retry: back to `pending` with a fresh retry budget
    pub fn reset_for_retry(&self, capture_id: &str) -> StorageResult<CaptureIndexEntry> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let entry = require_entry(&tx, capture_id)?;
        check_transition(&entry, CaptureStatus::Pending)?;

        tx.execute(
            "UPDATE captures SET status = ?1, attempts = 0, next_retry_at = NULL,
             last_error = NULL, transfer_id = NULL WHERE capture_id = ?2",
            params![CaptureStatus::Pending.as_str(), capture_id],
        )?;

        let entry = require_entry(&tx, capture_id)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Remove an entry. The caller deletes the blob first.
    pub fn remove(&self, capture_id: &str) -> StorageResult<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "DELETE FROM captures WHERE capture_id = ?1",
            params![capture_id],
        )?;
        Ok(count > 0)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════

    /// Entries in `status`, in insertion order
    pub fn list_by_status(&self, status: CaptureStatus) -> StorageResult<Vec<CaptureIndexEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM captures WHERE status = ?1 ORDER BY seq ASC",
            COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![status.as_str()], StoredRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(StoredRow::into_entry).collect()
    }

    /// Every entry, in insertion order
    pub fn list_all(&self) -> StorageResult<Vec<CaptureIndexEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM captures ORDER BY seq ASC", COLUMNS))?;
        let rows = stmt
            .query_map([], StoredRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(StoredRow::into_entry).collect()
    }

    /// Like `list_all`, but unreadable rows are logged and skipped instead of
    /// failing the whole scan. For background passes; `get` stays strict.
    pub fn scan_all(&self) -> StorageResult<Vec<CaptureIndexEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM captures ORDER BY seq ASC", COLUMNS))?;
        let mut entries = Vec::new();
        for row in stmt.query_map([], StoredRow::from_row)? {
            let parsed = match row {
                Ok(row) => row.into_entry(),
                Err(
                    e @ (rusqlite::Error::FromSqlConversionFailure(..)
                    | rusqlite::Error::InvalidColumnType(..)),
                ) => Err(StorageError::Corrupted(e.to_string())),
                Err(e) => return Err(e.into()),
            };
            match parsed {
                Ok(entry) => entries.push(entry),
                Err(e) => log::warn!("Skipping unreadable index row: {}", e),
            }
        }
        Ok(entries)
    }

    /// Pending entries and failed entries whose backoff elapsed, in insertion order
    pub fn list_due(&self, now: DateTime<Utc>) -> StorageResult<Vec<CaptureIndexEntry>> {
        Ok(self
            .scan_all()?
            .into_iter()
            .filter(|entry| entry.is_due(now))
            .collect())
    }

    /// Capture id registered for `transfer_id`
    pub fn capture_for_transfer(&self, transfer_id: &str) -> StorageResult<Option<String>> {
        let conn = self.conn.lock();
        let capture_id = conn
            .query_row(
                "SELECT capture_id FROM captures WHERE transfer_id = ?1",
                params![transfer_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(capture_id)
    }

    /// Count entries
    pub fn count(&self) -> StorageResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM captures", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Sum of ciphertext bytes across entries
    pub fn total_size(&self) -> StorageResult<u64> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(total_size), 0) FROM captures",
            [],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    /// Entry count and byte total from one snapshot
    pub fn usage(&self) -> StorageResult<(usize, u64)> {
        let conn = self.conn.lock();
        let (count, total): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(total_size), 0) FROM captures",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((count as usize, total as u64))
    }

    /// Distinct key ids still referenced by an entry
    pub fn key_ids_in_use(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT key_id FROM captures ORDER BY key_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // VAULT STATE
    // ═══════════════════════════════════════════════════════════════════════

    pub fn get_state(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM vault_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_state(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO vault_state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

fn check_transition(entry: &CaptureIndexEntry, next: CaptureStatus) -> StorageResult<()> {
    if entry.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(StorageError::InvalidTransition {
            capture_id: entry.capture_id.clone(),
            from: entry.status,
            to: next,
        })
    }
}

fn select_entry(conn: &Connection, capture_id: &str) -> StorageResult<Option<CaptureIndexEntry>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM captures WHERE capture_id = ?1", COLUMNS),
            params![capture_id],
            StoredRow::from_row,
        )
        .optional()?;
    row.map(StoredRow::into_entry).transpose()
}

fn require_entry(tx: &Transaction<'_>, capture_id: &str) -> StorageResult<CaptureIndexEntry> {
    select_entry(tx, capture_id)?.ok_or_else(|| StorageError::CaptureNotFound(capture_id.to_string()))
}

/// Raw column values, parsed into an entry outside of rusqlite's row callback
struct StoredRow {
    capture_id: String,
    queued_at: String,
    total_size: i64,
    status: String,
    is_offline: bool,
    key_id: String,
    iv: String,
    algorithm: String,
    encrypted_at: String,
    metadata: String,
    attempts: i64,
    next_retry_at: Option<String>,
    last_error: Option<String>,
    transfer_id: Option<String>,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            capture_id: row.get(0)?,
            queued_at: row.get(1)?,
            total_size: row.get(2)?,
            status: row.get(3)?,
            is_offline: row.get(4)?,
            key_id: row.get(5)?,
            iv: row.get(6)?,
            algorithm: row.get(7)?,
            encrypted_at: row.get(8)?,
            metadata: row.get(9)?,
            attempts: row.get(10)?,
            next_retry_at: row.get(11)?,
            last_error: row.get(12)?,
            transfer_id: row.get(13)?,
        })
    }

    fn into_entry(self) -> StorageResult<CaptureIndexEntry> {
        let id = self.capture_id.clone();
        let corrupted = |field: &str, detail: String| {
            StorageError::Corrupted(format!("{} ({}): {}", id, field, detail))
        };

        let status = self
            .status
            .parse::<CaptureStatus>()
            .map_err(|e| corrupted("status", e))?;
        let metadata = serde_json::from_str(&self.metadata)
            .map_err(|e| corrupted("metadata", e.to_string()))?;
        let next_retry_at = self
            .next_retry_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(|e| corrupted("next_retry_at", e))?;

        Ok(CaptureIndexEntry {
            queued_at: parse_timestamp(&self.queued_at).map_err(|e| corrupted("queued_at", e))?,
            total_size: u64::try_from(self.total_size)
                .map_err(|e| corrupted("total_size", e.to_string()))?,
            status,
            is_offline_capture: self.is_offline,
            encryption: EncryptionMetadata {
                key_id: self.key_id,
                iv: self.iv,
                algorithm: self.algorithm,
                created_at: parse_timestamp(&self.encrypted_at)
                    .map_err(|e| corrupted("encrypted_at", e))?,
            },
            metadata,
            attempts: u32::try_from(self.attempts)
                .map_err(|e| corrupted("attempts", e.to_string()))?,
            next_retry_at,
            last_error: self.last_error,
            transfer_id: self.transfer_id,
            capture_id: self.capture_id,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}
