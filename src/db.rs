//
// db.rs
// Dicom-Intake-rs
//
// SQLite handle and schema for uploads, DICOM metadata, batches and the audit trail, with the upload-level queries.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

use crate::models::{BatchRecord, DicomMetadataRecord, UploadRecord, UploadStatus};

/// How long a writer waits for another connection's lock before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batches (
    id TEXT PRIMARY KEY,
    owner_id TEXT,
    total_count INTEGER NOT NULL CHECK (total_count > 0),
    processed_count INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'queued',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK (processed_count <= total_count),
    CHECK (failed_count <= processed_count)
);

CREATE TABLE IF NOT EXISTS uploads (
    id TEXT PRIMARY KEY,
    filename TEXT NOT NULL,
    file_type TEXT,
    submitted_at TEXT NOT NULL,
    origin TEXT,
    owner_id TEXT,
    storage_path TEXT,
    content_hash TEXT,
    encrypted INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    failure_reason TEXT,
    batch_id TEXT REFERENCES batches(id),
    counted INTEGER NOT NULL DEFAULT 0,
    lease_id TEXT,
    lease_expires TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_uploads_batch_id ON uploads(batch_id);
CREATE INDEX IF NOT EXISTS idx_uploads_owner_id ON uploads(owner_id);
CREATE INDEX IF NOT EXISTS idx_batches_owner_id ON batches(owner_id);

CREATE TABLE IF NOT EXISTS dicom_metadata (
    upload_id TEXT PRIMARY KEY REFERENCES uploads(id),
    conversion_ok INTEGER NOT NULL,
    anonymization_ok INTEGER NOT NULL,
    modified_tags TEXT NOT NULL,
    processed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    upload_id TEXT,
    batch_id TEXT,
    stage TEXT NOT NULL,
    outcome TEXT NOT NULL,
    actor TEXT NOT NULL,
    detail TEXT
);

CREATE INDEX IF NOT EXISTS idx_audit_events_upload_id ON audit_events(upload_id);
CREATE INDEX IF NOT EXISTS idx_audit_events_batch_id ON audit_events(batch_id);

CREATE TRIGGER IF NOT EXISTS audit_events_no_update
BEFORE UPDATE ON audit_events
BEGIN
    SELECT RAISE(ABORT, 'audit events are append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_events_no_delete
BEFORE DELETE ON audit_events
BEGIN
    SELECT RAISE(ABORT, 'audit events are append-only');
END;
"#;

const UPLOAD_COLUMNS: &str = "id, filename, file_type, submitted_at, origin, owner_id, storage_path, \
     content_hash, encrypted, status, failure_reason, batch_id";

const BATCH_COLUMNS: &str =
    "id, owner_id, total_count, processed_count, failed_count, status, created_at, updated_at";

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Upload {0} is missing, terminal or held under another lease")]
    StaleUpload(String),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

/// Result of trying to take ownership of an upload for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Claimed,
    /// Another worker holds an unexpired lease on this upload.
    Busy,
    /// Someone already finished this upload.
    Terminal(UploadStatus),
    Missing,
}

/// One SQLite connection behind a mutex. Several `Database` values (or processes)
/// may open the same file; WAL and the busy timeout let them share it.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DbError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        let db = Self::init(conn)?;
        tracing::debug!(path = %path.display(), "database opened");
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        let conn = self.conn.lock().map_err(|_| DbError::LockPoisoned)?;
        f(&conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction: the write lock is taken up front,
    /// so concurrent writers serialize instead of failing on lock upgrade.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, DbError>,
    {
        let mut conn = self.conn.lock().map_err(|_| DbError::LockPoisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn ping(&self) -> bool {
        self.with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?))
            .is_ok()
    }

    pub fn insert_upload(&self, upload: &UploadRecord) -> Result<(), DbError> {
        self.with_conn(|conn| insert_upload(conn, upload))
    }

    /// Create a batch and all of its uploads atomically.
    pub fn insert_batch(&self, batch: &BatchRecord, uploads: &[UploadRecord]) -> Result<(), DbError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO batches (id, owner_id, total_count, processed_count, failed_count, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    batch.id,
                    batch.owner_id,
                    batch.total_count,
                    batch.processed_count,
                    batch.failed_count,
                    batch.status.as_str(),
                    ts(batch.created_at),
                    ts(batch.updated_at),
                ],
            )?;
            for upload in uploads {
                insert_upload(tx, upload)?;
            }
            Ok(())
        })
    }

    /// Move an upload to `processing` under `lease_id` until `lease` elapses. A `processing`
    /// upload is only taken over once its previous lease expired.
    pub fn claim_upload(&self, id: &str, lease_id: &str, lease: Duration) -> Result<Claim, DbError> {
        let now = Utc::now();
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE uploads SET status = 'processing', lease_id = ?2, lease_expires = ?3, updated_at = ?4
                 WHERE id = ?1 AND (status = 'received'
                     OR (status = 'processing' AND (lease_expires IS NULL OR lease_expires <= ?4)))",
                params![id, lease_id, ts(lease_deadline(now, lease)), ts(now)],
            )?;
            if changed > 0 {
                return Ok(Claim::Claimed);
            }
            let status = tx
                .query_row("SELECT status FROM uploads WHERE id = ?1", [id], |row| {
                    parse_col::<UploadStatus>(row, 0)
                })
                .optional()?;
            Ok(match status {
                None => Claim::Missing,
                Some(UploadStatus::Processing) => Claim::Busy,
                Some(status) => Claim::Terminal(status),
            })
        })
    }

    /// Hand the lease to a new token, keeping its expiry. Writes made under `current`
    /// are rejected from then on. Returns false when `current` no longer holds the upload.
    pub fn rotate_lease(&self, id: &str, current: &str, next: &str) -> Result<bool, DbError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE uploads SET lease_id = ?3, updated_at = ?4
                 WHERE id = ?1 AND status = 'processing' AND lease_id = ?2",
                params![id, current, next, ts(Utc::now())],
            )?;
            Ok(changed > 0)
        })
    }

    /// Mark a non-terminal upload `failed`, with the metadata record when the anonymizer ran.
    ///
    /// With a lease, only its holder can fail the upload. Without one, only an upload
    /// nobody holds (`received`, or `processing` under an expired lease) is failed.
    /// Returns false when nothing changed.
    pub fn fail_upload(
        &self,
        id: &str,
        lease_id: Option<&str>,
        reason: &str,
        metadata: Option<&DicomMetadataRecord>,
    ) -> Result<bool, DbError> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE uploads SET status = 'failed', failure_reason = ?3, lease_id = NULL,
                     lease_expires = NULL, updated_at = ?4
                 WHERE id = ?1 AND CASE WHEN ?2 IS NOT NULL
                     THEN (status = 'processing' AND lease_id = ?2)
                     ELSE (status = 'received'
                         OR (status = 'processing' AND (lease_expires IS NULL OR lease_expires <= ?4)))
                 END",
                params![id, lease_id, reason, ts(Utc::now())],
            )?;
            if changed > 0 {
                if let Some(metadata) = metadata {
                    upsert_metadata(tx, metadata)?;
                }
            }
            Ok(changed > 0)
        })
    }

    /// Record a stored artifact: upload row and metadata commit together or not at all.
    /// Only the current lease holder can complete the upload.
    pub fn complete_upload(
        &self,
        id: &str,
        lease_id: &str,
        storage_path: &str,
        content_hash: &str,
        encrypted: bool,
        metadata: &DicomMetadataRecord,
    ) -> Result<(), DbError> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE uploads
                 SET status = 'completed', storage_path = ?3, content_hash = ?4, encrypted = ?5,
                     failure_reason = NULL, lease_id = NULL, lease_expires = NULL, updated_at = ?6
                 WHERE id = ?1 AND status = 'processing' AND lease_id = ?2",
                params![id, lease_id, storage_path, content_hash, encrypted, ts(Utc::now())],
            )?;
            if changed == 0 {
                return Err(DbError::StaleUpload(id.to_string()));
            }
            upsert_metadata(tx, metadata)
        })
    }

    /// Uploads left non-terminal with no live lease, oldest first.
    pub fn unheld_uploads(&self) -> Result<Vec<UploadRecord>, DbError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {UPLOAD_COLUMNS} FROM uploads
                 WHERE status = 'received'
                    OR (status = 'processing' AND (lease_expires IS NULL OR lease_expires <= ?1))
                 ORDER BY submitted_at, id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([ts(Utc::now())], upload_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Terminal batch members whose batch counters never moved.
    pub fn uncounted_terminal_uploads(&self) -> Result<Vec<String>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM uploads
                 WHERE counted = 0 AND batch_id IS NOT NULL AND status IN ('completed', 'failed')
                 ORDER BY updated_at, id",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn upload(&self, id: &str) -> Result<Option<UploadRecord>, DbError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = ?1");
            Ok(conn.query_row(&sql, [id], upload_from_row).optional()?)
        })
    }

    pub fn metadata(&self, upload_id: &str) -> Result<Option<DicomMetadataRecord>, DbError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT upload_id, conversion_ok, anonymization_ok, modified_tags, processed_at
                     FROM dicom_metadata WHERE upload_id = ?1",
                    [upload_id],
                    metadata_from_row,
                )
                .optional()?)
        })
    }

    pub fn batch(&self, id: &str) -> Result<Option<BatchRecord>, DbError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?1");
            Ok(conn.query_row(&sql, [id], batch_from_row).optional()?)
        })
    }

    pub fn batch_uploads(&self, batch_id: &str) -> Result<Vec<UploadRecord>, DbError> {
        self.query_uploads("WHERE batch_id = ?1 ORDER BY submitted_at, id", batch_id)
    }

    pub fn owner_uploads(&self, owner_id: &str) -> Result<Vec<UploadRecord>, DbError> {
        self.query_uploads("WHERE owner_id = ?1 ORDER BY submitted_at DESC, id", owner_id)
    }

    pub fn owner_batches(&self, owner_id: &str) -> Result<Vec<BatchRecord>, DbError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {BATCH_COLUMNS} FROM batches WHERE owner_id = ?1 ORDER BY created_at DESC, id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([owner_id], batch_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn upload_status_counts(&self) -> Result<BTreeMap<String, u64>, DbError> {
        self.status_counts("SELECT status, COUNT(*) FROM uploads GROUP BY status")
    }

    pub fn batch_status_counts(&self) -> Result<BTreeMap<String, u64>, DbError> {
        self.status_counts("SELECT status, COUNT(*) FROM batches GROUP BY status")
    }

    fn query_uploads(&self, clause: &str, key: &str) -> Result<Vec<UploadRecord>, DbError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {UPLOAD_COLUMNS} FROM uploads {clause}");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([key], upload_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    fn status_counts(&self, sql: &str) -> Result<BTreeMap<String, u64>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            Ok(rows.collect::<Result<BTreeMap<_, _>, _>>()?)
        })
    }
}

fn insert_upload(conn: &Connection, upload: &UploadRecord) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO uploads (id, filename, file_type, submitted_at, origin, owner_id, storage_path,
                              content_hash, encrypted, status, failure_reason, batch_id, counted, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?4)",
        params![
            upload.id,
            upload.filename,
            upload.file_type,
            ts(upload.submitted_at),
            upload.origin,
            upload.owner_id,
            upload.storage_path,
            upload.content_hash,
            upload.encrypted,
            upload.status.as_str(),
            upload.failure_reason,
            upload.batch_id,
        ],
    )?;
    Ok(())
}

fn upsert_metadata(conn: &Connection, metadata: &DicomMetadataRecord) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO dicom_metadata (upload_id, conversion_ok, anonymization_ok, modified_tags, processed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(upload_id) DO UPDATE SET
             conversion_ok = excluded.conversion_ok,
             anonymization_ok = excluded.anonymization_ok,
             modified_tags = excluded.modified_tags,
             processed_at = excluded.processed_at",
        params![
            metadata.upload_id,
            metadata.conversion_ok,
            metadata.anonymization_ok,
            serde_json::to_string(&metadata.modified_tags)?,
            ts(metadata.processed_at),
        ],
    )?;
    Ok(())
}

fn upload_from_row(row: &Row<'_>) -> rusqlite::Result<UploadRecord> {
    Ok(UploadRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        file_type: row.get(2)?,
        submitted_at: ts_col(row, 3)?,
        origin: row.get(4)?,
        owner_id: row.get(5)?,
        storage_path: row.get(6)?,
        content_hash: row.get(7)?,
        encrypted: row.get(8)?,
        status: parse_col(row, 9)?,
        failure_reason: row.get(10)?,
        batch_id: row.get(11)?,
    })
}

pub(crate) fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<BatchRecord> {
    Ok(BatchRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        total_count: row.get(2)?,
        processed_count: row.get(3)?,
        failed_count: row.get(4)?,
        status: parse_col(row, 5)?,
        created_at: ts_col(row, 6)?,
        updated_at: ts_col(row, 7)?,
    })
}

fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<DicomMetadataRecord> {
    let raw_tags: String = row.get(3)?;
    let modified_tags = serde_json::from_str(&raw_tags)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(DicomMetadataRecord {
        upload_id: row.get(0)?,
        conversion_ok: row.get(1)?,
        anonymization_ok: row.get(2)?,
        modified_tags,
        processed_at: ts_col(row, 4)?,
    })
}

pub(crate) fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Capped so the expiry still formats as a four-digit year.
const MAX_LEASE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease.min(MAX_LEASE))
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(now)
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
