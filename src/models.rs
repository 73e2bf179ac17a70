//
// models.rs
// Dicom-Intake-rs
//
// Serializable records for uploads, batches and DICOM metadata, plus the read-only views returned to callers.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("unknown status {0:?}")]
pub struct UnknownStatus(pub String);

/// Lifecycle of one uploaded file. `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Received,
    Processing,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Received => "received",
            UploadStatus::Processing => "processing",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(UploadStatus::Received),
            "processing" => Ok(UploadStatus::Processing),
            "completed" => Ok(UploadStatus::Completed),
            "failed" => Ok(UploadStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Lifecycle of a batch. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(BatchStatus::Queued),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: String,
    pub filename: String,
    /// Detected kind (`png`, `dicom`, ...); unset when detection failed.
    pub file_type: Option<String>,
    pub submitted_at: DateTime<Utc>,
    /// Network address the upload came from.
    pub origin: Option<String>,
    pub owner_id: Option<String>,
    /// Artifact name inside the file store.
    pub storage_path: Option<String>,
    /// Hex SHA-256 of the cleartext artifact.
    pub content_hash: Option<String>,
    pub encrypted: bool,
    pub status: UploadStatus,
    pub failure_reason: Option<String>,
    pub batch_id: Option<String>,
}

impl UploadRecord {
    /// A freshly received upload.
    pub fn received(
        id: impl Into<String>,
        filename: impl Into<String>,
        file_type: Option<String>,
        owner_id: Option<String>,
        origin: Option<String>,
        batch_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            file_type,
            submitted_at: Utc::now(),
            origin,
            owner_id,
            storage_path: None,
            content_hash: None,
            encrypted: false,
            status: UploadStatus::Received,
            failure_reason: None,
            batch_id,
        }
    }
}

/// What the pipeline learned about a file once anonymization was attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DicomMetadataRecord {
    pub upload_id: String,
    pub conversion_ok: bool,
    pub anonymization_ok: bool,
    /// Tags removed or replaced, in rule order.
    pub modified_tags: Vec<String>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: String,
    pub owner_id: Option<String>,
    pub total_count: u32,
    pub processed_count: u32,
    pub failed_count: u32,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchRecord {
    pub fn queued(id: impl Into<String>, owner_id: Option<String>, total_count: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_id,
            total_count,
            processed_count: 0,
            failed_count: 0,
            status: BatchStatus::Queued,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Status of one upload as shown to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadView {
    pub upload_id: String,
    pub filename: String,
    pub file_type: Option<String>,
    pub status: UploadStatus,
    pub failure_reason: Option<String>,
    pub content_hash: Option<String>,
    pub encrypted: bool,
    pub batch_id: Option<String>,
    pub owner_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub metadata: Option<DicomMetadataRecord>,
}

impl UploadView {
    pub fn new(record: UploadRecord, metadata: Option<DicomMetadataRecord>) -> Self {
        Self {
            upload_id: record.id,
            filename: record.filename,
            file_type: record.file_type,
            status: record.status,
            failure_reason: record.failure_reason,
            content_hash: record.content_hash,
            encrypted: record.encrypted,
            batch_id: record.batch_id,
            owner_id: record.owner_id,
            submitted_at: record.submitted_at,
            metadata,
        }
    }
}

/// Progress of a batch as shown to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchView {
    pub batch_id: String,
    pub owner_id: Option<String>,
    pub status: BatchStatus,
    pub total_count: u32,
    pub processed_count: u32,
    pub failed_count: u32,
    pub progress_percentage: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<BatchRecord> for BatchView {
    fn from(batch: BatchRecord) -> Self {
        let progress_percentage = if batch.total_count == 0 {
            0.0
        } else {
            f64::from(batch.processed_count) / f64::from(batch.total_count) * 100.0
        };
        Self {
            batch_id: batch.id,
            owner_id: batch.owner_id,
            status: batch.status,
            total_count: batch.total_count,
            processed_count: batch.processed_count,
            failed_count: batch.failed_count,
            progress_percentage,
            created_at: batch.created_at,
            updated_at: batch.updated_at,
        }
    }
}

/// Totals per status across all uploads and batches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntakeStats {
    pub uploads_total: u64,
    pub uploads_by_status: BTreeMap<String, u64>,
    pub batches_total: u64,
    pub batches_by_status: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub database: bool,
    /// Unset when no broker is configured.
    pub broker: Option<bool>,
    /// `queue` or `local`.
    pub mode: String,
    pub accepting: bool,
}
