//
// status.rs
// Dicom-Intake-rs
//
// Read-only projections of persisted upload and batch state.
//
// Thales Matheus Mendonça Santos - November 2025

use std::sync::Arc;

use crate::db::{Database, DbError};
use crate::models::{BatchView, IntakeStats, UploadRecord, UploadStatus, UploadView};
use crate::seal::{self, SealError, SealedArtifact, Sealer, NONCE_LEN};
use crate::storage::FileStore;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("upload {0} not found")]
    UploadNotFound(String),
    #[error("batch {0} not found")]
    BatchNotFound(String),
    #[error("upload {upload_id} is {status}; no artifact is available")]
    NotReady {
        upload_id: String,
        status: UploadStatus,
    },
    #[error("artifact of upload {0} does not match its recorded hash")]
    Integrity(String),
    #[error("artifact store: {0}")]
    Store(String),
    #[error(transparent)]
    Seal(#[from] SealError),
    #[error(transparent)]
    Database(#[from] DbError),
}

#[derive(Clone)]
pub struct StatusService {
    db: Arc<Database>,
    store: FileStore,
}

impl StatusService {
    pub fn new(db: Arc<Database>, store: FileStore) -> Self {
        Self { db, store }
    }

    pub fn upload(&self, upload_id: &str) -> Result<UploadView, QueryError> {
        let record = self.upload_record(upload_id)?;
        let metadata = self.db.metadata(upload_id)?;
        Ok(UploadView::new(record, metadata))
    }

    pub fn batch(&self, batch_id: &str) -> Result<BatchView, QueryError> {
        self.db
            .batch(batch_id)?
            .map(BatchView::from)
            .ok_or_else(|| QueryError::BatchNotFound(batch_id.to_string()))
    }

    pub fn batch_files(&self, batch_id: &str) -> Result<Vec<UploadView>, QueryError> {
        if self.db.batch(batch_id)?.is_none() {
            return Err(QueryError::BatchNotFound(batch_id.to_string()));
        }
        self.views(self.db.batch_uploads(batch_id)?)
    }

    pub fn owner_uploads(&self, owner_id: &str) -> Result<Vec<UploadView>, QueryError> {
        self.views(self.db.owner_uploads(owner_id)?)
    }

    pub fn owner_batches(&self, owner_id: &str) -> Result<Vec<BatchView>, QueryError> {
        Ok(self
            .db
            .owner_batches(owner_id)?
            .into_iter()
            .map(BatchView::from)
            .collect())
    }

    pub fn stats(&self) -> Result<IntakeStats, QueryError> {
        let uploads_by_status = self.db.upload_status_counts()?;
        let batches_by_status = self.db.batch_status_counts()?;
        Ok(IntakeStats {
            uploads_total: uploads_by_status.values().sum(),
            batches_total: batches_by_status.values().sum(),
            uploads_by_status,
            batches_by_status,
        })
    }

    /// Stored artifact of a completed upload, as written (ciphertext when encrypted).
    pub fn sealed_artifact(&self, upload_id: &str) -> Result<SealedArtifact, QueryError> {
        let record = self.upload_record(upload_id)?;
        let (Some(path), Some(hash)) = (
            record.storage_path.as_deref().filter(|_| record.status == UploadStatus::Completed),
            record.content_hash.clone(),
        ) else {
            return Err(QueryError::NotReady {
                upload_id: upload_id.to_string(),
                status: record.status,
            });
        };

        let bytes = self
            .store
            .read(path)
            .map_err(|e| QueryError::Store(format!("{e:#}")))?;
        let nonce = (record.encrypted && bytes.len() >= NONCE_LEN).then(|| hex::encode(&bytes[..NONCE_LEN]));
        Ok(SealedArtifact {
            bytes,
            content_hash: hash,
            encrypted: record.encrypted,
            nonce,
        })
    }

    /// Cleartext Part 10 bytes of a completed upload, checked against the recorded hash.
    pub fn unsealed_artifact(&self, upload_id: &str, sealer: &Sealer) -> Result<Vec<u8>, QueryError> {
        let artifact = self.sealed_artifact(upload_id)?;
        let clear = sealer.unseal(&artifact.bytes, artifact.encrypted)?;
        if !seal::verify(&clear, &artifact.content_hash) {
            return Err(QueryError::Integrity(upload_id.to_string()));
        }
        Ok(clear)
    }

    fn upload_record(&self, upload_id: &str) -> Result<UploadRecord, QueryError> {
        self.db
            .upload(upload_id)?
            .ok_or_else(|| QueryError::UploadNotFound(upload_id.to_string()))
    }

    fn views(&self, records: Vec<UploadRecord>) -> Result<Vec<UploadView>, QueryError> {
        records
            .into_iter()
            .map(|record| {
                let metadata = self.db.metadata(&record.id)?;
                Ok(UploadView::new(record, metadata))
            })
            .collect()
    }
}
