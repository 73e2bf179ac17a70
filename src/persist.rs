//
// persist.rs
// Dicom-Intake-rs
//
// Stores a sealed artifact and records it: file first, then the upload and metadata rows in one transaction.
//
// Thales Matheus Mendonça Santos - November 2025

use std::sync::Arc;

use crate::db::{Database, DbError};
use crate::models::DicomMetadataRecord;
use crate::seal::SealedArtifact;
use crate::storage::FileStore;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("artifact store failed: {0}")]
    Store(String),
    #[error("database write failed: {0}")]
    Database(#[from] DbError),
}

pub struct PersistRequest<'a> {
    pub upload_id: &'a str,
    /// Lease the upload is claimed under; a stale lease cannot complete it.
    pub lease_id: &'a str,
    pub sealed: &'a SealedArtifact,
    pub metadata: &'a DicomMetadataRecord,
}

/// Destination of sealed artifacts. Returns the stored artifact name.
pub trait ArtifactSink: Send + Sync {
    fn persist(&self, request: &PersistRequest<'_>) -> Result<String, PersistenceError>;
}

pub struct PersistenceWriter {
    store: FileStore,
    db: Arc<Database>,
}

impl PersistenceWriter {
    pub fn new(store: FileStore, db: Arc<Database>) -> Self {
        Self { store, db }
    }
}

impl ArtifactSink for PersistenceWriter {
    fn persist(&self, request: &PersistRequest<'_>) -> Result<String, PersistenceError> {
        let sealed = request.sealed;
        let name = self
            .store
            .save(request.upload_id, request.lease_id, sealed.encrypted, &sealed.bytes)
            .map_err(|e| PersistenceError::Store(format!("{e:#}")))?;

        if let Err(err) = self.db.complete_upload(
            request.upload_id,
            request.lease_id,
            &name,
            &sealed.content_hash,
            sealed.encrypted,
            request.metadata,
        ) {
            // The row never pointed at this file, and no other lease writes under its name.
            if let Err(cleanup) = self.store.remove(&name) {
                tracing::warn!(
                    upload_id = request.upload_id,
                    error = %format!("{cleanup:#}"),
                    "failed to remove orphaned artifact"
                );
            }
            return Err(err.into());
        }

        tracing::debug!(
            upload_id = request.upload_id,
            artifact = %name,
            bytes = sealed.bytes.len(),
            "artifact persisted"
        );
        Ok(name)
    }
}
