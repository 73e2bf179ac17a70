//
// job.rs
// Dicom-Intake-rs
//
// Unit of work handed to a dispatcher: one upload, its routing fields and the raw payload.
//
// Thales Matheus Mendonça Santos - November 2025

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::UploadRecord;

/// Serializable part of a job travels as a JSON envelope; the payload travels beside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub upload_id: String,
    pub batch_id: Option<String>,
    pub filename: String,
    pub content_type: Option<String>,
    pub owner_id: Option<String>,
    pub origin: Option<String>,
    #[serde(skip)]
    pub payload: Vec<u8>,
}

impl Job {
    pub fn for_upload(upload: &UploadRecord, content_type: Option<String>, payload: Vec<u8>) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            upload_id: upload.id.clone(),
            batch_id: upload.batch_id.clone(),
            filename: upload.filename.clone(),
            content_type,
            owner_id: upload.owner_id.clone(),
            origin: upload.origin.clone(),
            payload,
        }
    }

    pub fn envelope(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_envelope(envelope: &str, payload: Vec<u8>) -> Result<Self, serde_json::Error> {
        let mut job: Job = serde_json::from_str(envelope)?;
        job.payload = payload;
        Ok(job)
    }
}
