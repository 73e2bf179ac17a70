//
// service.rs
// Dicom-Intake-rs
//
// Ingress facade: records uploads and batches, hands jobs to the dispatcher and answers status queries.
//
// Thales Matheus Mendonça Santos - November 2025

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLog, Outcome, Stage};
use crate::config::Config;
use crate::db::{Database, DbError};
use crate::dispatch::{self, DispatchError, DispatchMode, Dispatcher};
use crate::job::Job;
use crate::models::{
    BatchRecord, BatchView, HealthReport, IntakeStats, UploadRecord, UploadStatus, UploadView,
};
use crate::persist::PersistenceWriter;
use crate::pipeline::{JobRunner, Stages};
use crate::seal::SealedArtifact;
use crate::status::{QueryError, StatusService};
use crate::storage::FileStore;
use crate::validate::{detect_kind, ValidationError};

/// One file handed to the service.
#[derive(Debug, Clone)]
pub struct FileSubmission {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub owner_id: Option<String>,
    /// Network address of the caller.
    pub origin: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BatchFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct BatchSubmission {
    pub files: Vec<BatchFile>,
    pub owner_id: Option<String>,
    pub origin: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("intake is not accepting new files")]
    NotAccepting,
    #[error("upload {upload_id} rejected: {source}")]
    Rejected {
        upload_id: String,
        #[source]
        source: ValidationError,
    },
    #[error("batch contains no files")]
    EmptyBatch,
    #[error("batch of {files} files exceeds the limit of {limit}")]
    BatchTooLarge { files: usize, limit: usize },
    #[error("upload {upload_id} could not be dispatched: {source}")]
    Dispatch {
        upload_id: String,
        #[source]
        source: DispatchError,
    },
    #[error(transparent)]
    Database(#[from] DbError),
}

const RECOVERY_ACTOR: &str = "system:recovery";

/// What startup reconciliation changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Non-terminal uploads failed because their job died with an earlier process.
    pub abandoned: usize,
    /// Terminal uploads whose batch counters had not moved.
    pub recounted: usize,
}

pub struct IntakeService {
    db: Arc<Database>,
    runner: Arc<JobRunner>,
    dispatcher: Arc<dyn Dispatcher>,
    status: StatusService,
    audit: AuditLog,
    accepting: AtomicBool,
}

impl IntakeService {
    /// Open storage, build the stages and pick the dispatch backend.
    pub fn from_config(config: &Config) -> Result<Self> {
        let db = Arc::new(
            Database::open(&config.storage.database).context("Failed to open intake database")?,
        );
        let store = FileStore::new(&config.storage.artifact_root)?;
        let runner = Arc::new(build_runner(config, db.clone(), store.clone())?);
        let dispatcher =
            dispatch::connect(config, runner.clone()).context("Failed to start job dispatcher")?;
        let service = Self::new(runner, store, dispatcher);
        let recovery = service
            .recover()
            .context("Failed to reconcile uploads left by an earlier run")?;
        if recovery != Recovery::default() {
            tracing::info!(
                abandoned = recovery.abandoned,
                recounted = recovery.recounted,
                "reconciled uploads left by an earlier run"
            );
        }
        Ok(service)
    }

    pub fn new(runner: Arc<JobRunner>, store: FileStore, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let db = runner.database().clone();
        Self {
            status: StatusService::new(db.clone(), store),
            audit: AuditLog::new(db.clone()),
            db,
            runner,
            dispatcher,
            accepting: AtomicBool::new(true),
        }
    }

    /// Record one upload and queue it. Files failing validation are recorded as
    /// `failed` (with an audit event) and reported back as `Rejected`.
    pub fn submit(&self, submission: FileSubmission) -> Result<String, SubmitError> {
        self.ensure_accepting()?;
        let FileSubmission {
            filename,
            content_type,
            bytes,
            owner_id,
            origin,
        } = submission;
        let upload_id = Uuid::new_v4().to_string();
        let actor = actor_for(owner_id.as_deref());

        let checked = self.runner.stages().validator.check(&bytes, content_type.as_deref(), &filename);
        let file_type = detect_kind(&bytes, content_type.as_deref(), &filename).map(|k| k.to_string());
        let mut record = UploadRecord::received(
            upload_id.clone(),
            filename,
            file_type,
            owner_id,
            origin,
            None,
        );

        if let Err(err) = checked {
            reject(&mut record, &err);
            self.db.insert_upload(&record)?;
            self.audit_rejection(&record, &err, &actor);
            return Err(SubmitError::Rejected {
                upload_id,
                source: err,
            });
        }

        self.db.insert_upload(&record)?;
        self.audit.emit(
            AuditEvent::upload(&upload_id, Stage::Ingress, Outcome::Accepted)
                .with_actor(&actor)
                .with_detail(format!("{} ({} bytes)", record.filename, bytes.len())),
        );
        tracing::info!(upload_id = %upload_id, filename = %record.filename, "upload accepted");

        let job = Job::for_upload(&record, content_type, bytes);
        if let Err(source) = self.dispatcher.dispatch(job) {
            self.runner.abandon(
                &upload_id,
                None,
                &format!("dispatch failed: {source}"),
                Outcome::Failure,
                &actor,
            );
            return Err(SubmitError::Dispatch { upload_id, source });
        }
        Ok(upload_id)
    }

    /// Record a batch and queue one job per file. Invalid files become failed
    /// members of the batch; they never block the rest.
    pub fn submit_batch(&self, submission: BatchSubmission) -> Result<String, SubmitError> {
        self.ensure_accepting()?;
        let files = submission.files.len();
        if files == 0 {
            return Err(SubmitError::EmptyBatch);
        }
        let limit = self.runner.stages().validator.max_batch_files();
        if files > limit {
            return Err(SubmitError::BatchTooLarge { files, limit });
        }
        let total = u32::try_from(files).map_err(|_| SubmitError::BatchTooLarge {
            files,
            limit: u32::MAX as usize,
        })?;

        let batch = BatchRecord::queued(Uuid::new_v4().to_string(), submission.owner_id.clone(), total);
        let actor = actor_for(submission.owner_id.as_deref());
        let validator = &self.runner.stages().validator;

        let mut uploads = Vec::with_capacity(submission.files.len());
        let mut jobs = Vec::new();
        let mut rejected = Vec::new();
        for file in submission.files {
            let file_type = detect_kind(&file.bytes, file.content_type.as_deref(), &file.filename)
                .map(|k| k.to_string());
            let mut record = UploadRecord::received(
                Uuid::new_v4().to_string(),
                file.filename,
                file_type,
                submission.owner_id.clone(),
                submission.origin.clone(),
                Some(batch.id.clone()),
            );
            match validator.check(&file.bytes, file.content_type.as_deref(), &record.filename) {
                Ok(_) => jobs.push(Job::for_upload(&record, file.content_type, file.bytes)),
                Err(err) => {
                    reject(&mut record, &err);
                    rejected.push((record.id.clone(), err));
                }
            }
            uploads.push(record);
        }

        self.db.insert_batch(&batch, &uploads)?;
        tracing::info!(
            batch_id = %batch.id,
            files = total,
            rejected = rejected.len(),
            "batch accepted"
        );

        for record in &uploads {
            match rejected.iter().find(|(id, _)| *id == record.id) {
                Some((_, err)) => self.audit_rejection(record, err, &actor),
                None => self.audit.emit(
                    AuditEvent::upload(&record.id, Stage::Ingress, Outcome::Accepted)
                        .with_batch(Some(&batch.id))
                        .with_actor(&actor)
                        .with_detail(record.filename.clone()),
                ),
            }
        }
        for (upload_id, _) in &rejected {
            if let Err(err) = self.runner.tracker().record_terminal(upload_id) {
                tracing::error!(upload_id = %upload_id, error = %err, "could not count rejected upload");
            }
        }

        for job in jobs {
            let upload_id = job.upload_id.clone();
            if let Err(err) = self.dispatcher.dispatch(job) {
                self.runner.abandon(
                    &upload_id,
                    Some(&batch.id),
                    &format!("dispatch failed: {err}"),
                    Outcome::Failure,
                    &actor,
                );
            }
        }

        Ok(batch.id)
    }

    /// Settle what an earlier run left behind. Terminal uploads that missed their batch
    /// update are counted. In local mode the queued jobs died with that process, so every
    /// upload nobody holds is failed and counted; queue mode leaves them to the broker.
    pub fn recover(&self) -> Result<Recovery, DbError> {
        let mut recovery = Recovery::default();
        if self.dispatcher.mode() == DispatchMode::Local {
            for upload in self.db.unheld_uploads()? {
                self.runner.abandon(
                    &upload.id,
                    upload.batch_id.as_deref(),
                    "interrupted: the process running this upload stopped",
                    Outcome::Failure,
                    RECOVERY_ACTOR,
                );
                recovery.abandoned += 1;
            }
        }
        for upload_id in self.db.uncounted_terminal_uploads()? {
            self.runner.recount(&upload_id);
            recovery.recounted += 1;
        }
        Ok(recovery)
    }

    pub fn get_upload_status(&self, upload_id: &str) -> Result<UploadView, QueryError> {
        self.status.upload(upload_id)
    }

    pub fn get_batch_status(&self, batch_id: &str) -> Result<BatchView, QueryError> {
        self.status.batch(batch_id)
    }

    pub fn get_batch_files(&self, batch_id: &str) -> Result<Vec<UploadView>, QueryError> {
        self.status.batch_files(batch_id)
    }

    pub fn get_sealed_artifact(&self, upload_id: &str) -> Result<SealedArtifact, QueryError> {
        self.status.sealed_artifact(upload_id)
    }

    /// Decrypted, hash-verified Part 10 bytes of a completed upload.
    pub fn export_artifact(&self, upload_id: &str) -> Result<Vec<u8>, QueryError> {
        self.status
            .unsealed_artifact(upload_id, &self.runner.stages().sealer)
    }

    pub fn owner_uploads(&self, owner_id: &str) -> Result<Vec<UploadView>, QueryError> {
        self.status.owner_uploads(owner_id)
    }

    pub fn owner_batches(&self, owner_id: &str) -> Result<Vec<BatchView>, QueryError> {
        self.status.owner_batches(owner_id)
    }

    pub fn stats(&self) -> Result<IntakeStats, QueryError> {
        self.status.stats()
    }

    pub fn health(&self) -> HealthReport {
        let mode = self.dispatcher.mode();
        HealthReport {
            database: self.db.ping(),
            broker: (mode == DispatchMode::Queue).then(|| self.dispatcher.healthy()),
            mode: mode.to_string(),
            accepting: self.is_accepting(),
        }
    }

    /// Refuse new submissions. Jobs already accepted still run.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Relaxed);
        tracing::info!("intake stopped accepting new files");
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    /// Stop accepting and let the dispatcher finish what it holds.
    pub fn shutdown(&self) {
        self.stop_accepting();
        self.dispatcher.shutdown();
    }

    fn ensure_accepting(&self) -> Result<(), SubmitError> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(SubmitError::NotAccepting)
        }
    }

    fn audit_rejection(&self, record: &UploadRecord, err: &ValidationError, actor: &str) {
        tracing::info!(upload_id = %record.id, reason = err.code(), "upload rejected");
        self.audit.emit(
            AuditEvent::upload(&record.id, Stage::Validation, Outcome::Rejected)
                .with_batch(record.batch_id.as_deref())
                .with_actor(actor)
                .with_detail(format!("{}: {err}", err.code())),
        );
    }
}

/// Wire the pipeline stages to the artifact store and database.
pub fn build_runner(config: &Config, db: Arc<Database>, store: FileStore) -> Result<JobRunner> {
    let stages = Stages::from_config(config).context("Invalid sealing configuration")?;
    let writer = PersistenceWriter::new(store, db.clone());
    Ok(JobRunner::new(
        stages,
        Arc::new(writer),
        db,
        config.dispatch.clone(),
    ))
}

fn reject(record: &mut UploadRecord, err: &ValidationError) {
    record.status = UploadStatus::Failed;
    record.failure_reason = Some(format!("validation failed ({}): {err}", err.code()));
}

fn actor_for(owner_id: Option<&str>) -> String {
    owner_id.map_or_else(|| "anonymous".to_string(), |owner| format!("user:{owner}"))
}
