//
// pipeline.rs
// Dicom-Intake-rs
//
// Runs one job through validation, conversion, anonymization, sealing and persistence, retrying transient
// failures, then records the terminal status, the audit trail and the batch counters.
//
// Thales Matheus Mendonça Santos - November 2025

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::anonymize::{AnonymizationError, Anonymizer};
use crate::audit::{AuditEvent, AuditLog, Outcome, Stage};
use crate::config::{Config, DispatchConfig};
use crate::convert::{ConversionError, Converter};
use crate::db::{Claim, Database, DbError};
use crate::job::Job;
use crate::models::DicomMetadataRecord;
use crate::persist::{ArtifactSink, PersistRequest, PersistenceError};
use crate::seal::{SealError, Sealer};
use crate::tracker::BatchTracker;
use crate::validate::{ValidationError, Validator};

/// Slack on top of the worst-case run time before a lease counts as abandoned.
const LEASE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("validation failed ({}): {0}", .0.code())]
    Validation(#[from] ValidationError),
    #[error("conversion failed: {0}")]
    Conversion(#[from] ConversionError),
    #[error("anonymization failed: {0}")]
    Anonymization(#[from] AnonymizationError),
    #[error("sealing failed: {0}")]
    Seal(#[from] SealError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("attempt exceeded its {limit_secs}s deadline ({stage})")]
    Timeout { stage: Stage, limit_secs: u64 },
    #[error("worker panicked: {0}")]
    Panic(String),
    #[error("could not start attempt thread: {0}")]
    Spawn(String),
    #[error("upload lease was taken over")]
    LeaseLost,
}

/// What the runner does with a failed attempt. `Fatal` records the file as failed, then stops the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Terminal,
    Retry,
    Fatal,
}

impl StageError {
    pub fn stage(&self) -> Stage {
        match self {
            StageError::Validation(_) => Stage::Validation,
            StageError::Conversion(_) => Stage::Conversion,
            StageError::Anonymization(_) => Stage::Anonymization,
            StageError::Seal(_) => Stage::Sealing,
            StageError::Persistence(_) => Stage::Persistence,
            StageError::Timeout { stage, .. } => *stage,
            StageError::Panic(_) | StageError::Spawn(_) | StageError::LeaseLost => Stage::Pipeline,
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            StageError::Seal(SealError::MissingKey(_) | SealError::InvalidKey(_) | SealError::NoKey) => {
                Disposition::Fatal
            }
            StageError::Persistence(_) | StageError::Timeout { .. } | StageError::Spawn(_) => {
                Disposition::Retry
            }
            StageError::Validation(_)
            | StageError::Conversion(_)
            | StageError::Anonymization(_)
            | StageError::Seal(_)
            | StageError::Panic(_)
            | StageError::LeaseLost => Disposition::Terminal,
        }
    }
}

/// A job the worker cannot survive; the upload has already been recorded as failed.
#[derive(Debug, thiserror::Error)]
#[error("fatal error while processing upload {upload_id}: {source}")]
pub struct FatalError {
    pub upload_id: String,
    #[source]
    pub source: StageError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { content_hash: String, attempts: u32 },
    Failed { reason: String, attempts: u32 },
    /// The upload was already terminal (redelivery) or no longer exists.
    Skipped,
    /// Another worker holds a live lease on the upload. The job was not run.
    InProgress,
}

/// The stateless stage objects, shared by every worker.
#[derive(Debug, Clone)]
pub struct Stages {
    pub validator: Validator,
    pub converter: Converter,
    pub anonymizer: Anonymizer,
    pub sealer: Arc<Sealer>,
}

impl Stages {
    /// Build every stage from configuration. A bad sealing key stops startup here.
    pub fn from_config(config: &Config) -> Result<Self, SealError> {
        Ok(Self {
            validator: Validator::new(&config.validation),
            converter: Converter::new(&config.conversion),
            anonymizer: Anonymizer::new(config.anonymizer.rules.clone()),
            sealer: Arc::new(Sealer::from_config(&config.sealing)?),
        })
    }
}

/// Wall-clock budget of one attempt, checked between stages.
struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    fn start(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    fn check(&self, next: Stage) -> Result<(), StageError> {
        if self.started.elapsed() > self.limit {
            return Err(StageError::Timeout {
                stage: next,
                limit_secs: self.limit.as_secs(),
            });
        }
        Ok(())
    }
}

struct AttemptFailure {
    error: StageError,
    /// Set once the anonymizer ran.
    metadata: Option<DicomMetadataRecord>,
}

impl From<StageError> for AttemptFailure {
    fn from(error: StageError) -> Self {
        Self {
            error,
            metadata: None,
        }
    }
}

struct Processed {
    content_hash: String,
}

struct Attempt {
    stages: Arc<Stages>,
    sink: Arc<dyn ArtifactSink>,
    audit: AuditLog,
    job: Arc<Job>,
    lease_id: String,
    actor: String,
}

impl Attempt {
    fn run(&self, deadline: &Deadline) -> Result<Processed, AttemptFailure> {
        let job = &*self.job;
        let stages = &*self.stages;
        let trail = |stage: Stage, detail: String| {
            debug!(%stage, %detail, "stage done");
            self.audit.emit(
                AuditEvent::upload(&job.upload_id, stage, Outcome::Success)
                    .with_batch(job.batch_id.as_deref())
                    .with_actor(&self.actor)
                    .with_detail(detail),
            );
        };

        let kind = stages
            .validator
            .check(&job.payload, job.content_type.as_deref(), &job.filename)
            .map_err(StageError::from)?;
        trail(Stage::Validation, format!("accepted as {kind}"));

        deadline.check(Stage::Conversion)?;
        let mut obj = stages
            .converter
            .convert(&job.payload, kind, &job.upload_id)
            .map_err(StageError::from)?;
        trail(Stage::Conversion, format!("{kind} converted to DICOM"));

        deadline.check(Stage::Anonymization)?;
        let modified_tags = match stages.anonymizer.apply(&mut obj) {
            Ok(tags) => tags,
            Err(err) => {
                return Err(AttemptFailure {
                    error: err.into(),
                    metadata: Some(metadata_record(&job.upload_id, false, Vec::new())),
                })
            }
        };
        trail(
            Stage::Anonymization,
            format!("{} tag(s) modified", modified_tags.len()),
        );

        let metadata = metadata_record(&job.upload_id, true, modified_tags);
        let with_metadata = |error: StageError| AttemptFailure {
            error,
            metadata: Some(metadata.clone()),
        };

        deadline.check(Stage::Sealing).map_err(with_metadata)?;
        let sealed = stages
            .sealer
            .seal(&obj)
            .map_err(|e| with_metadata(e.into()))?;
        trail(
            Stage::Sealing,
            format!("sha256 {} (encrypted: {})", sealed.content_hash, sealed.encrypted),
        );

        deadline.check(Stage::Persistence).map_err(with_metadata)?;
        let storage_path = self
            .sink
            .persist(&PersistRequest {
                upload_id: &job.upload_id,
                lease_id: &self.lease_id,
                sealed: &sealed,
                metadata: &metadata,
            })
            .map_err(|e| with_metadata(e.into()))?;
        trail(Stage::Persistence, format!("stored as {storage_path}"));

        Ok(Processed {
            content_hash: sealed.content_hash,
        })
    }
}

pub struct JobRunner {
    stages: Arc<Stages>,
    sink: Arc<dyn ArtifactSink>,
    db: Arc<Database>,
    tracker: BatchTracker,
    audit: AuditLog,
    dispatch: DispatchConfig,
}

impl JobRunner {
    pub fn new(
        stages: Stages,
        sink: Arc<dyn ArtifactSink>,
        db: Arc<Database>,
        dispatch: DispatchConfig,
    ) -> Self {
        Self {
            tracker: BatchTracker::new(db.clone(), dispatch.batch_policy),
            audit: AuditLog::new(db.clone()),
            stages: Arc::new(stages),
            sink,
            db,
            dispatch,
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn tracker(&self) -> &BatchTracker {
        &self.tracker
    }

    pub fn stages(&self) -> &Stages {
        &self.stages
    }

    /// Process `job` to a terminal outcome, audited and counted.
    pub fn run(&self, job: &Job, actor: &str) -> Result<JobOutcome, FatalError> {
        let span = tracing::info_span!(
            "job",
            upload_id = %job.upload_id,
            batch_id = job.batch_id.as_deref().unwrap_or("-"),
        );
        let _enter = span.enter();

        let mut lease_id = new_lease_id();
        match self.claim(&job.upload_id, &lease_id) {
            Ok(Claim::Claimed) => {}
            Ok(Claim::Busy) => {
                debug!("upload is held by another worker");
                return Ok(JobOutcome::InProgress);
            }
            Ok(Claim::Terminal(status)) => {
                debug!(%status, "upload already terminal, skipping");
                self.count(&job.upload_id);
                return Ok(JobOutcome::Skipped);
            }
            Ok(Claim::Missing) => {
                warn!("upload record not found, dropping job");
                return Ok(JobOutcome::Skipped);
            }
            Err(err) => {
                let reason = format!("could not claim upload: {err}");
                self.abandon(&job.upload_id, job.batch_id.as_deref(), &reason, Outcome::Failure, actor);
                return Ok(JobOutcome::Failed { reason, attempts: 0 });
            }
        }

        if let Some(batch_id) = &job.batch_id {
            if let Err(err) = self.tracker.mark_processing(batch_id) {
                warn!(error = %err, "could not mark batch as processing");
            }
        }

        let shared = Arc::new(job.clone());
        let mut retries = 0u32;
        let result = loop {
            match self.run_attempt(&shared, &mut lease_id, actor) {
                Err(failure)
                    if failure.error.disposition() == Disposition::Retry
                        && retries < self.dispatch.max_retries =>
                {
                    let delay = self.dispatch.backoff(retries);
                    retries += 1;
                    warn!(
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.error,
                        "transient failure, retrying"
                    );
                    self.audit.emit(
                        AuditEvent::upload(&job.upload_id, failure.error.stage(), Outcome::Retry)
                            .with_batch(job.batch_id.as_deref())
                            .with_actor(actor)
                            .with_detail(format!("attempt {retries}: {}", failure.error)),
                    );
                    thread::sleep(delay);
                }
                other => break other,
            }
        };
        let attempts = retries + 1;

        match result {
            Ok(processed) => {
                info!(attempts, hash = %processed.content_hash, "upload completed");
                self.audit.emit(
                    AuditEvent::upload(&job.upload_id, Stage::Pipeline, Outcome::Success)
                        .with_batch(job.batch_id.as_deref())
                        .with_actor(actor)
                        .with_detail(format!("completed after {attempts} attempt(s)")),
                );
                self.count(&job.upload_id);
                Ok(JobOutcome::Completed {
                    content_hash: processed.content_hash,
                    attempts,
                })
            }
            Err(failure) if matches!(failure.error, StageError::LeaseLost) => {
                warn!(attempts, "lease lost to a late attempt or another worker");
                self.count(&job.upload_id);
                Ok(JobOutcome::Skipped)
            }
            Err(failure) => {
                let reason = failure.error.to_string();
                error!(attempts, stage = %failure.error.stage(), %reason, "upload failed");
                self.settle_failure(
                    job,
                    &lease_id,
                    &reason,
                    failure.metadata.as_ref(),
                    failure.error.stage(),
                    actor,
                );

                if failure.error.disposition() == Disposition::Fatal {
                    return Err(FatalError {
                        upload_id: job.upload_id.clone(),
                        source: failure.error,
                    });
                }
                Ok(JobOutcome::Failed { reason, attempts })
            }
        }
    }

    /// Give up on a job that will never run (dead letter, dispatch failure, shutdown, restart).
    /// An upload another worker still holds is left alone.
    pub fn abandon(
        &self,
        upload_id: &str,
        batch_id: Option<&str>,
        reason: &str,
        outcome: Outcome,
        actor: &str,
    ) {
        warn!(upload_id, reason, "abandoning job");
        match self.db.fail_upload(upload_id, None, reason, None) {
            Ok(true) => {
                self.audit.emit(
                    AuditEvent::upload(upload_id, Stage::Dispatch, outcome)
                        .with_batch(batch_id)
                        .with_actor(actor)
                        .with_detail(reason),
                );
            }
            Ok(false) => debug!(upload_id, "upload already terminal or held"),
            Err(err) => error!(upload_id, error = %err, "could not record abandoned upload"),
        }
        self.count(upload_id);
    }

    /// Count a terminal upload that missed its batch update.
    pub fn recount(&self, upload_id: &str) {
        self.count(upload_id);
    }

    fn claim(&self, upload_id: &str, lease_id: &str) -> Result<Claim, DbError> {
        let lease = self.dispatch.worst_case_job_time().saturating_add(LEASE_GRACE);
        let mut retries = 0u32;
        loop {
            match self.db.claim_upload(upload_id, lease_id, lease) {
                Err(err) if retries < self.dispatch.max_retries => {
                    warn!(error = %err, "could not claim upload, retrying");
                    thread::sleep(self.dispatch.backoff(retries));
                    retries += 1;
                }
                other => return other,
            }
        }
    }

    /// One attempt on a helper thread, waited on for at most the job timeout.
    ///
    /// An attempt still running at the deadline is left behind and its lease is rotated,
    /// so whatever it writes later is rejected.
    fn run_attempt(&self, job: &Arc<Job>, lease_id: &mut String, actor: &str) -> Result<Processed, AttemptFailure> {
        let limit = self.dispatch.job_timeout();
        let attempt = Attempt {
            stages: Arc::clone(&self.stages),
            sink: Arc::clone(&self.sink),
            audit: self.audit.clone(),
            job: Arc::clone(job),
            lease_id: lease_id.clone(),
            actor: actor.to_string(),
        };
        let (tx, rx) = bounded(1);
        let parent = tracing::Span::current();

        thread::Builder::new()
            .name("intake-attempt".to_string())
            .spawn(move || {
                let _enter = parent.enter();
                let deadline = Deadline::start(limit);
                let result = panic::catch_unwind(AssertUnwindSafe(|| attempt.run(&deadline)))
                    .unwrap_or_else(|payload| Err(StageError::Panic(panic_message(payload)).into()));
                let _ = tx.send(result);
            })
            .map_err(|e| StageError::Spawn(e.to_string()))?;

        match rx.recv_timeout(limit) {
            Ok(result) => result,
            Err(RecvTimeoutError::Disconnected) => {
                Err(StageError::Panic("attempt thread ended without a result".to_string()).into())
            }
            Err(RecvTimeoutError::Timeout) => {
                let next = new_lease_id();
                match self.db.rotate_lease(&job.upload_id, lease_id, &next) {
                    Ok(true) => *lease_id = next,
                    Ok(false) => return Err(StageError::LeaseLost.into()),
                    Err(err) => warn!(error = %err, "could not rotate lease after timeout"),
                }
                Err(StageError::Timeout {
                    stage: Stage::Pipeline,
                    limit_secs: limit.as_secs(),
                }
                .into())
            }
        }
    }

    fn settle_failure(
        &self,
        job: &Job,
        lease_id: &str,
        reason: &str,
        metadata: Option<&DicomMetadataRecord>,
        stage: Stage,
        actor: &str,
    ) {
        match self.db.fail_upload(&job.upload_id, Some(lease_id), reason, metadata) {
            Ok(true) => self.audit.emit(
                AuditEvent::upload(&job.upload_id, stage, Outcome::Failure)
                    .with_batch(job.batch_id.as_deref())
                    .with_actor(actor)
                    .with_detail(reason),
            ),
            Ok(false) => warn!("lease lost before the failure was recorded"),
            Err(err) => error!(error = %err, "could not record failed upload"),
        }
        self.count(&job.upload_id);
    }

    fn count(&self, upload_id: &str) {
        let mut retries = 0u32;
        loop {
            match self.tracker.record_terminal(upload_id) {
                Ok(_) => return,
                Err(err) if retries < self.dispatch.max_retries => {
                    warn!(upload_id, error = %err, "could not update batch counters, retrying");
                    thread::sleep(self.dispatch.backoff(retries));
                    retries += 1;
                }
                Err(err) => {
                    error!(upload_id, error = %err, "giving up on batch counter update");
                    return;
                }
            }
        }
    }
}

fn new_lease_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn metadata_record(upload_id: &str, anonymization_ok: bool, modified_tags: Vec<String>) -> DicomMetadataRecord {
    DicomMetadataRecord {
        upload_id: upload_id.to_string(),
        conversion_ok: true,
        anonymization_ok,
        modified_tags,
        processed_at: Utc::now(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
