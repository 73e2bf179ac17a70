//
// batch_processing.rs
// Dicom-Intake-rs
//
// End-to-end tests over the intake service: failure isolation, retry bounds, exactly-once counting, both dispatch
// modes and the fault paths (panics, hung attempts, redelivery, dead letters, restarts).
//
// Thales Matheus Mendonça Santos - November 2025

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dicom_intake::audit::AuditLog;
use dicom_intake::config::{BatchPolicy, Config};
use dicom_intake::db::Database;
use dicom_intake::dispatch::DispatchMode;
use dicom_intake::job::Job;
use dicom_intake::models::{BatchRecord, BatchStatus, BatchView, UploadRecord, UploadStatus};
use dicom_intake::persist::{ArtifactSink, PersistRequest, PersistenceError, PersistenceWriter};
use dicom_intake::pipeline::{JobOutcome, JobRunner, Stages};
use dicom_intake::queue::{BrokerQueue, ConsumerSettings, QueueConsumer};
use dicom_intake::seal;
use dicom_intake::service::{
    self, BatchFile, BatchSubmission, FileSubmission, IntakeService, Recovery, SubmitError,
};
use dicom_intake::status::QueryError;
use dicom_intake::storage::FileStore;
use dicom_intake::tracker::BatchTracker;
use tempfile::tempdir;

use common::{patient_dicom_bytes, png_bytes, test_config, truncated_png_bytes, wait_for};

const LIMIT: Duration = Duration::from_secs(30);

fn png_file(name: &str) -> BatchFile {
    BatchFile {
        filename: name.to_string(),
        content_type: Some("image/png".to_string()),
        bytes: png_bytes(8, 8),
    }
}

fn batch_of(files: Vec<BatchFile>, owner: &str) -> BatchSubmission {
    BatchSubmission {
        files,
        owner_id: Some(owner.to_string()),
        origin: Some("127.0.0.1".to_string()),
    }
}

/// Block until every member of the batch was counted.
fn wait_for_batch(service: &IntakeService, batch_id: &str) -> BatchView {
    wait_for(LIMIT, || {
        let view = service.get_batch_status(batch_id).expect("batch status");
        (view.processed_count == view.total_count).then_some(view)
    })
}

/// Transient store failures for the first `failures` calls, then the real writer.
struct FlakySink {
    inner: PersistenceWriter,
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl ArtifactSink for FlakySink {
    fn persist(&self, request: &PersistRequest<'_>) -> Result<String, PersistenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PersistenceError::Store("disk unavailable".into()));
        }
        self.inner.persist(request)
    }
}

fn flaky_runner(config: &Config, db: Arc<Database>, failures: u32) -> (JobRunner, Arc<FlakySink>) {
    let store = FileStore::new(&config.storage.artifact_root).expect("store");
    let sink = Arc::new(FlakySink {
        inner: PersistenceWriter::new(store, db.clone()),
        failures_left: AtomicU32::new(failures),
        calls: AtomicU32::new(0),
    });
    let stages = Stages::from_config(config).expect("stages");
    let runner = JobRunner::new(stages, sink.clone(), db, config.dispatch.clone());
    (runner, sink)
}

/// The real writer behind a hook that runs first on every call, given the 1-based call number.
struct HookedSink<F> {
    inner: PersistenceWriter,
    calls: AtomicU32,
    before: F,
}

impl<F: Fn(u32) + Send + Sync> ArtifactSink for HookedSink<F> {
    fn persist(&self, request: &PersistRequest<'_>) -> Result<String, PersistenceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.before)(call);
        self.inner.persist(request)
    }
}

fn hooked_runner<F>(config: &Config, db: Arc<Database>, before: F) -> (JobRunner, Arc<HookedSink<F>>)
where
    F: Fn(u32) + Send + Sync + 'static,
{
    let store = FileStore::new(&config.storage.artifact_root).expect("store");
    let sink = Arc::new(HookedSink {
        inner: PersistenceWriter::new(store, db.clone()),
        calls: AtomicU32::new(0),
        before,
    });
    let stages = Stages::from_config(config).expect("stages");
    let runner = JobRunner::new(stages, sink.clone(), db, config.dispatch.clone());
    (runner, sink)
}

fn queue_config(dir: &std::path::Path) -> (Config, String) {
    let mut config = test_config(dir);
    let broker_url = format!("sqlite:{}", dir.join("broker.db").display());
    config.broker.url = Some(broker_url.clone());
    config.broker.required = true;
    (config, broker_url)
}

/// One upload inside a one-file batch, ready to run.
fn queued_job(db: &Database, batch_id: &str) -> Job {
    let record = UploadRecord::received(
        format!("{batch_id}-upload"),
        "scan.png",
        Some("png".into()),
        None,
        None,
        Some(batch_id.to_string()),
    );
    db.insert_batch(&BatchRecord::queued(batch_id, None, 1), std::slice::from_ref(&record))
        .expect("insert batch");
    Job::for_upload(&record, Some("image/png".into()), png_bytes(8, 8))
}

#[test]
fn malformed_file_fails_alone_and_the_batch_completes() {
    let dir = tempdir().expect("tmpdir");
    let service = IntakeService::from_config(&test_config(dir.path())).expect("service");
    assert_eq!(service.health().mode, DispatchMode::Local.as_str());

    let mut files: Vec<BatchFile> = (1..=5).map(|i| png_file(&format!("scan-{i}.png"))).collect();
    files[2].bytes = truncated_png_bytes();
    let batch_id = service.submit_batch(batch_of(files, "alice")).expect("submit");

    let view = wait_for_batch(&service, &batch_id);
    assert_eq!(view.status, BatchStatus::Completed);
    assert_eq!((view.processed_count, view.failed_count, view.total_count), (5, 1, 5));
    assert!((view.progress_percentage - 100.0).abs() < f64::EPSILON);

    let members = service.get_batch_files(&batch_id).expect("files");
    assert_eq!(members.len(), 5);
    let failed: Vec<_> = members.iter().filter(|u| u.status == UploadStatus::Failed).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].filename, "scan-3.png");
    assert!(failed[0].metadata.is_none(), "anonymizer never ran");
    assert_eq!(
        members.iter().filter(|u| u.status == UploadStatus::Completed).count(),
        4
    );

    assert_eq!(service.owner_batches("alice").expect("owner batches").len(), 1);
    assert_eq!(service.owner_uploads("alice").expect("owner uploads").len(), 5);
    let stats = service.stats().expect("stats");
    assert_eq!(stats.uploads_total, 5);
    assert_eq!(stats.uploads_by_status.get("completed"), Some(&4));
    assert_eq!(stats.batches_by_status.get("completed"), Some(&1));

    service.shutdown();
}

#[test]
fn completed_upload_round_trips_through_the_sealed_artifact() {
    let dir = tempdir().expect("tmpdir");
    let config = test_config(dir.path());
    let service = IntakeService::from_config(&config).expect("service");

    let upload_id = service
        .submit(FileSubmission {
            filename: "study.dcm".into(),
            content_type: Some("application/dicom".into()),
            bytes: patient_dicom_bytes(),
            owner_id: Some("bob".into()),
            origin: Some("10.0.0.7".into()),
        })
        .expect("submit");

    let view = wait_for(LIMIT, || {
        let view = service.get_upload_status(&upload_id).expect("status");
        view.status.is_terminal().then_some(view)
    });
    assert_eq!(view.status, UploadStatus::Completed, "{:?}", view.failure_reason);
    let metadata = view.metadata.expect("metadata");
    assert!(metadata.conversion_ok && metadata.anonymization_ok);
    assert!(metadata.modified_tags.iter().any(|t| t.starts_with("(0010,0010)")));

    let sealed = service.get_sealed_artifact(&upload_id).expect("artifact");
    assert!(sealed.encrypted);
    assert_eq!(sealed.nonce.as_ref().map(String::len), Some(24));
    assert_eq!(Some(&sealed.content_hash), view.content_hash.as_ref());

    let clear = service.export_artifact(&upload_id).expect("export");
    assert!(seal::verify(&clear, &sealed.content_hash));
    assert_eq!(&clear[128..132], b"DICM");

    let audit = AuditLog::new(Arc::new(
        Database::open(&config.storage.database).expect("db"),
    ));
    let trail = audit.for_upload(&upload_id).expect("audit");
    let stages: Vec<_> = trail.iter().map(|e| (e.stage.as_str(), e.outcome.as_str())).collect();
    assert_eq!(stages.first(), Some(&("ingress", "accepted")));
    assert_eq!(stages.last(), Some(&("pipeline", "success")));
    assert!(trail.iter().all(|e| e.actor.starts_with("user:bob") || e.actor.starts_with("worker:")));

    service.shutdown();
}

#[test]
fn rejected_uploads_are_recorded_and_counted_immediately() {
    let dir = tempdir().expect("tmpdir");
    let service = IntakeService::from_config(&test_config(dir.path())).expect("service");

    let err = service
        .submit(FileSubmission {
            filename: "notes.txt".into(),
            content_type: Some("text/plain".into()),
            bytes: b"hello".to_vec(),
            owner_id: None,
            origin: None,
        })
        .unwrap_err();
    let (upload_id, source) = match err {
        SubmitError::Rejected { upload_id, source } => (upload_id, source),
        other => panic!("expected a rejection, got {other:?}"),
    };
    assert_eq!(source.code(), "unsupported-type");
    let view = service.get_upload_status(&upload_id).expect("recorded");
    assert_eq!(view.status, UploadStatus::Failed);
    assert!(matches!(
        service.get_sealed_artifact(&upload_id),
        Err(QueryError::NotReady { status: UploadStatus::Failed, .. })
    ));

    let mut files = vec![png_file("a.png"), png_file("b.png")];
    files[1].bytes.clear();
    let batch_id = service.submit_batch(batch_of(files, "carol")).expect("submit");
    let view = wait_for_batch(&service, &batch_id);
    assert_eq!(view.status, BatchStatus::Completed);
    assert_eq!(view.failed_count, 1);

    let members = service.get_batch_files(&batch_id).expect("files");
    let empty = members.iter().find(|u| u.filename == "b.png").expect("member");
    assert!(empty
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("empty-payload")));

    assert!(matches!(
        service.submit_batch(batch_of(Vec::new(), "carol")),
        Err(SubmitError::EmptyBatch)
    ));
    assert!(matches!(
        service.get_batch_status("missing"),
        Err(QueryError::BatchNotFound(_))
    ));

    service.stop_accepting();
    assert!(matches!(
        service.submit_batch(batch_of(vec![png_file("c.png")], "carol")),
        Err(SubmitError::NotAccepting)
    ));
    assert!(!service.health().accepting);
    service.shutdown();
}

#[test]
fn transient_persistence_failures_are_retried_until_success() {
    let dir = tempdir().expect("tmpdir");
    let mut config = test_config(dir.path());
    config.dispatch.max_retries = 3;
    let db = Arc::new(Database::open(&config.storage.database).expect("db"));
    let (runner, sink) = flaky_runner(&config, db.clone(), 2);

    let job = queued_job(&db, "retry-ok");
    let outcome = runner.run(&job, "worker:test").expect("not fatal");
    assert!(
        matches!(outcome, JobOutcome::Completed { attempts: 3, .. }),
        "{outcome:?}"
    );
    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);

    let upload = db.upload(&job.upload_id).expect("read").expect("upload");
    assert_eq!(upload.status, UploadStatus::Completed);
    let batch = db.batch("retry-ok").expect("read").expect("batch");
    assert_eq!((batch.processed_count, batch.status), (1, BatchStatus::Completed));

    let retries = AuditLog::new(db.clone())
        .for_upload(&job.upload_id)
        .expect("audit")
        .into_iter()
        .filter(|e| e.outcome == "retry")
        .count();
    assert_eq!(retries, 2);

    // A redelivered job sees a terminal upload and neither reruns nor recounts.
    assert_eq!(runner.run(&job, "worker:test").expect("not fatal"), JobOutcome::Skipped);
    assert_eq!(db.batch("retry-ok").expect("read").expect("batch").processed_count, 1);
}

#[test]
fn persistence_failures_beyond_the_bound_fail_the_upload() {
    let dir = tempdir().expect("tmpdir");
    let mut config = test_config(dir.path());
    config.dispatch.max_retries = 2;
    let db = Arc::new(Database::open(&config.storage.database).expect("db"));
    let (runner, sink) = flaky_runner(&config, db.clone(), 10);

    let job = queued_job(&db, "retry-exhausted");
    let outcome = runner.run(&job, "worker:test").expect("not fatal");
    assert!(
        matches!(outcome, JobOutcome::Failed { attempts: 3, .. }),
        "{outcome:?}"
    );
    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);

    let upload = db.upload(&job.upload_id).expect("read").expect("upload");
    assert_eq!(upload.status, UploadStatus::Failed);
    assert!(upload.storage_path.is_none());
    // The anonymizer ran, so its record is kept alongside the failure.
    let metadata = db.metadata(&job.upload_id).expect("read").expect("metadata");
    assert!(metadata.anonymization_ok);

    let batch = db.batch("retry-exhausted").expect("read").expect("batch");
    assert_eq!(
        (batch.processed_count, batch.failed_count, batch.status),
        (1, 1, BatchStatus::Completed)
    );
}

#[test]
fn concurrent_terminal_reports_count_each_upload_once() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("intake.db");
    let db = Database::open(&path).expect("db");

    let ids: Vec<String> = (0..4).map(|i| format!("u{i}")).collect();
    let uploads: Vec<_> = ids
        .iter()
        .map(|id| UploadRecord::received(id.as_str(), "x.png", None, None, None, Some("b".into())))
        .collect();
    db.insert_batch(&BatchRecord::queued("b", None, 4), &uploads).expect("insert");
    for id in &ids {
        assert!(db.fail_upload(id, None, "boom", None).expect("fail"));
    }

    let advanced = Arc::new(AtomicU32::new(0));
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let path = path.clone();
            let ids = ids.clone();
            let advanced = advanced.clone();
            thread::spawn(move || {
                // Separate connections, as separate worker processes would have.
                let tracker = BatchTracker::new(
                    Arc::new(Database::open(&path).expect("db")),
                    BatchPolicy::BestEffort,
                );
                for id in &ids {
                    if tracker.record_terminal(id).expect("record").is_some() {
                        advanced.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread");
    }

    assert_eq!(advanced.load(Ordering::SeqCst), 4);
    let batch = db.batch("b").expect("read").expect("batch");
    assert_eq!(
        (batch.processed_count, batch.failed_count, batch.status),
        (4, 4, BatchStatus::Completed)
    );
}

#[test]
fn fail_fast_policy_fails_the_batch_but_counts_every_file() {
    let dir = tempdir().expect("tmpdir");
    let mut config = test_config(dir.path());
    config.dispatch.batch_policy = BatchPolicy::FailFast;
    config.dispatch.workers = 1;
    let service = IntakeService::from_config(&config).expect("service");

    let mut files = vec![png_file("a.png"), png_file("b.png"), png_file("c.png")];
    files[0].bytes = truncated_png_bytes();
    let batch_id = service.submit_batch(batch_of(files, "dave")).expect("submit");

    let view = wait_for_batch(&service, &batch_id);
    assert_eq!(view.status, BatchStatus::Failed);
    assert_eq!((view.processed_count, view.failed_count), (3, 1));
    let completed = service
        .get_batch_files(&batch_id)
        .expect("files")
        .into_iter()
        .filter(|u| u.status == UploadStatus::Completed)
        .count();
    assert_eq!(completed, 2, "later files still run");

    service.shutdown();
}

#[test]
fn queue_mode_hands_jobs_to_separate_consumers() {
    let dir = tempdir().expect("tmpdir");
    let mut config = test_config(dir.path());
    let broker_url = format!("sqlite:{}", dir.path().join("broker.db").display());
    config.broker.url = Some(broker_url.clone());
    config.broker.required = true;

    let service = IntakeService::from_config(&config).expect("service");
    let health = service.health();
    assert_eq!(health.mode, DispatchMode::Queue.as_str());
    assert_eq!(health.broker, Some(true));

    let mut files: Vec<BatchFile> = (0..3).map(|i| png_file(&format!("q-{i}.png"))).collect();
    files[1].bytes = truncated_png_bytes();
    let batch_id = service.submit_batch(batch_of(files, "erin")).expect("submit");

    // Nothing runs until a consumer shows up.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(service.get_batch_status(&batch_id).expect("status").processed_count, 0);

    // The consumer side gets its own handles, like a `worker` process would.
    let queue = Arc::new(BrokerQueue::connect(&broker_url).expect("broker"));
    let db = Arc::new(Database::open(&config.storage.database).expect("db"));
    let store = FileStore::new(&config.storage.artifact_root).expect("store");
    let runner = Arc::new(service::build_runner(&config, db, store).expect("runner"));
    let consumer = QueueConsumer::spawn(
        queue.clone(),
        runner,
        ConsumerSettings::from_config(&config.broker),
    );

    let view = wait_for_batch(&service, &batch_id);
    consumer.stop();
    consumer.join();

    assert_eq!(view.status, BatchStatus::Completed);
    assert_eq!(view.failed_count, 1);
    let states = queue.state_counts().expect("states");
    assert_eq!(states.get("done"), Some(&3));

    service.shutdown();
}

#[test]
fn required_broker_that_is_unreachable_stops_startup() {
    let dir = tempdir().expect("tmpdir");
    let mut config = test_config(dir.path());
    config.broker.url = Some(format!(
        "sqlite:{}",
        dir.path().join("missing").join("broker.db").display()
    ));

    config.broker.required = true;
    assert!(IntakeService::from_config(&config).is_err());

    config.broker.required = false;
    let service = IntakeService::from_config(&config).expect("falls back");
    assert_eq!(service.health().mode, DispatchMode::Local.as_str());
    assert_eq!(service.health().broker, None);
    service.shutdown();
}

#[test]
fn batches_over_the_file_limit_are_refused_whole() {
    let dir = tempdir().expect("tmpdir");
    let mut config = test_config(dir.path());
    config.validation.max_batch_files = 2;
    let service = IntakeService::from_config(&config).expect("service");

    let files = (0..3).map(|i| png_file(&format!("big-{i}.png"))).collect();
    let err = service.submit_batch(batch_of(files, "frank")).unwrap_err();
    assert!(
        matches!(err, SubmitError::BatchTooLarge { files: 3, limit: 2 }),
        "{err:?}"
    );
    assert!(service.owner_batches("frank").expect("batches").is_empty());
    assert!(service.owner_uploads("frank").expect("uploads").is_empty());

    let files = (0..2).map(|i| png_file(&format!("ok-{i}.png"))).collect();
    let batch_id = service.submit_batch(batch_of(files, "frank")).expect("at the limit");
    assert_eq!(wait_for_batch(&service, &batch_id).status, BatchStatus::Completed);
    service.shutdown();
}

#[test]
fn restart_settles_uploads_an_earlier_process_left_behind() {
    let dir = tempdir().expect("tmpdir");
    let config = test_config(dir.path());
    {
        // State of a process that died right after ingress, and of one that
        // failed an upload but never reached the batch counters.
        let db = Database::open(&config.storage.database).expect("db");
        let orphans: Vec<_> = ["a.png", "b.png"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                UploadRecord::received(format!("orphan-{i}"), *name, None, None, None, Some("interrupted".into()))
            })
            .collect();
        db.insert_batch(&BatchRecord::queued("interrupted", None, 2), &orphans)
            .expect("insert");

        let finished = UploadRecord::received("late", "c.png", None, None, None, Some("uncounted".into()));
        db.insert_batch(&BatchRecord::queued("uncounted", None, 1), std::slice::from_ref(&finished))
            .expect("insert");
        assert!(db.fail_upload("late", None, "conversion failed", None).expect("fail"));
    }

    let service = IntakeService::from_config(&config).expect("service");

    let interrupted = service.get_batch_status("interrupted").expect("batch");
    assert_eq!(
        (interrupted.processed_count, interrupted.failed_count, interrupted.status),
        (2, 2, BatchStatus::Completed)
    );
    for member in service.get_batch_files("interrupted").expect("files") {
        assert_eq!(member.status, UploadStatus::Failed);
        assert!(member
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.starts_with("interrupted")));
    }

    let uncounted = service.get_batch_status("uncounted").expect("batch");
    assert_eq!(
        (uncounted.processed_count, uncounted.failed_count, uncounted.status),
        (1, 1, BatchStatus::Completed)
    );

    assert_eq!(service.recover().expect("second pass"), Recovery::default());
    service.shutdown();
}

#[test]
fn redelivery_while_the_first_worker_runs_does_not_process_twice() {
    let dir = tempdir().expect("tmpdir");
    let (config, broker_url) = queue_config(dir.path());
    let service = IntakeService::from_config(&config).expect("service");
    let upload_id = service
        .submit(FileSubmission {
            filename: "slow.png".into(),
            content_type: Some("image/png".into()),
            bytes: png_bytes(8, 8),
            owner_id: Some("gina".into()),
            origin: None,
        })
        .expect("submit");

    let queue = Arc::new(BrokerQueue::connect(&broker_url).expect("broker"));
    let db = Arc::new(Database::open(&config.storage.database).expect("db"));
    let (runner, sink) = hooked_runner(&config, db.clone(), |_| thread::sleep(Duration::from_millis(400)));
    // Claims go stale at once, so the second consumer keeps getting the running job.
    let settings = ConsumerSettings {
        consumers: 2,
        poll_interval: Duration::from_millis(10),
        visibility_timeout: Duration::ZERO,
        max_deliveries: 10_000,
    };
    let consumer = QueueConsumer::spawn(queue.clone(), Arc::new(runner), settings);

    let view = wait_for(LIMIT, || {
        let view = service.get_upload_status(&upload_id).expect("status");
        view.status.is_terminal().then_some(view)
    });
    wait_for(LIMIT, || {
        let states = queue.state_counts().expect("states");
        (states.get("done") == Some(&1)).then_some(())
    });
    consumer.stop();
    consumer.join();

    assert_eq!(view.status, UploadStatus::Completed, "{:?}", view.failure_reason);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    let completions = AuditLog::new(db)
        .for_upload(&upload_id)
        .expect("audit")
        .into_iter()
        .filter(|e| e.stage == "pipeline" && e.outcome == "success")
        .count();
    assert_eq!(completions, 1);
    service.shutdown();
}

#[test]
fn jobs_delivered_too_often_are_dead_lettered_and_counted() {
    let dir = tempdir().expect("tmpdir");
    let (config, broker_url) = queue_config(dir.path());
    let service = IntakeService::from_config(&config).expect("service");
    let batch_id = service
        .submit_batch(batch_of(vec![png_file("poison.png")], "hank"))
        .expect("submit");
    let upload_id = service.get_batch_files(&batch_id).expect("files")[0].upload_id.clone();

    // Two consumers that took the job and vanished without acknowledging it.
    let queue = Arc::new(BrokerQueue::connect(&broker_url).expect("broker"));
    for _ in 0..2 {
        thread::sleep(Duration::from_millis(5));
        queue.claim("worker:gone", Duration::ZERO).expect("claim").expect("delivery");
    }
    thread::sleep(Duration::from_millis(5));

    let db = Arc::new(Database::open(&config.storage.database).expect("db"));
    let store = FileStore::new(&config.storage.artifact_root).expect("store");
    let runner = Arc::new(service::build_runner(&config, db.clone(), store).expect("runner"));
    let settings = ConsumerSettings {
        consumers: 1,
        poll_interval: Duration::from_millis(10),
        visibility_timeout: Duration::ZERO,
        max_deliveries: 2,
    };
    let consumer = QueueConsumer::spawn(queue.clone(), runner, settings);
    let view = wait_for_batch(&service, &batch_id);
    consumer.stop();
    consumer.join();

    assert_eq!((view.failed_count, view.status), (1, BatchStatus::Completed));
    let upload = service.get_upload_status(&upload_id).expect("upload");
    assert_eq!(upload.status, UploadStatus::Failed);
    assert!(upload
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("dead-lettered after 2 deliveries")));
    assert_eq!(queue.state_counts().expect("states").get("dead"), Some(&1));

    let trail = AuditLog::new(db).for_upload(&upload_id).expect("audit");
    assert!(trail.iter().any(|e| e.outcome == "dead-letter" && e.stage == "dispatch"));
    service.shutdown();
}

#[test]
fn panicking_stage_fails_only_its_upload() {
    let dir = tempdir().expect("tmpdir");
    let config = test_config(dir.path());
    let db = Arc::new(Database::open(&config.storage.database).expect("db"));
    let (runner, sink) = hooked_runner(&config, db.clone(), |_| panic!("encoder state corrupted"));

    let job = queued_job(&db, "panics");
    match runner.run(&job, "worker:test").expect("not fatal") {
        JobOutcome::Failed { reason, attempts } => {
            assert_eq!(attempts, 1);
            assert!(reason.contains("encoder state corrupted"), "{reason}");
        }
        other => panic!("expected a failure, got {other:?}"),
    }
    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);

    let upload = db.upload(&job.upload_id).expect("read").expect("upload");
    assert_eq!(upload.status, UploadStatus::Failed);
    let batch = db.batch("panics").expect("read").expect("batch");
    assert_eq!(
        (batch.processed_count, batch.failed_count, batch.status),
        (1, 1, BatchStatus::Completed)
    );
}

#[test]
fn hung_attempt_times_out_and_its_late_write_is_fenced_off() {
    let dir = tempdir().expect("tmpdir");
    let mut config = test_config(dir.path());
    config.dispatch.job_timeout_secs = 1;
    config.dispatch.max_retries = 1;
    let db = Arc::new(Database::open(&config.storage.database).expect("db"));
    let (runner, sink) = hooked_runner(&config, db.clone(), |call| {
        if call == 1 {
            thread::sleep(Duration::from_millis(1_800));
        }
    });

    let job = queued_job(&db, "hung");
    let outcome = runner.run(&job, "worker:test").expect("not fatal");
    assert!(
        matches!(outcome, JobOutcome::Completed { attempts: 2, .. }),
        "{outcome:?}"
    );

    let retry = AuditLog::new(db.clone())
        .for_upload(&job.upload_id)
        .expect("audit")
        .into_iter()
        .find(|e| e.outcome == "retry")
        .expect("retry event");
    assert!(retry.detail.as_deref().is_some_and(|d| d.contains("deadline")));

    // The first attempt wakes up after the retry finished and tries to persist.
    thread::sleep(Duration::from_millis(1_500));
    assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    let upload = db.upload(&job.upload_id).expect("read").expect("upload");
    assert_eq!(upload.status, UploadStatus::Completed);
    let stored = upload.storage_path.expect("storage path");
    let artifacts: Vec<String> = std::fs::read_dir(&config.storage.artifact_root)
        .expect("list")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(artifacts, vec![stored]);
    assert_eq!(db.batch("hung").expect("read").expect("batch").processed_count, 1);
}
