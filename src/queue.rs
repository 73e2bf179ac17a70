//
// queue.rs
// Dicom-Intake-rs
//
// Distributed execution over a broker table in a shared SQLite file: producers push job envelopes, consumer
// threads (in any process that can open the file) claim them with a visibility timeout and acknowledge them.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info, warn};

use crate::audit::Outcome;
use crate::config::BrokerConfig;
use crate::db::BUSY_TIMEOUT;
use crate::dispatch::{DispatchError, DispatchMode, Dispatcher};
use crate::job::Job;
use crate::pipeline::{JobOutcome, JobRunner};

const BROKER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS broker_jobs (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL UNIQUE,
    upload_id TEXT NOT NULL,
    envelope TEXT NOT NULL,
    payload BLOB NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    deliveries INTEGER NOT NULL DEFAULT 0,
    claimed_by TEXT,
    claimed_at INTEGER,
    enqueued_at INTEGER NOT NULL,
    finished_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_broker_jobs_state ON broker_jobs(state, seq);
"#;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("unsupported broker url {0:?}, expected sqlite:<path>")]
    BadUrl(String),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("job envelope error: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error("Broker lock poisoned")]
    LockPoisoned,
}

/// How a claimed job left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    Done,
    DeadLettered,
}

impl Finish {
    fn as_str(self) -> &'static str {
        match self {
            Finish::Done => "done",
            Finish::DeadLettered => "dead",
        }
    }
}

/// A claimed job.
#[derive(Debug)]
pub struct Delivery {
    pub job_id: String,
    pub upload_id: String,
    /// Number of times this job was handed out, this delivery included.
    pub deliveries: u32,
    /// Decoded job, or the reason the envelope could not be read.
    pub job: Result<Job, String>,
}

/// Path of a `sqlite:<path>` (or `sqlite://<path>`) broker url.
pub fn parse_url(url: &str) -> Result<PathBuf, BrokerError> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .filter(|p| !p.is_empty())
        .ok_or_else(|| BrokerError::BadUrl(url.to_string()))?;
    Ok(PathBuf::from(path))
}

pub struct BrokerQueue {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl BrokerQueue {
    /// Open the broker file. The directory must already exist; a missing one counts as unreachable.
    pub fn connect(url: &str) -> Result<Self, BrokerError> {
        let path = parse_url(url)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                return Err(BrokerError::Unavailable(format!(
                    "directory {} does not exist",
                    parent.display()
                )));
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute_batch(BROKER_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, BrokerError>
    where
        F: FnOnce(&Connection) -> Result<T, BrokerError>,
    {
        let conn = self.conn.lock().map_err(|_| BrokerError::LockPoisoned)?;
        f(&conn)
    }

    pub fn probe(&self) -> Result<(), BrokerError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM broker_jobs WHERE state = 'pending'", [], |r| {
                r.get::<_, i64>(0)
            })?;
            Ok(())
        })
    }

    pub fn push(&self, job: &Job) -> Result<(), BrokerError> {
        let envelope = job.envelope()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO broker_jobs (job_id, upload_id, envelope, payload, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![job.job_id, job.upload_id, envelope, job.payload, now_millis()],
            )?;
            Ok(())
        })
    }

    /// Take the oldest job that is pending or whose claim expired, in one statement.
    pub fn claim(&self, consumer: &str, visibility: Duration) -> Result<Option<Delivery>, BrokerError> {
        let now = now_millis();
        let expired_before = now - i64::try_from(visibility.as_millis()).unwrap_or(i64::MAX);

        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "UPDATE broker_jobs
                     SET state = 'claimed', claimed_by = ?1, claimed_at = ?2, deliveries = deliveries + 1
                     WHERE seq = (
                         SELECT seq FROM broker_jobs
                         WHERE state = 'pending' OR (state = 'claimed' AND claimed_at < ?3)
                         ORDER BY seq
                         LIMIT 1
                     )
                     RETURNING job_id, upload_id, envelope, payload, deliveries",
                    params![consumer, now, expired_before],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                            row.get::<_, u32>(4)?,
                        ))
                    },
                )
                .optional()?)
        })?;

        Ok(row.map(|(job_id, upload_id, envelope, payload, deliveries)| Delivery {
            job: Job::from_envelope(&envelope, payload).map_err(|e| e.to_string()),
            job_id,
            upload_id,
            deliveries,
        }))
    }

    /// Finish a claimed job. Only the current claimant can finish it.
    pub fn ack(&self, job_id: &str, consumer: &str, finish: Finish) -> Result<bool, BrokerError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE broker_jobs SET state = ?3, finished_at = ?4, payload = X''
                 WHERE job_id = ?1 AND claimed_by = ?2 AND state = 'claimed'",
                params![job_id, consumer, finish.as_str(), now_millis()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Delete finished rows older than `retention`.
    pub fn prune_finished(&self, retention: Duration) -> Result<usize, BrokerError> {
        let cutoff = now_millis() - i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM broker_jobs WHERE state IN ('done', 'dead') AND finished_at < ?1",
                [cutoff],
            )?)
        })
    }

    pub fn state_counts(&self) -> Result<BTreeMap<String, u64>, BrokerError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM broker_jobs GROUP BY state")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            Ok(rows.collect::<Result<BTreeMap<_, _>, _>>()?)
        })
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Producer side of queue mode.
pub struct QueueDispatcher {
    queue: Arc<BrokerQueue>,
    closed: AtomicBool,
}

impl QueueDispatcher {
    pub fn new(queue: Arc<BrokerQueue>) -> Self {
        Self {
            queue,
            closed: AtomicBool::new(false),
        }
    }
}

impl Dispatcher for QueueDispatcher {
    fn dispatch(&self, job: Job) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(DispatchError::Closed);
        }
        self.queue.push(&job)?;
        debug!(upload_id = %job.upload_id, job_id = %job.job_id, "job queued");
        Ok(())
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn mode(&self) -> DispatchMode {
        DispatchMode::Queue
    }

    fn healthy(&self) -> bool {
        self.queue.probe().is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub consumers: usize,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub max_deliveries: u32,
}

impl ConsumerSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            consumers: config.consumers.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            visibility_timeout: Duration::from_secs(config.visibility_timeout_secs),
            max_deliveries: config.max_deliveries,
        }
    }
}

/// Consumer side of queue mode: threads that claim, run and acknowledge jobs.
pub struct QueueConsumer {
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl QueueConsumer {
    pub fn spawn(queue: Arc<BrokerQueue>, runner: Arc<JobRunner>, settings: ConsumerSettings) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handles = (0..settings.consumers)
            .filter_map(|i| {
                let name = format!("worker:{}-{i}", std::process::id());
                let queue = Arc::clone(&queue);
                let runner = Arc::clone(&runner);
                let stop = Arc::clone(&stop);
                let settings = settings.clone();
                thread::Builder::new()
                    .name(format!("intake-consumer-{i}"))
                    .spawn(move || consume(name, queue, runner, settings, stop))
                    .map_err(|err| error!(error = %err, "failed to spawn consumer thread"))
                    .ok()
            })
            .collect::<Vec<_>>();

        info!(consumers = handles.len(), "queue consumers started");
        Self { handles, stop }
    }

    /// Ask every consumer to stop after its current job.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// True once a stop was requested or a consumer hit a fatal error.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.join() {
                error!("Consumer panicked: {:?}", e);
            }
        }
        info!("queue consumers stopped");
    }
}

fn consume(
    name: String,
    queue: Arc<BrokerQueue>,
    runner: Arc<JobRunner>,
    settings: ConsumerSettings,
    stop: Arc<AtomicBool>,
) {
    debug!(consumer = %name, "consumer started");

    while !stop.load(Ordering::Relaxed) {
        let delivery = match queue.claim(&name, settings.visibility_timeout) {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                thread::sleep(settings.poll_interval);
                continue;
            }
            Err(err) => {
                warn!(consumer = %name, error = %err, "claim failed");
                thread::sleep(settings.poll_interval);
                continue;
            }
        };

        let Some(finish) = handle_delivery(&name, &runner, &settings, &delivery, &stop) else {
            debug!(job_id = %delivery.job_id, "upload held elsewhere, leaving job for redelivery");
            thread::sleep(settings.poll_interval);
            continue;
        };
        match queue.ack(&delivery.job_id, &name, finish) {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %delivery.job_id, "claim expired before ack"),
            Err(err) => warn!(job_id = %delivery.job_id, error = %err, "ack failed"),
        }
    }

    debug!(consumer = %name, "consumer stopped");
}

/// Run one delivery. `None` leaves the claim unacknowledged.
fn handle_delivery(
    name: &str,
    runner: &JobRunner,
    settings: &ConsumerSettings,
    delivery: &Delivery,
    stop: &AtomicBool,
) -> Option<Finish> {
    let job = match &delivery.job {
        Ok(job) => job,
        Err(reason) => {
            error!(job_id = %delivery.job_id, %reason, "unreadable job envelope");
            runner.abandon(
                &delivery.upload_id,
                None,
                &format!("unreadable job envelope: {reason}"),
                Outcome::DeadLetter,
                name,
            );
            return Some(Finish::DeadLettered);
        }
    };

    let deliveries = delivery.deliveries;
    if deliveries > settings.max_deliveries {
        runner.abandon(
            &job.upload_id,
            job.batch_id.as_deref(),
            &format!("dead-lettered after {} deliveries", deliveries - 1),
            Outcome::DeadLetter,
            name,
        );
        return Some(Finish::DeadLettered);
    }

    match runner.run(job, name) {
        Ok(JobOutcome::InProgress) => None,
        Ok(_) => Some(Finish::Done),
        Err(fatal) => {
            error!(consumer = name, error = %fatal, "fatal pipeline error, stopping consumers");
            stop.store(true, Ordering::Relaxed);
            Some(Finish::Done)
        }
    }
}
