//
// pool.rs
// Dicom-Intake-rs
//
// In-process execution: a fixed set of worker threads pulling jobs from a channel.
//
// Thales Matheus Mendonça Santos - November 2025

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::audit::Outcome;
use crate::dispatch::{DispatchError, DispatchMode, Dispatcher};
use crate::job::Job;
use crate::pipeline::{JobOutcome, JobRunner};

pub struct LocalPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    halted: Arc<AtomicBool>,
}

impl LocalPool {
    pub fn start(runner: Arc<JobRunner>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let halted = Arc::new(AtomicBool::new(false));

        let workers = (0..worker_count)
            .map(|worker_id| {
                let rx = receiver.clone();
                let runner = Arc::clone(&runner);
                let halted = Arc::clone(&halted);
                thread::Builder::new()
                    .name(format!("intake-worker-{worker_id}"))
                    .spawn(move || run_worker(worker_id, rx, runner, halted))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    error!(error = %err, "failed to spawn worker thread");
                    None
                }
            })
            .collect::<Vec<_>>();

        info!("Started {} workers", workers.len());

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            halted,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }
}

impl Dispatcher for LocalPool {
    fn dispatch(&self, job: Job) -> Result<(), DispatchError> {
        if self.is_halted() {
            return Err(DispatchError::Halted);
        }
        let guard = self.sender.lock().map_err(|_| DispatchError::Closed)?;
        let sender = guard.as_ref().ok_or(DispatchError::Closed)?;
        sender.send(job).map_err(|_| DispatchError::Closed)
    }

    /// Close the channel and wait for the workers to drain it.
    fn shutdown(&self) {
        info!("Shutting down worker pool...");
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        for (i, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            }
        }
        info!("All workers have stopped");
    }

    fn mode(&self) -> DispatchMode {
        DispatchMode::Local
    }

    fn healthy(&self) -> bool {
        !self.is_halted()
    }
}

impl Drop for LocalPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(worker_id: usize, jobs: Receiver<Job>, runner: Arc<JobRunner>, halted: Arc<AtomicBool>) {
    let actor = format!("worker:local-{worker_id}");
    debug!("Worker {} started", worker_id);

    // Ends when the pool drops its sender and the channel is empty.
    for job in jobs.iter() {
        if halted.load(Ordering::Relaxed) {
            runner.abandon(
                &job.upload_id,
                job.batch_id.as_deref(),
                "worker pool halted after a fatal error",
                Outcome::Failure,
                &actor,
            );
            continue;
        }

        match runner.run(&job, &actor) {
            Ok(JobOutcome::InProgress) => {
                warn!(worker_id, upload_id = %job.upload_id, "upload held by another process, dropping job")
            }
            Ok(_) => {}
            Err(fatal) => {
                error!(worker_id, error = %fatal, "fatal pipeline error, halting worker pool");
                halted.store(true, Ordering::Relaxed);
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}
