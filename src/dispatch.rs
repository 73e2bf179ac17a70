//
// dispatch.rs
// Dicom-Intake-rs
//
// One dispatch contract, two backends: a shared broker queue or the in-process worker pool, picked once at startup.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::job::Job;
use crate::pipeline::JobRunner;
use crate::pool::LocalPool;
use crate::queue::{BrokerError, BrokerQueue, QueueDispatcher};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher is shut down")]
    Closed,
    #[error("worker pool halted after a fatal error")]
    Halted,
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("broker at {url} is required but unreachable: {source}")]
    BrokerRequired {
        url: String,
        #[source]
        source: BrokerError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    Queue,
    Local,
}

impl DispatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchMode::Queue => "queue",
            DispatchMode::Local => "local",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hands jobs to whatever executes them. Returns once the job is accepted, never on completion.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, job: Job) -> Result<(), DispatchError>;

    /// Stop taking jobs. Local mode finishes what it already accepted.
    fn shutdown(&self);

    fn mode(&self) -> DispatchMode;

    fn healthy(&self) -> bool {
        true
    }
}

/// Pick the execution backend. A configured broker is used when its probe succeeds;
/// otherwise jobs run on a local pool, unless the broker is marked required.
pub fn connect(config: &Config, runner: Arc<JobRunner>) -> Result<Arc<dyn Dispatcher>, DispatchError> {
    let Some(url) = config.broker.url.as_deref() else {
        tracing::info!(workers = config.dispatch.workers, "no broker configured, using local worker pool");
        return Ok(Arc::new(LocalPool::start(runner, config.dispatch.workers)));
    };

    match BrokerQueue::connect(url).and_then(|queue| queue.probe().map(|_| queue)) {
        Ok(queue) => {
            tracing::info!(url, "broker reachable, dispatching through the queue");
            Ok(Arc::new(QueueDispatcher::new(Arc::new(queue))))
        }
        Err(source) if config.broker.required => Err(DispatchError::BrokerRequired {
            url: url.to_string(),
            source,
        }),
        Err(err) => {
            tracing::warn!(
                url,
                error = %err,
                workers = config.dispatch.workers,
                "broker unreachable, falling back to local worker pool"
            );
            Ok(Arc::new(LocalPool::start(runner, config.dispatch.workers)))
        }
    }
}
