//! Batch partitioning and the local job barrier.
//!
//! The dispatcher keeps the first `capacity` entries for itself and hands
//! the rest to a new instance. Local jobs run concurrently; the dispatcher
//! waits for every one of them and collects each outcome without letting a
//! failed job cancel its siblings. A malformed entry or a repeated job name
//! fails as its own job and never reaches the runner.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tracing::{error, info};

use crate::fanout::{FanOut, FanOutError};
use crate::future::CollaboratorFuture;
use crate::job::JobError;
use crate::request::{
    BatchEntry, ExecutionRequest, RequestError, encode_batch, reject_duplicate_names,
};

/// Runs a single job to completion.
pub trait JobRunner: Send + Sync + 'static {
    /// Executes `request`; the error describes why the job failed.
    fn execute(&self, request: ExecutionRequest) -> CollaboratorFuture<'_, (), JobError>;
}

/// Errors that abort a whole batch.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The overflow could not be encoded.
    #[error("failed to encode overflow batch: {0}")]
    Encode(#[source] RequestError),
    /// The overflow could not be handed off.
    #[error("failed to hand off {count} overflow request(s): {source}")]
    FanOut {
        /// Number of requests that were not forwarded.
        count: usize,
        /// Underlying hand-off error.
        #[source]
        source: FanOutError,
    },
}

/// Outcome of one local job.
#[derive(Debug)]
pub struct JobOutcome {
    /// Job name.
    pub name: String,
    /// Result reported by the job.
    pub result: Result<(), JobError>,
}

/// Aggregate result of a batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Outcomes of the local jobs in request order.
    pub outcomes: Vec<JobOutcome>,
    /// Number of requests handed to another instance.
    pub forwarded: usize,
}

impl BatchReport {
    /// Names of the jobs that failed, in request order.
    #[must_use]
    pub fn failures(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result.is_err())
            .map(|outcome| outcome.name.as_str())
            .collect()
    }

    /// Returns `true` when every local job succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.result.is_ok())
    }
}

/// Number of jobs the host runs concurrently.
#[must_use]
pub fn host_capacity() -> NonZeroUsize {
    thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

/// Splits `batch` into the local share (at most `capacity`, in order) and
/// the overflow.
#[must_use]
pub fn partition<T>(mut batch: Vec<T>, capacity: NonZeroUsize) -> (Vec<T>, Vec<T>) {
    let split = capacity.get().min(batch.len());
    let overflow = batch.split_off(split);
    (batch, overflow)
}

/// Partitions a batch, forwards the overflow, and runs the rest locally.
pub struct Dispatcher<J, F> {
    runner: Arc<J>,
    fan_out: F,
    capacity: NonZeroUsize,
}

impl<J: JobRunner, F: FanOut> Dispatcher<J, F> {
    /// Creates a dispatcher running at most `capacity` jobs locally.
    #[must_use]
    pub const fn new(runner: Arc<J>, fan_out: F, capacity: NonZeroUsize) -> Self {
        Self {
            runner,
            fan_out,
            capacity,
        }
    }

    /// Local capacity.
    #[must_use]
    pub const fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }

    /// Runs `entries`.
    ///
    /// Repeated job names are rejected first. The overflow is handed off
    /// before any local job starts; it carries malformed entries exactly as
    /// received but never a repeated name, which is reported here instead.
    /// Individual job failures are reported in the returned [`BatchReport`].
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] when the overflow cannot be encoded or
    /// handed off; no local job runs in that case.
    pub async fn run(&self, mut entries: Vec<BatchEntry>) -> Result<BatchReport, DispatchError> {
        if entries.is_empty() {
            info!("empty batch; nothing to do");
            return Ok(BatchReport::default());
        }

        reject_duplicate_names(&mut entries);
        let total = entries.len();
        let (local, spilled) = partition(entries, self.capacity);
        let (repeated, overflow): (Vec<_>, Vec<_>) =
            spilled.into_iter().partition(BatchEntry::is_duplicate);
        let forwarded = overflow.len();

        if !overflow.is_empty() {
            let payload = encode_batch(&overflow).map_err(DispatchError::Encode)?;
            self.fan_out
                .hand_off(payload)
                .await
                .map_err(|source| DispatchError::FanOut {
                    count: forwarded,
                    source,
                })?;
            info!(forwarded, "handed off overflow requests");
        }

        info!(total, local = local.len(), forwarded, "starting local jobs");
        let outcomes = self.run_local(local.into_iter().chain(repeated)).await;

        Ok(BatchReport {
            outcomes,
            forwarded,
        })
    }

    async fn run_local(&self, local: impl Iterator<Item = BatchEntry>) -> Vec<JobOutcome> {
        let pending: Vec<_> = local
            .map(|entry| {
                let name = entry.name().to_owned();
                let job = entry.into_request().map(|request| {
                    let runner = Arc::clone(&self.runner);
                    tokio::spawn(async move { runner.execute(request).await })
                });
                (name, job)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(pending.len());
        for (name, job) in pending {
            let result = match job {
                Ok(handle) => handle.await.unwrap_or_else(|err| {
                    Err(JobError::Panicked {
                        message: err.to_string(),
                    })
                }),
                Err(err) => Err(JobError::Request(err)),
            };
            match &result {
                Ok(()) => info!(job = %name, "job succeeded"),
                Err(err) => error!(job = %name, error = %err, "job failed"),
            }
            outcomes.push(JobOutcome { name, result });
        }
        outcomes
    }
}
