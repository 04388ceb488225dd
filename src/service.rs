//! Production wiring shared by the command line and the Lambda entry point.
//!
//! Both front ends decode a batch, then hand it here to run against git, STS,
//! and the configured fan-out target.

use std::env;
use std::num::NonZeroUsize;
use std::sync::Arc;

use aws_config::{BehaviorVersion, Region};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::config::{ConfigError, ExecutorConfig, FanOutMode};
use crate::credentials::StsCredentialBroker;
use crate::dispatch::{BatchReport, DispatchError, Dispatcher};
use crate::fanout::{FanOutError, FanOutTarget, LambdaFanOut, ProcessFanOut};
use crate::job::JobExecutor;
use crate::output::{OutputSink, StdoutSink};
use crate::request::BatchEntry;
use crate::source::GitFetcher;

/// Errors that stop a batch before or during dispatch.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The configuration cannot describe a run.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The fan-out target could not be prepared.
    #[error("fan-out setup failed: {0}")]
    FanOut(#[from] FanOutError),
    /// The overflow could not be handed off.
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Response-friendly view of a [`BatchReport`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct BatchSummary {
    /// Jobs run by this instance, including rejected entries.
    pub local: usize,
    /// Requests handed to another instance.
    pub forwarded: usize,
    /// Names of the failed jobs in request order.
    pub failed: Vec<String>,
}

impl From<&BatchReport> for BatchSummary {
    fn from(report: &BatchReport) -> Self {
        Self {
            local: report.outcomes.len(),
            forwarded: report.forwarded,
            failed: report.failures().into_iter().map(ToOwned::to_owned).collect(),
        }
    }
}

/// Runs `entries` with the collaborators described by `config`, running at
/// most `capacity` jobs locally.
///
/// # Errors
///
/// Returns [`ServiceError`] when the fan-out target cannot be built or the
/// overflow cannot be handed off. Job failures are reported in the
/// [`BatchReport`].
pub async fn run_batch(
    config: &ExecutorConfig,
    capacity: NonZeroUsize,
    entries: Vec<BatchEntry>,
) -> Result<BatchReport, ServiceError> {
    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()))
        .load()
        .await;

    let fan_out = match config.fan_out_mode()? {
        FanOutMode::Lambda => FanOutTarget::Lambda(LambdaFanOut::new(
            aws_sdk_lambda::Client::new(&sdk_config),
            config.function_name()?,
        )),
        FanOutMode::Process => FanOutTarget::Process(ProcessFanOut::current_executable()?),
    };

    let sink: Arc<dyn OutputSink> = Arc::new(StdoutSink);
    let executor = JobExecutor::new(
        config.job_settings(env::var("PATH").ok()),
        GitFetcher::with_process_runner(config.git_bin.clone(), config.git_token()),
        StsCredentialBroker::new(&sdk_config),
        sink,
    );

    let dispatcher = Dispatcher::new(Arc::new(executor), fan_out, capacity);
    Ok(dispatcher.run(entries).await?)
}

/// Logs the end-of-batch summary.
pub fn log_summary(report: &BatchReport) {
    let failures = report.failures();
    if failures.is_empty() {
        info!(
            local = report.outcomes.len(),
            forwarded = report.forwarded,
            "batch finished"
        );
    } else {
        error!(
            local = report.outcomes.len(),
            forwarded = report.forwarded,
            failed = failures.len(),
            jobs = %failures.join(", "),
            "batch finished with failed jobs"
        );
    }
}
