//! AWS Lambda entry point for `tfdispatch`.
//!
//! The invocation payload is the batch itself. Overflow handed off through
//! the `lambda` fan-out arrives here as a fresh asynchronous invocation of the
//! same function. Failed jobs are reported in the response and the log, not
//! as an invocation error, so the runtime does not retry a batch whose jobs
//! have already run.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lambda_runtime::{Error, LambdaEvent, service_fn};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tfdispatch::ExecutorConfig;
use tfdispatch::dispatch::host_capacity;
use tfdispatch::request::batch_from_value;
use tfdispatch::service::{self, BatchSummary};

const LOG_ENV: &str = "TFDISPATCH_LOG";

struct Handler {
    config: ExecutorConfig,
    capacity: NonZeroUsize,
}

impl Handler {
    async fn handle(&self, payload: serde_json::Value) -> Result<BatchSummary, Error> {
        let entries = batch_from_value(payload)?;
        if entries.is_empty() {
            info!("empty batch; nothing to do");
            return Ok(BatchSummary::default());
        }

        let report = service::run_batch(&self.config, self.capacity, entries).await?;
        service::log_summary(&report);
        Ok(BatchSummary::from(&report))
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .init();

    let config = ExecutorConfig::load_without_cli_args()?;
    config.validate()?;
    let capacity = config.capacity(host_capacity());
    let handler = Arc::new(Handler { config, capacity });

    lambda_runtime::run(service_fn(move |event: LambdaEvent<serde_json::Value>| {
        let shared = Arc::clone(&handler);
        async move { shared.handle(event.payload).await }
    }))
    .await
}
