//! Per-request execution pipeline.
//!
//! A job prepares its own working tree, fetches the primary module at the
//! requested revision, obtains scoped credentials, writes the state
//! backend, resolves nested modules, and finally runs the tool's `init` and
//! `apply` steps. Steps run strictly in that order and the first failure
//! ends the job; other jobs are unaffected.

use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{Instrument, info, info_span};

use crate::credentials::{self, CredentialBroker, CredentialError};
use crate::dispatch::JobRunner;
use crate::future::CollaboratorFuture;
use crate::modules::{ModuleResolver, ResolveError};
use crate::output::{Multiplexer, OutputSink};
use crate::request::{ExecutionRequest, RequestError};
use crate::source::{FetchError, SourceFetcher, render_git_config};
use crate::state_backend::StateBackend;
use crate::workspace::{GIT_CONFIG_FILE, WorkingTree, WorkspaceError};

mod environment;
mod process;

pub use environment::{Environment, assemble};
pub use process::{ToolStep, run_step};

/// Errors that end a single job.
#[derive(Debug, Error)]
pub enum JobError {
    /// The request itself is malformed.
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),
    /// The primary module could not be fetched.
    #[error("failed to fetch {address}: {source}")]
    Fetch {
        /// Primary repository address.
        address: String,
        /// Underlying fetch error.
        #[source]
        source: FetchError,
    },
    /// Credentials could not be obtained.
    #[error("credential issuance failed: {0}")]
    Credentials(#[from] CredentialError),
    /// The working tree could not be prepared.
    #[error("working tree error: {0}")]
    Workspace(#[from] WorkspaceError),
    /// Nested modules could not be resolved.
    #[error("module resolution failed: {0}")]
    Modules(#[source] Box<ResolveError>),
    /// The tool could not be started.
    #[error("failed to start {program} {step}: {message}")]
    Spawn {
        /// Step being started.
        step: ToolStep,
        /// Tool executable.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// The tool's exit status could not be collected.
    #[error("failed to wait for {step}: {message}")]
    Wait {
        /// Step being awaited.
        step: ToolStep,
        /// Operating system error string.
        message: String,
    },
    /// The tool exited non-zero.
    #[error("{step} exited with status {status_text}")]
    ToolFailed {
        /// Step that failed.
        step: ToolStep,
        /// Exit code, or `unknown` when killed by a signal.
        status_text: String,
    },
    /// The job task panicked or was cancelled.
    #[error("job task aborted: {message}")]
    Panicked {
        /// Join error description.
        message: String,
    },
}

/// Settings shared by every job of a batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobSettings {
    /// Primary module repository.
    pub repo_url: String,
    /// Role assumed in each target account.
    pub role_name: String,
    /// Tool executable.
    pub tool_bin: String,
    /// Parent directory of the working trees.
    pub work_root: Utf8PathBuf,
    /// Entry file scanned for module declarations.
    pub entry_file: String,
    /// AWS region for the state store and the tool.
    pub region: String,
    /// Shared remote-state bucket.
    pub state_bucket: String,
    /// Token written into the job's git config for fetches made by the tool.
    pub git_token: Option<String>,
    /// Write base credentials into the backend block.
    pub embed_state_credentials: bool,
    /// Prefix output lines with a wall-clock timestamp.
    pub timestamp_output: bool,
    /// `PATH` passed through to the tool.
    pub host_path: Option<String>,
}

/// Runs jobs with the injected collaborators.
pub struct JobExecutor<S, C> {
    settings: JobSettings,
    fetcher: S,
    broker: C,
    sink: Arc<dyn OutputSink>,
}

impl<S: SourceFetcher, C: CredentialBroker> JobExecutor<S, C> {
    /// Creates an executor.
    #[must_use]
    pub const fn new(
        settings: JobSettings,
        fetcher: S,
        broker: C,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            settings,
            fetcher,
            broker,
            sink,
        }
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Runs the full pipeline for `request`.
    ///
    /// # Errors
    ///
    /// Returns the [`JobError`] of the first step that failed.
    pub async fn execute_job(&self, request: &ExecutionRequest) -> Result<(), JobError> {
        let span = info_span!("job", job = %request.name, account = %request.account_id);
        self.pipeline(request).instrument(span).await
    }

    async fn pipeline(&self, request: &ExecutionRequest) -> Result<(), JobError> {
        request.validate()?;
        let settings = &self.settings;
        info!(version = %request.source_version, "job started");

        let tree = WorkingTree::new(&settings.work_root, &request.name);
        tree.clear_stale();

        self.fetcher
            .fetch_at_revision(
                &settings.repo_url,
                tree.root(),
                Some(&request.source_version),
            )
            .await
            .map_err(|source| JobError::Fetch {
                address: settings.repo_url.clone(),
                source,
            })?;

        let base = self.broker.base_credentials().await?;
        let role = credentials::role_arn(&request.account_id, &settings.role_name);
        let scoped = self
            .broker
            .assume_role(&credentials::session_name(), &role)
            .await?;

        StateBackend::new(&settings.state_bucket, &settings.region).write(
            &tree,
            &request.name,
            settings.embed_state_credentials.then_some(&base),
        )?;
        tree.create_cache_dirs()?;

        ModuleResolver::new(&self.fetcher, &tree)
            .resolve(&tree.file(&settings.entry_file))
            .await
            .map_err(|err| JobError::Modules(Box::new(err)))?;

        let env = assemble(
            request,
            &scoped,
            &tree,
            &settings.region,
            settings.host_path.as_deref(),
        );
        if let Some(token) = &settings.git_token {
            tree.write_private_file(GIT_CONFIG_FILE, &render_git_config(token))?;
        }

        let mux = Multiplexer::new(
            request.name.as_str(),
            settings.timestamp_output,
            Arc::clone(&self.sink),
        );
        for step in [ToolStep::Init, ToolStep::Apply] {
            run_step(&settings.tool_bin, step, tree.root(), &env, &mux).await?;
        }

        info!("job finished");
        Ok(())
    }
}

impl<S, C> JobRunner for JobExecutor<S, C>
where
    S: SourceFetcher + 'static,
    C: CredentialBroker + 'static,
{
    fn execute(&self, request: ExecutionRequest) -> CollaboratorFuture<'_, (), JobError> {
        Box::pin(async move { self.execute_job(&request).await })
    }
}

#[cfg(test)]
mod tests;
