//! Retrieval of source trees at a pinned revision.
//!
//! The fetcher shells out to the system `git` binary: a full clone followed
//! by a checkout of the requested revision, so tags, branches, and commit
//! ids all work. When a token is configured it is sent as a basic-auth
//! header through git's `GIT_CONFIG_*` environment overrides and never
//! appears in the clone URL or on the command line.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::future::CollaboratorFuture;

mod auth;
mod types;

pub use auth::{authorization_header, render_git_config};
pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner};

/// Retrieves a revision of a remote source tree into a local directory.
pub trait SourceFetcher: Send + Sync {
    /// Clones `address` into `destination` and checks out `revision` when
    /// one is given; otherwise the remote's default branch is left checked
    /// out.
    fn fetch_at_revision<'a>(
        &'a self,
        address: &'a str,
        destination: &'a Utf8Path,
        revision: Option<&'a str>,
    ) -> CollaboratorFuture<'a, (), FetchError>;
}

/// Errors surfaced while fetching a source tree.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FetchError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when `git` completes with a non-zero exit code.
    #[error("git {operation} of {address} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// `clone` or `checkout`.
        operation: &'static str,
        /// Address being fetched.
        address: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when the blocking fetch task was cancelled or panicked.
    #[error("fetch of {address} was interrupted: {message}")]
    Interrupted {
        /// Address being fetched.
        address: String,
        /// Join error description.
        message: String,
    },
}

/// [`SourceFetcher`] backed by the `git` command line client.
#[derive(Clone, Debug)]
pub struct GitFetcher<R: CommandRunner> {
    git_bin: String,
    token: Option<String>,
    runner: R,
}

impl GitFetcher<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub fn with_process_runner(git_bin: impl Into<String>, token: Option<String>) -> Self {
        Self::new(git_bin, token, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> GitFetcher<R> {
    /// Creates a fetcher using the provided runner. Blank tokens are ignored.
    #[must_use]
    pub fn new(git_bin: impl Into<String>, token: Option<String>, runner: R) -> Self {
        Self {
            git_bin: git_bin.into(),
            token: token.filter(|value| !value.trim().is_empty()),
            runner,
        }
    }

    /// Runs the clone and checkout on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Spawn`] when `git` cannot be started and
    /// [`FetchError::CommandFailure`] when either step exits non-zero.
    pub fn fetch_blocking(
        &self,
        address: &str,
        destination: &Utf8Path,
        revision: Option<&str>,
    ) -> Result<(), FetchError> {
        let clone_args = [
            OsString::from("clone"),
            OsString::from("--quiet"),
            OsString::from("--"),
            OsString::from(address),
            OsString::from(destination.as_str()),
        ];
        let cloned = self
            .runner
            .run(&self.git_bin, &clone_args, &self.auth_env())?;
        Self::check(cloned, "clone", address)?;

        let Some(pinned) = revision.filter(|value| !value.trim().is_empty()) else {
            return Ok(());
        };

        let checkout_args = [
            OsString::from("-C"),
            OsString::from(destination.as_str()),
            OsString::from("checkout"),
            OsString::from("--quiet"),
            OsString::from(pinned),
        ];
        let checked_out = self.runner.run(&self.git_bin, &checkout_args, &[])?;
        Self::check(checked_out, "checkout", address)
    }

    /// Environment entries that make git send the token as an extra
    /// header for this invocation only.
    fn auth_env(&self) -> Vec<(String, String)> {
        self.token.as_deref().map_or_else(Vec::new, |token| {
            vec![
                (String::from("GIT_CONFIG_COUNT"), String::from("1")),
                (String::from("GIT_CONFIG_KEY_0"), String::from("http.extraHeader")),
                (String::from("GIT_CONFIG_VALUE_0"), authorization_header(token)),
            ]
        })
    }

    fn check(
        output: CommandOutput,
        operation: &'static str,
        address: &str,
    ) -> Result<(), FetchError> {
        if output.is_success() {
            return Ok(());
        }

        Err(FetchError::CommandFailure {
            operation,
            address: address.to_owned(),
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

impl<R> SourceFetcher for GitFetcher<R>
where
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    fn fetch_at_revision<'a>(
        &'a self,
        address: &'a str,
        destination: &'a Utf8Path,
        revision: Option<&'a str>,
    ) -> CollaboratorFuture<'a, (), FetchError> {
        let fetcher = self.clone();
        let owned_address = address.to_owned();
        let owned_destination: Utf8PathBuf = destination.to_path_buf();
        let owned_revision = revision.map(ToOwned::to_owned);

        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                fetcher.fetch_blocking(
                    &owned_address,
                    &owned_destination,
                    owned_revision.as_deref(),
                )
            })
            .await
            .map_err(|err| FetchError::Interrupted {
                address: address.to_owned(),
                message: err.to_string(),
            })?
        })
    }
}
