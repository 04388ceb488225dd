//! Test support utilities shared across unit and integration tests.
//!
//! Every double records what it was asked to do behind an
//! `Arc<Mutex<..>>`, so clones handed to the code under test share state
//! with the copy the test asserts on.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::credentials::{BaseCredentials, CredentialBroker, CredentialError, ScopedCredential};
use crate::dispatch::JobRunner;
use crate::fanout::{FanOut, FanOutError};
use crate::future::CollaboratorFuture;
use crate::job::{JobError, ToolStep};
use crate::output::OutputSink;
use crate::request::{BatchEntry, ExecutionRequest};
use crate::source::{CommandOutput, CommandRunner, FetchError, SourceFetcher};
use crate::workspace;

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic `git` outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment entries passed to the program.
    pub env: Vec<(String, String)>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        env: &[(String, String)],
    ) -> Result<CommandOutput, FetchError> {
        locked(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            env: env.to_vec(),
        });
        locked(&self.responses)
            .pop_front()
            .ok_or_else(|| FetchError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Sink that keeps every line in memory.
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    lines: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl RecordingSink {
    /// Creates a sink that accepts every line.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink whose writes always fail.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            lines: Arc::default(),
            fail: true,
        }
    }

    /// Lines written so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        locked(&self.lines).clone()
    }
}

impl OutputSink for RecordingSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"));
        }
        locked(&self.lines).push(line.to_owned());
        Ok(())
    }
}

/// One call recorded by [`StaticSourceFetcher`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FetchCall {
    /// Address that was fetched.
    pub address: String,
    /// Destination directory.
    pub destination: Utf8PathBuf,
    /// Revision requested, if any.
    pub revision: Option<String>,
}

/// Fetcher that materialises canned files instead of cloning.
#[derive(Clone, Debug, Default)]
pub struct StaticSourceFetcher {
    trees: Arc<Mutex<BTreeMap<String, Vec<(String, String)>>>>,
    failing: Arc<Mutex<BTreeSet<String>>>,
    calls: Arc<Mutex<Vec<FetchCall>>>,
}

impl StaticSourceFetcher {
    /// Creates a fetcher with no canned trees; unknown addresses produce an
    /// empty checkout directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `files` (relative path, contents) for `address`.
    #[must_use]
    pub fn with_tree(self, address: &str, files: &[(&str, &str)]) -> Self {
        locked(&self.trees).insert(
            address.to_owned(),
            files
                .iter()
                .map(|(path, contents)| ((*path).to_owned(), (*contents).to_owned()))
                .collect(),
        );
        self
    }

    /// Makes every fetch of `address` fail.
    #[must_use]
    pub fn failing_on(self, address: &str) -> Self {
        locked(&self.failing).insert(address.to_owned());
        self
    }

    /// Calls recorded so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<FetchCall> {
        locked(&self.calls).clone()
    }

    fn materialise(&self, address: &str, destination: &Utf8Path) -> Result<(), FetchError> {
        let files = locked(&self.trees).get(address).cloned().unwrap_or_default();
        let io_failure = |err: workspace::WorkspaceError| FetchError::Spawn {
            program: String::from("static-fetcher"),
            message: err.to_string(),
        };
        if files.is_empty() {
            return workspace::write_file(&destination.join(".keep"), "").map_err(io_failure);
        }
        for (path, contents) in files {
            workspace::write_file(&destination.join(path), &contents).map_err(io_failure)?;
        }
        Ok(())
    }
}

impl SourceFetcher for StaticSourceFetcher {
    fn fetch_at_revision<'a>(
        &'a self,
        address: &'a str,
        destination: &'a Utf8Path,
        revision: Option<&'a str>,
    ) -> CollaboratorFuture<'a, (), FetchError> {
        Box::pin(async move {
            locked(&self.calls).push(FetchCall {
                address: address.to_owned(),
                destination: destination.to_path_buf(),
                revision: revision.map(ToOwned::to_owned),
            });
            if locked(&self.failing).contains(address) {
                return Err(FetchError::CommandFailure {
                    operation: "clone",
                    address: address.to_owned(),
                    status_text: String::from("128"),
                    stderr: String::from("repository not found"),
                });
            }
            self.materialise(address, destination)
        })
    }
}

/// Broker that hands out fixed credentials.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentialBroker {
    fail_assume: bool,
    assumed: Arc<Mutex<Vec<String>>>,
}

impl StaticCredentialBroker {
    /// Creates a broker that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a broker whose assume-role calls fail.
    #[must_use]
    pub fn denying() -> Self {
        Self {
            fail_assume: true,
            assumed: Arc::default(),
        }
    }

    /// Role ARNs requested so far.
    #[must_use]
    pub fn assumed_roles(&self) -> Vec<String> {
        locked(&self.assumed).clone()
    }

    /// Base credentials returned by this broker.
    #[must_use]
    pub fn base() -> BaseCredentials {
        BaseCredentials {
            access_key_id: String::from("AKIABASE"),
            secret_access_key: String::from("base-secret"),
            session_token: None,
        }
    }

    /// Scoped credentials returned by this broker.
    #[must_use]
    pub fn scoped() -> ScopedCredential {
        ScopedCredential {
            access_key_id: String::from("ASIASCOPED"),
            secret_access_key: String::from("scoped-secret"),
            session_token: String::from("scoped-token"),
            expires_at: None,
        }
    }
}

impl CredentialBroker for StaticCredentialBroker {
    fn base_credentials(&self) -> CollaboratorFuture<'_, BaseCredentials, CredentialError> {
        Box::pin(async { Ok(Self::base()) })
    }

    fn assume_role<'a>(
        &'a self,
        _session_name: &'a str,
        role_arn: &'a str,
    ) -> CollaboratorFuture<'a, ScopedCredential, CredentialError> {
        Box::pin(async move {
            locked(&self.assumed).push(role_arn.to_owned());
            if self.fail_assume {
                return Err(CredentialError::AssumeRole {
                    role_arn: role_arn.to_owned(),
                    message: String::from("access denied"),
                });
            }
            Ok(Self::scoped())
        })
    }
}

/// Fan-out target that records payloads instead of starting instances.
#[derive(Clone, Debug, Default)]
pub struct RecordingFanOut {
    payloads: Arc<Mutex<Vec<Vec<u8>>>>,
    fail: bool,
}

impl RecordingFanOut {
    /// Creates a target that accepts every hand-off.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a target that rejects every hand-off.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            payloads: Arc::default(),
            fail: true,
        }
    }

    /// Payloads accepted so far.
    #[must_use]
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        locked(&self.payloads).clone()
    }
}

impl FanOut for RecordingFanOut {
    fn hand_off(&self, payload: Vec<u8>) -> CollaboratorFuture<'_, (), FanOutError> {
        Box::pin(async move {
            if self.fail {
                return Err(FanOutError::Invoke {
                    function: String::from("recording"),
                    message: String::from("throttled"),
                });
            }
            locked(&self.payloads).push(payload);
            Ok(())
        })
    }
}

/// Job runner that records job names and fails or panics on demand.
#[derive(Clone, Debug, Default)]
pub struct ScriptedJobRunner {
    executed: Arc<Mutex<Vec<String>>>,
    failing: BTreeSet<String>,
    panicking: BTreeSet<String>,
}

impl ScriptedJobRunner {
    /// Creates a runner where every job succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the job called `name` fail its apply step.
    #[must_use]
    pub fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_owned());
        self
    }

    /// Makes the job called `name` panic.
    #[must_use]
    pub fn panicking(mut self, name: &str) -> Self {
        self.panicking.insert(name.to_owned());
        self
    }

    /// Names of the jobs started so far.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        locked(&self.executed).clone()
    }
}

impl JobRunner for ScriptedJobRunner {
    fn execute(&self, request: ExecutionRequest) -> CollaboratorFuture<'_, (), JobError> {
        Box::pin(async move {
            locked(&self.executed).push(request.name.clone());
            tokio::task::yield_now().await;
            assert!(
                !self.panicking.contains(&request.name),
                "scripted panic in {}",
                request.name
            );
            if self.failing.contains(&request.name) {
                return Err(JobError::ToolFailed {
                    step: ToolStep::Apply,
                    status_text: String::from("1"),
                });
            }
            Ok(())
        })
    }
}

/// Builds a request with no variables.
#[must_use]
pub fn request(name: &str) -> ExecutionRequest {
    ExecutionRequest {
        account_id: format!("{name}-account"),
        name: name.to_owned(),
        source_version: String::from("v1.0.0"),
        log_level: String::new(),
        variables: BTreeMap::new(),
    }
}

/// Wraps [`request`] in a batch entry.
///
/// # Panics
///
/// Panics when the request cannot be encoded.
#[must_use]
pub fn entry(name: &str) -> BatchEntry {
    BatchEntry::from_request(request(name))
        .unwrap_or_else(|err| panic!("request should encode: {err}"))
}

/// Converts a temporary directory path into a UTF-8 path.
///
/// # Panics
///
/// Panics when the path is not valid UTF-8.
#[must_use]
pub fn utf8_path(path: &std::path::Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf())
        .unwrap_or_else(|bad| panic!("path should be utf8: {}", bad.display()))
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets (`Some`) or removes (`None`) variables while holding a global
    /// mutex.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
