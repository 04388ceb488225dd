//! Running the tool's lifecycle steps with streamed output.

use std::fmt;
use std::process::Stdio;

use camino::Utf8Path;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Environment, JobError};
use crate::output::{Multiplexer, StreamKind};

/// One of the two lifecycle commands run per job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ToolStep {
    /// `init -input=false`
    Init,
    /// `apply -input=false -auto-approve`
    Apply,
}

impl ToolStep {
    /// Arguments passed to the tool for this step.
    #[must_use]
    pub const fn args(self) -> &'static [&'static str] {
        match self {
            Self::Init => &["init", "-input=false"],
            Self::Apply => &["apply", "-input=false", "-auto-approve"],
        }
    }
}

impl fmt::Display for ToolStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::Apply => f.write_str("apply"),
        }
    }
}

/// Runs `program` for `step` inside `dir` with exactly `env`, forwarding
/// both output streams through `mux` until the process exits and both
/// streams are drained.
///
/// # Errors
///
/// Returns [`JobError::Spawn`] when the process cannot start,
/// [`JobError::Wait`] when its status cannot be collected, and
/// [`JobError::ToolFailed`] on a non-zero exit.
pub async fn run_step(
    program: &str,
    step: ToolStep,
    dir: &Utf8Path,
    env: &Environment,
    mux: &Multiplexer,
) -> Result<(), JobError> {
    debug!(job = mux.job(), %step, path = %dir, "starting tool step");
    let mut child = Command::new(program)
        .args(step.args())
        .env_clear()
        .envs(env.iter())
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| JobError::Spawn {
            step,
            program: program.to_owned(),
            message: err.to_string(),
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let drain_stdout = async {
        if let Some(stream) = stdout {
            let drained = mux.drain(StreamKind::Stdout, stream).await;
            report_drain(mux, step, StreamKind::Stdout, drained);
        }
    };
    let drain_stderr = async {
        if let Some(stream) = stderr {
            let drained = mux.drain(StreamKind::Stderr, stream).await;
            report_drain(mux, step, StreamKind::Stderr, drained);
        }
    };

    let (waited, (), ()) = tokio::join!(child.wait(), drain_stdout, drain_stderr);
    let status = waited.map_err(|err| JobError::Wait {
        step,
        message: err.to_string(),
    })?;

    if status.success() {
        Ok(())
    } else {
        Err(JobError::ToolFailed {
            step,
            status_text: status
                .code()
                .map_or_else(|| String::from("unknown"), |code| code.to_string()),
        })
    }
}

fn report_drain(
    mux: &Multiplexer,
    step: ToolStep,
    stream: StreamKind,
    result: std::io::Result<usize>,
) {
    match result {
        Ok(lines) => debug!(job = mux.job(), %step, %stream, lines, "stream drained"),
        Err(err) => warn!(job = mux.job(), %step, %stream, error = %err, "failed to read tool output"),
    }
}
