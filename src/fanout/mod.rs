//! Hand-off of overflow requests to a fresh dispatcher instance.
//!
//! A hand-off starts another instance with the encoded overflow batch as its
//! payload and returns as soon as the instance has accepted it; the caller
//! never waits for the forwarded jobs to finish.

use std::process::Stdio;

use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::InvocationType;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::future::CollaboratorFuture;

/// Starts a new dispatcher instance with `payload` and does not await it.
pub trait FanOut: Send + Sync {
    /// Hands `payload` (a JSON-encoded batch) to a new instance.
    fn hand_off(&self, payload: Vec<u8>) -> CollaboratorFuture<'_, (), FanOutError>;
}

/// Errors raised while handing off a batch.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FanOutError {
    /// The asynchronous invocation was rejected.
    #[error("failed to invoke {function}: {message}")]
    Invoke {
        /// Function that was invoked.
        function: String,
        /// Service error description.
        message: String,
    },
    /// The invocation was accepted with an unexpected status code.
    #[error("invocation of {function} returned status {status}")]
    Status {
        /// Function that was invoked.
        function: String,
        /// Status code reported by the service.
        status: i32,
    },
    /// The child process could not be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// The payload could not be written to the child's stdin.
    #[error("failed to send payload to {program}: {message}")]
    Payload {
        /// Program receiving the payload.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Re-invokes a Lambda function with an `Event` invocation.
#[derive(Clone, Debug)]
pub struct LambdaFanOut {
    client: aws_sdk_lambda::Client,
    function_name: String,
}

impl LambdaFanOut {
    /// Creates a hand-off targeting `function_name`.
    #[must_use]
    pub const fn new(client: aws_sdk_lambda::Client, function_name: String) -> Self {
        Self {
            client,
            function_name,
        }
    }
}

/// Status code Lambda returns when an `Event` invocation is queued.
const EVENT_ACCEPTED: i32 = 202;

impl FanOut for LambdaFanOut {
    fn hand_off(&self, payload: Vec<u8>) -> CollaboratorFuture<'_, (), FanOutError> {
        Box::pin(async move {
            let bytes = payload.len();
            let output = self
                .client
                .invoke()
                .function_name(&self.function_name)
                .invocation_type(InvocationType::Event)
                .payload(Blob::new(payload))
                .send()
                .await
                .map_err(|err| FanOutError::Invoke {
                    function: self.function_name.clone(),
                    message: aws_sdk_lambda::error::DisplayErrorContext(&err).to_string(),
                })?;

            if output.status_code() != EVENT_ACCEPTED {
                return Err(FanOutError::Status {
                    function: self.function_name.clone(),
                    status: output.status_code(),
                });
            }

            info!(function = %self.function_name, bytes, "queued overflow invocation");
            Ok(())
        })
    }
}

/// Spawns a detached child process and writes the payload to its stdin.
///
/// The child inherits stdout and stderr, so its tagged output interleaves
/// line by line with the parent's.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessFanOut {
    program: String,
    args: Vec<String>,
}

impl ProcessFanOut {
    /// Creates a hand-off that runs `program args...`.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Hand-off that re-runs the current executable as `run --input -`.
    ///
    /// # Errors
    ///
    /// Returns [`FanOutError::Spawn`] when the current executable cannot be
    /// located.
    pub fn current_executable() -> Result<Self, FanOutError> {
        let exe = std::env::current_exe().map_err(|err| FanOutError::Spawn {
            program: String::from("<current executable>"),
            message: err.to_string(),
        })?;
        Ok(Self::new(
            exe.to_string_lossy().into_owned(),
            vec![
                String::from("run"),
                String::from("--input"),
                String::from("-"),
            ],
        ))
    }
}

impl FanOut for ProcessFanOut {
    fn hand_off(&self, payload: Vec<u8>) -> CollaboratorFuture<'_, (), FanOutError> {
        Box::pin(async move {
            let mut child = Command::new(&self.program)
                .args(&self.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|err| FanOutError::Spawn {
                    program: self.program.clone(),
                    message: err.to_string(),
                })?;

            let mut stdin = child.stdin.take().ok_or_else(|| FanOutError::Payload {
                program: self.program.clone(),
                message: String::from("stdin was not captured"),
            })?;
            stdin
                .write_all(&payload)
                .await
                .map_err(|err| FanOutError::Payload {
                    program: self.program.clone(),
                    message: err.to_string(),
                })?;
            // Closing stdin lets the child see EOF; the child itself is left
            // running.
            drop(stdin);

            debug!(program = %self.program, pid = child.id(), "spawned overflow process");
            Ok(())
        })
    }
}

/// Runtime-selected hand-off.
#[derive(Clone, Debug)]
pub enum FanOutTarget {
    /// Asynchronous Lambda invocation.
    Lambda(LambdaFanOut),
    /// Detached child process.
    Process(ProcessFanOut),
}

impl FanOut for FanOutTarget {
    fn hand_off(&self, payload: Vec<u8>) -> CollaboratorFuture<'_, (), FanOutError> {
        match self {
            Self::Lambda(target) => target.hand_off(payload),
            Self::Process(target) => target.hand_off(payload),
        }
    }
}
