//! Job-tagged multiplexing of tool output.
//!
//! Every job owns a [`Multiplexer`] that drains the tool's stdout and stderr
//! line by line and forwards each complete line to a shared
//! [`OutputSink`], prefixed with `[<job>]:` (and optionally a wall-clock
//! timestamp). A line is handed to the sink in a single call, so output from
//! concurrent jobs never fuses mid-line.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::warn;

/// Destination for tagged output lines.
pub trait OutputSink: Send + Sync {
    /// Writes one complete line. The sink appends the line terminator.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the line cannot be written.
    fn write_line(&self, line: &str) -> io::Result<()>;
}

/// Sink that writes each line to the process's stdout under the stdout lock.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut buffer = String::with_capacity(line.len() + 1);
        buffer.push_str(line);
        buffer.push('\n');

        let mut stdout = io::stdout().lock();
        stdout.write_all(buffer.as_bytes())?;
        stdout.flush()
    }
}

/// Identifies which stream of the tool a line came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Tags and forwards the output of a single job.
#[derive(Clone)]
pub struct Multiplexer {
    job: String,
    timestamps: bool,
    sink: Arc<dyn OutputSink>,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("job", &self.job)
            .field("timestamps", &self.timestamps)
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Creates a multiplexer for `job` writing into `sink`.
    #[must_use]
    pub fn new(job: impl Into<String>, timestamps: bool, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            job: job.into(),
            timestamps,
            sink,
        }
    }

    /// Returns the job name used in the prefix.
    #[must_use]
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Formats `line` with the job prefix.
    #[must_use]
    pub fn tag(&self, line: &str) -> String {
        if self.timestamps {
            let now = chrono::Local::now();
            format!("[{}][{}]: {line}", now.format("%H:%M:%S"), self.job)
        } else {
            format!("[{}]: {line}", self.job)
        }
    }

    /// Tags and forwards one line. Sink failures are logged and dropped so
    /// a broken writer never stalls the job.
    pub fn emit(&self, stream: StreamKind, line: &str) {
        if let Err(err) = self.sink.write_line(&self.tag(line)) {
            warn!(job = %self.job, %stream, error = %err, "failed to forward output line");
        }
    }

    /// Reads `source` until EOF, forwarding every line. A trailing fragment
    /// without a newline is forwarded as its own line. Invalid UTF-8 is
    /// replaced rather than rejected.
    ///
    /// Returns the number of lines forwarded.
    ///
    /// # Errors
    ///
    /// Returns the read error when the underlying stream breaks; lines read
    /// before the failure have already been forwarded.
    pub async fn drain<R>(&self, stream: StreamKind, source: R) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(source);
        let mut buffer = Vec::new();
        let mut forwarded = 0_usize;

        loop {
            buffer.clear();
            let read = reader.read_until(b'\n', &mut buffer).await?;
            if read == 0 {
                break;
            }

            let text = String::from_utf8_lossy(&buffer);
            self.emit(stream, text.trim_end_matches(['\n', '\r']));
            forwarded += 1;
        }

        Ok(forwarded)
    }
}
