//! Binary entry point for the `tfdispatch` CLI.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tfdispatch::dispatch::host_capacity;
use tfdispatch::modules::{self, ResolveError};
use tfdispatch::request::parse_batch;
use tfdispatch::service::{self, ServiceError};
use tfdispatch::{ConfigError, ExecutorConfig, RequestError};

mod cli;

use cli::{Cli, ModulesCommand, RunCommand};

const LOG_ENV: &str = "TFDISPATCH_LOG";

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to read {path}: {message}")]
    Input { path: String, message: String },
    #[error("malformed batch: {0}")]
    Request(#[from] RequestError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to start runtime: {0}")]
    Runtime(String),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("module discovery failed: {0}")]
    Modules(Box<ResolveError>),
    #[error("invalid path {0}: paths must be valid UTF-8")]
    NonUtf8Path(String),
    #[error("failed to write output: {0}")]
    Output(String),
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_command(&command),
        Cli::Modules(command) => modules_command(&command),
    }
}

fn run_command(args: &RunCommand) -> Result<i32, CliError> {
    let payload = read_input(&args.input)?;
    let entries = parse_batch(&payload)?;
    if entries.is_empty() {
        info!("empty batch; nothing to do");
        return Ok(0);
    }

    let config = ExecutorConfig::load_without_cli_args()?;
    config.validate()?;
    let capacity = config.capacity(host_capacity());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(capacity.get())
        .enable_all()
        .build()
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    let report = runtime.block_on(service::run_batch(&config, capacity, entries))?;

    service::log_summary(&report);
    Ok(i32::from(!report.all_succeeded()))
}

fn modules_command(args: &ModulesCommand) -> Result<i32, CliError> {
    let entry_file = utf8(&args.entry_file)?;
    let modules_root = utf8(&args.modules_root)?;

    let descriptors = modules::discover(&entry_file, &modules_root)
        .map_err(|err| CliError::Modules(Box::new(err)))?;
    let rendered = serde_json::to_string_pretty(&descriptors)
        .map_err(|err| CliError::Output(err.to_string()))?;

    writeln!(io::stdout(), "{rendered}").map_err(|err| CliError::Output(err.to_string()))?;
    Ok(0)
}

fn read_input(path: &Path) -> Result<Vec<u8>, CliError> {
    let input_error = |err: io::Error| CliError::Input {
        path: path.display().to_string(),
        message: err.to_string(),
    };

    if path.as_os_str() == "-" {
        let mut buffer = Vec::new();
        io::stdin().read_to_end(&mut buffer).map_err(input_error)?;
        return Ok(buffer);
    }
    fs::read(path).map_err(input_error)
}

fn utf8(path: &Path) -> Result<Utf8PathBuf, CliError> {
    Utf8PathBuf::from_path_buf(path.to_path_buf())
        .map_err(|bad| CliError::NonUtf8Path(bad.display().to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_reads_stdin_by_default() {
        let Cli::Run(command) = Cli::parse_from(["tfdispatch", "run"]) else {
            panic!("expected run subcommand");
        };
        assert_eq!(command.input, Path::new("-"));
    }

    #[test]
    fn write_error_renders_message() {
        let mut buffer = Vec::new();
        write_error(
            &mut buffer,
            &CliError::Input {
                path: String::from("batch.json"),
                message: String::from("not found"),
            },
        );
        assert_eq!(
            String::from_utf8(buffer).expect("utf8"),
            "failed to read batch.json: not found\n"
        );
    }

    #[test]
    fn read_input_reports_missing_file() {
        let err = read_input(Path::new("/nonexistent/batch.json")).expect_err("missing file");
        assert!(matches!(err, CliError::Input { ref path, .. } if path == "/nonexistent/batch.json"));
    }
}
