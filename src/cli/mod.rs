//! Command-line interface definitions for the `tfdispatch` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use std::path::PathBuf;

use clap::Parser;

/// Top-level CLI for the `tfdispatch` binary.
#[derive(Debug, Parser)]
#[command(
    name = "tfdispatch",
    about = "Fan out batches of Terraform runs across AWS accounts",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run a batch of execution requests.
    #[command(name = "run", about = "Run a batch of execution requests")]
    Run(RunCommand),
    /// List the remote modules declared in an entry file without fetching.
    #[command(
        name = "modules",
        about = "List the remote modules declared in an entry file"
    )]
    Modules(ModulesCommand),
}

/// Arguments for the `tfdispatch run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// JSON batch to read; `-` reads standard input.
    #[arg(long, short, value_name = "PATH", default_value = "-")]
    pub(crate) input: PathBuf,
}

/// Arguments for the `tfdispatch modules` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ModulesCommand {
    /// Entry file to scan for `module` blocks.
    #[arg(value_name = "ENTRY_FILE")]
    pub(crate) entry_file: PathBuf,
    /// Directory the modules would be checked out under.
    #[arg(long, value_name = "DIR", default_value = ".terraform/modules")]
    pub(crate) modules_root: PathBuf,
}
