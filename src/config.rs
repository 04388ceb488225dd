//! Configuration loading via `ortho-config`.

use std::env;
use std::ffi::OsString;
use std::num::NonZeroUsize;
use std::str::FromStr;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::job::JobSettings;

/// Name of the configuration file searched for by discovery.
pub const CONFIG_FILE: &str = "tfdispatch.toml";
/// Variable Lambda sets to the running function's name.
pub const LAMBDA_FUNCTION_ENV: &str = "AWS_LAMBDA_FUNCTION_NAME";

/// Executor settings derived from defaults, configuration files, and
/// `TFDISPATCH_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "TFDISPATCH",
    discovery(
        app_name = "tfdispatch",
        env_var = "TFDISPATCH_CONFIG_PATH",
        config_file_name = "tfdispatch.toml",
        dotfile_name = ".tfdispatch.toml",
        project_file_name = "tfdispatch.toml"
    )
)]
pub struct ExecutorConfig {
    /// AWS region for STS, Lambda, and the state bucket.
    #[ortho_config(default = "us-east-1".to_owned())]
    pub region: String,
    /// Bucket holding every job's remote state. Required.
    #[ortho_config(default = String::new())]
    pub state_bucket: String,
    /// Repository of the primary module. Required.
    #[ortho_config(default = String::new())]
    pub repo_url: String,
    /// Token used for HTTPS git fetches.
    pub git_token: Option<String>,
    /// Path to the `git` executable.
    #[ortho_config(default = "git".to_owned())]
    pub git_bin: String,
    /// Role assumed in each target account.
    #[ortho_config(default = "OrganizationAccountAccessRole".to_owned())]
    pub role_name: String,
    /// Path to the `terraform` executable.
    #[ortho_config(default = "terraform".to_owned())]
    pub tool_bin: String,
    /// Parent directory of the per-job working trees.
    #[ortho_config(default = "/tmp".to_owned())]
    pub work_root: String,
    /// Entry file of the primary module scanned for module blocks.
    #[ortho_config(default = "main.tf".to_owned())]
    pub entry_file: String,
    /// Jobs run locally per invocation; defaults to the host's parallelism.
    pub capacity: Option<usize>,
    /// Hand-off mechanism for overflow requests: `lambda` or `process`.
    #[ortho_config(default = "lambda".to_owned())]
    pub fan_out: String,
    /// Lambda function re-invoked with the overflow. Falls back to
    /// `AWS_LAMBDA_FUNCTION_NAME`.
    pub function_name: Option<String>,
    /// Whether to write the host's credentials into the backend block.
    #[ortho_config(default = false)]
    pub embed_state_credentials: bool,
    /// Whether to prefix tagged output lines with `[HH:MM:SS]`.
    #[ortho_config(default = true)]
    pub timestamp_output: bool,
}

/// Overflow hand-off mechanism.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FanOutMode {
    /// Asynchronous Lambda invocation.
    Lambda,
    /// Detached child process running this executable.
    Process,
}

impl FromStr for FanOutMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lambda" => Ok(Self::Lambda),
            "process" => Ok(Self::Process),
            other => Err(ConfigError::InvalidValue(format!(
                "fan_out must be `lambda` or `process`, got `{other}`: set TFDISPATCH_FAN_OUT or fan_out in {CONFIG_FILE}"
            ))),
        }
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl ExecutorConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to {CONFIG_FILE}",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("tfdispatch")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and configuration key that supply the value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::InvalidValue`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.state_bucket,
                FieldMetadata::new("state bucket", "TFDISPATCH_STATE_BUCKET", "state_bucket"),
            ),
            (
                &self.repo_url,
                FieldMetadata::new("primary repository URL", "TFDISPATCH_REPO_URL", "repo_url"),
            ),
            (
                &self.region,
                FieldMetadata::new("AWS region", "TFDISPATCH_REGION", "region"),
            ),
            (
                &self.role_name,
                FieldMetadata::new("role name", "TFDISPATCH_ROLE_NAME", "role_name"),
            ),
            (
                &self.tool_bin,
                FieldMetadata::new("tool executable", "TFDISPATCH_TOOL_BIN", "tool_bin"),
            ),
            (
                &self.entry_file,
                FieldMetadata::new("entry file", "TFDISPATCH_ENTRY_FILE", "entry_file"),
            ),
            (
                &self.work_root,
                FieldMetadata::new("working root", "TFDISPATCH_WORK_ROOT", "work_root"),
            ),
        ];
        for (value, metadata) in &required {
            Self::require_field(value, metadata)?;
        }

        if self.capacity == Some(0) {
            return Err(ConfigError::InvalidValue(format!(
                "capacity must be at least 1: set TFDISPATCH_CAPACITY or capacity in {CONFIG_FILE}"
            )));
        }
        self.fan_out_mode()?;
        Ok(())
    }

    /// Number of jobs run locally, falling back to `host`.
    #[must_use]
    pub fn capacity(&self, host: NonZeroUsize) -> NonZeroUsize {
        self.capacity.and_then(NonZeroUsize::new).unwrap_or(host)
    }

    /// Parsed hand-off mechanism.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unknown modes.
    pub fn fan_out_mode(&self) -> Result<FanOutMode, ConfigError> {
        self.fan_out.parse()
    }

    /// Lambda function to re-invoke, preferring the configured name over the
    /// runtime's own.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when neither is set.
    pub fn function_name(&self) -> Result<String, ConfigError> {
        self.function_name
            .clone()
            .or_else(|| env::var(LAMBDA_FUNCTION_ENV).ok())
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| {
                ConfigError::MissingField(format!(
                    "missing Lambda function name: set TFDISPATCH_FUNCTION_NAME, {LAMBDA_FUNCTION_ENV}, or add function_name to {CONFIG_FILE}"
                ))
            })
    }

    /// Git token with blank values treated as absent.
    #[must_use]
    pub fn git_token(&self) -> Option<String> {
        self.git_token
            .clone()
            .filter(|token| !token.trim().is_empty())
    }

    /// Settings shared by every job of the batch.
    #[must_use]
    pub fn job_settings(&self, host_path: Option<String>) -> JobSettings {
        JobSettings {
            repo_url: self.repo_url.clone(),
            role_name: self.role_name.clone(),
            tool_bin: self.tool_bin.clone(),
            work_root: Utf8PathBuf::from(&self.work_root),
            entry_file: self.entry_file.clone(),
            region: self.region.clone(),
            state_bucket: self.state_bucket.clone(),
            git_token: self.git_token(),
            embed_state_credentials: self.embed_state_credentials,
            timestamp_output: self.timestamp_output,
            host_path,
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configured value is outside its accepted range.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
