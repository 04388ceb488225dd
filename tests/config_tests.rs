//! Tests for layered configuration loading and validation.

use std::fs;

use rstest::*;
use tempfile::TempDir;

use tfdispatch::config::{ConfigError, ExecutorConfig, FanOutMode};
use tfdispatch::test_support::EnvGuard;

const CLEARED: [(&str, Option<&str>); 6] = [
    ("TFDISPATCH_CONFIG_PATH", None),
    ("TFDISPATCH_STATE_BUCKET", None),
    ("TFDISPATCH_REPO_URL", None),
    ("TFDISPATCH_CAPACITY", None),
    ("TFDISPATCH_FAN_OUT", None),
    ("TFDISPATCH_REGION", None),
];

fn with_overrides<'a>(overrides: &[(&'a str, Option<&'a str>)]) -> Vec<(&'a str, Option<&'a str>)> {
    CLEARED
        .iter()
        .filter(|(key, _)| !overrides.iter().any(|(name, _)| name == key))
        .chain(overrides.iter())
        .copied()
        .collect()
}

#[fixture]
fn valid_config() -> ExecutorConfig {
    ExecutorConfig {
        region: String::from("us-east-1"),
        state_bucket: String::from("states"),
        repo_url: String::from("https://git.example.com/infra/primary"),
        git_token: None,
        git_bin: String::from("git"),
        role_name: String::from("OrganizationAccountAccessRole"),
        tool_bin: String::from("terraform"),
        work_root: String::from("/tmp"),
        entry_file: String::from("main.tf"),
        capacity: None,
        fan_out: String::from("process"),
        function_name: None,
        embed_state_credentials: false,
        timestamp_output: true,
    }
}

#[tokio::test]
async fn environment_overrides_defaults() {
    let vars = with_overrides(&[
        ("TFDISPATCH_STATE_BUCKET", Some("env-states")),
        ("TFDISPATCH_REPO_URL", Some("https://git.example.com/infra/env")),
        ("TFDISPATCH_CAPACITY", Some("3")),
        ("TFDISPATCH_FAN_OUT", Some("process")),
    ]);
    let _guard = EnvGuard::set_vars(&vars).await;

    let config = ExecutorConfig::load_without_cli_args().expect("config should load");

    assert_eq!(config.state_bucket, "env-states");
    assert_eq!(config.repo_url, "https://git.example.com/infra/env");
    assert_eq!(config.capacity, Some(3));
    assert_eq!(config.fan_out_mode(), Ok(FanOutMode::Process));
    assert_eq!(config.region, "us-east-1");
    assert_eq!(config.role_name, "OrganizationAccountAccessRole");
    assert_eq!(config.entry_file, "main.tf");
    assert!(config.timestamp_output);
    assert!(!config.embed_state_credentials);
    assert_eq!(config.validate(), Ok(()));
}

#[tokio::test]
async fn config_file_named_by_env_var_is_loaded() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("tfdispatch.toml");
    fs::write(
        &path,
        "state_bucket = \"file-states\"\nrepo_url = \"https://git.example.com/infra/file\"\nregion = \"eu-west-2\"\n",
    )
    .expect("write config");
    let path_str = path.to_str().expect("utf8 path");
    let vars = with_overrides(&[("TFDISPATCH_CONFIG_PATH", Some(path_str))]);
    let _guard = EnvGuard::set_vars(&vars).await;

    let config = ExecutorConfig::load_without_cli_args().expect("config should load");

    assert_eq!(config.state_bucket, "file-states");
    assert_eq!(config.region, "eu-west-2");
}

#[rstest]
#[case::state_bucket(|cfg: &mut ExecutorConfig| cfg.state_bucket.clear(), "TFDISPATCH_STATE_BUCKET", "state_bucket")]
#[case::repo_url(|cfg: &mut ExecutorConfig| cfg.repo_url.clear(), "TFDISPATCH_REPO_URL", "repo_url")]
#[case::region(|cfg: &mut ExecutorConfig| cfg.region = String::from("  "), "TFDISPATCH_REGION", "region")]
#[case::tool_bin(|cfg: &mut ExecutorConfig| cfg.tool_bin.clear(), "TFDISPATCH_TOOL_BIN", "tool_bin")]
fn validation_errors_are_actionable(
    valid_config: ExecutorConfig,
    #[case] mutate: fn(&mut ExecutorConfig),
    #[case] env_var: &str,
    #[case] toml_key: &str,
) {
    let mut cfg = valid_config;
    mutate(&mut cfg);

    let error = cfg.validate().expect_err("validation should fail");
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField error, got {error:?}");
    };
    assert!(message.contains(env_var), "error should mention {env_var}: {message}");
    assert!(message.contains(toml_key), "error should mention {toml_key}: {message}");
    assert!(message.contains("tfdispatch.toml"), "error should mention config file: {message}");
}

#[tokio::test]
async fn lambda_mode_needs_a_function_name() {
    let _guard = EnvGuard::set_vars(&[("AWS_LAMBDA_FUNCTION_NAME", None)]).await;
    let cfg = ExecutorConfig {
        fan_out: String::from("lambda"),
        ..valid_config()
    };

    let err = cfg.function_name().expect_err("no function name");
    assert!(err.to_string().contains("AWS_LAMBDA_FUNCTION_NAME"));
}

#[tokio::test]
async fn function_name_falls_back_to_lambda_runtime() {
    let _guard =
        EnvGuard::set_vars(&[("AWS_LAMBDA_FUNCTION_NAME", Some("runtime-dispatcher"))]).await;

    assert_eq!(
        valid_config().function_name(),
        Ok(String::from("runtime-dispatcher"))
    );
}
