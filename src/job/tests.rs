//! Unit tests for the job pipeline, using a shell script as the tool.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use camino::Utf8Path;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::request::VariableValue;
use crate::test_support::{
    RecordingSink, StaticCredentialBroker, StaticSourceFetcher, request, utf8_path,
};

const PRIMARY: &str = "https://git.example.com/infra/primary";
const NETWORK_RAW: &str = "git::https://git.example.com/infra/network.git//vpc?ref=v3";
const NETWORK: &str = "https://git.example.com/infra/network";

const ENTRY: &str = r#"
module "network" {
  source = "git::https://git.example.com/infra/network.git//vpc?ref=v3"
  cidr   = "10.0.0.0/16"
}

module "local" {
  source = "./local"
}
"#;

struct Harness {
    _tmp: TempDir,
    work_root: Utf8PathBuf,
    tool: Utf8PathBuf,
}

impl Harness {
    fn tree(&self, name: &str) -> WorkingTree {
        WorkingTree::new(&self.work_root, name)
    }

    fn settings(&self) -> JobSettings {
        JobSettings {
            repo_url: PRIMARY.to_owned(),
            role_name: String::from("OrganizationAccountAccessRole"),
            tool_bin: self.tool.to_string(),
            work_root: self.work_root.clone(),
            entry_file: String::from("main.tf"),
            region: String::from("eu-west-1"),
            state_bucket: String::from("states"),
            git_token: None,
            embed_state_credentials: false,
            timestamp_output: false,
            host_path: Some(String::from("/usr/bin:/bin")),
        }
    }

    fn steps(&self, name: &str) -> String {
        fs::read_to_string(self.tree(name).file("steps.log")).unwrap_or_default()
    }
}

fn write_tool(dir: &Utf8Path, failing_step: Option<&str>) -> Utf8PathBuf {
    let exit = failing_step.map_or_else(
        || String::from("exit 0"),
        |step| format!("if [ \"$1\" = \"{step}\" ]; then exit 3; fi"),
    );
    let script = format!(
        "#!/bin/sh\n\
         echo \"$1\" >> \"$HOME/steps.log\"\n\
         env > \"$HOME/env-$1.txt\"\n\
         echo \"running $1\"\n\
         echo \"warn $1\" >&2\n\
         {exit}\n"
    );
    let path = dir.join("fake-tool.sh");
    fs::write(&path, script).expect("write tool");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod tool");
    path
}

fn harness_with(failing_step: Option<&str>) -> Harness {
    let tmp = TempDir::new().expect("tempdir");
    let root = utf8_path(tmp.path());
    let tool = write_tool(&root, failing_step);
    Harness {
        work_root: root.join("work"),
        tool,
        _tmp: tmp,
    }
}

#[fixture]
fn harness() -> Harness {
    harness_with(None)
}

fn fetcher() -> StaticSourceFetcher {
    StaticSourceFetcher::new()
        .with_tree(PRIMARY, &[("main.tf", ENTRY), ("local/main.tf", "")])
        .with_tree(NETWORK, &[("vpc/main.tf", "# vpc")])
}

fn sample_request() -> ExecutionRequest {
    let mut req = request("acct-1");
    req.account_id = String::from("123456789012");
    req.variables = BTreeMap::from([
        (String::from("enabled"), VariableValue::Bool(true)),
        (String::from("count"), VariableValue::Integer(3)),
    ]);
    req
}

fn executor(
    settings: JobSettings,
    fetcher: StaticSourceFetcher,
    broker: StaticCredentialBroker,
    sink: &RecordingSink,
) -> JobExecutor<StaticSourceFetcher, StaticCredentialBroker> {
    JobExecutor::new(settings, fetcher, broker, Arc::new(sink.clone()))
}

#[rstest]
#[tokio::test]
async fn pipeline_runs_init_then_apply(harness: Harness) {
    let sink = RecordingSink::new();
    let fetcher = fetcher();
    let broker = StaticCredentialBroker::new();
    let job = executor(harness.settings(), fetcher.clone(), broker.clone(), &sink);

    job.execute_job(&sample_request()).await.expect("job succeeds");

    assert_eq!(harness.steps("acct-1"), "init\napply\n");
    assert_eq!(
        broker.assumed_roles(),
        vec!["arn:aws:iam::123456789012:role/OrganizationAccountAccessRole"]
    );

    let tree = harness.tree("acct-1");
    let calls = fetcher.calls();
    assert_eq!(calls.len(), 2);
    let primary = calls.first().expect("primary fetch");
    assert_eq!(primary.address, PRIMARY);
    assert_eq!(primary.destination, tree.root());
    assert_eq!(primary.revision.as_deref(), Some("v1.0.0"));
    let module = calls.get(1).expect("module fetch");
    assert_eq!(module.address, NETWORK);
    assert_eq!(module.destination, tree.modules_root().join("network"));
    assert_eq!(module.revision.as_deref(), Some("v3"));

    let lines = sink.lines();
    assert!(lines.contains(&String::from("[acct-1]: running init")));
    assert!(lines.contains(&String::from("[acct-1]: warn apply")));
    assert!(lines.iter().all(|line| line.starts_with("[acct-1]: ")));
}

#[rstest]
#[tokio::test]
async fn pipeline_writes_backend_manifest_and_environment(harness: Harness) {
    let sink = RecordingSink::new();
    let job = executor(harness.settings(), fetcher(), StaticCredentialBroker::new(), &sink);

    job.execute_job(&sample_request()).await.expect("job succeeds");

    let tree = harness.tree("acct-1");
    let backend = fs::read_to_string(tree.file("backend.tf")).expect("backend");
    assert!(backend.contains("key = \"acct-1.tfstate\""));
    assert!(backend.contains("bucket = \"states\""));
    assert!(!backend.contains("access_key"));

    let manifest = fs::read_to_string(tree.manifest_path()).expect("manifest");
    assert!(manifest.contains(NETWORK_RAW));
    assert!(manifest.contains(".terraform/modules/network/vpc"));

    let env = fs::read_to_string(tree.file("env-apply.txt")).expect("env dump");
    let entries: Vec<&str> = env.lines().collect();
    for expected in [
        "enabled=true",
        "count=3",
        "AWS_ACCESS_KEY_ID=ASIASCOPED",
        "AWS_SESSION_TOKEN=scoped-token",
        "AWS_REGION=eu-west-1",
        "TF_IN_AUTOMATION=1",
    ] {
        assert!(entries.contains(&expected), "missing {expected} in {env}");
    }
    assert!(entries.contains(&format!("HOME={}", tree.root()).as_str()));
    assert!(!entries.iter().any(|entry| entry.starts_with("TFDISPATCH_")));
}

#[tokio::test]
async fn failing_init_never_runs_apply() {
    let harness = harness_with(Some("init"));
    let sink = RecordingSink::new();
    let job = executor(harness.settings(), fetcher(), StaticCredentialBroker::new(), &sink);

    let err = job
        .execute_job(&sample_request())
        .await
        .expect_err("init should fail");

    assert!(matches!(
        err,
        JobError::ToolFailed { step: ToolStep::Init, ref status_text } if status_text == "3"
    ));
    assert_eq!(harness.steps("acct-1"), "init\n");
}

#[tokio::test]
async fn failing_apply_is_reported() {
    let harness = harness_with(Some("apply"));
    let sink = RecordingSink::new();
    let job = executor(harness.settings(), fetcher(), StaticCredentialBroker::new(), &sink);

    let err = job
        .execute_job(&sample_request())
        .await
        .expect_err("apply should fail");

    assert!(matches!(err, JobError::ToolFailed { step: ToolStep::Apply, .. }));
    assert_eq!(harness.steps("acct-1"), "init\napply\n");
}

#[rstest]
#[tokio::test]
async fn denied_role_stops_before_the_tool(harness: Harness) {
    let sink = RecordingSink::new();
    let job = executor(harness.settings(), fetcher(), StaticCredentialBroker::denying(), &sink);

    let err = job
        .execute_job(&sample_request())
        .await
        .expect_err("assume role should fail");

    assert!(matches!(err, JobError::Credentials(CredentialError::AssumeRole { .. })));
    assert!(harness.steps("acct-1").is_empty());
}

#[rstest]
#[tokio::test]
async fn primary_fetch_failure_names_the_repository(harness: Harness) {
    let sink = RecordingSink::new();
    let job = executor(
        harness.settings(),
        fetcher().failing_on(PRIMARY),
        StaticCredentialBroker::new(),
        &sink,
    );

    let err = job
        .execute_job(&sample_request())
        .await
        .expect_err("fetch should fail");

    assert!(matches!(err, JobError::Fetch { ref address, .. } if address == PRIMARY));
}

#[rstest]
#[tokio::test]
async fn entry_file_without_modules_fails_the_job(harness: Harness) {
    let sink = RecordingSink::new();
    let fetcher = StaticSourceFetcher::new().with_tree(PRIMARY, &[("main.tf", "# empty\n")]);
    let job = executor(harness.settings(), fetcher.clone(), StaticCredentialBroker::new(), &sink);

    let err = job
        .execute_job(&sample_request())
        .await
        .expect_err("resolution should fail");

    assert!(matches!(err, JobError::Modules(ref inner) if matches!(**inner, ResolveError::NoModules { .. })));
    assert_eq!(fetcher.calls().len(), 1);
    assert!(harness.steps("acct-1").is_empty());
}

#[rstest]
#[tokio::test]
async fn invalid_request_fails_before_fetching(harness: Harness) {
    let sink = RecordingSink::new();
    let fetcher = fetcher();
    let job = executor(harness.settings(), fetcher.clone(), StaticCredentialBroker::new(), &sink);
    let mut req = sample_request();
    req.name = String::from("../escape");

    let err = job.execute_job(&req).await.expect_err("invalid name");

    assert!(matches!(err, JobError::Request(_)));
    assert!(fetcher.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn git_token_is_written_to_job_home(harness: Harness) {
    let sink = RecordingSink::new();
    let mut settings = harness.settings();
    settings.git_token = Some(String::from("secret"));
    settings.embed_state_credentials = true;
    let job = executor(settings, fetcher(), StaticCredentialBroker::new(), &sink);

    job.execute_job(&sample_request()).await.expect("job succeeds");

    let tree = harness.tree("acct-1");
    let git_config = fs::read_to_string(tree.file(".gitconfig")).expect("gitconfig");
    assert!(git_config.contains("extraHeader = Authorization: Basic Z2l0OnNlY3JldA=="));
    let backend = fs::read_to_string(tree.file("backend.tf")).expect("backend");
    assert!(backend.contains("access_key = \"AKIABASE\""));
    for secret_file in [".gitconfig", "backend.tf"] {
        let mode = fs::metadata(tree.file(secret_file))
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600, "{secret_file} mode {mode:o}");
    }
}

#[rstest]
#[tokio::test]
async fn stale_tree_is_replaced(harness: Harness) {
    let tree = harness.tree("acct-1");
    tree.write_file("stale.txt", "old").expect("seed stale tree");
    let sink = RecordingSink::new();
    let job = executor(harness.settings(), fetcher(), StaticCredentialBroker::new(), &sink);

    job.execute_job(&sample_request()).await.expect("job succeeds");

    assert!(!tree.file("stale.txt").exists());
}
