//! Environment handed to the tool.
//!
//! The tool runs with a cleared environment; only the entries assembled
//! here reach it.

use crate::credentials::ScopedCredential;
use crate::request::ExecutionRequest;
use crate::workspace::WorkingTree;

/// Ordered list of `NAME=value` entries.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Environment {
    entries: Vec<(String, String)>,
}

impl Environment {
    /// Appends an entry. Later entries with the same name win when the
    /// process is spawned.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Effective value of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Iterates over the entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Entries rendered as `NAME=value`.
    #[must_use]
    pub fn render(&self) -> Vec<String> {
        self.iter().map(|(key, value)| format!("{key}={value}")).collect()
    }
}

/// Builds the tool environment for one job.
///
/// Request variables come first so the credential, cache, and home entries
/// always override a variable of the same name.
#[must_use]
pub fn assemble(
    request: &ExecutionRequest,
    scoped: &ScopedCredential,
    tree: &WorkingTree,
    region: &str,
    host_path: Option<&str>,
) -> Environment {
    let mut env = Environment::default();
    for (name, value) in request.variable_entries() {
        env.push(name, value);
    }

    env.push("AWS_ACCESS_KEY_ID", scoped.access_key_id.as_str());
    env.push("AWS_SECRET_ACCESS_KEY", scoped.secret_access_key.as_str());
    env.push("AWS_SESSION_TOKEN", scoped.session_token.as_str());
    env.push("AWS_REGION", region);
    env.push("AWS_DEFAULT_REGION", region);

    env.push("TF_PLUGIN_CACHE_DIR", tree.plugin_cache_dir().as_str());
    env.push("TF_DATA_DIR", tree.data_dir().as_str());
    if !request.log_level.trim().is_empty() {
        env.push("TF_LOG", request.log_level.trim());
    }
    env.push("TF_IN_AUTOMATION", "1");

    env.push("HOME", tree.home().as_str());
    if let Some(path) = host_path {
        env.push("PATH", path);
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{BatchEntry, parse_batch};
    use crate::test_support::{StaticCredentialBroker, request};
    use camino::Utf8Path;

    fn tree() -> WorkingTree {
        WorkingTree::new(Utf8Path::new("/work"), "acct-1")
    }

    #[test]
    fn variables_are_rendered_by_type() {
        let batch = parse_batch(
            br#"[{"id":"1","name":"acct-1","version":"v1.0.0",
                 "variables":{"enabled":true,"count":3,"ratio":1.5,
                              "label":"blue","tags":{"team":"ops"}}}]"#,
        )
        .expect("valid batch");
        let req = batch.first().and_then(BatchEntry::request).expect("request");

        let env = assemble(req, &StaticCredentialBroker::scoped(), &tree(), "us-east-1", None);

        assert_eq!(env.get("enabled"), Some("true"));
        assert_eq!(env.get("count"), Some("3"));
        assert_eq!(env.get("ratio"), Some("1.500000"));
        assert_eq!(env.get("label"), Some("blue"));
        assert_eq!(env.get("tags"), Some(r#"{"team":"ops"}"#));
    }

    #[test]
    fn credentials_cache_and_home_entries_are_present() {
        let env = assemble(
            &request("acct-1"),
            &StaticCredentialBroker::scoped(),
            &tree(),
            "eu-central-1",
            Some("/usr/bin:/bin"),
        );

        assert_eq!(env.get("AWS_ACCESS_KEY_ID"), Some("ASIASCOPED"));
        assert_eq!(env.get("AWS_SECRET_ACCESS_KEY"), Some("scoped-secret"));
        assert_eq!(env.get("AWS_SESSION_TOKEN"), Some("scoped-token"));
        assert_eq!(env.get("AWS_REGION"), Some("eu-central-1"));
        assert_eq!(env.get("AWS_DEFAULT_REGION"), Some("eu-central-1"));
        assert_eq!(
            env.get("TF_PLUGIN_CACHE_DIR"),
            Some("/work/acct-1/.terraform.d/plugin-cache")
        );
        assert_eq!(env.get("TF_DATA_DIR"), Some("/work/acct-1/.terraform"));
        assert_eq!(env.get("TF_IN_AUTOMATION"), Some("1"));
        assert_eq!(env.get("HOME"), Some("/work/acct-1"));
        assert_eq!(env.get("PATH"), Some("/usr/bin:/bin"));
        assert_eq!(env.get("TF_LOG"), None);
    }

    #[test]
    fn log_level_becomes_tf_log() {
        let mut req = request("acct-1");
        req.log_level = String::from("DEBUG");

        let env = assemble(&req, &StaticCredentialBroker::scoped(), &tree(), "us-east-1", None);

        assert_eq!(env.get("TF_LOG"), Some("DEBUG"));
    }

    #[test]
    fn reserved_entries_override_colliding_variables() {
        let batch = parse_batch(
            br#"[{"id":"1","name":"acct-1","version":"v1","variables":{"HOME":"/elsewhere"}}]"#,
        )
        .expect("valid batch");
        let req = batch.first().and_then(BatchEntry::request).expect("request");

        let env = assemble(req, &StaticCredentialBroker::scoped(), &tree(), "us-east-1", None);

        assert_eq!(env.get("HOME"), Some("/work/acct-1"));
        assert!(env.render().contains(&String::from("HOME=/elsewhere")));
    }
}
