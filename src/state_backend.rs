//! Remote-state configuration written into each working tree.

use camino::Utf8PathBuf;

use crate::credentials::BaseCredentials;
use crate::workspace::{BACKEND_FILE, WorkingTree, WorkspaceError};

/// Shared S3 state store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StateBackend {
    bucket: String,
    region: String,
}

impl StateBackend {
    /// Creates a backend targeting `bucket` in `region`.
    #[must_use]
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
        }
    }

    /// State object key for `job_name`.
    #[must_use]
    pub fn state_key(job_name: &str) -> String {
        format!("{job_name}.tfstate")
    }

    /// Renders the backend block. When `credentials` are given they are
    /// written explicitly so the store is reached with the host identity
    /// rather than the scoped one.
    #[must_use]
    pub fn render(&self, job_name: &str, credentials: Option<&BaseCredentials>) -> String {
        let key = Self::state_key(job_name);
        let mut attributes = vec![
            ("bucket", self.bucket.as_str()),
            ("key", key.as_str()),
            ("region", self.region.as_str()),
        ];
        if let Some(creds) = credentials {
            attributes.push(("access_key", creds.access_key_id.as_str()));
            attributes.push(("secret_key", creds.secret_access_key.as_str()));
            if let Some(token) = &creds.session_token {
                attributes.push(("token", token.as_str()));
            }
        }

        let mut rendered = String::from("terraform {\n  backend \"s3\" {\n");
        for (name, value) in attributes {
            rendered.push_str("    ");
            rendered.push_str(name);
            rendered.push_str(" = \"");
            rendered.push_str(&escape(value));
            rendered.push_str("\"\n");
        }
        rendered.push_str("  }\n}\n");
        rendered
    }

    /// Writes the backend file into `tree` before the tool runs.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError`] when the file cannot be written.
    pub fn write(
        &self,
        tree: &WorkingTree,
        job_name: &str,
        credentials: Option<&BaseCredentials>,
    ) -> Result<Utf8PathBuf, WorkspaceError> {
        tree.write_private_file(BACKEND_FILE, &self.render(job_name, credentials))
    }
}

/// Escapes a value for an HCL quoted string, including template sequences.
fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '$' | '%' if chars.peek() == Some(&'{') => {
                escaped.push(ch);
                escaped.push(ch);
            }
            other => escaped.push(other),
        }
    }
    escaped
}
