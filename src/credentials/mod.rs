//! Temporary credentials scoped to a target account.
//!
//! The dispatcher runs with the host's base credentials and, for every job,
//! assumes a role in the target account through STS. The scoped credential
//! is handed to the tool; the base credential is only used to reach the
//! shared state bucket.

use std::fmt;
use std::time::SystemTime;

use aws_config::SdkConfig;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sdk_sts::error::DisplayErrorContext;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::future::CollaboratorFuture;

const REDACTED: &str = "<redacted>";

/// Credentials of the process itself.
#[derive(Clone, Eq, PartialEq)]
pub struct BaseCredentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token when the host runs on temporary credentials.
    pub session_token: Option<String>,
}

impl fmt::Debug for BaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &REDACTED)
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| REDACTED),
            )
            .finish()
    }
}

/// Temporary credentials for one target account, owned by one job.
#[derive(Clone, Eq, PartialEq)]
pub struct ScopedCredential {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token.
    pub session_token: String,
    /// Expiry reported by the issuer.
    pub expires_at: Option<SystemTime>,
}

impl fmt::Debug for ScopedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCredential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &REDACTED)
            .field("session_token", &REDACTED)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Errors raised while obtaining credentials.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CredentialError {
    /// No credentials provider is configured for the process.
    #[error("no AWS credentials provider is configured")]
    MissingProvider,
    /// The provider failed to yield base credentials.
    #[error("failed to load base credentials: {message}")]
    Provider {
        /// Provider error description.
        message: String,
    },
    /// The role could not be assumed.
    #[error("failed to assume {role_arn}: {message}")]
    AssumeRole {
        /// Role that was requested.
        role_arn: String,
        /// Service error description.
        message: String,
    },
    /// The issuer answered without credentials.
    #[error("assuming {role_arn} returned no credentials")]
    MissingCredentials {
        /// Role that was requested.
        role_arn: String,
    },
}

/// Issues base and account-scoped credentials.
pub trait CredentialBroker: Send + Sync {
    /// Returns the credentials the process itself runs with.
    fn base_credentials(&self) -> CollaboratorFuture<'_, BaseCredentials, CredentialError>;

    /// Exchanges the base credentials for temporary credentials of
    /// `role_arn`.
    fn assume_role<'a>(
        &'a self,
        session_name: &'a str,
        role_arn: &'a str,
    ) -> CollaboratorFuture<'a, ScopedCredential, CredentialError>;
}

/// Builds the ARN of `role_name` in `account_id`.
#[must_use]
pub fn role_arn(account_id: &str, role_name: &str) -> String {
    format!("arn:aws:iam::{account_id}:role/{role_name}")
}

/// Generates a unique session name for one assume-role call.
#[must_use]
pub fn session_name() -> String {
    format!("tfdispatch-{}", Uuid::new_v4().simple())
}

/// [`CredentialBroker`] backed by STS and the SDK's default provider chain.
#[derive(Clone, Debug)]
pub struct StsCredentialBroker {
    client: aws_sdk_sts::Client,
    provider: Option<SharedCredentialsProvider>,
}

impl StsCredentialBroker {
    /// Creates a broker from a loaded SDK configuration.
    #[must_use]
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_sts::Client::new(sdk_config),
            provider: sdk_config.credentials_provider(),
        }
    }
}

impl CredentialBroker for StsCredentialBroker {
    fn base_credentials(&self) -> CollaboratorFuture<'_, BaseCredentials, CredentialError> {
        Box::pin(async move {
            let provider = self
                .provider
                .as_ref()
                .ok_or(CredentialError::MissingProvider)?;
            let credentials =
                provider
                    .provide_credentials()
                    .await
                    .map_err(|err| CredentialError::Provider {
                        message: DisplayErrorContext(&err).to_string(),
                    })?;

            Ok(BaseCredentials {
                access_key_id: credentials.access_key_id().to_owned(),
                secret_access_key: credentials.secret_access_key().to_owned(),
                session_token: credentials.session_token().map(ToOwned::to_owned),
            })
        })
    }

    fn assume_role<'a>(
        &'a self,
        session_name: &'a str,
        role_arn: &'a str,
    ) -> CollaboratorFuture<'a, ScopedCredential, CredentialError> {
        Box::pin(async move {
            debug!(role = role_arn, session = session_name, "assuming role");
            let output = self
                .client
                .assume_role()
                .role_arn(role_arn)
                .role_session_name(session_name)
                .send()
                .await
                .map_err(|err| CredentialError::AssumeRole {
                    role_arn: role_arn.to_owned(),
                    message: DisplayErrorContext(&err).to_string(),
                })?;

            let issued = output
                .credentials()
                .ok_or_else(|| CredentialError::MissingCredentials {
                    role_arn: role_arn.to_owned(),
                })?;

            Ok(ScopedCredential {
                access_key_id: issued.access_key_id().to_owned(),
                secret_access_key: issued.secret_access_key().to_owned(),
                session_token: issued.session_token().to_owned(),
                expires_at: SystemTime::try_from(*issued.expiration()).ok(),
            })
        })
    }
}
