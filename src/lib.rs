//! Core library for the `tfdispatch` batch executor.
//!
//! A batch of execution requests is split between this instance and a
//! freshly started one; every local request becomes a job that checks out a
//! Terraform module, resolves its nested modules, assumes a role in the
//! target account, and runs `init` and `apply` with its output tagged by job
//! name.

pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod fanout;
pub mod future;
pub mod job;
pub mod modules;
pub mod output;
pub mod request;
pub mod service;
pub mod source;
pub mod state_backend;
pub mod test_support;
pub mod workspace;

pub use config::{ConfigError, ExecutorConfig, FanOutMode};
pub use credentials::{
    BaseCredentials, CredentialBroker, CredentialError, ScopedCredential, StsCredentialBroker,
};
pub use dispatch::{BatchReport, DispatchError, Dispatcher, JobOutcome, JobRunner};
pub use fanout::{FanOut, FanOutError, FanOutTarget, LambdaFanOut, ProcessFanOut};
pub use job::{JobError, JobExecutor, JobSettings, ToolStep};
pub use modules::{ModuleDescriptor, ModuleResolver, ResolveError};
pub use output::{Multiplexer, OutputSink, StdoutSink};
pub use request::{BatchEntry, ExecutionRequest, RequestError, VariableValue};
pub use service::{BatchSummary, ServiceError};
pub use source::{FetchError, GitFetcher, SourceFetcher};
pub use state_backend::StateBackend;
pub use workspace::{WorkingTree, WorkspaceError};
