//! Boxed future returned by the collaborator traits.
//!
//! Collaborators (credential broker, source fetcher, fan-out target, job
//! runner) are object-safe traits so tests can substitute scripted doubles.

use std::future::Future;
use std::pin::Pin;

/// Future returned by collaborator operations.
pub type CollaboratorFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;
