//! Discovery and checkout of nested module dependencies.
//!
//! The resolver scans the primary module's entry file for `module` blocks,
//! normalises each source address, checks every module out under the job's
//! module root, and writes a manifest the tool reads to find them. Only the
//! entry file is scanned; dependencies of the fetched modules are left to
//! the tool.
//!
//! Resolution is all-or-nothing: an entry file with no remote modules, a
//! duplicate module name, an unparseable address, or any failed fetch aborts
//! the pass before the manifest is written.

use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::source::{FetchError, SourceFetcher};
use crate::workspace::{self, WorkingTree, WorkspaceError};

mod address;
mod scanner;

pub use address::{NormalizedSource, is_local_source, normalize_source};

/// A nested module discovered in the entry file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ModuleDescriptor {
    /// Declared module name.
    pub key: String,
    /// Source address exactly as written in the entry file.
    pub source_address: String,
    /// Normalised clone URL.
    pub fetch_address: String,
    /// Pinned revision taken from the `ref` query parameter.
    pub revision: Option<String>,
    /// Directory the tool loads the module from (checkout root plus any
    /// sub-path inside the repository).
    pub checkout_path: Utf8PathBuf,
    /// Directory the repository is cloned into.
    pub root_checkout_path: Utf8PathBuf,
}

/// Errors raised while resolving modules.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The entry file could not be read.
    #[error("failed to read entry file: {0}")]
    EntryFile(#[source] WorkspaceError),
    /// The entry file declares no remote module.
    #[error("no module declarations found in {path}")]
    NoModules {
        /// Entry file that was scanned.
        path: Utf8PathBuf,
    },
    /// Two blocks declare the same module name.
    #[error("module `{key}` is declared more than once in {path} (line {line})")]
    DuplicateModule {
        /// Repeated module name.
        key: String,
        /// Entry file that was scanned.
        path: Utf8PathBuf,
        /// Line of the repeated declaration.
        line: usize,
    },
    /// A module name cannot be used as a directory name.
    #[error("module name `{key}` in {path} must be a single path component")]
    InvalidModuleName {
        /// Offending module name.
        key: String,
        /// Entry file that was scanned.
        path: Utf8PathBuf,
    },
    /// A source address could not be normalised.
    #[error("invalid module source `{address}`: {message}")]
    InvalidSource {
        /// Address as written.
        address: String,
        /// Parser error message.
        message: String,
    },
    /// Checking out a module failed.
    #[error("failed to fetch module `{key}`: {source}")]
    Fetch {
        /// Module name.
        key: String,
        /// Underlying fetch error.
        #[source]
        source: FetchError,
    },
    /// The manifest could not be encoded.
    #[error("failed to encode module manifest: {0}")]
    ManifestEncode(#[source] serde_json::Error),
    /// The manifest could not be written.
    #[error("failed to write module manifest: {0}")]
    ManifestWrite(#[source] WorkspaceError),
}

/// Resolves the modules of one job's primary checkout.
pub struct ModuleResolver<'a, S: SourceFetcher + ?Sized> {
    fetcher: &'a S,
    tree: &'a WorkingTree,
}

impl<'a, S: SourceFetcher + ?Sized> ModuleResolver<'a, S> {
    /// Creates a resolver that checks modules out under `tree`.
    #[must_use]
    pub const fn new(fetcher: &'a S, tree: &'a WorkingTree) -> Self {
        Self { fetcher, tree }
    }

    /// Discovers, fetches, and records every module declared in
    /// `entry_file`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when discovery fails, any module cannot be
    /// fetched, or the manifest cannot be written.
    pub async fn resolve(&self, entry_file: &Utf8Path) -> Result<Vec<ModuleDescriptor>, ResolveError> {
        let descriptors = discover(entry_file, &self.tree.modules_root())?;

        for descriptor in &descriptors {
            debug!(
                module = %descriptor.key,
                address = %descriptor.fetch_address,
                revision = descriptor.revision.as_deref().unwrap_or("default"),
                path = %descriptor.root_checkout_path,
                "fetching module"
            );
            self.fetcher
                .fetch_at_revision(
                    &descriptor.fetch_address,
                    &descriptor.root_checkout_path,
                    descriptor.revision.as_deref(),
                )
                .await
                .map_err(|source| ResolveError::Fetch {
                    key: descriptor.key.clone(),
                    source,
                })?;
        }

        self.write_manifest(&descriptors)?;
        info!(modules = descriptors.len(), "resolved modules");
        Ok(descriptors)
    }

    fn write_manifest(&self, descriptors: &[ModuleDescriptor]) -> Result<(), ResolveError> {
        let rendered = render_manifest(self.tree.root(), descriptors)?;
        workspace::write_file(&self.tree.manifest_path(), &rendered)
            .map_err(ResolveError::ManifestWrite)
    }
}

/// Reads `entry_file` and builds descriptors rooted at `modules_root`
/// without fetching anything.
///
/// # Errors
///
/// Returns [`ResolveError`] when the file cannot be read, declares no
/// remote module, repeats a module name, or holds an invalid address.
pub fn discover(
    entry_file: &Utf8Path,
    modules_root: &Utf8Path,
) -> Result<Vec<ModuleDescriptor>, ResolveError> {
    let text = workspace::read_file(entry_file).map_err(ResolveError::EntryFile)?;
    plan(&text, entry_file, modules_root)
}

/// Builds descriptors from entry file `text`. `entry_file` is only used in
/// error messages.
///
/// Local (`./`, `../`) sources are part of the primary checkout and are
/// skipped.
///
/// # Errors
///
/// See [`discover`].
pub fn plan(
    text: &str,
    entry_file: &Utf8Path,
    modules_root: &Utf8Path,
) -> Result<Vec<ModuleDescriptor>, ResolveError> {
    let mut seen = BTreeSet::new();
    let mut descriptors = Vec::new();

    for declaration in scanner::scan(text) {
        if is_local_source(&declaration.source) {
            debug!(module = %declaration.name, "skipping local module source");
            continue;
        }
        if !seen.insert(declaration.name.clone()) {
            return Err(ResolveError::DuplicateModule {
                key: declaration.name,
                path: entry_file.to_path_buf(),
                line: declaration.line,
            });
        }
        if declaration.name.is_empty()
            || declaration.name.contains(['/', '\\'])
            || declaration.name == "."
            || declaration.name == ".."
        {
            return Err(ResolveError::InvalidModuleName {
                key: declaration.name,
                path: entry_file.to_path_buf(),
            });
        }

        let normalized = normalize_source(&declaration.source)?;
        let root_checkout_path = modules_root.join(&declaration.name);
        let checkout_path = normalized
            .sub_path
            .as_ref()
            .map_or_else(|| root_checkout_path.clone(), |sub| root_checkout_path.join(sub));

        descriptors.push(ModuleDescriptor {
            key: declaration.name,
            source_address: declaration.source,
            fetch_address: normalized.address,
            revision: normalized.revision,
            checkout_path,
            root_checkout_path,
        });
    }

    if descriptors.is_empty() {
        return Err(ResolveError::NoModules {
            path: entry_file.to_path_buf(),
        });
    }

    Ok(descriptors)
}

#[derive(Serialize)]
struct Manifest<'a> {
    #[serde(rename = "Modules")]
    modules: Vec<ManifestRecord<'a>>,
}

#[derive(Serialize)]
struct ManifestRecord<'a> {
    #[serde(rename = "Key")]
    key: &'a str,
    #[serde(rename = "Source")]
    source: &'a str,
    #[serde(rename = "Dir")]
    dir: String,
}

/// Renders the module manifest in the layout `terraform init` reads from
/// `.terraform/modules/modules.json`. Directories are relative to `root`;
/// the root module itself is recorded with an empty key.
///
/// # Errors
///
/// Returns [`ResolveError::ManifestEncode`] when encoding fails.
pub fn render_manifest(
    root: &Utf8Path,
    descriptors: &[ModuleDescriptor],
) -> Result<String, ResolveError> {
    let mut modules = Vec::with_capacity(descriptors.len() + 1);
    modules.push(ManifestRecord {
        key: "",
        source: "",
        dir: String::from("."),
    });
    modules.extend(descriptors.iter().map(|descriptor| ManifestRecord {
        key: &descriptor.key,
        source: &descriptor.source_address,
        dir: descriptor
            .checkout_path
            .strip_prefix(root)
            .map_or_else(|_| descriptor.checkout_path.to_string(), ToString::to_string),
    }));

    serde_json::to_string_pretty(&Manifest { modules }).map_err(ResolveError::ManifestEncode)
}
