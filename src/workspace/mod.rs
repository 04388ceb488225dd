//! Per-job working trees.
//!
//! A job's working tree lives at `<work_root>/<job name>` and holds the
//! primary checkout, the generated backend file, the module manifest, the
//! tool's data and plugin cache directories, and (acting as `HOME`) the git
//! auth override. Nothing here is shared between jobs.

use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::{Dir, OpenOptions, OpenOptionsExt, Permissions, PermissionsExt};
use thiserror::Error;
use tracing::{debug, warn};

/// File name of the generated remote-state configuration.
pub const BACKEND_FILE: &str = "backend.tf";
/// File name of the git auth override, relative to the job home.
pub const GIT_CONFIG_FILE: &str = ".gitconfig";

const DATA_DIR: &str = ".terraform";
const MODULES_DIR: &str = "modules";
const MANIFEST_FILE: &str = "modules.json";
const PLUGIN_CACHE_DIR: &str = ".terraform.d/plugin-cache";

/// Mode of files that may carry credentials.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Errors raised while preparing or writing into a working tree.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WorkspaceError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a path has no parent directory or file name.
    #[error("invalid path {path}: {message}")]
    InvalidPath {
        /// Offending path.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Layout of one job's working tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkingTree {
    root: Utf8PathBuf,
}

impl WorkingTree {
    /// Places the tree for `job_name` under `work_root`.
    #[must_use]
    pub fn new(work_root: &Utf8Path, job_name: &str) -> Self {
        Self {
            root: work_root.join(job_name),
        }
    }

    /// Root of the tree; the primary module is checked out here.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Directory used as `HOME` for the tool.
    #[must_use]
    pub fn home(&self) -> &Utf8Path {
        &self.root
    }

    /// Tool data directory (`TF_DATA_DIR`).
    #[must_use]
    pub fn data_dir(&self) -> Utf8PathBuf {
        self.root.join(DATA_DIR)
    }

    /// Parent directory of every module checkout.
    #[must_use]
    pub fn modules_root(&self) -> Utf8PathBuf {
        self.data_dir().join(MODULES_DIR)
    }

    /// Location of the module manifest read by the tool.
    #[must_use]
    pub fn manifest_path(&self) -> Utf8PathBuf {
        self.modules_root().join(MANIFEST_FILE)
    }

    /// Provider plugin cache (`TF_PLUGIN_CACHE_DIR`).
    #[must_use]
    pub fn plugin_cache_dir(&self) -> Utf8PathBuf {
        self.root.join(PLUGIN_CACHE_DIR)
    }

    /// Resolves `file_name` against the tree root.
    #[must_use]
    pub fn file(&self, file_name: &str) -> Utf8PathBuf {
        self.root.join(file_name)
    }

    /// Removes a tree left behind by an earlier run with the same job name.
    ///
    /// Failures are logged rather than returned: if the directory really
    /// cannot be removed, the following clone fails with a clearer error.
    pub fn clear_stale(&self) {
        match remove_tree(&self.root) {
            Ok(true) => debug!(path = %self.root, "removed stale working tree"),
            Ok(false) => {}
            Err(err) => warn!(path = %self.root, error = %err, "failed to remove stale working tree"),
        }
    }

    /// Creates the isolated data, module, and plugin cache directories.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Io`] when a directory cannot be created.
    pub fn create_cache_dirs(&self) -> Result<(), WorkspaceError> {
        for dir in [self.modules_root(), self.plugin_cache_dir()] {
            Dir::create_ambient_dir_all(&dir, ambient_authority()).map_err(|err| {
                WorkspaceError::Io {
                    path: dir.clone(),
                    message: err.to_string(),
                }
            })?;
        }
        Ok(())
    }

    /// Writes `contents` to `file_name` inside the tree and returns the full
    /// path.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError`] when the file cannot be written.
    pub fn write_file(&self, file_name: &str, contents: &str) -> Result<Utf8PathBuf, WorkspaceError> {
        let path = self.file(file_name);
        write_file(&path, contents)?;
        Ok(path)
    }

    /// Like [`WorkingTree::write_file`], but the file is readable and
    /// writable by the owner only.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError`] when the file cannot be written.
    pub fn write_private_file(
        &self,
        file_name: &str,
        contents: &str,
    ) -> Result<Utf8PathBuf, WorkspaceError> {
        let path = self.file(file_name);
        write_private_file(&path, contents)?;
        Ok(path)
    }
}

/// Writes `contents` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`WorkspaceError`] when the path has no file name or any file
/// system operation fails.
pub fn write_file(path: &Utf8Path, contents: &str) -> Result<(), WorkspaceError> {
    let (dir, file_name) = create_parent(path)?;
    dir.write(file_name, contents)
        .map_err(|err| WorkspaceError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

/// Writes `contents` to `path` with [`PRIVATE_FILE_MODE`], tightening the
/// mode of a file that already exists.
///
/// # Errors
///
/// Returns [`WorkspaceError`] when the path has no file name or any file
/// system operation fails.
pub fn write_private_file(path: &Utf8Path, contents: &str) -> Result<(), WorkspaceError> {
    let io_error = |err: io::Error| WorkspaceError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    };

    let (dir, file_name) = create_parent(path)?;
    let mut options = OpenOptions::new();
    options
        .write(true)
        .create(true)
        .truncate(true)
        .mode(PRIVATE_FILE_MODE);
    let mut file = dir.open_with(file_name, &options).map_err(io_error)?;
    file.set_permissions(Permissions::from_mode(PRIVATE_FILE_MODE))
        .map_err(io_error)?;
    file.write_all(contents.as_bytes()).map_err(io_error)
}

fn create_parent(path: &Utf8Path) -> Result<(Dir, &str), WorkspaceError> {
    let (parent, file_name) = split_path(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| WorkspaceError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })?;

    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
        WorkspaceError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        }
    })?;
    Ok((dir, file_name))
}

/// Reads `path` into a string.
///
/// # Errors
///
/// Returns [`WorkspaceError`] when the path has no file name or cannot be
/// read.
pub fn read_file(path: &Utf8Path) -> Result<String, WorkspaceError> {
    let (parent, file_name) = split_path(path)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
        WorkspaceError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        }
    })?;

    dir.read_to_string(file_name)
        .map_err(|err| WorkspaceError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

fn remove_tree(path: &Utf8Path) -> Result<bool, WorkspaceError> {
    let (parent, name) = split_path(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(WorkspaceError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            });
        }
    };

    match dir.remove_dir_all(name) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(WorkspaceError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), WorkspaceError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| WorkspaceError::InvalidPath {
        path: path.to_path_buf(),
        message: String::from("path is missing a file name"),
    })?;
    Ok((parent, file_name))
}
