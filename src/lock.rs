//! Per-repository advance lock.
//!
//! An exclusive advisory lock on `<root>/<repo_id>.lock` guards each
//! `advance`. A second caller for the same repository, in this process or
//! another one, fails fast with `Busy` instead of waiting.

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;

use fs2::FileExt;
use tracing::debug;

use crate::catalog::is_valid_repo_id;
use crate::error::{PipelineError, StateError};

#[derive(Debug, Clone)]
pub struct RepoLocks {
    root: PathBuf,
}

impl RepoLocks {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn try_acquire(&self, repo_id: &str) -> Result<RepoLockGuard, PipelineError> {
        if !is_valid_repo_id(repo_id) {
            return Err(StateError::InvalidRepoId(repo_id.to_string()).into());
        }
        fs::create_dir_all(&self.root).map_err(|source| PipelineError::Lock {
            path: self.root.clone(),
            source,
        })?;

        let path = self.root.join(format!("{repo_id}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| PipelineError::Lock {
                path: path.clone(),
                source,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(repo_id, path = %path.display(), "Acquired advance lock");
                Ok(RepoLockGuard { file, path })
            }
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(PipelineError::Busy(repo_id.to_string()))
            }
            Err(source) => Err(PipelineError::Lock { path, source }),
        }
    }
}

/// Holds the lock until dropped.
#[derive(Debug)]
pub struct RepoLockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for RepoLockGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %err, "Failed to release advance lock");
        }
    }
}
