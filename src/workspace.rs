//! Local working copies of catalog repositories.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::catalog::{RepositoryDescriptor, is_valid_repo_id};
use crate::error::{CommandError, FetchError};
use crate::process::CommandRunner;

/// Directory layout under the orchestrator workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repos(&self) -> PathBuf {
        self.root.join("repos")
    }

    pub fn state(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn artifacts(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn locks(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// Materializes a repository's sources into an empty directory.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, repo: &RepositoryDescriptor, dest: &Path) -> Result<(), FetchError>;

    /// Revision currently checked out at `path`, when the fetcher can tell.
    async fn revision(&self, _path: &Path) -> Option<String> {
        None
    }
}

pub struct GitFetcher {
    runner: CommandRunner,
}

impl GitFetcher {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    fn name(&self) -> &str {
        "git"
    }

    async fn fetch(&self, repo: &RepositoryDescriptor, dest: &Path) -> Result<(), FetchError> {
        let dest_str = dest.to_string_lossy().to_string();
        self.runner
            .run_checked(&["git", "clone", "--quiet", repo.url.as_str(), dest_str.as_str()], None)
            .await
            .map_err(|err| match err {
                CommandError::Failed { stderr, .. } => FetchError::Unreachable {
                    location: repo.url.clone(),
                    message: stderr,
                },
                other => FetchError::Command(other),
            })?;

        if !repo.commit.is_empty() {
            self.runner
                .run_checked(
                    &[
                        "git",
                        "-C",
                        dest_str.as_str(),
                        "checkout",
                        "--quiet",
                        repo.commit.as_str(),
                    ],
                    None,
                )
                .await
                .map_err(|err| match err {
                    CommandError::Failed { stderr, .. } => FetchError::Checkout {
                        revision: repo.commit.clone(),
                        message: stderr,
                    },
                    other => FetchError::Command(other),
                })?;
        }
        Ok(())
    }

    async fn revision(&self, path: &Path) -> Option<String> {
        let path = path.to_string_lossy().to_string();
        let output = self
            .runner
            .run_checked(&["git", "-C", path.as_str(), "rev-parse", "HEAD"], None)
            .await
            .ok()?;
        let revision = output.stdout.trim();
        (!revision.is_empty()).then(|| revision.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub repo_id: String,
    pub path: PathBuf,
    pub revision: Option<String>,
    /// Whether this call fetched the sources.
    pub created: bool,
}

pub struct WorkspaceManager {
    root: PathBuf,
    fetcher: Arc<dyn SourceFetcher>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            root: root.into(),
            fetcher,
        }
    }

    pub fn fetcher_name(&self) -> &str {
        self.fetcher.name()
    }

    pub fn path_for(&self, repo_id: &str) -> Result<PathBuf, FetchError> {
        if !is_valid_repo_id(repo_id) {
            return Err(FetchError::InvalidRepoId(repo_id.to_string()));
        }
        Ok(self.root.join(repo_id))
    }

    /// Return the working copy for `repo`, fetching it when absent.
    ///
    /// An existing directory is reused as-is. A fresh fetch lands in a
    /// temporary sibling directory and is renamed into place only once it
    /// completes, so an interrupted fetch never leaves a half-populated
    /// workspace behind.
    pub async fn ensure(&self, repo: &RepositoryDescriptor) -> Result<Workspace, FetchError> {
        let path = self.path_for(&repo.id)?;
        if path.is_dir() {
            debug!(repo_id = %repo.id, path = %path.display(), "Reusing existing workspace");
            return Ok(Workspace {
                repo_id: repo.id.clone(),
                revision: self.fetcher.revision(&path).await,
                path,
                created: false,
            });
        }

        fs::create_dir_all(&self.root).map_err(|source| FetchError::Io {
            path: self.root.clone(),
            source,
        })?;
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}-", repo.id))
            .tempdir_in(&self.root)
            .map_err(|source| FetchError::Io {
                path: self.root.clone(),
                source,
            })?;
        let checkout = staging.path().join("checkout");

        info!(repo_id = %repo.id, url = %repo.url, fetcher = self.fetcher.name(), "Fetching sources");
        self.fetcher.fetch(repo, &checkout).await?;
        if !checkout.is_dir() {
            return Err(FetchError::Unreachable {
                location: repo.url.clone(),
                message: "fetcher produced no sources".into(),
            });
        }

        if let Err(source) = fs::rename(&checkout, &path) {
            if !path.is_dir() {
                return Err(FetchError::Io { path, source });
            }
            debug!(repo_id = %repo.id, "Workspace appeared concurrently; keeping existing copy");
            return Ok(Workspace {
                repo_id: repo.id.clone(),
                revision: self.fetcher.revision(&path).await,
                path,
                created: false,
            });
        }

        Ok(Workspace {
            repo_id: repo.id.clone(),
            revision: self.fetcher.revision(&path).await,
            path,
            created: true,
        })
    }
}
