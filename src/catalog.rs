use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// Read-only source of repository descriptors.
pub trait Catalog: Send + Sync {
    fn lookup(&self, repo_id: &str) -> Result<RepositoryDescriptor, CatalogError>;
    fn list(&self) -> Vec<RepositoryDescriptor>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    pub id: String,
    pub url: String,
    #[serde(default = "default_commit")]
    pub commit: String,
    #[serde(default)]
    pub license: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub tests: TestConfig,
}

impl RepositoryDescriptor {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            commit: default_commit(),
            license: String::new(),
            language: default_language(),
            default_branch: None,
            tests: TestConfig::default(),
        }
    }
}

fn default_commit() -> String {
    "main".to_string()
}

fn default_language() -> String {
    "python".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestConfig {
    #[serde(default = "default_runner")]
    pub runner: String,
    #[serde(default)]
    pub markers_exclude: Vec<String>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            runner: default_runner(),
            markers_exclude: Vec::new(),
            timeout_s: None,
        }
    }
}

fn default_runner() -> String {
    "pytest".to_string()
}

/// Ids double as directory names, so they must be a single plain path
/// component.
pub fn is_valid_repo_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    repos: Option<Vec<RepositoryDescriptor>>,
}

/// Catalog backed by a YAML (or JSON) file with a top-level `repos` list.
#[derive(Debug, Clone)]
pub struct RepoCatalog {
    path: PathBuf,
    repos: Vec<RepositoryDescriptor>,
}

impl RepoCatalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &content)
    }

    pub fn from_repos(repos: Vec<RepositoryDescriptor>) -> Self {
        Self {
            path: PathBuf::new(),
            repos,
        }
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, CatalogError> {
        // JSON is a YAML subset, so one parser covers both catalog flavours.
        let parsed: CatalogFile =
            serde_yaml::from_str(content).map_err(|source| CatalogError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let repos = parsed.repos.ok_or_else(|| CatalogError::Malformed {
            path: path.to_path_buf(),
            message: "catalog must contain a top-level 'repos' list".into(),
        })?;

        let mut seen = HashSet::new();
        for repo in &repos {
            if !is_valid_repo_id(&repo.id) {
                return Err(CatalogError::Malformed {
                    path: path.to_path_buf(),
                    message: format!(
                        "invalid repository id '{}': use letters, digits, '.', '_' or '-'",
                        repo.id
                    ),
                });
            }
            if !seen.insert(repo.id.as_str()) {
                return Err(CatalogError::Malformed {
                    path: path.to_path_buf(),
                    message: format!("duplicate repository id '{}'", repo.id),
                });
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            repos,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }

    pub fn contains(&self, repo_id: &str) -> bool {
        self.repos.iter().any(|repo| repo.id == repo_id)
    }
}

impl Catalog for RepoCatalog {
    fn lookup(&self, repo_id: &str) -> Result<RepositoryDescriptor, CatalogError> {
        self.repos
            .iter()
            .find(|repo| repo.id == repo_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(repo_id.to_string()))
    }

    fn list(&self) -> Vec<RepositoryDescriptor> {
        self.repos.clone()
    }
}
