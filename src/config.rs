use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifacts::Retention;
use crate::pipeline::MachineSettings;

pub const CONFIG_FILE: &str = "orchestrator.yaml";
pub const ENV_WORKSPACE: &str = "CWM_WORKSPACE";
pub const ENV_CATALOG: &str = "CWM_CATALOG";
pub const ENV_STAGE_TIMEOUT: &str = "CWM_STAGE_TIMEOUT";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorConfig {
    pub workspace: PathBuf,
    pub catalog: PathBuf,
    /// `0` disables the stage timeout.
    pub stage_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub retention: Retention,
    pub python: String,
    pub image_registry: String,
    pub jobs: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from(".open-cwm"),
            catalog: PathBuf::from("repo_catalog/repos.yaml"),
            stage_timeout_secs: 3600,
            command_timeout_secs: 1800,
            retention: Retention::Latest,
            python: "python".to_string(),
            image_registry: "ghcr.io/open-cwm".to_string(),
            jobs: 4,
        }
    }
}

/// One configuration source; unset fields leave lower layers untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub workspace: Option<PathBuf>,
    pub catalog: Option<PathBuf>,
    pub stage_timeout_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
    pub retention: Option<Retention>,
    pub python: Option<String>,
    pub image_registry: Option<String>,
    pub jobs: Option<usize>,
}

impl ConfigLayer {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let layer: ConfigLayer = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        Ok(layer)
    }

    /// Environment overrides, read through `lookup` so callers choose the
    /// source.
    pub fn from_env<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let stage_timeout_secs = match non_empty(ENV_STAGE_TIMEOUT) {
            Some(raw) => Some(
                raw.trim()
                    .parse()
                    .with_context(|| format!("{ENV_STAGE_TIMEOUT} must be whole seconds, got '{raw}'"))?,
            ),
            None => None,
        };
        Ok(Self {
            workspace: non_empty(ENV_WORKSPACE).map(PathBuf::from),
            catalog: non_empty(ENV_CATALOG).map(PathBuf::from),
            stage_timeout_secs,
            ..Self::default()
        })
    }
}

impl OrchestratorConfig {
    /// Defaults, then `<workspace>/orchestrator.yaml`, then `explicit`, then
    /// `env`, then `cli`.
    pub fn resolve(explicit: Option<&Path>, env: ConfigLayer, cli: ConfigLayer) -> Result<Self> {
        let explicit = explicit.map(ConfigLayer::load).transpose()?;

        let workspace = cli
            .workspace
            .clone()
            .or_else(|| env.workspace.clone())
            .or_else(|| explicit.as_ref().and_then(|layer| layer.workspace.clone()))
            .unwrap_or_else(|| Self::default().workspace);

        let mut config = Self::default();
        let workspace_file = workspace.join(CONFIG_FILE);
        if workspace_file.is_file() {
            debug!(path = %workspace_file.display(), "Loading workspace config");
            config.apply(ConfigLayer::load(&workspace_file)?);
        }
        for layer in explicit.into_iter().chain([env, cli]) {
            config.apply(layer);
        }
        config.workspace = workspace;
        config.check()?;
        Ok(config)
    }

    pub fn apply(&mut self, layer: ConfigLayer) {
        if let Some(workspace) = layer.workspace {
            self.workspace = workspace;
        }
        if let Some(catalog) = layer.catalog {
            self.catalog = catalog;
        }
        if let Some(secs) = layer.stage_timeout_secs {
            self.stage_timeout_secs = secs;
        }
        if let Some(secs) = layer.command_timeout_secs {
            self.command_timeout_secs = secs;
        }
        if let Some(retention) = layer.retention {
            self.retention = retention;
        }
        if let Some(python) = layer.python {
            self.python = python;
        }
        if let Some(registry) = layer.image_registry {
            self.image_registry = registry;
        }
        if let Some(jobs) = layer.jobs {
            self.jobs = jobs;
        }
    }

    fn check(&self) -> Result<()> {
        if self.jobs == 0 {
            bail!("jobs must be at least 1");
        }
        if self.python.trim().is_empty() {
            bail!("python interpreter must not be empty");
        }
        Ok(())
    }

    pub fn machine_settings(&self) -> MachineSettings {
        let seconds = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        MachineSettings {
            stage_timeout: seconds(self.stage_timeout_secs),
            command_timeout: seconds(self.command_timeout_secs),
            retention: self.retention,
            python: self.python.clone(),
            image_registry: self.image_registry.clone(),
        }
    }
}
