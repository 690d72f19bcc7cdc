use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use crate::artifacts::store_addressed;
use crate::catalog::RepositoryDescriptor;
use crate::error::StrategyError;
use crate::inference::StrategyDecision;
use crate::pipeline::{Stage, StageRecord};
use crate::process::CommandRunner;
use crate::schema::STATUS_NOT_IMPLEMENTED;
use crate::workspace::Workspace;

pub mod package;
pub mod pytest;
pub mod python;

pub use package::{DryRunPublish, ImageManifest};
pub use pytest::PytestRunner;
pub use python::{BuildTool, PythonBuild};

/// Strategy id recorded by placeholder records.
pub const UNKNOWN_STRATEGY: &str = "unknown";

/// Everything a strategy may use beyond the workspace and the decision.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub repo: RepositoryDescriptor,
    pub stage: Stage,
    pub strategy: String,
    pub runner: CommandRunner,
    /// Destination for reports and manifests referenced by the record.
    pub files_dir: PathBuf,
    pub logs_dir: PathBuf,
    /// Records of the predecessor stages that succeeded.
    pub inputs: BTreeMap<Stage, StageRecord>,
    pub python: String,
    pub image_registry: String,
}

impl StageContext {
    /// A completed record header for this stage and strategy.
    pub fn record(&self) -> StageRecord {
        StageRecord::new(&self.repo.id, self.stage, &self.strategy)
    }

    pub fn input(&self, stage: Stage) -> Result<&StageRecord, StrategyError> {
        self.inputs
            .get(&stage)
            .ok_or(StrategyError::MissingInput(stage))
    }

    /// `python -m <module> args...` with the configured interpreter.
    pub fn python_module(&self, module: &str, args: &[&str]) -> Vec<String> {
        let mut command = vec![self.python.clone(), "-m".to_string(), module.to_string()];
        command.extend(args.iter().map(|arg| arg.to_string()));
        command
    }

    /// Store a JSON document in the stage files directory under a
    /// content-addressed name derived from `name`.
    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf, StrategyError> {
        let mut bytes = serde_json::to_vec_pretty(value)
            .map_err(|err| StrategyError::failed(format!("Failed to encode {name}: {err}")))?;
        bytes.push(b'\n');
        self.store_file(name, &bytes)
    }

    /// Store raw bytes in the stage files directory.
    pub fn store_file(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, StrategyError> {
        store_addressed(&self.files_dir, name, bytes).map_err(|source| StrategyError::Io {
            path: self.files_dir.join(name),
            source,
        })
    }

    /// Store JSON lines in the logs directory.
    pub fn write_log<T: Serialize>(&self, name: &str, entries: &[T]) -> Result<PathBuf, StrategyError> {
        let mut bytes = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut bytes, entry)
                .map_err(|err| StrategyError::failed(format!("Failed to encode {name}: {err}")))?;
            bytes.push(b'\n');
        }
        store_addressed(&self.logs_dir, name, &bytes).map_err(|source| StrategyError::Io {
            path: self.logs_dir.join(name),
            source,
        })
    }

    pub fn ensure_dir(&self, dir: &Path) -> Result<(), StrategyError> {
        fs::create_dir_all(dir).map_err(|source| StrategyError::Io {
            path: dir.to_path_buf(),
            source,
        })
    }
}

/// A concrete way of carrying out build, test, package or publish for one
/// kind of repository.
#[async_trait]
pub trait StageStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        workspace: &Workspace,
        decision: &StrategyDecision,
        ctx: &StageContext,
    ) -> Result<StageRecord, StrategyError>;
}

/// Strategies keyed by the stage they serve and their id.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<(Stage, String), Arc<dyn StageStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        stage: Stage,
        id: impl Into<String>,
        strategy: Arc<dyn StageStrategy>,
    ) {
        self.strategies.insert((stage, id.into()), strategy);
    }

    pub fn get(&self, stage: Stage, id: &str) -> Result<Arc<dyn StageStrategy>, StrategyError> {
        self.strategies
            .get(&(stage, id.to_string()))
            .cloned()
            .ok_or_else(|| StrategyError::Unregistered {
                kind: stage.to_string(),
                strategy: id.to_string(),
            })
    }

    pub fn known(&self, stage: Stage) -> Vec<String> {
        let mut names: Vec<_> = self
            .strategies
            .keys()
            .filter(|(s, _)| *s == stage)
            .map(|(_, id)| id.clone())
            .collect();
        names.sort();
        names
    }
}

pub fn register_defaults(registry: &mut StrategyRegistry) {
    for tool in BuildTool::ALL {
        registry.register(Stage::Build, tool.as_str(), Arc::new(PythonBuild::new(tool)));
    }
    registry.register(Stage::Test, "pytest", Arc::new(PytestRunner));
    registry.register(Stage::Package, "image-manifest", Arc::new(ImageManifest));
    registry.register(Stage::Publish, "dry-run", Arc::new(DryRunPublish));
}

/// Schema-valid record for a stage whose strategy could not be determined.
pub fn placeholder_record(repo_id: &str, stage: Stage, message: &str) -> StageRecord {
    StageRecord::new(repo_id, stage, UNKNOWN_STRATEGY)
        .with("status", json!(STATUS_NOT_IMPLEMENTED))
        .with("message", json!(message))
}

/// Last `limit` non-empty lines of command output, for failure details.
pub(crate) fn tail_lines(output: &str, limit: usize) -> Vec<String> {
    let lines: Vec<&str> = output.lines().filter(|line| !line.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(limit)..]
        .iter()
        .map(|line| line.to_string())
        .collect()
}
