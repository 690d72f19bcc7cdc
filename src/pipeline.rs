use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::artifacts::{ArtifactRef, ArtifactStore, Retention};
use crate::catalog::{Catalog, RepositoryDescriptor};
use crate::error::{ArtifactError, CommandError, FetchError, PipelineError, StrategyError};
use crate::inference::{StrategyDecision, StrategyInferencer, detect_toolchain};
use crate::lock::RepoLocks;
use crate::observability::MetricsCollector;
use crate::process::{CommandRunner, display_path};
use crate::schema::{SCHEMA_VERSION, STATUS_COMPLETED, STATUS_NOT_IMPLEMENTED};
use crate::state::{
    FailureKind, FailureReason, PipelineState, StageStatus, StateStore, Transition,
};
use crate::strategies::{StageContext, StrategyRegistry, placeholder_record};
use crate::workspace::{SourceFetcher, WorkspaceLayout, WorkspaceManager};

/// Python version targeted by build plans.
pub const PLAN_PYTHON_VERSION: &str = "3.11";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discover,
    Plan,
    Build,
    Test,
    Package,
    Publish,
}

const ORDER: [Stage; 6] = [
    Stage::Discover,
    Stage::Plan,
    Stage::Build,
    Stage::Test,
    Stage::Package,
    Stage::Publish,
];

impl Stage {
    pub fn ordered() -> &'static [Stage] {
        &ORDER
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Every stage that must succeed before this one.
    pub fn predecessors(self) -> &'static [Stage] {
        &ORDER[..self.index()]
    }

    /// The stages `advance` walks to reach this one, inclusive.
    pub fn chain(self) -> &'static [Stage] {
        &ORDER[..=self.index()]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Discover => "discover",
            Stage::Plan => "plan",
            Stage::Build => "build",
            Stage::Test => "test",
            Stage::Package => "package",
            Stage::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ORDER
            .iter()
            .copied()
            .find(|stage| stage.as_str() == value)
            .ok_or_else(|| {
                format!(
                    "Unknown stage '{value}'. Available stages: {}",
                    ORDER.map(Stage::as_str).join(", ")
                )
            })
    }
}

/// The JSON record a stage produces, validated against the stage schema
/// before it becomes an artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageRecord(Map<String, Value>);

impl StageRecord {
    /// Header of a record describing completed work.
    pub fn new(repo_id: &str, stage: Stage, strategy: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("schema_version".into(), json!(SCHEMA_VERSION));
        fields.insert("repo_id".into(), json!(repo_id));
        fields.insert("stage".into(), json!(stage.as_str()));
        fields.insert("strategy".into(), json!(strategy));
        fields.insert("status".into(), json!(STATUS_COMPLETED));
        Self(fields)
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn status(&self) -> &str {
        self.get("status").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn strategy(&self) -> &str {
        self.get("strategy").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn is_placeholder(&self) -> bool {
        self.status() == STATUS_NOT_IMPLEMENTED
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for StageRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// The chain halted after at least one stage succeeded.
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub repo_id: String,
    pub target: Stage,
    pub outcome: RunOutcome,
    pub stages: Vec<StageReport>,
}

impl RunResult {
    /// Summarize the chain up to `target` from persisted state.
    pub fn from_state(state: &PipelineState, target: Stage) -> Self {
        let stages: Vec<StageReport> = target
            .chain()
            .iter()
            .map(|stage| {
                let entry = state.stage(*stage);
                StageReport {
                    stage: *stage,
                    status: entry.status,
                    attempts: entry.attempts,
                    started_at: entry.started_at,
                    finished_at: entry.finished_at,
                    artifact: entry.artifact.clone(),
                    error: entry.error.clone(),
                }
            })
            .collect();

        let outcome = if state.is_succeeded(target) {
            RunOutcome::Succeeded
        } else if stages.iter().any(|s| s.status == StageStatus::Succeeded) {
            RunOutcome::Partial
        } else {
            RunOutcome::Failed
        };

        Self {
            repo_id: state.repo_id.clone(),
            target,
            outcome,
            stages,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    pub fn report(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|report| report.stage == stage)
    }

    pub fn failed_stage(&self) -> Option<&StageReport> {
        self.stages
            .iter()
            .find(|report| report.status == StageStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct MachineSettings {
    /// Budget for one stage; `None` disables it.
    pub stage_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
    pub retention: Retention,
    pub python: String,
    pub image_registry: String,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            stage_timeout: Some(Duration::from_secs(3600)),
            command_timeout: Some(Duration::from_secs(1800)),
            retention: Retention::Latest,
            python: "python".to_string(),
            image_registry: "ghcr.io/open-cwm".to_string(),
        }
    }
}

pub struct StageMachine {
    catalog: Arc<dyn Catalog>,
    layout: WorkspaceLayout,
    workspaces: WorkspaceManager,
    inferencer: StrategyInferencer,
    strategies: StrategyRegistry,
    artifacts: ArtifactStore,
    state: StateStore,
    locks: RepoLocks,
    metrics: MetricsCollector,
    settings: MachineSettings,
}

impl StageMachine {
    pub fn new(
        layout: WorkspaceLayout,
        catalog: Arc<dyn Catalog>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        let settings = MachineSettings::default();
        let mut strategies = StrategyRegistry::new();
        crate::strategies::register_defaults(&mut strategies);
        Self {
            catalog,
            workspaces: WorkspaceManager::new(layout.repos(), fetcher),
            inferencer: StrategyInferencer::default(),
            strategies,
            artifacts: ArtifactStore::new(layout.artifacts(), settings.retention),
            state: StateStore::new(layout.state()),
            locks: RepoLocks::new(layout.locks()),
            metrics: MetricsCollector::new(),
            settings,
            layout,
        }
    }

    pub fn with_settings(mut self, settings: MachineSettings) -> Self {
        self.artifacts = ArtifactStore::new(self.layout.artifacts(), settings.retention);
        self.settings = settings;
        self
    }

    pub fn with_strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_inferencer(mut self, inferencer: StrategyInferencer) -> Self {
        self.inferencer = inferencer;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Drive `repo_id` forward until `target` has succeeded or a stage fails.
    ///
    /// Stages that already succeeded are skipped without re-running their
    /// strategy, so repeated calls are idempotent. Stage failures are
    /// recorded in state and reported in the result; `Err` is reserved for
    /// unknown repositories, a concurrent advance and state persistence
    /// problems.
    #[instrument(skip(self, target), fields(target = %target))]
    pub async fn advance(&self, repo_id: &str, target: Stage) -> Result<RunResult, PipelineError> {
        let repo = self.catalog.lookup(repo_id)?;
        let _lock = self.locks.try_acquire(repo_id)?;

        for stage in target.chain() {
            let state = self.state.get_state(repo_id)?;
            if state.is_succeeded(*stage) {
                debug!(stage = %stage, "Stage already succeeded; skipping");
                continue;
            }
            if !self.run_stage(&repo, *stage).await? {
                break;
            }
        }

        let state = self.state.get_state(repo_id)?;
        let result = RunResult::from_state(&state, target);
        self.metrics.record_run(result.outcome);
        info!(outcome = ?result.outcome, "Advance finished");
        Ok(result)
    }

    /// Current pipeline state, without side effects.
    pub fn status(&self, repo_id: &str) -> Result<PipelineState, PipelineError> {
        self.catalog.lookup(repo_id)?;
        Ok(self.state.get_state(repo_id)?)
    }

    /// Return `from` and every later stage to pending.
    pub fn reset(&self, repo_id: &str, from: Stage) -> Result<PipelineState, PipelineError> {
        self.catalog.lookup(repo_id)?;
        let _lock = self.locks.try_acquire(repo_id)?;
        let state = self.state.reset(repo_id, from)?;
        info!(repo_id, from = %from, "Pipeline state reset");
        Ok(state)
    }

    async fn run_stage(
        &self,
        repo: &RepositoryDescriptor,
        stage: Stage,
    ) -> Result<bool, PipelineError> {
        let span = info_span!("stage", stage = %stage);
        async move {
            self.state.transition(&repo.id, stage, Transition::Running)?;
            info!("Stage running");
            let _timer = self.metrics.start_stage(stage.as_str());

            let body = self.execute_stage(repo, stage);
            let produced = match self.stage_timeout(repo, stage) {
                Some(limit) => match tokio::time::timeout(limit, body).await {
                    Ok(result) => result,
                    Err(_) => Err(FailureReason::new(
                        FailureKind::Timeout,
                        format!("Stage '{stage}' exceeded its {}s budget", limit.as_secs()),
                    )),
                },
                None => body.await,
            };

            let written = produced.and_then(|record| {
                self.artifacts
                    .write(&repo.id, stage, &record)
                    .map_err(FailureReason::from)
            });

            match written {
                Ok(artifact) => {
                    let outcome = self.state.transition(
                        &repo.id,
                        stage,
                        Transition::Succeeded(artifact.clone()),
                    )?;
                    if let Some(previous) = outcome.superseded
                        && let Err(err) = self.artifacts.release(&previous, &artifact)
                    {
                        warn!(error = %err, "Failed to apply retention to superseded artifact");
                    }
                    info!(digest = %artifact.digest, "Stage succeeded");
                    Ok(true)
                }
                Err(reason) => {
                    self.metrics.record_failure(stage.as_str());
                    error!(kind = ?reason.kind, message = %reason.message, "Stage failed");
                    self.state
                        .transition(&repo.id, stage, Transition::Failed(reason))?;
                    Ok(false)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// A catalog `tests.timeout_s` governs the whole test stage, so it
    /// replaces both the stage budget and the per-command limit.
    fn test_timeout(repo: &RepositoryDescriptor, stage: Stage) -> Option<Duration> {
        (stage == Stage::Test)
            .then_some(repo.tests.timeout_s)
            .flatten()
            .map(Duration::from_secs)
    }

    fn stage_timeout(&self, repo: &RepositoryDescriptor, stage: Stage) -> Option<Duration> {
        Self::test_timeout(repo, stage).or(self.settings.stage_timeout)
    }

    fn command_timeout(&self, repo: &RepositoryDescriptor, stage: Stage) -> Option<Duration> {
        Self::test_timeout(repo, stage).or(self.settings.command_timeout)
    }

    async fn execute_stage(
        &self,
        repo: &RepositoryDescriptor,
        stage: Stage,
    ) -> Result<StageRecord, FailureReason> {
        match stage {
            Stage::Discover => self.discover(repo).await,
            Stage::Plan => self.plan(repo).await,
            _ => self.run_strategy(repo, stage).await,
        }
    }

    async fn discover(&self, repo: &RepositoryDescriptor) -> Result<StageRecord, FailureReason> {
        let workspace = self.workspaces.ensure(repo).await?;
        let toolchain = detect_toolchain(&workspace.path);

        let mut workspace_info = json!({
            "path": display_path(&workspace.path),
            "created": workspace.created,
        });
        if let Some(revision) = &workspace.revision {
            workspace_info["revision"] = json!(revision);
        }

        let mut record = StageRecord::new(&repo.id, Stage::Discover, self.workspaces.fetcher_name())
            .with(
                "source",
                json!({
                    "url": repo.url,
                    "commit": repo.commit,
                    "license": repo.license,
                }),
            )
            .with("language", json!(repo.language))
            .with("workspace", workspace_info)
            .with("toolchain", json!(toolchain));
        if let Some(branch) = &repo.default_branch {
            record.insert("default_branch", json!(branch));
        }
        Ok(record)
    }

    async fn plan(&self, repo: &RepositoryDescriptor) -> Result<StageRecord, FailureReason> {
        let workspace = self.workspaces.ensure(repo).await?;
        let decision = self.inferencer.infer(&workspace.path);
        let toolchain = detect_toolchain(&workspace.path);

        let lockfile_sources: Vec<&str> = [
            ("pyproject.toml", toolchain.pyproject),
            ("requirements.txt", toolchain.requirements),
            ("environment.yml", toolchain.environment_yml),
        ]
        .into_iter()
        .filter_map(|(name, present)| present.then_some(name))
        .collect();

        Ok(
            StageRecord::new(&repo.id, Stage::Plan, self.inferencer.ruleset())
                .with("decision", json!(decision))
                .with("python_version", json!(PLAN_PYTHON_VERSION))
                .with(
                    "builder_inputs",
                    json!({
                        "requires_network": !toolchain.ci_workflows.is_empty(),
                        "lockfile_sources": lockfile_sources,
                    }),
                )
                .with("tests", json!(repo.tests)),
        )
    }

    async fn run_strategy(
        &self,
        repo: &RepositoryDescriptor,
        stage: Stage,
    ) -> Result<StageRecord, FailureReason> {
        let workspace = self.workspaces.ensure(repo).await?;
        let decision = self.load_decision(repo, &workspace.path)?;

        let Some(strategy_id) = decision.strategy_for(stage) else {
            warn!(stage = %stage, "No strategy detected; emitting placeholder record");
            self.metrics.record_placeholder(stage.as_str());
            return Ok(placeholder_record(
                &repo.id,
                stage,
                &format!("no {stage} strategy detected for this repository"),
            ));
        };

        let strategy = self
            .strategies
            .get(stage, &strategy_id)
            .map_err(FailureReason::from)?;
        let ctx = StageContext {
            repo: repo.clone(),
            stage,
            strategy: strategy_id.clone(),
            runner: CommandRunner::new(self.command_timeout(repo, stage)),
            files_dir: self.artifacts.files_dir(&repo.id),
            logs_dir: self.layout.logs().join(&repo.id),
            inputs: self.load_inputs(&repo.id, stage)?,
            python: self.settings.python.clone(),
            image_registry: self.settings.image_registry.clone(),
        };

        debug!(strategy = %strategy_id, "Executing strategy");
        strategy
            .execute(&workspace, &decision, &ctx)
            .await
            .map_err(FailureReason::from)
    }

    /// The decision recorded by the plan stage, or a fresh inference when the
    /// plan artifact is unavailable.
    fn load_decision(
        &self,
        repo: &RepositoryDescriptor,
        workspace: &Path,
    ) -> Result<StrategyDecision, FailureReason> {
        let state = self.state.get_state(&repo.id).map_err(|err| {
            FailureReason::new(FailureKind::Io, format!("Failed to read state: {err}"))
        })?;
        if let Some(artifact) = &state.stage(Stage::Plan).artifact {
            let record = self.artifacts.read(artifact)?;
            if let Some(decision) = record.get("decision")
                && let Ok(decision) = serde_json::from_value::<StrategyDecision>(decision.clone())
            {
                return Ok(decision);
            }
            warn!("Plan artifact carries no readable decision; re-inferring");
        }
        Ok(self.inferencer.infer(workspace))
    }

    fn load_inputs(
        &self,
        repo_id: &str,
        stage: Stage,
    ) -> Result<BTreeMap<Stage, StageRecord>, FailureReason> {
        let state = self.state.get_state(repo_id).map_err(|err| {
            FailureReason::new(FailureKind::Io, format!("Failed to read state: {err}"))
        })?;
        let mut inputs = BTreeMap::new();
        for predecessor in stage.predecessors() {
            if let Some(artifact) = &state.stage(*predecessor).artifact {
                inputs.insert(*predecessor, self.artifacts.read(artifact)?);
            }
        }
        Ok(inputs)
    }
}

impl From<FetchError> for FailureReason {
    fn from(err: FetchError) -> Self {
        let kind = match &err {
            FetchError::Command(CommandError::Timeout { .. }) => FailureKind::Timeout,
            FetchError::Io { .. } => FailureKind::Io,
            _ => FailureKind::Fetch,
        };
        FailureReason::new(kind, err.to_string())
    }
}

impl From<ArtifactError> for FailureReason {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::Schema(violation) => FailureReason::new(
                FailureKind::SchemaViolation,
                format!(
                    "{} record for stage '{}' failed validation",
                    violation.schema, violation.stage
                ),
            )
            .with_details(violation.violations.iter().map(ToString::to_string).collect()),
            ArtifactError::Io { .. } => FailureReason::new(FailureKind::Io, err.to_string()),
            other => FailureReason::new(FailureKind::Internal, other.to_string()),
        }
    }
}

impl From<StrategyError> for FailureReason {
    fn from(err: StrategyError) -> Self {
        match err {
            StrategyError::Failed { message, details } => {
                FailureReason::new(FailureKind::Strategy, message).with_details(details)
            }
            StrategyError::Command(CommandError::Timeout { .. }) => {
                FailureReason::new(FailureKind::Timeout, err.to_string())
            }
            StrategyError::Artifact(inner) => inner.into(),
            StrategyError::Io { .. } => FailureReason::new(FailureKind::Io, err.to_string()),
            other => FailureReason::new(FailureKind::Strategy, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_and_chains() {
        assert_eq!(Stage::Discover.predecessors(), &[] as &[Stage]);
        assert_eq!(Stage::Build.predecessors(), &[Stage::Discover, Stage::Plan]);
        assert_eq!(Stage::Publish.chain().len(), 6);
        assert!(Stage::Plan < Stage::Build);
        assert_eq!("test".parse::<Stage>().unwrap(), Stage::Test);
        assert!("deploy".parse::<Stage>().is_err());
    }

    #[test]
    fn stage_serializes_snake_case() {
        assert_eq!(serde_json::to_value(Stage::Package).unwrap(), json!("package"));
    }

    #[test]
    fn run_result_outcomes() {
        let mut state = PipelineState::new("demo");
        assert_eq!(
            RunResult::from_state(&state, Stage::Plan).outcome,
            RunOutcome::Failed
        );

        state.stages[0].status = StageStatus::Succeeded;
        state.stages[1].status = StageStatus::Failed;
        let partial = RunResult::from_state(&state, Stage::Build);
        assert_eq!(partial.outcome, RunOutcome::Partial);
        assert_eq!(partial.stages.len(), 3);
        assert_eq!(partial.failed_stage().unwrap().stage, Stage::Plan);

        assert!(RunResult::from_state(&state, Stage::Discover).is_success());
    }

    #[test]
    fn catalog_test_timeout_governs_test_commands() {
        let mut repo = RepositoryDescriptor::new("demo", "https://example.invalid/demo.git");
        repo.tests.timeout_s = Some(30);
        let root = tempfile::tempdir().unwrap();
        let machine = StageMachine::new(
            WorkspaceLayout::new(root.path()),
            Arc::new(crate::catalog::RepoCatalog::from_repos(vec![repo.clone()])),
            Arc::new(crate::workspace::GitFetcher::new(CommandRunner::default())),
        )
        .with_settings(MachineSettings {
            command_timeout: Some(Duration::from_secs(1)),
            ..MachineSettings::default()
        });

        assert_eq!(
            machine.command_timeout(&repo, Stage::Test),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            machine.stage_timeout(&repo, Stage::Test),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            machine.command_timeout(&repo, Stage::Build),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn strategy_failures_map_to_kinds() {
        let reason: FailureReason = StrategyError::Command(CommandError::Timeout {
            command: "pytest".into(),
            timeout: Duration::from_secs(5),
        })
        .into();
        assert_eq!(reason.kind, FailureKind::Timeout);

        let reason: FailureReason = StrategyError::Failed {
            message: "install failed".into(),
            details: vec!["pip install -r requirements.txt".into()],
        }
        .into();
        assert_eq!(reason.kind, FailureKind::Strategy);
        assert_eq!(reason.details.len(), 1);
    }
}
