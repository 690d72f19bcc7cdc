//! Durable per-repository pipeline state.
//!
//! One JSON document per repository at `<root>/<repo_id>/pipeline.json`,
//! replaced atomically on every transition. Transitions for the same
//! repository are serialized in-process.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::artifacts::{ArtifactRef, write_atomic};
use crate::catalog::is_valid_repo_id;
use crate::error::StateError;
use crate::pipeline::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    SchemaViolation,
    Timeout,
    Strategy,
    Io,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageState {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    /// Artifact of an earlier run, kept until a new one supersedes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_artifact: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReason>,
}

impl StageState {
    fn pending(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            artifact: None,
            previous_artifact: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub repo_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageState>,
}

impl PipelineState {
    pub fn new(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            updated_at: None,
            stages: Stage::ordered().iter().copied().map(StageState::pending).collect(),
        }
    }

    pub fn stage(&self, stage: Stage) -> &StageState {
        &self.stages[stage.index()]
    }

    fn stage_mut(&mut self, stage: Stage) -> &mut StageState {
        &mut self.stages[stage.index()]
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.stage(stage).status
    }

    pub fn is_succeeded(&self, stage: Stage) -> bool {
        self.status(stage) == StageStatus::Succeeded
    }

    /// Fill in stages missing from an older or hand-edited record and put
    /// them in canonical order.
    fn normalize(mut self) -> Self {
        let mut stages: Vec<StageState> = Stage::ordered()
            .iter()
            .copied()
            .map(StageState::pending)
            .collect();
        for entry in self.stages.drain(..) {
            let index = entry.stage.index();
            stages[index] = entry;
        }
        self.stages = stages;
        self
    }
}

/// A requested status change, carrying the data the new status needs.
#[derive(Debug, Clone)]
pub enum Transition {
    Running,
    Succeeded(ArtifactRef),
    Failed(FailureReason),
}

impl Transition {
    pub fn target(&self) -> StageStatus {
        match self {
            Transition::Running => StageStatus::Running,
            Transition::Succeeded(_) => StageStatus::Succeeded,
            Transition::Failed(_) => StageStatus::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub state: PipelineState,
    /// Artifact that the committed transition replaced, if any.
    pub superseded: Option<ArtifactRef>,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    guards: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            guards: Arc::new(DashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, repo_id: &str) -> PathBuf {
        self.root.join(repo_id).join("pipeline.json")
    }

    fn guard(&self, repo_id: &str) -> Arc<Mutex<()>> {
        self.guards
            .entry(repo_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Current state; a repository never advanced has every stage pending.
    pub fn get_state(&self, repo_id: &str) -> Result<PipelineState, StateError> {
        if !is_valid_repo_id(repo_id) {
            return Err(StateError::InvalidRepoId(repo_id.to_string()));
        }
        let path = self.path_for(repo_id);
        match fs::read(&path) {
            Ok(bytes) => {
                let state: PipelineState = serde_json::from_slice(&bytes)
                    .map_err(|source| StateError::Decode { path, source })?;
                Ok(state.normalize())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(PipelineState::new(repo_id)),
            Err(source) => Err(StateError::Io { path, source }),
        }
    }

    /// Apply a single status change and persist it before returning.
    pub fn transition(
        &self,
        repo_id: &str,
        stage: Stage,
        transition: Transition,
    ) -> Result<TransitionOutcome, StateError> {
        let guard = self.guard(repo_id);
        let _lock = guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut state = self.get_state(repo_id)?;
        let target = transition.target();

        if target == StageStatus::Succeeded {
            for predecessor in stage.predecessors() {
                let status = state.status(*predecessor);
                if status != StageStatus::Succeeded {
                    return Err(StateError::OutOfOrderTransition {
                        repo_id: repo_id.to_string(),
                        stage,
                        predecessor: *predecessor,
                        status,
                    });
                }
            }
        }

        let current = state.status(stage);
        let allowed = matches!(
            (current, target),
            (StageStatus::Pending, StageStatus::Running)
                | (StageStatus::Failed, StageStatus::Running)
                | (StageStatus::Running, StageStatus::Running)
                | (StageStatus::Running, StageStatus::Succeeded)
                | (StageStatus::Running, StageStatus::Failed)
        );
        if !allowed {
            return Err(StateError::InvalidTransition {
                repo_id: repo_id.to_string(),
                stage,
                from: current,
                to: target,
            });
        }
        if current == StageStatus::Running && target == StageStatus::Running {
            warn!(repo_id, stage = %stage, "Re-entering stage left running by an interrupted advance");
        }

        let now = Utc::now();
        let mut superseded = None;
        let entry = state.stage_mut(stage);
        match transition {
            Transition::Running => {
                entry.status = StageStatus::Running;
                entry.attempts += 1;
                entry.started_at = Some(now);
                entry.finished_at = None;
                entry.error = None;
            }
            Transition::Succeeded(artifact) => {
                superseded = entry
                    .previous_artifact
                    .take()
                    .filter(|previous| previous.path != artifact.path);
                entry.status = StageStatus::Succeeded;
                entry.finished_at = Some(now);
                entry.artifact = Some(artifact);
                entry.error = None;
            }
            Transition::Failed(reason) => {
                entry.status = StageStatus::Failed;
                entry.finished_at = Some(now);
                entry.error = Some(reason);
            }
        }
        state.updated_at = Some(now);

        self.persist(&state)?;
        debug!(repo_id, stage = %stage, status = %target, "State transition committed");
        Ok(TransitionOutcome { state, superseded })
    }

    /// Return `from` and every later stage to `pending`.
    ///
    /// Artifact references move to `previous_artifact` so the retention
    /// policy can be applied once a re-run supersedes them.
    pub fn reset(&self, repo_id: &str, from: Stage) -> Result<PipelineState, StateError> {
        let guard = self.guard(repo_id);
        let _lock = guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut state = self.get_state(repo_id)?;
        for entry in state.stages.iter_mut().filter(|s| s.stage >= from) {
            let previous = entry.artifact.take().or(entry.previous_artifact.take());
            *entry = StageState {
                previous_artifact: previous,
                ..StageState::pending(entry.stage)
            };
        }
        state.updated_at = Some(Utc::now());
        self.persist(&state)?;
        Ok(state)
    }

    fn persist(&self, state: &PipelineState) -> Result<(), StateError> {
        let path = self.path_for(&state.repo_id);
        let mut bytes = serde_json::to_vec_pretty(state).map_err(|source| StateError::Encode {
            path: path.clone(),
            source,
        })?;
        bytes.push(b'\n');
        write_atomic(&path, &bytes).map_err(|source| StateError::Io { path, source })
    }
}
