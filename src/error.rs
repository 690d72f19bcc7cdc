use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::Stage;
use crate::schema::SchemaViolation;
use crate::state::StageStatus;

/// Caller-visible failures of `advance`, `status` and `reset`.
///
/// Stage-level failures never surface here: they are recorded as a `failed`
/// stage in the pipeline state and reported through the `RunResult`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown repository id '{0}'")]
    NotFound(String),

    #[error("Repository '{0}' is already being advanced by another caller")]
    Busy(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Catalog(CatalogError),

    #[error("Failed to acquire advance lock at {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Busy(_) | PipelineError::Lock { .. })
    }
}

impl From<CatalogError> for PipelineError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(id) => PipelineError::NotFound(id),
            other => PipelineError::Catalog(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Unknown repo id: {0}")]
    NotFound(String),

    #[error("Failed to read catalog {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse catalog {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Malformed catalog {path}: {message}")]
    Malformed { path: PathBuf, message: String },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error(
        "Cannot mark stage '{stage}' succeeded for '{repo_id}': predecessor '{predecessor}' is {status}"
    )]
    OutOfOrderTransition {
        repo_id: String,
        stage: Stage,
        predecessor: Stage,
        status: StageStatus,
    },

    #[error("Invalid transition for '{repo_id}' stage '{stage}': {from} -> {to}")]
    InvalidTransition {
        repo_id: String,
        stage: Stage,
        from: StageStatus,
        to: StageStatus,
    },

    #[error("Invalid repository id '{0}'")]
    InvalidRepoId(String),

    #[error("State I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt state record at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode state record for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid repository id '{0}'")]
    InvalidRepoId(String),

    #[error("Source {location} is unreachable: {message}")]
    Unreachable { location: String, message: String },

    #[error("Failed to check out revision '{revision}': {message}")]
    Checkout { revision: String, message: String },

    #[error("Workspace I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command has no executable")]
    Empty,

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command '{command}' timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("Command '{command}' failed with exit code {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("I/O error while running '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("{message}")]
    Failed {
        message: String,
        details: Vec<String>,
    },

    #[error("Stage requires the '{0}' artifact, which is missing")]
    MissingInput(Stage),

    #[error("No '{kind}' strategy registered under '{strategy}'")]
    Unregistered { kind: String, strategy: String },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("Strategy I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StrategyError {
    pub fn failed(message: impl Into<String>) -> Self {
        StrategyError::Failed {
            message: message.into(),
            details: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Schema(#[from] SchemaViolation),

    #[error("Artifact I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode artifact: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Corrupt artifact at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Artifact {path} does not match its digest {expected}")]
    DigestMismatch { path: PathBuf, expected: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_not_found_maps_to_pipeline_not_found() {
        let err: PipelineError = CatalogError::NotFound("demo".into()).into();
        assert!(matches!(err, PipelineError::NotFound(ref id) if id == "demo"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn busy_is_retryable() {
        assert!(PipelineError::Busy("demo".into()).is_retryable());
    }

    #[test]
    fn command_timeout_message_reports_seconds() {
        let err = CommandError::Timeout {
            command: "pytest -q".into(),
            timeout: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "Command 'pytest -q' timed out after 90s");
    }
}
