#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cwm_orchestrator::catalog::{RepoCatalog, RepositoryDescriptor};
use cwm_orchestrator::error::{FetchError, StrategyError};
use cwm_orchestrator::inference::StrategyDecision;
use cwm_orchestrator::pipeline::{MachineSettings, StageMachine, StageRecord};
use cwm_orchestrator::strategies::{StageContext, StageStrategy};
use cwm_orchestrator::workspace::{SourceFetcher, Workspace, WorkspaceLayout};
use serde_json::json;

/// Writes a fixed file tree instead of cloning.
pub struct FakeFetcher {
    files: Vec<(String, String)>,
    unreachable: Vec<String>,
    calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn new(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(path, content)| (path.to_string(), content.to_string()))
                .collect(),
            unreachable: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unreachable_for(mut self, repo_id: &str) -> Self {
        self.unreachable.push(repo_id.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    fn name(&self) -> &str {
        "fake"
    }

    async fn fetch(&self, repo: &RepositoryDescriptor, dest: &Path) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.contains(&repo.id) {
            return Err(FetchError::Unreachable {
                location: repo.url.clone(),
                message: "connection refused".into(),
            });
        }
        fs::create_dir_all(dest).unwrap();
        for (rel, content) in &self.files {
            let path = dest.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        Ok(())
    }

    async fn revision(&self, _path: &Path) -> Option<String> {
        Some("0123abcd".into())
    }
}

pub const FLASK_TREE: &[(&str, &str)] = &[
    (
        "pyproject.toml",
        "[project]\nname = \"flask\"\n\n[project.optional-dependencies]\ntest = [\"pytest\"]\n\n[tool.pytest.ini_options]\ntestpaths = [\"tests\"]\n",
    ),
    ("src/flask/__init__.py", "__version__ = \"3.0.0\"\n"),
    ("tests/test_app.py", "def test_index():\n    assert True\n"),
    (
        ".github/workflows/tests.yaml",
        "jobs:\n  tests:\n    steps:\n      - run: pytest\n",
    ),
];

pub const BARE_TREE: &[(&str, &str)] = &[("README.md", "# nothing to build\n")];

pub fn flask() -> RepositoryDescriptor {
    let mut repo = RepositoryDescriptor::new("pallets_flask", "https://github.com/pallets/flask");
    repo.commit = "3.0.0".into();
    repo.license = "BSD-3-Clause".into();
    repo
}

pub fn repo(id: &str) -> RepositoryDescriptor {
    RepositoryDescriptor::new(id, format!("https://example.invalid/{id}.git"))
}

pub fn machine(
    root: &Path,
    repos: Vec<RepositoryDescriptor>,
    fetcher: Arc<FakeFetcher>,
) -> StageMachine {
    StageMachine::new(
        WorkspaceLayout::new(root),
        Arc::new(RepoCatalog::from_repos(repos)),
        fetcher,
    )
}

/// An interpreter stand-in that answers the commands the Python strategies
/// issue with canned output.
pub fn fake_python(dir: &Path, failing_install: bool) -> PathBuf {
    if failing_install {
        fake_python_with(
            dir,
            "python-broken",
            r#"*"pip install"*) echo 'ERROR: No matching distribution found for flask' >&2; exit 1 ;;"#,
        )
    } else {
        fake_python_with(dir, "python", "")
    }
}

/// Like [`fake_python`], with `arms` matched before the canned answers.
pub fn fake_python_with(dir: &Path, name: &str, arms: &str) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
case "$*" in
  {arms}
  "--version") echo "Python 3.11.9" ;;
  *"pip install"*) : ;;
  *"pip freeze"*) printf 'flask==3.0.0\nwerkzeug==3.0.1\n' ;;
  *"--collect-only"*) printf 'tests/test_app.py::test_index\ntests/test_app.py::test_health\n\n2 tests collected in 0.01s\n' ;;
  *"coverage xml"*) for last; do :; done; printf '<?xml version="1.0" ?>\n<coverage line-rate="0.8765"></coverage>\n' > "$last" ;;
  *"coverage run"*) printf '..\n2 passed in 0.05s\n' ;;
  *) : ;;
esac
exit 0
"#
    );
    let path = dir.join(name);
    fs::write(&path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Whether `pid` names a live, non-zombie process.
#[cfg(target_os = "linux")]
pub fn is_alive(pid: &str) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .map(|stat| {
            let state = stat.rsplit(')').next().unwrap_or_default();
            !state.trim_start().starts_with('Z')
        })
        .unwrap_or(false)
}

pub fn settings_with_python(python: &Path) -> MachineSettings {
    MachineSettings {
        python: python.to_string_lossy().to_string(),
        ..MachineSettings::default()
    }
}

/// What a spy strategy hands back.
#[derive(Clone, Copy)]
pub enum SpyMode {
    Valid,
    /// A record missing most of its schema fields.
    Malformed,
    /// Fails the first call, then behaves like `Valid`.
    FailOnce,
    Sleep(Duration),
}

/// Counts executions and returns a build record without running anything.
pub struct SpyBuild {
    mode: SpyMode,
    calls: Arc<AtomicUsize>,
}

impl SpyBuild {
    pub fn new(mode: SpyMode) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                mode,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

pub fn build_record(ctx: &StageContext) -> StageRecord {
    ctx.record()
        .with("python_version", json!("3.11.9"))
        .with("packages", json!(["flask==3.0.0"]))
        .with("env", json!({ "PYTHONHASHSEED": "0" }))
        .with("base_image", json!("python:3.11-slim"))
        .with("plan_hash", json!("0".repeat(64)))
        .with("lockfiles", json!([]))
        .with("commands", json!([]))
        .with("duration_ms", json!(1))
        .with("env_manifest_path", json!("env_manifest.json"))
        .with("log_path", json!("build.log.jsonl"))
}

#[async_trait]
impl StageStrategy for SpyBuild {
    fn name(&self) -> &'static str {
        "spy"
    }

    async fn execute(
        &self,
        _workspace: &Workspace,
        _decision: &StrategyDecision,
        ctx: &StageContext,
    ) -> Result<StageRecord, StrategyError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            SpyMode::Valid => Ok(build_record(ctx)),
            SpyMode::Malformed => Ok(ctx.record().with("python_version", json!(311))),
            SpyMode::FailOnce if call == 0 => Err(StrategyError::Failed {
                message: "Dependency installation failed".into(),
                details: vec!["$ python -m pip install -e .".into()],
            }),
            SpyMode::FailOnce => Ok(build_record(ctx)),
            SpyMode::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(build_record(ctx))
            }
        }
    }
}
