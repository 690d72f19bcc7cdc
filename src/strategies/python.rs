//! Dependency installation for Python repositories.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::{StageContext, StageStrategy, tail_lines};
use crate::artifacts::sha256_hex;
use crate::error::StrategyError;
use crate::inference::{StrategyDecision, load_pyproject};
use crate::pipeline::{PLAN_PYTHON_VERSION, Stage, StageRecord};
use crate::process::{CommandOutput, display_path};
use crate::workspace::Workspace;

pub const BASE_IMAGE: &str = "python:3.11-slim";

const REQUIREMENT_FILES: &[&str] = &[
    "requirements.txt",
    "requirements-dev.txt",
    "requirements-test.txt",
    "requirements/tests.txt",
    "requirements/dev.txt",
    "requirements/test.txt",
    "requirements/ci.txt",
];

const EXTRA_CANDIDATES: &[&str] = &["dev", "test", "tests", "ci"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildTool {
    Pip,
    Setuptools,
    Poetry,
    Conda,
}

impl BuildTool {
    pub const ALL: [BuildTool; 4] = [
        BuildTool::Pip,
        BuildTool::Setuptools,
        BuildTool::Poetry,
        BuildTool::Conda,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildTool::Pip => "pip",
            BuildTool::Setuptools => "setuptools",
            BuildTool::Poetry => "poetry",
            BuildTool::Conda => "conda",
        }
    }
}

/// Installs a repository and its test dependencies into the configured
/// interpreter and records the resulting environment.
pub struct PythonBuild {
    tool: BuildTool,
}

impl PythonBuild {
    pub fn new(tool: BuildTool) -> Self {
        Self { tool }
    }
}

/// Extras among dev/test/tests/ci declared in `project.optional-dependencies`
/// or as non-empty Poetry dependency groups, sorted and deduplicated.
pub fn project_extras(repo_dir: &Path) -> Vec<String> {
    let Some(pyproject) = load_pyproject(repo_dir) else {
        return Vec::new();
    };
    let mut extras = Vec::new();

    if let Some(optional) = pyproject
        .get("project")
        .and_then(|p| p.get("optional-dependencies"))
        .and_then(toml::Value::as_table)
    {
        extras.extend(
            EXTRA_CANDIDATES
                .iter()
                .filter(|candidate| optional.contains_key(**candidate))
                .map(|candidate| candidate.to_string()),
        );
    }

    if let Some(groups) = pyproject
        .get("tool")
        .and_then(|t| t.get("poetry"))
        .and_then(|p| p.get("group"))
        .and_then(toml::Value::as_table)
    {
        for candidate in EXTRA_CANDIDATES {
            let non_empty = groups
                .get(*candidate)
                .and_then(|group| group.get("dependencies"))
                .and_then(toml::Value::as_table)
                .map(|deps| !deps.is_empty())
                .unwrap_or(false);
            if non_empty {
                extras.push(candidate.to_string());
            }
        }
    }

    extras.sort();
    extras.dedup();
    extras
}

/// The ordered install commands for `repo_dir`.
pub fn install_commands(repo_dir: &Path, python: &str) -> Vec<Vec<String>> {
    let pip = |args: &[&str]| -> Vec<String> {
        [python, "-m", "pip", "install"]
            .iter()
            .chain(args.iter())
            .map(|s| s.to_string())
            .collect()
    };

    let mut commands: Vec<Vec<String>> = REQUIREMENT_FILES
        .iter()
        .filter(|rel| repo_dir.join(rel).is_file())
        .map(|rel| pip(&["-r", *rel]))
        .collect();

    let extras = project_extras(repo_dir);
    let target = if extras.is_empty() {
        ".".to_string()
    } else {
        format!(".[{}]", extras.join(","))
    };
    if ["setup.py", "setup.cfg", "pyproject.toml"]
        .iter()
        .any(|name| repo_dir.join(name).is_file())
    {
        commands.push(pip(&["-e", target.as_str()]));
    }

    commands.push(pip(&["pytest", "coverage"]));
    commands
}

fn command_entry(output: &CommandOutput) -> serde_json::Value {
    json!({
        "command": output.command,
        "returncode": output.returncode,
        "duration_ms": output.duration_ms,
    })
}

#[async_trait]
impl StageStrategy for PythonBuild {
    fn name(&self) -> &'static str {
        "python-build"
    }

    async fn execute(
        &self,
        workspace: &Workspace,
        _decision: &StrategyDecision,
        ctx: &StageContext,
    ) -> Result<StageRecord, StrategyError> {
        let plan = ctx.input(Stage::Plan)?;
        let started = Instant::now();
        let repo_dir = workspace.path.as_path();

        let mut entries = Vec::new();
        let mut log = Vec::new();
        for command in install_commands(repo_dir, &ctx.python) {
            let output = ctx.runner.run(&command, Some(repo_dir)).await?;
            entries.push(command_entry(&output));
            log.push(output.clone());
            if !output.success() {
                ctx.write_log("build.log.jsonl", &log)?;
                let mut details = vec![format!("$ {}", output.command.join(" "))];
                details.extend(tail_lines(&output.stderr, 20));
                return Err(StrategyError::Failed {
                    message: format!(
                        "Dependency installation failed: `{}` exited with {}",
                        output.command.join(" "),
                        output.returncode
                    ),
                    details,
                });
            }
        }

        let freeze = ctx
            .runner
            .run(&ctx.python_module("pip", &["freeze"]), Some(repo_dir))
            .await?;
        if !freeze.success() {
            warn!(returncode = freeze.returncode, "pip freeze failed; recording no packages");
        }
        let packages: Vec<String> = freeze
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        log.push(freeze);

        let version = ctx.runner.run(&[ctx.python.as_str(), "--version"], None).await?;
        let python_version = parse_python_version(&format!("{}{}", version.stdout, version.stderr))
            .or_else(|| {
                plan.get("python_version")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| PLAN_PYTHON_VERSION.to_string());

        // serde_json maps are sorted, so the encoding is canonical.
        let plan_hash = sha256_hex(plan.to_value().to_string().as_bytes());
        let lockfiles = plan
            .get("builder_inputs")
            .and_then(|inputs| inputs.get("lockfile_sources"))
            .cloned()
            .unwrap_or_else(|| json!([]));
        let env = json!({ "PYTHONHASHSEED": "0" });

        let env_manifest_path = ctx.write_json(
            "env_manifest.json",
            &json!({
                "python_version": python_version,
                "pip_freeze": packages,
                "apt_packages": [],
                "env": env,
            }),
        )?;
        let log_path = ctx.write_log("build.log.jsonl", &log)?;
        let duration_ms = started.elapsed().as_millis() as u64;

        info!(
            tool = self.tool.as_str(),
            packages = packages.len(),
            duration_ms,
            "Environment built"
        );
        Ok(ctx
            .record()
            .with("python_version", json!(python_version))
            .with("packages", json!(packages))
            .with("env", env)
            .with("base_image", json!(BASE_IMAGE))
            .with("plan_hash", json!(plan_hash))
            .with("lockfiles", lockfiles)
            .with("commands", json!(entries))
            .with("duration_ms", json!(duration_ms))
            .with("env_manifest_path", json!(display_path(&env_manifest_path)))
            .with("log_path", json!(display_path(&log_path))))
    }
}

/// `3.11.4` from `Python 3.11.4`.
fn parse_python_version(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .skip_while(|word| !word.eq_ignore_ascii_case("python"))
        .nth(1)
        .filter(|version| version.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .map(str::to_string)
}
