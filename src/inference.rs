//! Strategy inference from a repository's file tree.
//!
//! Inference is a pure function of the files on disk: the same tree always
//! yields the same [`StrategyDecision`], and nothing time- or
//! environment-dependent is recorded in it.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pipeline::Stage;

pub const DEFAULT_RULESET: &str = "python-rules/v1";

/// Toolchain facts recorded in the discover manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toolchain {
    pub pyproject: bool,
    pub poetry: bool,
    pub hatch: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_backend: Option<String>,
    pub requirements: bool,
    pub environment_yml: bool,
    pub ci_workflows: Vec<String>,
}

pub fn detect_toolchain(repo_dir: &Path) -> Toolchain {
    let pyproject = load_pyproject(repo_dir);
    let tool = pyproject.as_ref().and_then(|doc| doc.get("tool"));
    Toolchain {
        pyproject: repo_dir.join("pyproject.toml").is_file(),
        poetry: tool.and_then(|t| t.get("poetry")).is_some(),
        hatch: tool.and_then(|t| t.get("hatch")).is_some(),
        build_backend: pyproject
            .as_ref()
            .and_then(|doc| doc.get("build-system"))
            .and_then(|bs| bs.get("build-backend"))
            .and_then(toml::Value::as_str)
            .map(str::to_string),
        requirements: repo_dir.join("requirements.txt").is_file(),
        environment_yml: repo_dir.join("environment.yml").is_file(),
        ci_workflows: list_workflows(repo_dir),
    }
}

/// Parsed `pyproject.toml`, or `None` when absent or unparsable.
pub fn load_pyproject(repo_dir: &Path) -> Option<toml::Table> {
    let content = fs::read_to_string(repo_dir.join("pyproject.toml")).ok()?;
    match content.parse::<toml::Table>() {
        Ok(table) => Some(table),
        Err(err) => {
            debug!(error = %err, "Ignoring unparsable pyproject.toml");
            None
        }
    }
}

/// Workflow files relative to the repository root: `*.yml` sorted, then
/// `*.yaml` sorted.
fn list_workflows(repo_dir: &Path) -> Vec<String> {
    let workflows_dir = repo_dir.join(".github").join("workflows");
    let mut workflows = Vec::new();
    for extension in ["yml", "yaml"] {
        let pattern = format!("{}/*.{extension}", glob::Pattern::escape(&workflows_dir.to_string_lossy()));
        let Ok(paths) = glob::glob(&pattern) else {
            continue;
        };
        let mut found: Vec<String> = paths
            .filter_map(Result::ok)
            .filter(|path| path.is_file())
            .filter_map(|path| {
                path.strip_prefix(repo_dir)
                    .ok()
                    .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        found.sort();
        workflows.extend(found);
    }
    workflows
}

/// Everything the rules look at, gathered once per inference.
#[derive(Debug, Default)]
pub struct RepoFacts {
    /// Top-level entries; directories carry a trailing `/`.
    pub entries: BTreeSet<String>,
    pub pyproject: Option<toml::Table>,
    pub workflows: Vec<(String, String)>,
    pub python_test_dirs: Vec<String>,
}

impl RepoFacts {
    pub fn gather(repo_dir: &Path) -> Self {
        let mut entries = BTreeSet::new();
        if let Ok(read_dir) = fs::read_dir(repo_dir) {
            for entry in read_dir.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                entries.insert(if is_dir { format!("{name}/") } else { name });
            }
        }

        let workflows = list_workflows(repo_dir)
            .into_iter()
            .map(|rel| {
                let content = fs::read_to_string(repo_dir.join(&rel)).unwrap_or_default();
                (rel, content)
            })
            .collect();

        let python_test_dirs = ["tests", "test"]
            .into_iter()
            .filter(|dir| contains_python_files(&repo_dir.join(dir)))
            .map(|dir| format!("{dir}/"))
            .collect();

        Self {
            entries,
            pyproject: load_pyproject(repo_dir),
            workflows,
            python_test_dirs,
        }
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.entries.contains(name)
    }

    fn tool_section(&self, name: &str) -> bool {
        self.pyproject
            .as_ref()
            .and_then(|doc| doc.get("tool"))
            .and_then(|tool| tool.get(name))
            .is_some()
    }

    fn pytest_ini_options(&self) -> bool {
        self.pyproject
            .as_ref()
            .and_then(|doc| doc.get("tool"))
            .and_then(|tool| tool.get("pytest"))
            .and_then(|pytest| pytest.get("ini_options"))
            .is_some()
    }
}

fn contains_python_files(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    let pattern = format!("{}/**/*.py", glob::Pattern::escape(&dir.to_string_lossy()));
    glob::glob(&pattern)
        .map(|mut paths| paths.any(|p| p.is_ok()))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Resolution {
    Resolved { strategy: String },
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyChoice {
    pub resolution: Resolution,
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub signals: Vec<String>,
}

impl StrategyChoice {
    pub fn unknown() -> Self {
        Self {
            resolution: Resolution::Unknown,
            confidence: Confidence::None,
            rule: None,
            signals: Vec::new(),
        }
    }

    pub fn strategy(&self) -> Option<&str> {
        match &self.resolution {
            Resolution::Resolved { strategy } => Some(strategy),
            Resolution::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyDecision {
    pub ruleset: String,
    pub build: StrategyChoice,
    pub test: StrategyChoice,
    pub package: StrategyChoice,
    /// Sorted descriptor files the rules looked at and found.
    pub observed: Vec<String>,
}

/// Publish strategy used whenever packaging is resolved.
pub const PUBLISH_STRATEGY: &str = "dry-run";

impl StrategyDecision {
    pub fn choice(&self, stage: Stage) -> Option<&StrategyChoice> {
        match stage {
            Stage::Build => Some(&self.build),
            Stage::Test => Some(&self.test),
            Stage::Package => Some(&self.package),
            _ => None,
        }
    }

    /// Strategy id for a strategy-driven stage, `None` when unknown.
    pub fn strategy_for(&self, stage: Stage) -> Option<String> {
        match stage {
            Stage::Publish => self
                .package
                .strategy()
                .map(|_| PUBLISH_STRATEGY.to_string()),
            other => self
                .choice(other)
                .and_then(StrategyChoice::strategy)
                .map(str::to_string),
        }
    }
}

/// Stage kinds a rule can resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTarget {
    Build,
    Test,
    Package,
}

/// A detection rule: when `check` matches, it returns the signals that
/// justified the match.
#[derive(Clone)]
pub struct Rule {
    pub name: &'static str,
    pub target: RuleTarget,
    pub strategy: &'static str,
    pub confidence: Confidence,
    pub check: fn(&RepoFacts) -> Option<Vec<String>>,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("strategy", &self.strategy)
            .finish()
    }
}

fn present(facts: &RepoFacts, names: &[&str]) -> Option<Vec<String>> {
    let signals: Vec<String> = names
        .iter()
        .filter(|name| facts.has_file(name))
        .map(|name| format!("{name} present"))
        .collect();
    (!signals.is_empty()).then_some(signals)
}

fn requirement_files(facts: &RepoFacts) -> Vec<String> {
    facts
        .entries
        .iter()
        .filter(|name| name.starts_with("requirements") && name.ends_with(".txt"))
        .cloned()
        .collect()
}

pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "poetry-project",
            target: RuleTarget::Build,
            strategy: "poetry",
            confidence: Confidence::High,
            check: |facts| {
                facts
                    .tool_section("poetry")
                    .then(|| vec!["[tool.poetry] in pyproject.toml".to_string()])
            },
        },
        Rule {
            name: "pyproject",
            target: RuleTarget::Build,
            strategy: "setuptools",
            confidence: Confidence::High,
            check: |facts| present(facts, &["pyproject.toml"]),
        },
        Rule {
            name: "setup-script",
            target: RuleTarget::Build,
            strategy: "setuptools",
            confidence: Confidence::High,
            check: |facts| present(facts, &["setup.py", "setup.cfg"]),
        },
        Rule {
            name: "conda-environment",
            target: RuleTarget::Build,
            strategy: "conda",
            confidence: Confidence::High,
            check: |facts| present(facts, &["environment.yml"]),
        },
        Rule {
            name: "requirements",
            target: RuleTarget::Build,
            strategy: "pip",
            confidence: Confidence::High,
            check: |facts| {
                let files = requirement_files(facts);
                (!files.is_empty())
                    .then(|| files.iter().map(|f| format!("{f} present")).collect())
            },
        },
        Rule {
            name: "pytest-config",
            target: RuleTarget::Test,
            strategy: "pytest",
            confidence: Confidence::High,
            check: |facts| {
                let mut signals =
                    present(facts, &["pytest.ini", "conftest.py", "tox.ini"]).unwrap_or_default();
                if facts.pytest_ini_options() {
                    signals.push("[tool.pytest.ini_options] in pyproject.toml".to_string());
                }
                (!signals.is_empty()).then_some(signals)
            },
        },
        Rule {
            name: "ci-runs-pytest",
            target: RuleTarget::Test,
            strategy: "pytest",
            confidence: Confidence::Medium,
            check: |facts| {
                let signals: Vec<String> = facts
                    .workflows
                    .iter()
                    .filter(|(_, content)| content.contains("pytest"))
                    .map(|(rel, _)| format!("{rel} invokes pytest"))
                    .collect();
                (!signals.is_empty()).then_some(signals)
            },
        },
        Rule {
            name: "python-test-directory",
            target: RuleTarget::Test,
            strategy: "pytest",
            confidence: Confidence::Medium,
            check: |facts| {
                let signals: Vec<String> = facts
                    .python_test_dirs
                    .iter()
                    .map(|dir| format!("{dir} contains Python files"))
                    .collect();
                (!signals.is_empty()).then_some(signals)
            },
        },
        Rule {
            name: "packaging-descriptor",
            target: RuleTarget::Package,
            strategy: "image-manifest",
            confidence: Confidence::High,
            check: |facts| {
                present(
                    facts,
                    &[
                        "pyproject.toml",
                        "setup.py",
                        "setup.cfg",
                        "requirements.txt",
                        "environment.yml",
                        "poetry.lock",
                    ],
                )
            },
        },
    ]
}

const OBSERVED_FILES: &[&str] = &[
    "conftest.py",
    "environment.yml",
    "poetry.lock",
    "pyproject.toml",
    "pytest.ini",
    "setup.cfg",
    "setup.py",
    "tox.ini",
];

#[derive(Debug, Clone)]
pub struct StrategyInferencer {
    ruleset: String,
    rules: Vec<Rule>,
}

impl Default for StrategyInferencer {
    fn default() -> Self {
        Self::new(DEFAULT_RULESET, default_rules())
    }
}

impl StrategyInferencer {
    pub fn new(ruleset: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self {
            ruleset: ruleset.into(),
            rules,
        }
    }

    pub fn ruleset(&self) -> &str {
        &self.ruleset
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn infer(&self, repo_dir: &Path) -> StrategyDecision {
        self.infer_from(&RepoFacts::gather(repo_dir))
    }

    /// Apply the rules in order; the first match per target wins.
    pub fn infer_from(&self, facts: &RepoFacts) -> StrategyDecision {
        let decide = |target: RuleTarget| {
            self.rules
                .iter()
                .filter(|rule| rule.target == target)
                .find_map(|rule| {
                    (rule.check)(facts).map(|mut signals| {
                        signals.sort();
                        signals.dedup();
                        StrategyChoice {
                            resolution: Resolution::Resolved {
                                strategy: rule.strategy.to_string(),
                            },
                            confidence: rule.confidence,
                            rule: Some(rule.name.to_string()),
                            signals,
                        }
                    })
                })
                .unwrap_or_else(StrategyChoice::unknown)
        };

        let mut observed: Vec<String> = OBSERVED_FILES
            .iter()
            .filter(|name| facts.has_file(name))
            .map(|name| name.to_string())
            .chain(requirement_files(facts))
            .chain(facts.workflows.iter().map(|(rel, _)| rel.clone()))
            .collect();
        observed.sort();
        observed.dedup();

        StrategyDecision {
            ruleset: self.ruleset.clone(),
            build: decide(RuleTarget::Build),
            test: decide(RuleTarget::Test),
            package: decide(RuleTarget::Package),
            observed,
        }
    }
}
