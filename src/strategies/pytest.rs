//! Test execution with pytest under coverage.

use std::collections::BTreeMap;
use std::fs;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::{StageContext, StageStrategy, tail_lines};
use crate::error::StrategyError;
use crate::inference::StrategyDecision;
use crate::pipeline::StageRecord;
use crate::process::{CommandOutput, display_path};
use crate::workspace::Workspace;

static SUMMARY_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+ [A-Za-z_-]+(?:, \d+ [A-Za-z_-]+)* in .+$").expect("valid summary regex")
});
static SUMMARY_CHUNK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+) ([A-Za-z_-]+)").expect("valid chunk regex"));
static LINE_RATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<coverage\b[^>]*\bline-rate="([0-9.eE+-]+)""#).expect("valid coverage regex")
});

/// Outcome counts from the pytest terminal summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SummaryCounts {
    pub passed: u64,
    pub failed: u64,
    pub errors: u64,
    pub skipped: u64,
    pub xfailed: u64,
    pub xpassed: u64,
    pub rerun: u64,
    pub deselected: u64,
    pub warnings: u64,
}

impl SummaryCounts {
    /// Tests that actually ran to an outcome.
    pub fn selected(&self) -> u64 {
        self.passed + self.failed + self.errors + self.skipped + self.xfailed + self.xpassed
            + self.rerun
    }

    fn add(&mut self, label: &str, value: u64) {
        let slot = match label {
            "passed" | "passes" => &mut self.passed,
            "failed" | "failures" => &mut self.failed,
            "error" | "errors" => &mut self.errors,
            "skipped" => &mut self.skipped,
            "xfailed" => &mut self.xfailed,
            "xpassed" => &mut self.xpassed,
            "rerun" | "reruns" => &mut self.rerun,
            "deselected" => &mut self.deselected,
            "warning" | "warnings" => &mut self.warnings,
            _ => return,
        };
        *slot += value;
    }
}

/// Parse the last summary line in `output`, either the decorated
/// `=== 3 passed in 0.1s ===` form or the bare `-q` form.
pub fn parse_summary(output: &str) -> SummaryCounts {
    let mut counts = SummaryCounts::default();
    let summary = output.lines().rev().map(str::trim).find_map(|line| {
        if line.is_empty() {
            None
        } else if line.starts_with("===") && line.contains(" in ") {
            Some(line.trim_matches(|c| c == '=' || c == ' '))
        } else if SUMMARY_LINE.is_match(line) {
            Some(line)
        } else {
            None
        }
    });
    let Some(summary) = summary else {
        return counts;
    };

    let stats = summary.split(" in ").next().unwrap_or_default();
    for chunk in stats.split(',') {
        if let Some(caps) = SUMMARY_CHUNK.captures(chunk.trim())
            && let Ok(value) = caps[1].parse::<u64>()
        {
            counts.add(&caps[2].to_lowercase(), value);
        }
    }
    counts
}

/// `not a and not b` for the excluded markers, or an empty string.
pub fn marker_expression(markers: &[String]) -> String {
    markers
        .iter()
        .filter(|marker| !marker.is_empty())
        .map(|marker| format!("not {marker}"))
        .collect::<Vec<_>>()
        .join(" and ")
}

/// Root `line-rate` of a Cobertura XML report as a percentage with two
/// decimals.
pub fn coverage_percent(xml: &str) -> Option<f64> {
    let rate: f64 = LINE_RATE.captures(xml)?[1].parse().ok()?;
    Some((rate * 100.0 * 100.0).round() / 100.0)
}

fn collected_node_ids(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.contains("::"))
        .map(str::to_string)
        .collect()
}

#[derive(Serialize)]
struct LogEvent<'a> {
    event: &'a str,
    #[serde(flatten)]
    output: &'a CommandOutput,
}

pub struct PytestRunner;

#[async_trait]
impl StageStrategy for PytestRunner {
    fn name(&self) -> &'static str {
        "pytest"
    }

    async fn execute(
        &self,
        workspace: &Workspace,
        _decision: &StrategyDecision,
        ctx: &StageContext,
    ) -> Result<StageRecord, StrategyError> {
        let repo_dir = workspace.path.as_path();
        let markers = marker_expression(&ctx.repo.tests.markers_exclude);
        let marker_args: Vec<&str> = if markers.is_empty() {
            Vec::new()
        } else {
            vec!["-m", markers.as_str()]
        };

        let mut collect_args = vec!["--collect-only", "-q"];
        collect_args.extend(&marker_args);
        let collect = ctx
            .runner
            .run(&ctx.python_module("pytest", &collect_args), Some(repo_dir))
            .await?;
        let node_ids = collected_node_ids(&collect.stdout);

        ctx.ensure_dir(&ctx.files_dir)?;
        // coverage writes to a scratch file; the report is stored by content
        // once the run is over.
        let scratch = tempfile::Builder::new()
            .prefix("coverage-")
            .suffix(".xml")
            .tempfile_in(&ctx.files_dir)
            .map_err(|source| StrategyError::Io {
                path: ctx.files_dir.clone(),
                source,
            })?
            .into_temp_path();
        let scratch_str = scratch.to_string_lossy().to_string();

        ctx.runner
            .run(&ctx.python_module("coverage", &["erase"]), Some(repo_dir))
            .await?;
        let mut run_args = vec![
            "run",
            "-m",
            "pytest",
            "-q",
            "--maxfail",
            "1",
            "--durations",
            "30",
        ];
        run_args.extend(&marker_args);
        let run = ctx
            .runner
            .run(&ctx.python_module("coverage", &run_args), Some(repo_dir))
            .await?;
        let report = ctx
            .runner
            .run(
                &ctx.python_module("coverage", &["xml", "-o", scratch_str.as_str()]),
                Some(repo_dir),
            )
            .await?;

        let log_path = ctx.write_log(
            "test.log.jsonl",
            &[
                LogEvent {
                    event: "collect",
                    output: &collect,
                },
                LogEvent {
                    event: "run",
                    output: &run,
                },
            ],
        )?;

        if !collect.success() {
            let mut details = tail_lines(&collect.stdout, 10);
            details.extend(tail_lines(&collect.stderr, 10));
            return Err(StrategyError::Failed {
                message: format!("Pytest collection failed with exit code {}", collect.returncode),
                details,
            });
        }

        let index_path = ctx.write_json(
            "test_index.json",
            &json!({
                "repo_id": ctx.repo.id,
                "tests": node_ids
                    .iter()
                    .map(|id| json!({ "nodeid": id, "markers": [] }))
                    .collect::<Vec<_>>(),
            }),
        )?;

        let counts = parse_summary(&format!("{}\n{}", run.stdout, run.stderr));
        if !run.success() {
            let mut details = vec![format!(
                "passed={} failed={} errors={} skipped={}",
                counts.passed, counts.failed, counts.errors, counts.skipped
            )];
            details.extend(tail_lines(&run.stdout, 20));
            return Err(StrategyError::Failed {
                message: format!("Test run failed with exit code {}", run.returncode),
                details,
            });
        }

        let xml = fs::read(&scratch).unwrap_or_default();
        let coverage_path = ctx.store_file("coverage.xml", &xml)?;
        let mut coverage = BTreeMap::new();
        coverage.insert("report_path", json!(display_path(&coverage_path)));
        let line_pct = if report.success() {
            coverage_percent(&String::from_utf8_lossy(&xml)).unwrap_or(0.0)
        } else {
            let message = report.stderr.trim().to_string();
            warn!(error = %message, "Coverage report unavailable");
            coverage.insert("error", json!(message));
            0.0
        };
        coverage.insert("line_pct", json!(line_pct));

        info!(
            discovered = node_ids.len(),
            passed = counts.passed,
            failed = counts.failed + counts.errors,
            line_pct,
            "Tests finished"
        );
        Ok(ctx
            .record()
            .with("runner", json!(ctx.repo.tests.runner))
            .with("tests", json!(node_ids))
            .with("discovered", json!(node_ids.len()))
            .with("selected", json!(counts.selected()))
            .with("passed", json!(counts.passed))
            .with("failed", json!(counts.failed + counts.errors))
            .with("skipped", json!(counts.skipped))
            .with("xfailed", json!(counts.xfailed))
            .with("coverage", json!(coverage))
            .with("index_path", json!(display_path(&index_path)))
            .with("logs", json!([display_path(&log_path)])))
    }
}
