use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::pipeline::RunOutcome;

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub runs_succeeded: u64,
    pub runs_partial: u64,
    pub runs_failed: u64,
}

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct StageMetrics {
    pub calls: u64,
    pub failures: u64,
    pub placeholders: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// In-process counters for stage executions; cheap to clone and share.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_failure(&self, stage_name: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.stages.entry(stage_name.to_string()).or_default().failures += 1;
        }
    }

    pub fn record_placeholder(&self, stage_name: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard
                .stages
                .entry(stage_name.to_string())
                .or_default()
                .placeholders += 1;
        }
    }

    pub fn record_run(&self, outcome: RunOutcome) {
        if let Ok(mut guard) = self.inner.lock() {
            match outcome {
                RunOutcome::Succeeded => guard.runs_succeeded += 1,
                RunOutcome::Partial => guard.runs_partial += 1,
                RunOutcome::Failed => guard.runs_failed += 1,
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(stage = self.stage.as_str(), duration_ms, "Stage duration recorded");
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        runs_succeeded = snapshot.runs_succeeded,
        runs_partial = snapshot.runs_partial,
        runs_failed = snapshot.runs_failed,
        stage_count = snapshot.stages.len(),
        "Orchestrator metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            placeholders = metrics.placeholders,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP cwm_runs_total Advance calls by outcome\n");
        output.push_str("# TYPE cwm_runs_total counter\n");
        for (outcome, count) in [
            ("succeeded", self.runs_succeeded),
            ("partial", self.runs_partial),
            ("failed", self.runs_failed),
        ] {
            output.push_str(&format!(
                "cwm_runs_total{{outcome=\"{outcome}\"}} {count}\n"
            ));
        }
        output.push_str("# HELP cwm_stage_calls_total Stage execution count\n");
        output.push_str("# TYPE cwm_stage_calls_total counter\n");
        output.push_str("# HELP cwm_stage_failures_total Stage executions that failed\n");
        output.push_str("# TYPE cwm_stage_failures_total counter\n");
        output.push_str(
            "# HELP cwm_stage_placeholders_total Stage executions without a detected strategy\n",
        );
        output.push_str("# TYPE cwm_stage_placeholders_total counter\n");
        output.push_str(
            "# HELP cwm_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE cwm_stage_duration_seconds_total counter\n");
        output.push_str("# HELP cwm_stage_duration_seconds_max Maximum stage duration in seconds\n");
        output.push_str("# TYPE cwm_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "cwm_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, metrics.calls
            ));
            output.push_str(&format!(
                "cwm_stage_failures_total{{stage=\"{}\"}} {}\n",
                stage, metrics.failures
            ));
            output.push_str(&format!(
                "cwm_stage_placeholders_total{{stage=\"{}\"}} {}\n",
                stage, metrics.placeholders
            ));
            output.push_str(&format!(
                "cwm_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "cwm_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_records_on_drop() {
        let metrics = MetricsCollector::new();
        {
            let _timer = metrics.start_stage("build");
        }
        metrics.record_failure("build");
        metrics.record_run(RunOutcome::Partial);

        let snapshot = metrics.snapshot();
        let build = &snapshot.stages["build"];
        assert_eq!(build.calls, 1);
        assert_eq!(build.failures, 1);
        assert_eq!(snapshot.runs_partial, 1);

        let text = snapshot.to_prometheus();
        assert!(text.contains("cwm_stage_calls_total{stage=\"build\"} 1"));
        assert!(text.contains("cwm_runs_total{outcome=\"partial\"} 1"));

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
