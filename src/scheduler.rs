//! Runs `advance` for many repositories concurrently.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::pipeline::{RunResult, Stage, StageMachine};

/// Result of one repository in a batch. `error` carries caller-level
/// failures such as `Busy` or `NotFound`; stage failures live in `result`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub repo_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchEntry {
    pub fn is_success(&self) -> bool {
        self.result.as_ref().is_some_and(RunResult::is_success)
    }
}

/// Advance every repository in `repo_ids` to `target`, at most `jobs` at a
/// time. Entries come back in input order.
pub async fn advance_many(
    machine: Arc<StageMachine>,
    repo_ids: Vec<String>,
    target: Stage,
    jobs: usize,
) -> Vec<BatchEntry> {
    let semaphore = Arc::new(Semaphore::new(jobs.max(1)));
    let mut join_set = JoinSet::new();

    for (idx, repo_id) in repo_ids.iter().cloned().enumerate() {
        let machine = Arc::clone(&machine);
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let entry = match semaphore.acquire_owned().await {
                Ok(_permit) => match machine.advance(&repo_id, target).await {
                    Ok(result) => BatchEntry {
                        repo_id,
                        result: Some(result),
                        error: None,
                    },
                    Err(err) => {
                        warn!(repo_id = %repo_id, error = %err, "Advance rejected");
                        BatchEntry {
                            repo_id,
                            result: None,
                            error: Some(err.to_string()),
                        }
                    }
                },
                Err(err) => BatchEntry {
                    repo_id,
                    result: None,
                    error: Some(format!("scheduler closed: {err}")),
                },
            };
            (idx, entry)
        });
    }

    let mut slots: Vec<Option<BatchEntry>> = vec![None; repo_ids.len()];
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((idx, entry)) => slots[idx] = Some(entry),
            Err(err) => warn!(error = %err, "Advance task aborted"),
        }
    }

    let entries: Vec<BatchEntry> = slots
        .into_iter()
        .zip(repo_ids)
        .map(|(slot, repo_id)| {
            slot.unwrap_or_else(|| BatchEntry {
                repo_id,
                result: None,
                error: Some("advance task aborted".to_string()),
            })
        })
        .collect();

    let succeeded = entries.iter().filter(|entry| entry.is_success()).count();
    info!(
        target_stage = %target,
        total = entries.len(),
        succeeded,
        "Batch advance finished"
    );
    entries
}
