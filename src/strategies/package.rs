//! Repository image manifest assembly and (dry-run) publication.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{StageContext, StageStrategy};
use crate::artifacts::{sha256_file, sha256_hex};
use crate::error::StrategyError;
use crate::inference::StrategyDecision;
use crate::pipeline::{Stage, StageRecord};
use crate::process::display_path;
use crate::workspace::Workspace;

pub const MANIFEST_FILE: &str = "repo_image_manifest.json";

pub fn image_name(registry: &str, repo_id: &str, commit: &str) -> String {
    format!("{}/{repo_id}:{commit}", registry.trim_end_matches('/'))
}

/// Files a completed build or test record points at.
fn referenced_files(build: Option<&StageRecord>, test: Option<&StageRecord>) -> Vec<String> {
    let mut files = Vec::new();
    if let Some(build) = build.filter(|record| !record.is_placeholder()) {
        for key in ["env_manifest_path", "log_path"] {
            if let Some(path) = build.get(key).and_then(Value::as_str) {
                files.push(path.to_string());
            }
        }
    }
    if let Some(test) = test.filter(|record| !record.is_placeholder()) {
        if let Some(path) = test.get("index_path").and_then(Value::as_str) {
            files.push(path.to_string());
        }
        if let Some(path) = test
            .get("coverage")
            .and_then(|c| c.get("report_path"))
            .and_then(Value::as_str)
        {
            files.push(path.to_string());
        }
        if let Some(logs) = test.get("logs").and_then(Value::as_array) {
            files.extend(logs.iter().filter_map(Value::as_str).map(str::to_string));
        }
    }
    files
}

pub struct ImageManifest;

#[async_trait]
impl StageStrategy for ImageManifest {
    fn name(&self) -> &'static str {
        "image-manifest"
    }

    async fn execute(
        &self,
        _workspace: &Workspace,
        decision: &StrategyDecision,
        ctx: &StageContext,
    ) -> Result<StageRecord, StrategyError> {
        let build = ctx.inputs.get(&Stage::Build);
        let test = ctx.inputs.get(&Stage::Test);
        let repo = &ctx.repo;
        let name = image_name(&ctx.image_registry, &repo.id, &repo.commit);

        let mut artifacts = Vec::new();
        for file in referenced_files(build, test) {
            let path = PathBuf::from(&file);
            match sha256_file(&path) {
                Ok(digest) => artifacts.push(json!({ "path": file, "sha256": digest })),
                Err(err) => debug!(path = %file, error = %err, "Skipping unreadable artifact file"),
            }
        }

        let runs_tests = test.is_some_and(|record| !record.is_placeholder());
        let manifest = json!({
            "repo_id": repo.id,
            "source": {
                "url": repo.url,
                "commit": repo.commit,
                "license": repo.license,
            },
            "strategies": {
                "build": build.map(StageRecord::strategy),
                "test": test.map(StageRecord::strategy),
                "ruleset": decision.ruleset,
            },
            "build": build.map(StageRecord::to_value),
            "tests": test.map(StageRecord::to_value),
            "image": { "name": name },
            "artifacts": artifacts,
            "capabilities": {
                "run_pytest": runs_tests,
                "non_network": false,
                "deterministic_seed": true,
            },
        });

        let manifest_path = ctx.write_json(MANIFEST_FILE, &manifest)?;
        let manifest_digest = sha256_file(&manifest_path).map_err(|source| StrategyError::Io {
            path: manifest_path.clone(),
            source,
        })?;

        info!(image = %name, artifacts = artifacts.len(), "Image manifest written");
        Ok(ctx
            .record()
            .with("manifest_path", json!(display_path(&manifest_path)))
            .with("manifest_digest", json!(manifest_digest))
            .with(
                "image",
                json!({
                    "name": name,
                    "content_id": format!("sha256:{}", sha256_hex(manifest.to_string().as_bytes())),
                }),
            )
            .with("artifact_count", json!(artifacts.len())))
    }
}

/// Records what would be pushed; never contacts a registry.
pub struct DryRunPublish;

#[async_trait]
impl StageStrategy for DryRunPublish {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    async fn execute(
        &self,
        _workspace: &Workspace,
        _decision: &StrategyDecision,
        ctx: &StageContext,
    ) -> Result<StageRecord, StrategyError> {
        let package = ctx.input(Stage::Package)?;
        let manifest_path = package
            .get("manifest_path")
            .and_then(Value::as_str)
            .ok_or_else(|| StrategyError::failed("Package record has no manifest_path"))?;
        let image_tag = package
            .get("image")
            .and_then(|image| image.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| image_name(&ctx.image_registry, &ctx.repo.id, &ctx.repo.commit));

        info!(image = %image_tag, "Dry-run publish; nothing pushed");
        Ok(ctx
            .record()
            .with("image_tag", json!(image_tag))
            .with("manifest_path", json!(manifest_path))
            .with("pushed", json!(false)))
    }
}
