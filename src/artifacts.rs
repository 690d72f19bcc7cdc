//! Content-addressed, schema-checked artifact storage.
//!
//! Layout: `<root>/<repo_id>/<stage>/<sha256>.json`. A record is validated
//! before anything touches disk and is written through a temporary file in
//! the destination directory, so readers never observe a partial artifact.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::ArtifactError;
use crate::pipeline::{Stage, StageRecord};
use crate::schema::{ValidationReport, schema_for, validate_record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Only the artifact referenced by the pipeline state is kept.
    #[default]
    Latest,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub stage: Stage,
    pub schema: String,
    pub digest: String,
    pub path: PathBuf,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    retention: Retention,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, retention: Retention) -> Self {
        Self {
            root: root.into(),
            retention,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    /// Directory for auxiliary files (reports, manifests) a stage writes
    /// alongside its record. Files there are stored with [`store_addressed`].
    pub fn files_dir(&self, repo_id: &str) -> PathBuf {
        self.root.join(repo_id).join("files")
    }

    pub fn validate(
        &self,
        repo_id: &str,
        stage: Stage,
        record: &StageRecord,
    ) -> Result<ValidationReport, ArtifactError> {
        let mut report = validate_record(stage, repo_id, &record.to_value());
        let warnings = std::mem::take(&mut report.warnings);
        report.into_result(stage)?;
        Ok(ValidationReport {
            violations: Vec::new(),
            warnings,
        })
    }

    /// Validate and persist `record` as the artifact of `stage`.
    ///
    /// Nothing is written when validation fails.
    pub fn write(
        &self,
        repo_id: &str,
        stage: Stage,
        record: &StageRecord,
    ) -> Result<ArtifactRef, ArtifactError> {
        let report = self.validate(repo_id, stage, record)?;
        for warning in &report.warnings {
            warn!(repo_id, stage = %stage, "{warning}");
        }

        let mut bytes = serde_json::to_vec_pretty(record).map_err(ArtifactError::Encode)?;
        bytes.push(b'\n');
        let digest = sha256_hex(&bytes);

        let dir = self.root.join(repo_id).join(stage.as_str());
        let path = dir.join(format!("{digest}.json"));
        if path.exists() {
            debug!(path = %path.display(), "Artifact content already stored");
        } else {
            write_atomic(&path, &bytes).map_err(|source| ArtifactError::Io {
                path: path.clone(),
                source,
            })?;
        }

        Ok(ArtifactRef {
            stage,
            schema: schema_for(stage).id(),
            digest,
            path,
            written_at: Utc::now(),
        })
    }

    pub fn read(&self, artifact: &ArtifactRef) -> Result<StageRecord, ArtifactError> {
        let bytes = fs::read(&artifact.path).map_err(|source| ArtifactError::Io {
            path: artifact.path.clone(),
            source,
        })?;
        if sha256_hex(&bytes) != artifact.digest {
            return Err(ArtifactError::DigestMismatch {
                path: artifact.path.clone(),
                expected: artifact.digest.clone(),
            });
        }
        serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Decode {
            path: artifact.path.clone(),
            source,
        })
    }

    /// Apply the retention policy to an artifact that `current` replaced.
    ///
    /// Returns whether a file was removed.
    pub fn release(
        &self,
        superseded: &ArtifactRef,
        current: &ArtifactRef,
    ) -> Result<bool, ArtifactError> {
        if self.retention == Retention::All || superseded.path == current.path {
            return Ok(false);
        }
        match fs::remove_file(&superseded.path) {
            Ok(()) => {
                debug!(path = %superseded.path.display(), "Removed superseded artifact");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ArtifactError::Io {
                path: superseded.path.clone(),
                source,
            }),
        }
    }
}

/// Write `bytes` to `path` via a sibling temporary file and an atomic rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Store `bytes` in `dir` as `<stem>.<sha256>.<ext>` and return the path.
///
/// Identical content lands on the same file and a stored file is never
/// rewritten, so every record referencing it keeps seeing what it hashed.
pub fn store_addressed(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    let digest = sha256_hex(bytes);
    let file_name = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}.{digest}.{ext}"),
        _ => format!("{name}.{digest}"),
    };
    let path = dir.join(file_name);
    if !path.exists() {
        write_atomic(&path, bytes)?;
    }
    Ok(path)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// SHA-256 of the file at `path` as a hex string.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
