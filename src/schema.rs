//! Fixed, versioned schemas for the record each stage produces.
//!
//! Every record shares a header (`schema_version`, `repo_id`, `stage`,
//! `strategy`, `status`). Stage-specific fields are required only when the
//! record reports real work (`status: completed`); a `not_implemented`
//! placeholder carries the header plus a `message`.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::pipeline::Stage;

pub const SCHEMA_VERSION: u64 = 1;

pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_NOT_IMPLEMENTED: &str = "not_implemented";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Bool,
    Integer,
    Number,
    Array,
    Object,
    OneOf(&'static [&'static str]),
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Integer => value.is_u64() || value.is_i64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::OneOf(allowed) => value
                .as_str()
                .map(|s| allowed.contains(&s))
                .unwrap_or(false),
        }
    }

    fn describe(&self) -> String {
        match self {
            FieldKind::String => "string".into(),
            FieldKind::Bool => "boolean".into(),
            FieldKind::Integer => "integer".into(),
            FieldKind::Number => "number".into(),
            FieldKind::Array => "array".into(),
            FieldKind::Object => "object".into(),
            FieldKind::OneOf(allowed) => format!("one of [{}]", allowed.join(", ")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Always,
    WhenCompleted,
    Optional,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub path: &'static str,
    pub kind: FieldKind,
    pub presence: Presence,
}

const fn always(path: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        path,
        kind,
        presence: Presence::Always,
    }
}

const fn completed(path: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        path,
        kind,
        presence: Presence::WhenCompleted,
    }
}

const fn optional(path: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        path,
        kind,
        presence: Presence::Optional,
    }
}

#[derive(Debug)]
pub struct ArtifactSchema {
    pub name: &'static str,
    pub version: u64,
    pub stage: Stage,
    pub fields: &'static [FieldSpec],
}

impl ArtifactSchema {
    pub fn id(&self) -> String {
        format!("{}/v{}", self.name, self.version)
    }
}

const RESOLUTION_STATES: &[&str] = &["resolved", "unknown"];
const CONFIDENCE_LEVELS: &[&str] = &["high", "medium", "none"];

static HEADER: &[FieldSpec] = &[
    always("schema_version", FieldKind::Integer),
    always("repo_id", FieldKind::String),
    always("stage", FieldKind::String),
    always("strategy", FieldKind::String),
    always(
        "status",
        FieldKind::OneOf(&[STATUS_COMPLETED, STATUS_NOT_IMPLEMENTED]),
    ),
    optional("message", FieldKind::String),
];

static MANIFEST: ArtifactSchema = ArtifactSchema {
    name: "repository-manifest",
    version: SCHEMA_VERSION,
    stage: Stage::Discover,
    fields: &[
        completed("source", FieldKind::Object),
        completed("source.url", FieldKind::String),
        completed("source.commit", FieldKind::String),
        completed("source.license", FieldKind::String),
        completed("language", FieldKind::String),
        optional("default_branch", FieldKind::String),
        completed("workspace", FieldKind::Object),
        completed("workspace.path", FieldKind::String),
        completed("workspace.created", FieldKind::Bool),
        optional("workspace.revision", FieldKind::String),
        completed("toolchain", FieldKind::Object),
        completed("toolchain.pyproject", FieldKind::Bool),
        completed("toolchain.poetry", FieldKind::Bool),
        completed("toolchain.hatch", FieldKind::Bool),
        optional("toolchain.build_backend", FieldKind::String),
        completed("toolchain.requirements", FieldKind::Bool),
        completed("toolchain.environment_yml", FieldKind::Bool),
        completed("toolchain.ci_workflows", FieldKind::Array),
    ],
};

static PLAN: ArtifactSchema = ArtifactSchema {
    name: "strategy-plan",
    version: SCHEMA_VERSION,
    stage: Stage::Plan,
    fields: &[
        completed("decision", FieldKind::Object),
        completed("decision.ruleset", FieldKind::String),
        completed("decision.observed", FieldKind::Array),
        completed("decision.build", FieldKind::Object),
        completed(
            "decision.build.resolution.state",
            FieldKind::OneOf(RESOLUTION_STATES),
        ),
        completed(
            "decision.build.confidence",
            FieldKind::OneOf(CONFIDENCE_LEVELS),
        ),
        completed("decision.build.signals", FieldKind::Array),
        completed("decision.test", FieldKind::Object),
        completed(
            "decision.test.resolution.state",
            FieldKind::OneOf(RESOLUTION_STATES),
        ),
        completed(
            "decision.test.confidence",
            FieldKind::OneOf(CONFIDENCE_LEVELS),
        ),
        completed("decision.test.signals", FieldKind::Array),
        completed("decision.package", FieldKind::Object),
        completed(
            "decision.package.resolution.state",
            FieldKind::OneOf(RESOLUTION_STATES),
        ),
        completed(
            "decision.package.confidence",
            FieldKind::OneOf(CONFIDENCE_LEVELS),
        ),
        completed("decision.package.signals", FieldKind::Array),
        completed("python_version", FieldKind::String),
        completed("builder_inputs", FieldKind::Object),
        completed("builder_inputs.requires_network", FieldKind::Bool),
        completed("builder_inputs.lockfile_sources", FieldKind::Array),
        completed("tests", FieldKind::Object),
        completed("tests.runner", FieldKind::String),
        completed("tests.markers_exclude", FieldKind::Array),
        optional("tests.timeout_s", FieldKind::Integer),
    ],
};

static ENVIRONMENT: ArtifactSchema = ArtifactSchema {
    name: "environment-manifest",
    version: SCHEMA_VERSION,
    stage: Stage::Build,
    fields: &[
        completed("python_version", FieldKind::String),
        completed("packages", FieldKind::Array),
        completed("env", FieldKind::Object),
        completed("base_image", FieldKind::String),
        completed("plan_hash", FieldKind::String),
        completed("lockfiles", FieldKind::Array),
        completed("commands", FieldKind::Array),
        completed("duration_ms", FieldKind::Integer),
        completed("env_manifest_path", FieldKind::String),
        completed("log_path", FieldKind::String),
    ],
};

static TEST_INDEX: ArtifactSchema = ArtifactSchema {
    name: "test-index",
    version: SCHEMA_VERSION,
    stage: Stage::Test,
    fields: &[
        completed("runner", FieldKind::String),
        completed("tests", FieldKind::Array),
        completed("discovered", FieldKind::Integer),
        completed("selected", FieldKind::Integer),
        completed("passed", FieldKind::Integer),
        completed("failed", FieldKind::Integer),
        completed("skipped", FieldKind::Integer),
        completed("xfailed", FieldKind::Integer),
        completed("coverage", FieldKind::Object),
        completed("coverage.line_pct", FieldKind::Number),
        completed("coverage.report_path", FieldKind::String),
        optional("coverage.error", FieldKind::String),
        completed("index_path", FieldKind::String),
        completed("logs", FieldKind::Array),
    ],
};

static PACKAGE: ArtifactSchema = ArtifactSchema {
    name: "package-reference",
    version: SCHEMA_VERSION,
    stage: Stage::Package,
    fields: &[
        completed("manifest_path", FieldKind::String),
        completed("manifest_digest", FieldKind::String),
        completed("image", FieldKind::Object),
        completed("image.name", FieldKind::String),
        completed("artifact_count", FieldKind::Integer),
    ],
};

static PUBLISH: ArtifactSchema = ArtifactSchema {
    name: "publish-reference",
    version: SCHEMA_VERSION,
    stage: Stage::Publish,
    fields: &[
        completed("image_tag", FieldKind::String),
        completed("manifest_path", FieldKind::String),
        completed("pushed", FieldKind::Bool),
    ],
};

pub fn schema_for(stage: Stage) -> &'static ArtifactSchema {
    match stage {
        Stage::Discover => &MANIFEST,
        Stage::Plan => &PLAN,
        Stage::Build => &ENVIRONMENT,
        Stage::Test => &TEST_INDEX,
        Stage::Package => &PACKAGE,
        Stage::Publish => &PUBLISH,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum ViolationKind {
    Missing,
    WrongType { expected: String, found: String },
    Mismatch { expected: String, found: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    #[serde(flatten)]
    pub kind: ViolationKind,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ViolationKind::Missing => write!(f, "`{}` is missing", self.field),
            ViolationKind::WrongType { expected, found } => {
                write!(f, "`{}` must be {expected}, found {found}", self.field)
            }
            ViolationKind::Mismatch { expected, found } => {
                write!(f, "`{}` must be '{expected}', found '{found}'", self.field)
            }
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error(
    "{schema} record for stage '{stage}' has {} violation(s): {}",
    .violations.len(),
    .violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
)]
pub struct SchemaViolation {
    pub stage: Stage,
    pub schema: String,
    pub violations: Vec<FieldViolation>,
}

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub violations: Vec<FieldViolation>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.violations.extend(other.violations);
        self.warnings.extend(other.warnings);
    }

    pub fn into_result(self, stage: Stage) -> Result<(), SchemaViolation> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(SchemaViolation {
                stage,
                schema: schema_for(stage).id(),
                violations: self.violations,
            })
        }
    }
}

/// Validate `record` as the artifact of `stage` for `repo_id`.
///
/// Collects every violation instead of stopping at the first one. Fields
/// below a missing or mistyped parent are not reported separately.
pub fn validate_record(stage: Stage, repo_id: &str, record: &Value) -> ValidationReport {
    let mut report = ValidationReport::default();
    let Some(object) = record.as_object() else {
        report.violations.push(FieldViolation {
            field: "$".into(),
            kind: ViolationKind::WrongType {
                expected: "object".into(),
                found: type_name(record).into(),
            },
        });
        return report;
    };

    let schema = schema_for(stage);
    report.merge(validate_fields(HEADER, record, true));
    if !report.is_ok() {
        return report;
    }

    report.merge(validate_identity(stage, repo_id, record));

    let is_completed = object.get("status").and_then(Value::as_str) == Some(STATUS_COMPLETED);
    report.merge(validate_fields(schema.fields, record, is_completed));

    if object.get("status").and_then(Value::as_str) == Some(STATUS_NOT_IMPLEMENTED)
        && !object.contains_key("message")
    {
        report.violations.push(FieldViolation {
            field: "message".into(),
            kind: ViolationKind::Missing,
        });
    }

    let declared: BTreeSet<&str> = HEADER
        .iter()
        .chain(schema.fields.iter())
        .map(|spec| spec.path.split('.').next().unwrap_or(spec.path))
        .collect();
    for key in object.keys() {
        if !declared.contains(key.as_str()) {
            report
                .warnings
                .push(format!("undeclared field `{key}` in {}", schema.id()));
        }
    }

    report
}

fn validate_identity(stage: Stage, repo_id: &str, record: &Value) -> ValidationReport {
    let mut report = ValidationReport::default();
    let expectations = [
        ("repo_id", repo_id.to_string()),
        ("stage", stage.as_str().to_string()),
    ];
    for (field, expected) in expectations {
        let found = record.get(field).and_then(Value::as_str).unwrap_or_default();
        if found != expected {
            report.violations.push(FieldViolation {
                field: field.into(),
                kind: ViolationKind::Mismatch {
                    expected,
                    found: found.to_string(),
                },
            });
        }
    }
    if record.get("schema_version").and_then(Value::as_u64) != Some(SCHEMA_VERSION) {
        report.violations.push(FieldViolation {
            field: "schema_version".into(),
            kind: ViolationKind::Mismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: record
                    .get("schema_version")
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            },
        });
    }
    report
}

fn validate_fields(fields: &[FieldSpec], record: &Value, is_completed: bool) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut broken_prefixes: Vec<&str> = Vec::new();

    for spec in fields {
        if broken_prefixes
            .iter()
            .any(|prefix| spec.path.starts_with(prefix) && spec.path[prefix.len()..].starts_with('.'))
        {
            continue;
        }

        let required = match spec.presence {
            Presence::Always => true,
            Presence::WhenCompleted => is_completed,
            Presence::Optional => false,
        };

        match lookup(record, spec.path) {
            None | Some(Value::Null) => {
                if required {
                    report.violations.push(FieldViolation {
                        field: spec.path.into(),
                        kind: ViolationKind::Missing,
                    });
                    broken_prefixes.push(spec.path);
                }
            }
            Some(value) if !spec.kind.matches(value) => {
                let found = match (spec.kind, value.as_str()) {
                    (FieldKind::OneOf(_), Some(s)) => format!("'{s}'"),
                    _ => type_name(value).to_string(),
                };
                report.violations.push(FieldViolation {
                    field: spec.path.into(),
                    kind: ViolationKind::WrongType {
                        expected: spec.kind.describe(),
                        found,
                    },
                });
                broken_prefixes.push(spec.path);
            }
            Some(_) => {}
        }
    }

    report
}

fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |current, segment| current.as_object()?.get(segment))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
