use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum, ValueHint};
use clap_complete::Shell;
use cwm_orchestrator::catalog::{Catalog, RepoCatalog};
use cwm_orchestrator::config::{ConfigLayer, OrchestratorConfig};
use cwm_orchestrator::observability::{MetricsSnapshot, log_snapshot};
use cwm_orchestrator::pipeline::{RunResult, Stage, StageMachine};
use cwm_orchestrator::process::CommandRunner;
use cwm_orchestrator::scheduler::advance_many;
use cwm_orchestrator::schema::validate_record;
use cwm_orchestrator::workspace::{GitFetcher, WorkspaceLayout};
use serde::Serialize;
use serde_json::Value;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing(cli.log_format)?;
    let global = cli.global;

    match cli.command {
        Commands::List => {
            let config = resolve_config(&global)?;
            print_json(&load_catalog(&config)?.list())
        }
        Commands::Discover(args) => advance(&global, &args.repo_id, Stage::Discover).await,
        Commands::Plan(args) => advance(&global, &args.repo_id, Stage::Plan).await,
        Commands::Build(args) => advance(&global, &args.repo_id, Stage::Build).await,
        Commands::Test(args) => advance(&global, &args.repo_id, Stage::Test).await,
        Commands::Package(args) => advance(&global, &args.repo_id, Stage::Package).await,
        Commands::Publish(args) => advance(&global, &args.repo_id, Stage::Publish).await,
        Commands::Status(args) => {
            let (machine, _) = build_machine(&global)?;
            let state = machine
                .status(&args.repo_id)
                .with_context(|| format!("Failed to read state for '{}'", args.repo_id))?;
            print_json(&state)
        }
        Commands::Reset { repo_id, stage } => {
            let (machine, _) = build_machine(&global)?;
            let from = stage.unwrap_or(Stage::Discover);
            let state = machine
                .reset(&repo_id, from)
                .with_context(|| format!("Failed to reset '{repo_id}'"))?;
            print_json(&state)
        }
        Commands::RunAll { stage, jobs } => run_all(&global, stage, jobs).await,
        Commands::ValidateArtifact { stage, file } => validate_artifact(stage, &file),
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "cwm-orchestrator", &mut io::stdout());
            Ok(())
        }
    }
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

fn configure_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries command output, so logs go to stderr.
    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(io::stderr),
            )
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?,
    }

    Ok(())
}

fn resolve_config(global: &GlobalArgs) -> Result<OrchestratorConfig> {
    let env = ConfigLayer::from_env(|key| std::env::var(key).ok())?;
    let cli = ConfigLayer {
        workspace: global.workspace.clone(),
        catalog: global.catalog.clone(),
        stage_timeout_secs: global.stage_timeout,
        ..ConfigLayer::default()
    };
    OrchestratorConfig::resolve(global.config.as_deref(), env, cli)
}

fn load_catalog(config: &OrchestratorConfig) -> Result<RepoCatalog> {
    RepoCatalog::load(&config.catalog)
        .with_context(|| format!("Failed to load catalog: {}", config.catalog.display()))
}

fn build_machine(global: &GlobalArgs) -> Result<(StageMachine, OrchestratorConfig)> {
    let config = resolve_config(global)?;
    let catalog = load_catalog(&config)?;
    fs::create_dir_all(&config.workspace).with_context(|| {
        format!(
            "Failed to create workspace directory: {}",
            config.workspace.display()
        )
    })?;
    let settings = config.machine_settings();
    let fetcher = GitFetcher::new(CommandRunner::new(settings.command_timeout));
    let machine = StageMachine::new(
        WorkspaceLayout::new(&config.workspace),
        Arc::new(catalog),
        Arc::new(fetcher),
    )
    .with_settings(settings);
    Ok((machine, config))
}

async fn advance(global: &GlobalArgs, repo_id: &str, target: Stage) -> Result<()> {
    let (machine, _) = build_machine(global)?;
    let result = machine
        .advance(repo_id, target)
        .await
        .with_context(|| format!("Failed to advance '{repo_id}' to {target}"))?;
    print_json(&result)?;
    write_metrics(global.metrics_json.as_deref(), &machine.metrics().snapshot())?;
    finish(&result)
}

fn finish(result: &RunResult) -> Result<()> {
    if result.is_success() {
        info!(repo_id = %result.repo_id, target = %result.target, "Run succeeded");
        return Ok(());
    }
    match result.failed_stage() {
        Some(report) => {
            let message = report
                .error
                .as_ref()
                .map(|reason| reason.message.as_str())
                .unwrap_or("no reason recorded");
            error!(repo_id = %result.repo_id, stage = %report.stage, "{message}");
            bail!("Stage '{}' failed for '{}': {message}", report.stage, result.repo_id)
        }
        None => bail!(
            "Run for '{}' did not reach '{}'",
            result.repo_id,
            result.target
        ),
    }
}

async fn run_all(global: &GlobalArgs, stage: Stage, jobs: Option<usize>) -> Result<()> {
    let (machine, config) = build_machine(global)?;
    let repo_ids: Vec<String> = machine
        .catalog()
        .list()
        .into_iter()
        .map(|repo| repo.id)
        .collect();
    if repo_ids.is_empty() {
        warn!("Catalog lists no repositories. Nothing to run.");
        return print_json(&Vec::<Value>::new());
    }

    let metrics = machine.metrics();
    let entries = advance_many(
        Arc::new(machine),
        repo_ids,
        stage,
        jobs.unwrap_or(config.jobs),
    )
    .await;
    print_json(&entries)?;
    write_metrics(global.metrics_json.as_deref(), &metrics.snapshot())?;

    let failed = entries.iter().filter(|entry| !entry.is_success()).count();
    if failed > 0 {
        bail!("{failed} of {} repositories did not reach '{stage}'", entries.len());
    }
    Ok(())
}

fn validate_artifact(stage: Stage, path: &Path) -> Result<()> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read artifact: {}", path.display()))?;
    let record: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse artifact JSON: {}", path.display()))?;
    let repo_id = record
        .get("repo_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let report = validate_record(stage, &repo_id, &record);
    for warning in &report.warnings {
        warn!(file = %path.display(), "{warning}");
    }
    print_json(&report)?;

    if report.is_ok() {
        info!(file = %path.display(), stage = %stage, "Artifact validation passed");
        Ok(())
    } else {
        for violation in &report.violations {
            error!(file = %path.display(), "{violation}");
        }
        Err(anyhow!(
            "Artifact validation failed with {} violation(s)",
            report.violations.len()
        ))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    to_writer_pretty(&mut handle, value).context("Failed to write JSON output")?;
    writeln!(handle).context("Failed to write JSON output")?;
    Ok(())
}

fn write_metrics(path: Option<&Path>, snapshot: &MetricsSnapshot) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    log_snapshot(snapshot);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create metrics directory: {}", parent.display())
        })?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
    to_writer_pretty(file, snapshot)
        .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
    info!(metrics = %path.display(), "Metrics JSON written");
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "cwm-orchestrator",
    version,
    about = "Drives catalog repositories through discover, plan, build, test, package and publish"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[command(flatten)]
    global: GlobalArgs,
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(clap::Args)]
struct GlobalArgs {
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    catalog: Option<PathBuf>,
    #[arg(long, global = true, value_hint = ValueHint::DirPath)]
    workspace: Option<PathBuf>,
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    #[arg(long = "stage-timeout", global = true, value_name = "SECS")]
    stage_timeout: Option<u64>,
    #[arg(long = "metrics-json", global = true, value_hint = ValueHint::FilePath)]
    metrics_json: Option<PathBuf>,
}

#[derive(clap::Args)]
struct RepoArgs {
    #[arg(long = "repo-id")]
    repo_id: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List catalog repositories.
    List,
    Discover(RepoArgs),
    Plan(RepoArgs),
    Build(RepoArgs),
    Test(RepoArgs),
    Package(RepoArgs),
    Publish(RepoArgs),
    /// Print the pipeline state.
    Status(RepoArgs),
    /// Return a stage and every later stage to pending.
    Reset {
        #[arg(long = "repo-id")]
        repo_id: String,
        #[arg(long, value_enum)]
        stage: Option<Stage>,
    },
    /// Advance every catalog repository in parallel.
    RunAll {
        #[arg(long, value_enum, default_value_t = Stage::Publish)]
        stage: Stage,
        #[arg(long)]
        jobs: Option<usize>,
    },
    /// Check an artifact file against its stage schema.
    ValidateArtifact {
        #[arg(long, value_enum)]
        stage: Stage,
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}
