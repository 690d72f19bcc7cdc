mod common;

use std::fs;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use common::{
    BARE_TREE, FLASK_TREE, FakeFetcher, SpyBuild, SpyMode, fake_python, fake_python_with, flask,
    machine, repo, settings_with_python,
};
use cwm_orchestrator::PipelineError;
use cwm_orchestrator::artifacts::{ArtifactStore, Retention, sha256_file};
use cwm_orchestrator::error::StateError;
use cwm_orchestrator::pipeline::{MachineSettings, RunOutcome, Stage, StageMachine, StageRecord};
use cwm_orchestrator::scheduler::advance_many;
use cwm_orchestrator::state::{FailureKind, StageStatus, StateStore, Transition};
use cwm_orchestrator::strategies::{StrategyRegistry, placeholder_record, register_defaults};
use serde_json::Value;
use tempfile::tempdir;

fn with_spy_build(machine: StageMachine, spy: SpyBuild) -> StageMachine {
    let mut registry = StrategyRegistry::new();
    register_defaults(&mut registry);
    registry.register(Stage::Build, "setuptools", Arc::new(spy));
    machine.with_strategies(registry)
}

fn artifact_json(machine: &StageMachine, repo_id: &str, stage: Stage) -> Value {
    let state = machine.status(repo_id).unwrap();
    let artifact = state.stage(stage).artifact.clone().expect("artifact recorded");
    let record: StageRecord = machine.artifacts().read(&artifact).unwrap();
    record.to_value()
}

#[tokio::test]
async fn flask_repository_reaches_publish() {
    let temp = tempdir().unwrap();
    let python = fake_python(temp.path(), false);
    let fetcher = Arc::new(FakeFetcher::new(FLASK_TREE));
    let machine = machine(&temp.path().join("ws"), vec![flask()], fetcher.clone())
        .with_settings(settings_with_python(&python));

    let result = machine.advance("pallets_flask", Stage::Publish).await.unwrap();
    assert_eq!(result.outcome, RunOutcome::Succeeded, "{result:#?}");
    assert_eq!(result.stages.len(), 6);
    assert!(
        result
            .stages
            .iter()
            .all(|report| report.status == StageStatus::Succeeded && report.attempts == 1)
    );
    assert_eq!(fetcher.calls(), 1);

    let discover = artifact_json(&machine, "pallets_flask", Stage::Discover);
    assert_eq!(discover["source"]["commit"], "3.0.0");
    assert_eq!(discover["toolchain"]["pyproject"], true);
    assert_eq!(discover["workspace"]["revision"], "0123abcd");

    let plan = artifact_json(&machine, "pallets_flask", Stage::Plan);
    assert_eq!(plan["decision"]["build"]["resolution"]["strategy"], "setuptools");
    assert_eq!(plan["decision"]["test"]["resolution"]["strategy"], "pytest");
    assert_eq!(plan["builder_inputs"]["requires_network"], true);

    let build = artifact_json(&machine, "pallets_flask", Stage::Build);
    assert_eq!(build["strategy"], "setuptools");
    assert_eq!(build["python_version"], "3.11.9");
    assert_eq!(build["packages"][0], "flask==3.0.0");

    let test = artifact_json(&machine, "pallets_flask", Stage::Test);
    assert_eq!(test["passed"], 2);
    assert_eq!(test["discovered"], 2);
    assert_eq!(test["coverage"]["line_pct"], 87.65);

    let package = artifact_json(&machine, "pallets_flask", Stage::Package);
    assert_eq!(package["image"]["name"], "ghcr.io/open-cwm/pallets_flask:3.0.0");
    assert_eq!(package["artifact_count"], 5);

    let publish = artifact_json(&machine, "pallets_flask", Stage::Publish);
    assert_eq!(publish["pushed"], false);
    assert_eq!(publish["image_tag"], "ghcr.io/open-cwm/pallets_flask:3.0.0");

    let state_file = temp.path().join("ws/state/pallets_flask/pipeline.json");
    assert!(state_file.is_file());
}

#[tokio::test]
async fn advance_skips_succeeded_stages() {
    let temp = tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new(FLASK_TREE));
    let (spy, calls) = SpyBuild::new(SpyMode::Valid);
    let machine = with_spy_build(
        machine(temp.path(), vec![flask()], fetcher.clone()),
        spy,
    );

    let first = machine.advance("pallets_flask", Stage::Build).await.unwrap();
    assert!(first.is_success());
    let state_before = machine.status("pallets_flask").unwrap();

    let second = machine.advance("pallets_flask", Stage::Build).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(machine.status("pallets_flask").unwrap(), state_before);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn failed_stage_is_retried_without_rerunning_predecessors() {
    let temp = tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new(FLASK_TREE));
    let (spy, calls) = SpyBuild::new(SpyMode::FailOnce);
    let machine = with_spy_build(
        machine(temp.path(), vec![flask()], fetcher.clone()),
        spy,
    );

    let first = machine.advance("pallets_flask", Stage::Test).await.unwrap();
    assert_eq!(first.outcome, RunOutcome::Partial);
    let failed = first.failed_stage().unwrap();
    assert_eq!(failed.stage, Stage::Build);
    let reason = failed.error.as_ref().unwrap();
    assert_eq!(reason.kind, FailureKind::Strategy);
    assert!(!reason.details.is_empty());
    assert_eq!(first.report(Stage::Test).unwrap().status, StageStatus::Pending);
    let plan_before = first.report(Stage::Plan).unwrap().clone();

    let second = machine.advance("pallets_flask", Stage::Build).await.unwrap();
    assert!(second.is_success());
    assert_eq!(second.report(Stage::Plan).unwrap(), &plan_before);
    let build = second.report(Stage::Build).unwrap();
    assert_eq!(build.attempts, 2);
    assert!(build.error.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn retry_resumes_after_restart() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("ws");
    let broken = fake_python(temp.path(), true);
    let working = fake_python(temp.path(), false);

    let fetcher = Arc::new(FakeFetcher::new(FLASK_TREE));
    let first = machine(&root, vec![flask()], fetcher.clone())
        .with_settings(settings_with_python(&broken))
        .advance("pallets_flask", Stage::Build)
        .await
        .unwrap();
    let reason = first.failed_stage().unwrap().error.clone().unwrap();
    assert_eq!(reason.kind, FailureKind::Strategy);
    assert!(reason.message.contains("pip install"));

    // A fresh machine over the same workspace stands in for a new process.
    let second = machine(&root, vec![flask()], fetcher.clone())
        .with_settings(settings_with_python(&working))
        .advance("pallets_flask", Stage::Build)
        .await
        .unwrap();
    assert!(second.is_success());
    assert_eq!(second.report(Stage::Discover).unwrap().attempts, 1);
    assert_eq!(second.report(Stage::Build).unwrap().attempts, 2);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn failed_build_is_retried_on_the_way_to_package() {
    let temp = tempdir().unwrap();
    let python = fake_python(temp.path(), false);
    let fetcher = Arc::new(FakeFetcher::new(FLASK_TREE));
    let (spy, calls) = SpyBuild::new(SpyMode::FailOnce);
    let machine = with_spy_build(
        machine(&temp.path().join("ws"), vec![flask()], fetcher.clone()),
        spy,
    )
    .with_settings(settings_with_python(&python));

    let first = machine.advance("pallets_flask", Stage::Package).await.unwrap();
    assert_eq!(first.outcome, RunOutcome::Partial);
    assert_eq!(first.failed_stage().unwrap().stage, Stage::Build);
    assert_eq!(first.report(Stage::Test).unwrap().status, StageStatus::Pending);
    assert_eq!(first.report(Stage::Package).unwrap().status, StageStatus::Pending);

    let second = machine.advance("pallets_flask", Stage::Package).await.unwrap();
    assert!(second.is_success(), "{second:#?}");
    assert_eq!(second.report(Stage::Plan).unwrap().attempts, 1);
    assert_eq!(second.report(Stage::Build).unwrap().attempts, 2);
    assert_eq!(second.report(Stage::Test).unwrap().attempts, 1);
    assert_eq!(second.report(Stage::Package).unwrap().attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn interrupted_stage_resumes_on_next_advance() {
    let temp = tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new(FLASK_TREE));
    let (spy, calls) = SpyBuild::new(SpyMode::Valid);
    let machine = with_spy_build(machine(temp.path(), vec![flask()], fetcher), spy);
    machine.advance("pallets_flask", Stage::Plan).await.unwrap();

    // A process that died mid-build leaves the stage persisted as running.
    let store = StateStore::new(temp.path().join("state"));
    store
        .transition("pallets_flask", Stage::Build, Transition::Running)
        .unwrap();
    assert_eq!(
        machine.status("pallets_flask").unwrap().status(Stage::Build),
        StageStatus::Running
    );

    let result = machine.advance("pallets_flask", Stage::Build).await.unwrap();
    assert!(result.is_success(), "{result:#?}");
    let build = result.report(Stage::Build).unwrap();
    assert_eq!(build.attempts, 2);
    assert!(build.artifact.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn catalog_test_timeout_outlasts_command_timeout() {
    let temp = tempdir().unwrap();
    let python = fake_python_with(
        temp.path(),
        "python-slow-tests",
        r#"*"coverage run"*) sleep 2; printf '..\n2 passed in 2.00s\n' ;;"#,
    );
    let mut repo = flask();
    repo.tests.timeout_s = Some(30);
    let fetcher = Arc::new(FakeFetcher::new(FLASK_TREE));
    let machine = machine(&temp.path().join("ws"), vec![repo], fetcher).with_settings(
        MachineSettings {
            command_timeout: Some(Duration::from_secs(1)),
            ..settings_with_python(&python)
        },
    );

    let result = machine.advance("pallets_flask", Stage::Test).await.unwrap();
    assert!(result.is_success(), "{result:#?}");
    let test = artifact_json(&machine, "pallets_flask", Stage::Test);
    assert_eq!(test["passed"], 2);
}

#[tokio::test]
async fn retained_artifacts_keep_their_files() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("ws");
    let fetcher = Arc::new(FakeFetcher::new(FLASK_TREE));
    let two_tests = fake_python(temp.path(), false);
    let one_test = fake_python_with(
        temp.path(),
        "python-one-test",
        r#"*"--collect-only"*) printf 'tests/test_app.py::test_index\n\n1 test collected in 0.01s\n' ;;
  *"coverage run"*) printf '.\n1 passed in 0.01s\n' ;;"#,
    );
    let keep_all = |python: &std::path::Path| MachineSettings {
        retention: Retention::All,
        ..settings_with_python(python)
    };

    let first = machine(&root, vec![flask()], fetcher.clone()).with_settings(keep_all(&two_tests));
    assert!(first.advance("pallets_flask", Stage::Package).await.unwrap().is_success());
    let state = first.status("pallets_flask").unwrap();
    let old_test = state.stage(Stage::Test).artifact.clone().unwrap();
    let old_package = state.stage(Stage::Package).artifact.clone().unwrap();
    first.reset("pallets_flask", Stage::Test).unwrap();

    let second = machine(&root, vec![flask()], fetcher).with_settings(keep_all(&one_test));
    assert!(second.advance("pallets_flask", Stage::Package).await.unwrap().is_success());
    assert_eq!(artifact_json(&second, "pallets_flask", Stage::Test)["discovered"], 1);

    let package = second.artifacts().read(&old_package).unwrap();
    let manifest_path = package.get("manifest_path").and_then(Value::as_str).unwrap();
    assert_eq!(
        sha256_file(std::path::Path::new(manifest_path)).unwrap(),
        package.get("manifest_digest").and_then(Value::as_str).unwrap()
    );
    assert_ne!(
        artifact_json(&second, "pallets_flask", Stage::Package)["manifest_path"],
        manifest_path
    );

    let test = second.artifacts().read(&old_test).unwrap();
    let index_path = test.get("index_path").and_then(Value::as_str).unwrap();
    let index: Value = serde_json::from_str(&fs::read_to_string(index_path).unwrap()).unwrap();
    assert_eq!(index["tests"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn schema_violation_persists_no_artifact() {
    let temp = tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new(FLASK_TREE));
    let (spy, _calls) = SpyBuild::new(SpyMode::Malformed);
    let machine = with_spy_build(machine(temp.path(), vec![flask()], fetcher), spy);

    let result = machine.advance("pallets_flask", Stage::Build).await.unwrap();
    let build = result.report(Stage::Build).unwrap();
    assert_eq!(build.status, StageStatus::Failed);
    assert!(build.artifact.is_none());

    let reason = build.error.as_ref().unwrap();
    assert_eq!(reason.kind, FailureKind::SchemaViolation);
    assert!(reason.details.iter().any(|d| d.contains("`python_version`")));
    assert!(reason.details.iter().any(|d| d.contains("`packages` is missing")));

    let build_dir = temp.path().join("artifacts/pallets_flask/build");
    let written = fs::read_dir(&build_dir).map(|dir| dir.count()).unwrap_or(0);
    assert_eq!(written, 0);
}

#[tokio::test]
async fn unrecognised_repository_gets_placeholders() {
    let temp = tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new(BARE_TREE));
    let machine = machine(temp.path(), vec![repo("mystery")], fetcher);

    let result = machine.advance("mystery", Stage::Publish).await.unwrap();
    assert!(result.is_success(), "{result:#?}");

    for stage in [Stage::Build, Stage::Test, Stage::Package, Stage::Publish] {
        let record = artifact_json(&machine, "mystery", stage);
        assert_eq!(record["status"], "not_implemented", "{stage}");
        assert_eq!(record["strategy"], "unknown");
        assert!(record["message"].as_str().unwrap().contains(stage.as_str()));
    }
    let snapshot = machine.metrics().snapshot();
    assert_eq!(snapshot.stages["build"].placeholders, 1);
    assert_eq!(snapshot.runs_succeeded, 1);
}

#[tokio::test]
async fn identical_trees_get_identical_plans() {
    let temp = tempdir().unwrap();
    let repos = vec![repo("left"), repo("right")];
    let fetcher = Arc::new(FakeFetcher::new(FLASK_TREE));
    let machine = machine(temp.path(), repos, fetcher);

    machine.advance("left", Stage::Plan).await.unwrap();
    machine.advance("right", Stage::Plan).await.unwrap();

    let left = artifact_json(&machine, "left", Stage::Plan);
    let right = artifact_json(&machine, "right", Stage::Plan);
    assert_eq!(left["decision"], right["decision"]);
    assert_eq!(left["builder_inputs"], right["builder_inputs"]);
}

#[tokio::test]
async fn unknown_repository_is_not_found() {
    let temp = tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new(BARE_TREE));
    let machine = machine(temp.path(), vec![repo("known")], fetcher.clone());

    let err = machine.advance("ghost", Stage::Plan).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(ref id) if id == "ghost"));
    assert!(matches!(
        machine.status("ghost"),
        Err(PipelineError::NotFound(_))
    ));
    assert_eq!(fetcher.calls(), 0);
    assert!(!temp.path().join("state/ghost").exists());
}

#[tokio::test]
async fn fetch_failure_is_recorded_on_discover() {
    let temp = tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new(BARE_TREE).unreachable_for("offline"));
    let machine = machine(temp.path(), vec![repo("offline")], fetcher);

    let result = machine.advance("offline", Stage::Build).await.unwrap();
    assert_eq!(result.outcome, RunOutcome::Failed);
    let discover = result.report(Stage::Discover).unwrap();
    assert_eq!(discover.status, StageStatus::Failed);
    assert_eq!(discover.error.as_ref().unwrap().kind, FailureKind::Fetch);
    assert_eq!(result.report(Stage::Plan).unwrap().status, StageStatus::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_advance_is_busy() {
    let temp = tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new(FLASK_TREE));
    let (spy, calls) = SpyBuild::new(SpyMode::Sleep(Duration::from_millis(800)));
    let machine = Arc::new(with_spy_build(
        machine(temp.path(), vec![flask()], fetcher),
        spy,
    ));

    let background = {
        let machine = Arc::clone(&machine);
        tokio::spawn(async move { machine.advance("pallets_flask", Stage::Build).await })
    };
    while calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = machine
        .advance("pallets_flask", Stage::Build)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Busy(_)));
    assert!(err.is_retryable());

    let first = background.await.unwrap().unwrap();
    assert!(first.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_stage_times_out() {
    let temp = tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new(FLASK_TREE));
    let (spy, _calls) = SpyBuild::new(SpyMode::Sleep(Duration::from_secs(30)));
    let machine = with_spy_build(machine(temp.path(), vec![flask()], fetcher), spy)
        .with_settings(MachineSettings {
            stage_timeout: Some(Duration::from_millis(200)),
            ..MachineSettings::default()
        });

    let started = Instant::now();
    let result = machine.advance("pallets_flask", Stage::Build).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    let build = result.report(Stage::Build).unwrap();
    assert_eq!(build.status, StageStatus::Failed);
    assert_eq!(build.error.as_ref().unwrap().kind, FailureKind::Timeout);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn timed_out_build_leaves_no_install_helpers() {
    let temp = tempdir().unwrap();
    let pidfile = temp.path().join("helper.pid");
    let python = fake_python_with(
        temp.path(),
        "python-hanging-install",
        &format!(r#"*"pip install"*) sleep 30 & echo $! > '{}'; wait ;;"#, pidfile.display()),
    );
    let fetcher = Arc::new(FakeFetcher::new(FLASK_TREE));
    let machine = machine(&temp.path().join("ws"), vec![flask()], fetcher).with_settings(
        MachineSettings {
            stage_timeout: Some(Duration::from_millis(700)),
            ..settings_with_python(&python)
        },
    );

    let result = machine.advance("pallets_flask", Stage::Build).await.unwrap();
    let build = result.report(Stage::Build).unwrap();
    assert_eq!(build.status, StageStatus::Failed);
    assert_eq!(build.error.as_ref().unwrap().kind, FailureKind::Timeout);

    let pid = fs::read_to_string(&pidfile).unwrap().trim().to_string();
    let deadline = Instant::now() + Duration::from_secs(5);
    while common::is_alive(&pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!common::is_alive(&pid), "install helper {pid} outlived the stage");
}

#[tokio::test]
async fn reset_reruns_later_stages() {
    let temp = tempdir().unwrap();
    let fetcher = Arc::new(FakeFetcher::new(FLASK_TREE));
    let (spy, calls) = SpyBuild::new(SpyMode::Valid);
    let machine = with_spy_build(machine(temp.path(), vec![flask()], fetcher), spy);

    machine.advance("pallets_flask", Stage::Build).await.unwrap();
    let state = machine.reset("pallets_flask", Stage::Build).unwrap();
    assert_eq!(state.status(Stage::Plan), StageStatus::Succeeded);
    assert_eq!(state.status(Stage::Build), StageStatus::Pending);
    assert!(state.stage(Stage::Build).artifact.is_none());

    let again = machine.advance("pallets_flask", Stage::Build).await.unwrap();
    assert!(again.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn batch_failures_stay_isolated() {
    let temp = tempdir().unwrap();
    let repos = vec![repo("alpha"), repo("offline"), repo("gamma")];
    let fetcher = Arc::new(FakeFetcher::new(BARE_TREE).unreachable_for("offline"));
    let machine = Arc::new(machine(temp.path(), repos, fetcher));

    let ids = vec![
        "alpha".to_string(),
        "offline".to_string(),
        "gamma".to_string(),
        "ghost".to_string(),
    ];
    let entries = advance_many(Arc::clone(&machine), ids, Stage::Publish, 2).await;

    let ids: Vec<&str> = entries.iter().map(|e| e.repo_id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "offline", "gamma", "ghost"]);
    assert!(entries[0].is_success());
    assert!(!entries[1].is_success());
    assert_eq!(
        entries[1].result.as_ref().unwrap().outcome,
        RunOutcome::Failed
    );
    assert!(entries[2].is_success());
    assert!(entries[3].error.as_deref().unwrap().contains("ghost"));

    assert_eq!(
        machine.status("alpha").unwrap().status(Stage::Publish),
        StageStatus::Succeeded
    );
}

#[test]
fn succeeded_requires_succeeded_predecessors() {
    let temp = tempdir().unwrap();
    let store = StateStore::new(temp.path().join("state"));
    let artifacts = ArtifactStore::new(temp.path().join("artifacts"), Retention::Latest);
    let record = placeholder_record("demo", Stage::Build, "no build strategy detected");
    let artifact = artifacts.write("demo", Stage::Build, &record).unwrap();

    let err = store
        .transition("demo", Stage::Build, Transition::Succeeded(artifact))
        .unwrap_err();
    assert!(matches!(
        err,
        StateError::OutOfOrderTransition {
            predecessor: Stage::Discover,
            ..
        }
    ));
    assert_eq!(
        store.get_state("demo").unwrap().status(Stage::Build),
        StageStatus::Pending
    );
}
