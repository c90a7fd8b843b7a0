// tests/runtime_fake_work.rs

use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use parmerge::config::Plan;
use parmerge::engine::{OutputWorker, RunSummary, RuntimeConfig};
use parmerge::errors::ParmergeError;
use parmerge::run_plan;
use parmerge::types::{Action, Phase};
use parmerge_test_utils::builders::{PlanBuilder, TargetBuilder};
use parmerge_test_utils::fake_work::{FakeEvent, FakeWork};
use parmerge_test_utils::{init_tracing, with_timeout, SharedBuffer};

type TestResult = Result<(), Box<dyn Error>>;

struct Outcome {
    result: parmerge::errors::Result<RunSummary>,
    output: String,
}

async fn run_with(plan: &Plan, work: &FakeWork, log_dir: &Path, config: RuntimeConfig) -> Outcome {
    let out = SharedBuffer::new();
    let config = RuntimeConfig {
        tick: Duration::from_millis(50),
        log_dir: Some(log_dir.to_path_buf()),
        ..config
    };

    let result = with_timeout(run_plan(
        plan,
        Arc::new(work.clone()),
        OutputWorker::spawn(Box::new(out.clone())),
        CancellationToken::new(),
        config,
    ))
    .await;

    Outcome {
        result,
        output: out.text(),
    }
}

fn finished(target: &str, phase: Phase, retcode: i32) -> FakeEvent {
    FakeEvent::Finished {
        target: target.to_string(),
        phase,
        retcode,
    }
}

fn started(target: &str, phase: Phase) -> FakeEvent {
    FakeEvent::Started {
        target: target.to_string(),
        phase,
    }
}

#[tokio::test]
async fn dependents_build_after_their_dependency_in_parallel() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let plan = PlanBuilder::new()
        .with_target("a", TargetBuilder::new())
        .with_target("b", TargetBuilder::new().after("a"))
        .with_target("c", TargetBuilder::new().after("a"))
        .build();
    let work = FakeWork::new().with_delay(Duration::from_millis(50));

    let outcome = run_with(&plan, &work, dir.path(), RuntimeConfig::default()).await;
    let summary = outcome.result?;

    assert!(summary.is_success());
    assert_eq!(summary.completed, 3);

    let a_done = work.position(&finished("a", Phase::Build, 0)).unwrap();
    for dependent in ["b", "c"] {
        let start = work.position(&started(dependent, Phase::Build)).unwrap();
        assert!(a_done < start, "{dependent} built before a finished");
    }
    assert_eq!(work.max_concurrent(Phase::Build), 2);

    assert!(outcome.output.contains("Completed a"));
    assert!(outcome.output.contains("Completed 3/3 task(s)"));

    // Successful logs are removed.
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn build_succeeds_on_the_last_allowed_attempt() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let plan = PlanBuilder::new()
        .with_target("x", TargetBuilder::new())
        .with_settings(|s| s.max_retries = 2)
        .build();
    let work = FakeWork::new().fail("x", Phase::Build, 2);

    let summary = run_with(&plan, &work, dir.path(), RuntimeConfig::default())
        .await
        .result?;

    assert!(summary.is_success());
    assert_eq!(summary.completed, 1);
    assert_eq!(work.started(Phase::Build), vec!["x", "x", "x"]);
    assert_eq!(work.started(Phase::Fetch), vec!["x"]);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_end_the_run_with_a_failure_report() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let failure_file = dir.path().join("failures.json");
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs)?;

    let plan = PlanBuilder::new()
        .with_target("y", TargetBuilder::new())
        .with_target("z", TargetBuilder::new().after("y"))
        .with_settings(|s| s.max_retries = 1)
        .build();
    let work = FakeWork::new().fail("y", Phase::Build, 10);

    let config = RuntimeConfig {
        failure_file: Some(failure_file.clone()),
        ..RuntimeConfig::default()
    };
    let outcome = run_with(&plan, &work, &logs, config).await;
    let summary = outcome.result?;

    assert!(!summary.is_success());
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].target, "y");
    assert_eq!(summary.failed[0].attempts, 2);
    assert!(summary.failed[0].log.exists(), "failed log is kept");
    assert_eq!(work.started(Phase::Build), vec!["y", "y"]);

    let report: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&failure_file)?)?;
    assert_eq!(report.as_array().map(Vec::len), Some(1));
    assert_eq!(report[0]["target"], "y");

    // Only the failing attempts' logs survive.
    for entry in std::fs::read_dir(&logs)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        assert!(name.starts_with("build-y"), "unexpected leftover log {name}");
    }
    assert!(outcome.output.contains("fake build of y"));
    Ok(())
}

#[tokio::test]
async fn build_pool_size_bounds_concurrency() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let mut builder = PlanBuilder::new().with_settings(|s| {
        s.build_jobs = 2;
        s.fetch_jobs = 3;
    });
    for i in 0..6 {
        builder = builder.with_target(&format!("t{i}"), TargetBuilder::new());
    }
    let plan = builder.build();
    let work = FakeWork::new().with_delay(Duration::from_millis(20));

    let summary = run_with(&plan, &work, dir.path(), RuntimeConfig::default())
        .await
        .result?;

    assert_eq!(summary.completed, 6);
    assert!(work.max_concurrent(Phase::Build) <= 2);
    assert!(work.max_concurrent(Phase::Fetch) <= 3);
    Ok(())
}

#[tokio::test]
async fn nomerge_targets_run_no_jobs_but_release_dependents() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let plan = PlanBuilder::new()
        .with_target("base", TargetBuilder::new())
        .with_target("meta", TargetBuilder::new().action(Action::Nomerge).after("base"))
        .with_target("app", TargetBuilder::new().after("meta"))
        .build();
    let work = FakeWork::new();

    let summary = run_with(&plan, &work, dir.path(), RuntimeConfig::default())
        .await
        .result?;

    assert_eq!(summary.completed, 3);
    assert!(!work.started(Phase::Fetch).contains(&"meta".to_string()));
    assert!(!work.started(Phase::Build).contains(&"meta".to_string()));
    assert_eq!(work.started(Phase::Build), vec!["base", "app"]);
    Ok(())
}

#[tokio::test]
async fn event_log_has_a_start_and_finish_line_per_job() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let events = dir.path().join("events.jsonl");
    let logs = dir.path().join("logs");
    std::fs::create_dir(&logs)?;

    let plan = PlanBuilder::new()
        .with_target("a", TargetBuilder::new())
        .build();
    let config = RuntimeConfig {
        event_log: Some(events.clone()),
        ..RuntimeConfig::default()
    };
    run_with(&plan, &FakeWork::new(), &logs, config).await.result?;

    let lines: Vec<serde_json::Value> = std::fs::read_to_string(&events)?
        .lines()
        .map(serde_json::from_str::<serde_json::Value>)
        .collect::<Result<_, _>>()?;
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0]["phase"], "fetch");
    assert_eq!(lines[0]["done"], false);
    assert_eq!(lines[3]["phase"], "build");
    assert_eq!(lines[3]["retcode"], 0);
    Ok(())
}

#[tokio::test]
async fn cancellation_stops_hanging_jobs() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let plan = PlanBuilder::new()
        .with_target("slow", TargetBuilder::new())
        .build();
    let work = FakeWork::new().hang("slow", Phase::Build);
    let out = SharedBuffer::new();
    let cancel = CancellationToken::new();

    let run = tokio::spawn({
        let work = work.clone();
        let out = out.clone();
        let cancel = cancel.clone();
        let config = RuntimeConfig {
            tick: Duration::from_millis(20),
            log_dir: Some(dir.path().to_path_buf()),
            ..RuntimeConfig::default()
        };
        async move {
            run_plan(
                &plan,
                Arc::new(work),
                OutputWorker::spawn(Box::new(out)),
                cancel,
                config,
            )
            .await
        }
    });

    with_timeout(async {
        while work.started(Phase::Build).is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    cancel.cancel();

    let result = with_timeout(run).await?;
    assert!(matches!(result, Err(ParmergeError::Cancelled)));
    assert!(out.text().contains("fake build of slow"));
    assert!(out.text().contains("Exiting on signal"));
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn targets_outside_the_install_set_are_never_run() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let plan = PlanBuilder::new()
        .with_target("lib", TargetBuilder::new())
        .with_target("mid", TargetBuilder::new().after("lib"))
        .with_target("app", TargetBuilder::new().after("mid"))
        .with_install(&["lib", "app"])
        .build();
    let work = FakeWork::new();

    let summary = run_with(&plan, &work, dir.path(), RuntimeConfig::default())
        .await
        .result?;

    assert!(summary.is_success());
    assert_eq!(summary.total, 2);
    assert!(!work.started(Phase::Fetch).contains(&"mid".to_string()));
    // The ordering "mid" imposed survives the splice.
    assert_eq!(work.started(Phase::Build), vec!["lib", "app"]);
    Ok(())
}

#[tokio::test]
async fn prebuilt_target_without_hooks_installs_before_its_dependency() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let plan = PlanBuilder::new()
        .with_target("lib", TargetBuilder::new())
        .with_target("tool", TargetBuilder::new().prebuilt_without_hooks().dep("lib", &["runtime"]))
        .with_settings(|s| s.max_retries = 0)
        .build();
    let work = FakeWork::new().fail("lib", Phase::Build, 1);

    let summary = run_with(&plan, &work, dir.path(), RuntimeConfig::default())
        .await
        .result?;

    assert!(work.started(Phase::Build).contains(&"tool".to_string()));
    assert!(work.position(&finished("tool", Phase::Build, 0)).is_some());
    // "tool" still waits for "lib" before it counts as done.
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].target, "lib");
    assert_eq!(summary.completed, 0);
    Ok(())
}
