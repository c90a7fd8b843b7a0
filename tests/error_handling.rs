// tests/error_handling.rs

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::Parser;

use parmerge::cli::CliArgs;
use parmerge::config::{load_and_validate, load_from_path, Plan};
use parmerge::errors::ParmergeError;
use parmerge::types::{Action, DepType};
use parmerge_test_utils::builders::{PlanBuilder, TargetBuilder};
use parmerge_test_utils::init_tracing;

type TestResult = Result<(), Box<dyn Error>>;

fn write_plan(dir: &Path, name: &str, contents: &str) -> std::io::Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, contents)?;
    Ok(path)
}

#[test]
fn unknown_dependency_tag_is_rejected_with_the_edge() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = write_plan(
        dir.path(),
        "plan.toml",
        r#"
[target."dev-libs/a"]
idx = 0

[target."app/b"]
idx = 1
deps = { "dev-libs/a" = { types = ["buildtime", "whenever"] } }
"#,
    )?;

    match load_and_validate(&path) {
        Err(ParmergeError::UnknownDepType { tail, head, tag }) => {
            assert_eq!(tail, "app/b");
            assert_eq!(head, "dev-libs/a");
            assert_eq!(tag, "whenever");
        }
        other => panic!("expected UnknownDepType, got {other:?}"),
    }
    Ok(())
}

#[test]
fn dependency_on_unknown_target_is_a_config_error() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = write_plan(
        dir.path(),
        "plan.toml",
        r#"
[target.a]
deps = { ghost = { types = ["runtime"] } }
"#,
    )?;

    let err = load_and_validate(&path).unwrap_err();
    assert!(matches!(err, ParmergeError::ConfigError(_)));
    assert!(err.to_string().contains("ghost"));
    Ok(())
}

#[test]
fn install_set_naming_an_unknown_target_is_rejected() {
    let raw = PlanBuilder::new()
        .with_target("a", TargetBuilder::new())
        .with_install(&["a", "ghost"])
        .raw();

    let err = Plan::try_from(raw).unwrap_err();
    assert!(matches!(err, ParmergeError::ConfigError(_)));
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn malformed_toml_is_reported() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = write_plan(dir.path(), "plan.toml", "[target.a\nidx = ")?;

    let err = load_from_path(&path).unwrap_err();
    assert!(matches!(err, ParmergeError::TomlError(_)));
    Ok(())
}

#[test]
fn missing_plan_file_is_an_io_error() {
    let err = load_from_path("/definitely/not/here/plan.toml").unwrap_err();
    assert!(matches!(err, ParmergeError::IoError(_)));
}

#[test]
fn json_plans_are_accepted() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = write_plan(
        dir.path(),
        "plan.json",
        r#"{
  "install": ["app"],
  "settings": { "build_jobs": 2, "max_retries": 0 },
  "target": {
    "lib": { "idx": 0, "prebuilt": true, "defines_install_hooks": false },
    "app": { "idx": 1, "action": "merge", "deps": { "lib": { "types": ["runtime", "runtime-slot"] } } }
  }
}"#,
    )?;

    let plan = load_and_validate(&path)?;
    assert_eq!(plan.settings.build_jobs, 2);
    assert_eq!(plan.install.len(), 1);
    assert!(plan.targets["lib"].nodeps());
    assert_eq!(plan.targets["app"].action, Action::Merge);
    assert_eq!(
        plan.targets["app"].deps["lib"],
        vec![DepType::Runtime, DepType::RuntimeSlot]
    );
    Ok(())
}

#[tokio::test]
async fn dry_run_prepares_the_graph_without_running_anything() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = write_plan(
        dir.path(),
        "plan.toml",
        r#"
[target.a]
idx = 0
deps = { b = { types = ["blocker"] } }

[target.b]
idx = 1
deps = { a = { types = ["runtime"] } }
"#,
    )?;

    let args = CliArgs::parse_from([
        "parmerge",
        "--plan",
        path.to_str().ok_or("non-utf8 temp path")?,
        "--dry-run",
    ]);
    let summary = parmerge::run(args).await?;

    assert!(summary.is_success());
    assert_eq!(summary.total, 2);
    assert_eq!(summary.completed, 0);
    Ok(())
}

#[test]
fn dry_run_lists_tasks_in_order_with_their_scores() -> TestResult {
    let plan = PlanBuilder::new()
        .with_target("lib", TargetBuilder::new())
        .with_target("app", TargetBuilder::new().after("lib"))
        .build();
    let prepared = parmerge::dag::prepare(&plan)?;

    let mut out = Vec::new();
    parmerge::write_dry_run(&mut out, &plan, &prepared)?;
    let text = String::from_utf8(out)?;

    let lib = text.find("  - lib (idx 0; merge; 1 transitive dependents; score (-1, 0, source, -1, 0))");
    let app = text.find("  - app (idx 1; merge; 0 transitive dependents; score (-0, 1, source, -0, 1))");
    assert!(lib.is_some(), "{text}");
    assert!(app.is_some(), "{text}");
    assert!(lib < app);
    assert!(text.contains("      needs lib [buildtime]"));
    Ok(())
}

#[tokio::test]
async fn run_without_build_command_fails_before_scheduling() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = write_plan(
        dir.path(),
        "plan.toml",
        r#"
[commands]
fetch = "true"

[target.a]
idx = 0
"#,
    )?;

    let args = CliArgs::parse_from(["parmerge", "--plan", path.to_str().ok_or("non-utf8 temp path")?]);
    let err = parmerge::run(args).await.unwrap_err();
    assert!(err.to_string().contains("[commands].build"));
    Ok(())
}
