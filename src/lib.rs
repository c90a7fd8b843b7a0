// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod types;

use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::config::loader::load_from_path;
use crate::config::model::Plan;
use crate::dag::{PreparedGraph, Score};
use crate::engine::cancel::spawn_signal_listener;
use crate::engine::{CoreOptions, OutputWorker, RunSummary, Runtime, RuntimeConfig, SchedulerCore};
use crate::errors::Result;
use crate::exec::{CommandWork, WorkFunction};
use crate::types::join_dep_types;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - plan loading, CLI overrides and validation
/// - graph preparation (incidental splicing, cycle breaking, scoring)
/// - the shell command work function and its process groups
/// - SIGINT / SIGTERM handling
/// - the scheduler runtime
pub async fn run(args: CliArgs) -> Result<RunSummary> {
    let mut raw = load_from_path(&args.plan)?;
    args.apply_overrides(&mut raw.settings);
    let plan = Plan::try_from(raw)?;
    info!(
        plan = %args.plan.display(),
        targets = plan.targets.len(),
        install = plan.install.len(),
        "plan loaded"
    );

    if args.dry_run {
        let prepared = dag::prepare(&plan)?;
        write_dry_run(&mut std::io::stdout().lock(), &plan, &prepared)?;
        return Ok(RunSummary::empty(prepared.graph.len()));
    }

    let work = CommandWork::new(plan.commands.clone(), &plan.settings)?;
    let groups = work.process_groups();

    let cancel = CancellationToken::new();
    let _signals = spawn_signal_listener(cancel.clone(), move || {
        let killed = groups.kill_all();
        info!(killed, "killed running process groups");
    });

    let config = RuntimeConfig {
        event_log: args.event_log.clone(),
        failure_file: args.failure_file.clone(),
        ..RuntimeConfig::default()
    };
    let output = OutputWorker::spawn(Box::new(std::io::stdout()));

    run_plan(&plan, Arc::new(work), output, cancel, config).await
}

/// Schedule `plan` with an arbitrary work function.
///
/// Used by [`run`] with [`CommandWork`]; tests pass fakes.
pub async fn run_plan(
    plan: &Plan,
    work: Arc<dyn WorkFunction>,
    output: OutputWorker,
    cancel: CancellationToken,
    config: RuntimeConfig,
) -> Result<RunSummary> {
    let prepared = dag::prepare(plan)?;
    for edge in &prepared.removed_edges {
        debug!(tail = %edge.tail, head = %edge.head, "cycle edge removed");
    }

    let core = SchedulerCore::new(
        prepared.graph,
        CoreOptions::from_settings(&plan.settings),
        Utc::now(),
    );
    let runtime = Runtime::new(core, work, output, cancel, config)?;
    runtime.run().await
}

/// Write the prepared graph in dependency order without running anything.
pub fn write_dry_run(
    out: &mut impl Write,
    plan: &Plan,
    prepared: &PreparedGraph,
) -> std::io::Result<()> {
    let graph = &prepared.graph;
    let s = &plan.settings;

    writeln!(out, "parmerge dry-run")?;
    writeln!(
        out,
        "  jobs: fetch={} build={} unpack={}",
        s.fetch_jobs, s.build_jobs, s.unpack_jobs
    )?;
    writeln!(
        out,
        "  max_retries={} use_prebuilt={} unpack_only={}",
        s.max_retries, s.use_prebuilt, s.unpack_only
    )?;
    if let Some(load) = s.load_average {
        writeln!(out, "  load_average={load}")?;
    }
    writeln!(out)?;

    if !prepared.removed_edges.is_empty() {
        writeln!(out, "removed cycle edges ({}):", prepared.removed_edges.len())?;
        for edge in &prepared.removed_edges {
            writeln!(
                out,
                "  {} -> {} [{}] (idx {} -> {}; cycle: {})",
                edge.tail,
                edge.head,
                join_dep_types(&edge.types),
                edge.tail_idx,
                edge.head_idx,
                edge.cycle.join(" -> ")
            )?;
        }
        writeln!(out)?;
    }

    // `prepare` guarantees the graph is acyclic.
    let order = graph.topological_order().unwrap_or_default();
    writeln!(out, "tasks ({}):", order.len())?;
    for id in order {
        let Some(task) = graph.get(&id) else {
            continue;
        };
        let mut flags = vec![task.action.to_string()];
        if task.binary {
            flags.push("prebuilt".into());
        }
        if task.nodeps {
            flags.push("nodeps".into());
        }
        writeln!(
            out,
            "  - {id} (idx {}; {}; {} transitive dependents; score {})",
            task.idx,
            flags.join(", "),
            task.transitive_provides.len(),
            Score::of(task)
        )?;
        for (dep, types) in &task.needs {
            writeln!(out, "      needs {dep} [{}]", join_dep_types(types))?;
        }
        if !task.provides.is_empty() {
            let provides: Vec<&str> = task.provides.iter().map(String::as_str).collect();
            writeln!(out, "      provides {}", provides.join(", "))?;
        }
        for (dep, types) in &task.soft_deps {
            writeln!(out, "      after {dep} [{}] (non-blocking)", join_dep_types(types))?;
        }
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}
