// tests/property_graph.rs

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::Utc;
use proptest::prelude::*;

use parmerge::config::Plan;
use parmerge::dag;
use parmerge::engine::{CoreCommand, CoreOptions, SchedulerCore};
use parmerge::exec::{JobState, WorkItem};
use parmerge::types::Phase;
use parmerge_test_utils::builders::{PlanBuilder, TargetBuilder};

fn name(i: usize) -> String {
    format!("pkg_{i}")
}

/// Arbitrary dependency graph (cycles allowed) with arbitrary resolver
/// indices, which may repeat.
fn cyclic_plan_strategy(max_tasks: usize) -> impl Strategy<Value = Plan> {
    (2..=max_tasks).prop_flat_map(|n| {
        (
            proptest::collection::vec(0..n, n),
            proptest::collection::vec(proptest::collection::vec(0..n, 0..4), n),
        )
            .prop_map(move |(idxs, deps)| {
                let mut builder = PlanBuilder::new();
                for (i, targets) in deps.into_iter().enumerate() {
                    let mut target = TargetBuilder::new().idx(idxs[i]);
                    let unique: BTreeSet<usize> = targets.into_iter().filter(|d| *d != i).collect();
                    for d in unique {
                        target = target.dep(&name(d), &["runtime"]);
                    }
                    builder = builder.with_target(&name(i), target);
                }
                builder.build()
            })
    })
}

/// Acyclic graph: task `i` only depends on tasks with a smaller index.
fn dag_plan_strategy(max_tasks: usize) -> impl Strategy<Value = Plan> {
    (1..=max_tasks).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..4), n).prop_map(
            move |deps| {
                let mut builder = PlanBuilder::new();
                for (i, potential) in deps.into_iter().enumerate() {
                    let mut target = TargetBuilder::new().idx(i);
                    if i > 0 {
                        let unique: BTreeSet<usize> = potential.into_iter().map(|d| d % i).collect();
                        for d in unique {
                            target = target.after(&name(d));
                        }
                    }
                    builder = builder.with_target(&name(i), target);
                }
                builder.build()
            },
        )
    })
}

proptest! {
    #[test]
    fn cycle_breaking_always_yields_a_dag(plan in cyclic_plan_strategy(12)) {
        let prepared = dag::prepare(&plan).unwrap();

        prop_assert!(prepared.graph.is_acyclic());
        prop_assert_eq!(prepared.graph.len(), plan.targets.len());
        for edge in &prepared.removed_edges {
            prop_assert!(edge.head_idx >= edge.tail_idx);
            prop_assert!(plan.targets[&edge.tail].deps.contains_key(&edge.head));
        }
    }

    #[test]
    fn acyclic_plans_lose_no_edges(plan in dag_plan_strategy(15)) {
        let prepared = dag::prepare(&plan).unwrap();

        prop_assert!(prepared.removed_edges.is_empty());
        for (id, spec) in &plan.targets {
            let task = prepared.graph.get(id).unwrap();
            let needs: BTreeSet<&String> = task.needs.keys().collect();
            let deps: BTreeSet<&String> = spec.deps.keys().collect();
            prop_assert_eq!(needs, deps);
        }
    }

    #[test]
    fn builds_never_start_before_their_dependencies_finish(
        plan in dag_plan_strategy(12),
        picks in proptest::collection::vec(any::<usize>(), 1..64),
    ) {
        let prepared = dag::prepare(&plan).unwrap();
        let now = Utc::now();
        let mut core = SchedulerCore::new(prepared.graph, CoreOptions::from_settings(&plan.settings), now);

        let mut commands = core.seed();
        commands.extend(core.schedule(None).unwrap());
        let mut running: Vec<WorkItem> = Vec::new();

        for step in 0..(plan.targets.len() * 4 + 4) {
            for command in commands.drain(..) {
                if let CoreCommand::Dispatch(item) = command {
                    if item.phase == Phase::Build {
                        let finished: BTreeSet<&str> = core.finished().iter().map(String::as_str).collect();
                        for dep in plan.targets[&item.target].deps.keys() {
                            prop_assert!(
                                finished.contains(dep.as_str()),
                                "{} built before {}", item.target, dep
                            );
                        }
                    }
                    running.push(item);
                }
            }

            if core.is_done() {
                break;
            }
            prop_assert!(!running.is_empty(), "scheduler stalled with nothing running");

            let item = running.swap_remove(picks[step % picks.len()] % running.len());
            let started = JobState::started(&item, PathBuf::from("/dev/null"), now);
            commands = core.handle_event(started.clone(), now);
            commands.extend(core.handle_event(started.finished(0, now), now));
            commands.extend(core.schedule(None).unwrap());
        }

        prop_assert!(core.is_done());
        prop_assert!(core.graph().is_empty());
        let unique: BTreeSet<&String> = core.finished().iter().collect();
        prop_assert_eq!(unique.len(), plan.targets.len());
        prop_assert_eq!(core.finished().len(), plan.targets.len());
    }
}
