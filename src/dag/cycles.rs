// src/dag/cycles.rs

//! Cycle detection and breaking for the `needs` graph.
//!
//! Cycles are broken by deleting back-edges relative to the resolver's flat
//! order: an edge "`tail` needs `head`" is only removed when
//! `head.idx >= tail.idx`. Edges running with the flat order are never
//! touched, so the final graph is always consistent with it.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::dag::graph::TaskGraph;
use crate::errors::{ParmergeError, Result};
use crate::types::{join_dep_types, DepType, TaskId};

/// A `needs` edge found on a cycle, with one example cycle through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleEdge {
    pub tail: TaskId,
    pub head: TaskId,
    /// Closed path `[n0, n1, ..., n0]` where each element needs the next.
    pub cycle: Vec<TaskId>,
}

/// An edge deleted by [`break_cycles`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedEdge {
    pub tail: TaskId,
    pub head: TaskId,
    pub types: Vec<DepType>,
    pub tail_idx: usize,
    pub head_idx: usize,
    pub cycle: Vec<TaskId>,
}

/// Depth-first search over `needs`, recording every edge that lies on a
/// cycle found through the current path.
///
/// Edges are returned in discovery order, each with the first cycle seen
/// through it. Traversal is iterative and visits tasks in id order, so the
/// result is deterministic.
pub fn find_cycles(graph: &TaskGraph) -> Vec<CycleEdge> {
    let mut found: Vec<CycleEdge> = Vec::new();
    let mut seen_edges: HashSet<(TaskId, TaskId)> = HashSet::new();
    let mut resolved: HashSet<&str> = HashSet::new();

    for root in graph.ids() {
        if resolved.contains(root) {
            continue;
        }

        // Current path and each frame's position in its neighbour list.
        let mut path: Vec<&str> = vec![root];
        let mut on_path: HashMap<&str, usize> = HashMap::from([(root, 0)]);
        let mut frames: Vec<(Vec<&str>, usize)> = vec![(needs_of(graph, root), 0)];

        while let Some((neighbours, cursor)) = frames.last_mut() {
            if *cursor >= neighbours.len() {
                frames.pop();
                if let Some(done) = path.pop() {
                    on_path.remove(done);
                    resolved.insert(done);
                }
                continue;
            }

            let dep = neighbours[*cursor];
            *cursor += 1;

            if let Some(&pos) = on_path.get(dep) {
                let mut cycle: Vec<TaskId> = path[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.to_string());

                for pair in cycle.windows(2) {
                    let key = (pair[0].clone(), pair[1].clone());
                    if seen_edges.insert(key) {
                        found.push(CycleEdge {
                            tail: pair[0].clone(),
                            head: pair[1].clone(),
                            cycle: cycle.clone(),
                        });
                    }
                }
            } else if !resolved.contains(dep) && graph.contains(dep) {
                on_path.insert(dep, path.len());
                path.push(dep);
                frames.push((needs_of(graph, dep), 0));
            }
        }
    }

    found
}

fn needs_of<'g>(graph: &'g TaskGraph, id: &str) -> Vec<&'g str> {
    graph
        .get(id)
        .map(|t| t.needs.keys().map(|s| s.as_str()).collect())
        .unwrap_or_default()
}

/// Whether every edge of the closed path still exists.
fn cycle_intact(graph: &TaskGraph, cycle: &[TaskId]) -> bool {
    cycle.windows(2).all(|pair| {
        graph
            .get(&pair[0])
            .is_some_and(|t| t.needs.contains_key(&pair[1]))
    })
}

/// Break every cycle in `graph`, running [`find_cycles`] to a fixpoint.
///
/// Within one pass, edges are considered in discovery order. An edge whose
/// example cycle was already broken earlier in the same pass is left alone;
/// if it is still on some other cycle the next pass finds it again. This is
/// what decides 2-cycles between tasks with equal `idx`: the edge discovered
/// first is removed and the other is kept.
///
/// Returns the removed edges in removal order.
pub fn break_cycles(graph: &mut TaskGraph) -> Result<Vec<RemovedEdge>> {
    let mut removed = Vec::new();

    loop {
        let cycles = find_cycles(graph);
        if cycles.is_empty() {
            break;
        }

        let mut removed_this_pass = 0usize;

        for edge in cycles {
            let (Some(tail), Some(head)) = (graph.get(&edge.tail), graph.get(&edge.head)) else {
                continue;
            };
            let (tail_idx, head_idx) = (tail.idx, head.idx);

            if head_idx < tail_idx {
                continue;
            }
            if !cycle_intact(graph, &edge.cycle) {
                continue;
            }

            let Some(types) = graph.remove_edge(&edge.tail, &edge.head) else {
                continue;
            };

            let path = edge.cycle.join(" -> ");
            if types.contains(&DepType::Blocker) {
                warn!(
                    tail = %edge.tail,
                    head = %edge.head,
                    types = %join_dep_types(&types),
                    cycle = %path,
                    "breaking cycle by dropping a blocker edge; these targets may now build concurrently"
                );
            } else {
                info!(
                    tail = %edge.tail,
                    head = %edge.head,
                    types = %join_dep_types(&types),
                    cycle = %path,
                    "breaking dependency cycle"
                );
            }

            removed.push(RemovedEdge {
                tail: edge.tail,
                head: edge.head,
                types,
                tail_idx,
                head_idx,
                cycle: edge.cycle,
            });
            removed_this_pass += 1;
        }

        // Every cycle has an edge with head.idx >= tail.idx, so a pass that
        // removes nothing means the graph is inconsistent.
        if removed_this_pass == 0 {
            return Err(ParmergeError::ConfigError(
                "dependency cycles remain but no edge could be removed".to_string(),
            ));
        }
    }

    Ok(removed)
}
