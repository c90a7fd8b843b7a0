// src/dag/mod.rs

//! Task graph construction and scheduling structures.
//!
//! - [`task`] holds the per-target [`BuildTask`] record.
//! - [`graph`] owns the `needs`/`provides` adjacency built from the plan.
//! - [`cycles`] detects and breaks dependency cycles.
//! - [`ready_queue`] is the scored priority heap used per phase.

pub mod cycles;
pub mod graph;
pub mod ready_queue;
pub mod task;

pub use cycles::{break_cycles, find_cycles, CycleEdge, RemovedEdge};
pub use graph::TaskGraph;
pub use ready_queue::{Score, ScoredReadyQueue};
pub use task::BuildTask;

use tracing::info;

use crate::config::model::Plan;
use crate::errors::{ParmergeError, Result};

/// Graph ready for scheduling, plus the edges removed to get there.
#[derive(Debug, Clone)]
pub struct PreparedGraph {
    pub graph: TaskGraph,
    pub removed_edges: Vec<RemovedEdge>,
}

/// Build the task graph from a plan, break cycles and compute scores.
pub fn prepare(plan: &Plan) -> Result<PreparedGraph> {
    let mut graph = TaskGraph::from_plan(plan);
    let removed_edges = break_cycles(&mut graph)?;

    if let Err(node) = graph.topological_order() {
        return Err(ParmergeError::ConfigError(format!(
            "graph still cyclic after cycle breaking (involving '{node}')"
        )));
    }

    graph.compute_transitive_provides();

    info!(
        tasks = graph.len(),
        removed_edges = removed_edges.len(),
        "task graph prepared"
    );

    Ok(PreparedGraph {
        graph,
        removed_edges,
    })
}
