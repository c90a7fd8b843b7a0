// src/dag/task.rs

//! Per-target scheduling record.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::model::TargetSpec;
use crate::types::{Action, DepType, TaskId};

/// One node of the [`TaskGraph`](crate::dag::TaskGraph).
///
/// Created once from the plan, mutated in place while dependencies finish,
/// and removed from the graph when its own work completes.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildTask {
    pub id: TaskId,
    pub action: Action,
    /// Unresolved blocking dependencies, with the tags of each edge.
    pub needs: BTreeMap<TaskId, Vec<DepType>>,
    /// Tasks blocked on this one.
    pub provides: BTreeSet<TaskId>,
    /// Every task transitively blocked on this one. Only used for scoring.
    pub transitive_provides: BTreeSet<TaskId>,
    /// Edges whose tags never block. Kept for reporting only.
    pub soft_deps: BTreeMap<TaskId, Vec<DepType>>,
    /// A prebuilt artifact is installed instead of building from source.
    pub binary: bool,
    /// May start installing before `needs` is empty.
    pub nodeps: bool,
    /// Flat resolver order.
    pub idx: usize,
    /// Retries consumed so far.
    pub try_count: u32,
}

impl BuildTask {
    pub fn from_spec(id: TaskId, spec: &TargetSpec) -> Self {
        Self {
            id,
            action: spec.action,
            needs: BTreeMap::new(),
            provides: BTreeSet::new(),
            transitive_provides: BTreeSet::new(),
            soft_deps: BTreeMap::new(),
            binary: spec.prebuilt,
            nodeps: spec.nodeps(),
            idx: spec.idx,
            try_count: 0,
        }
    }

    /// Whether the build phase may start for this task.
    pub fn build_unblocked(&self) -> bool {
        self.needs.is_empty() || self.nodeps
    }
}
