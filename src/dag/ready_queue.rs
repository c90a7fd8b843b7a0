// src/dag/ready_queue.rs

//! Priority heap of tasks whose phase-gating dependencies are satisfied.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use crate::dag::graph::TaskGraph;
use crate::dag::task::BuildTask;
use crate::types::TaskId;

/// Scheduling priority. Smaller sorts first.
///
/// Field order is the comparison order:
/// 1. more transitive dependents first
/// 2. fewer remaining needs
/// 3. prebuilt before from-source
/// 4. more direct dependents
/// 5. resolver index, then id, for determinism
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Score {
    transitive_provides: Reverse<usize>,
    needs: usize,
    from_source: bool,
    provides: Reverse<usize>,
    idx: usize,
    id: TaskId,
}

impl Score {
    pub fn of(task: &BuildTask) -> Self {
        Self {
            transitive_provides: Reverse(task.transitive_provides.len()),
            needs: task.needs.len(),
            from_source: !task.binary,
            provides: Reverse(task.provides.len()),
            idx: task.idx,
            id: task.id.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Renders the comparison tuple, e.g. `(-3, 0, prebuilt, -1, 7)`.
impl std::fmt::Display for Score {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(-{}, {}, {}, -{}, {})",
            self.transitive_provides.0,
            self.needs,
            if self.from_source { "source" } else { "prebuilt" },
            self.provides.0,
            self.idx
        )
    }
}

/// Min-heap over [`Score`] holding each task at most once.
///
/// Scores are snapshots; call [`ScoredReadyQueue::rescore`] after `needs`
/// counts change so the heap order reflects them again.
#[derive(Debug, Default)]
pub struct ScoredReadyQueue {
    heap: BinaryHeap<Reverse<Score>>,
    members: HashSet<TaskId>,
}

impl ScoredReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `task`; returns `false` if it was already queued.
    pub fn push(&mut self, task: &BuildTask) -> bool {
        if !self.members.insert(task.id.clone()) {
            return false;
        }
        self.heap.push(Reverse(Score::of(task)));
        true
    }

    /// Remove and return the highest-priority task id.
    pub fn pop(&mut self) -> Option<TaskId> {
        let Reverse(score) = self.heap.pop()?;
        self.members.remove(&score.id);
        Some(score.id)
    }

    pub fn peek(&self) -> Option<&Score> {
        self.heap.peek().map(|Reverse(s)| s)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Recompute every score from `graph` and rebuild the heap. Tasks no
    /// longer in the graph are dropped.
    pub fn rescore(&mut self, graph: &TaskGraph) {
        let old = std::mem::take(&mut self.heap);
        self.members.clear();

        for Reverse(score) in old.into_vec() {
            if let Some(task) = graph.get(&score.id) {
                self.push(task);
            }
        }
    }
}
