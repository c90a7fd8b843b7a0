// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::{debug, warn};

use crate::config::model::Plan;
use crate::dag::task::BuildTask;
use crate::types::{DepType, TaskId};

/// Forward (`provides`) and backward (`needs`) adjacency of the build tree.
///
/// Invariant: `a.needs` contains `b` exactly when `b.provides` contains `a`.
/// Every mutating method keeps both sides in step.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: BTreeMap<TaskId, BuildTask>,
}

impl TaskGraph {
    /// Build the graph from a validated [`Plan`].
    ///
    /// - Edges with at least one blocking tag become `needs`/`provides`
    ///   pairs; the rest are kept as `soft_deps`.
    /// - A `blocker` edge clears `nodeps` on the task that needs it.
    /// - Tree members outside `plan.install` are spliced out.
    ///
    /// The result may still contain cycles; see [`crate::dag::cycles`].
    pub fn from_plan(plan: &Plan) -> Self {
        let use_prebuilt = plan.settings.use_prebuilt;

        let mut tasks: BTreeMap<TaskId, BuildTask> = plan
            .targets
            .iter()
            .map(|(id, spec)| (id.clone(), BuildTask::from_spec(id.clone(), spec)))
            .collect();

        for (id, spec) in plan.targets.iter() {
            for (dep, types) in spec.deps.iter() {
                let blocking = types.iter().any(|t| t.is_blocking(use_prebuilt));

                if !blocking {
                    if let Some(task) = tasks.get_mut(id) {
                        task.soft_deps.insert(dep.clone(), types.clone());
                    }
                    continue;
                }

                if let Some(dep_task) = tasks.get_mut(dep) {
                    dep_task.provides.insert(id.clone());
                }
                if let Some(task) = tasks.get_mut(id) {
                    task.needs.insert(dep.clone(), types.clone());
                    if types.contains(&DepType::Blocker) {
                        task.nodeps = false;
                    }
                }
            }
        }

        let mut graph = Self { tasks };
        graph.remove_incidental(&plan.install);
        graph
    }

    /// Splice out every task not in `keep`, preserving the ordering it
    /// imposed between its own dependencies and dependents.
    pub fn remove_incidental(&mut self, keep: &BTreeSet<TaskId>) {
        let incidental: Vec<TaskId> = self
            .tasks
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();

        for id in incidental {
            debug!(task = %id, "splicing incidental task out of the graph");
            self.splice_out(&id);
        }
    }

    /// Remove `id`, connecting each of its dependents directly to each of its
    /// dependencies.
    pub fn splice_out(&mut self, id: &str) {
        let Some(node) = self.tasks.remove(id) else {
            return;
        };

        for dep in node.needs.keys() {
            if let Some(dep_task) = self.tasks.get_mut(dep) {
                dep_task.provides.extend(node.provides.iter().cloned());
                dep_task.provides.remove(id);
                dep_task.provides.remove(dep);
            }
        }

        for dependent in node.provides.iter() {
            if let Some(task) = self.tasks.get_mut(dependent) {
                task.needs.remove(id);
                for (dep, types) in node.needs.iter() {
                    if dep == dependent {
                        continue;
                    }
                    let entry = task.needs.entry(dep.clone()).or_default();
                    merge_types(entry, types);
                    if types.contains(&DepType::Blocker) {
                        task.nodeps = false;
                    }
                }
            }
        }
    }

    /// Delete the edge "`tail` needs `head`" on both sides.
    ///
    /// Returns the tags the edge carried, or `None` if it did not exist.
    pub fn remove_edge(&mut self, tail: &str, head: &str) -> Option<Vec<DepType>> {
        let types = self.tasks.get_mut(tail)?.needs.remove(head)?;
        if let Some(head_task) = self.tasks.get_mut(head) {
            head_task.provides.remove(tail);
        }
        Some(types)
    }

    /// Remove a task, dropping it from its remaining dependencies' `provides`.
    ///
    /// Dependents' `needs` are left alone: releasing them is the scheduler's
    /// job.
    pub fn remove(&mut self, id: &str) -> Option<BuildTask> {
        let task = self.tasks.remove(id)?;
        for dep in task.needs.keys() {
            if let Some(dep_task) = self.tasks.get_mut(dep) {
                dep_task.provides.remove(id);
            }
        }
        Some(task)
    }

    /// Memoised transitive closure of `provides` for every task.
    ///
    /// Must run on an acyclic graph; tasks on a cycle only get their direct
    /// dependents.
    pub fn compute_transitive_provides(&mut self) {
        let mut remaining: BTreeMap<TaskId, usize> = self
            .tasks
            .iter()
            .map(|(id, t)| (id.clone(), t.provides.len()))
            .collect();

        let mut queue: VecDeque<TaskId> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| id.clone())
            .collect();

        let mut done: BTreeMap<TaskId, BTreeSet<TaskId>> = BTreeMap::new();

        while let Some(id) = queue.pop_front() {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };

            let mut closure = BTreeSet::new();
            for dependent in task.provides.iter() {
                closure.insert(dependent.clone());
                if let Some(sub) = done.get(dependent) {
                    closure.extend(sub.iter().cloned());
                }
            }
            done.insert(id.clone(), closure);

            for dep in task.needs.keys() {
                if let Some(n) = remaining.get_mut(dep) {
                    *n = n.saturating_sub(1);
                    if *n == 0 {
                        queue.push_back(dep.clone());
                    }
                }
            }
        }

        for (id, task) in self.tasks.iter_mut() {
            match done.remove(id) {
                Some(closure) => task.transitive_provides = closure,
                None => {
                    warn!(task = %id, "task is on a cycle; using direct dependents for scoring");
                    task.transitive_provides = task.provides.clone();
                }
            }
        }
    }

    /// Topological order of the `needs` graph (dependencies first).
    ///
    /// Returns the id of a task on a cycle if there is one.
    pub fn topological_order(&self) -> std::result::Result<Vec<TaskId>, TaskId> {
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

        for id in self.tasks.keys() {
            graph.add_node(id.as_str());
        }
        for (id, task) in self.tasks.iter() {
            for dep in task.needs.keys() {
                if self.tasks.contains_key(dep) {
                    graph.add_edge(dep.as_str(), id.as_str(), ());
                }
            }
        }

        toposort(&graph, None)
            .map(|order| order.into_iter().map(str::to_string).collect())
            .map_err(|cycle| cycle.node_id().to_string())
    }

    pub fn is_acyclic(&self) -> bool {
        self.topological_order().is_ok()
    }

    pub fn get(&self, id: &str) -> Option<&BuildTask> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut BuildTask> {
        self.tasks.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(|s| s.as_str())
    }

    pub fn tasks(&self) -> impl Iterator<Item = &BuildTask> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

fn merge_types(into: &mut Vec<DepType>, from: &[DepType]) {
    for t in from {
        if !into.contains(t) {
            into.push(*t);
        }
    }
    into.sort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{Commands, Settings, TargetSpec};
    use crate::types::Action;

    fn spec(idx: usize, deps: &[(&str, &[DepType])]) -> TargetSpec {
        TargetSpec {
            action: Action::Merge,
            idx,
            prebuilt: false,
            defines_install_hooks: true,
            deps: deps
                .iter()
                .map(|(d, t)| (d.to_string(), t.to_vec()))
                .collect(),
        }
    }

    fn plan(targets: Vec<(&str, TargetSpec)>, install: Option<&[&str]>) -> Plan {
        let targets: BTreeMap<TaskId, TargetSpec> = targets
            .into_iter()
            .map(|(id, s)| (id.to_string(), s))
            .collect();
        let install = match install {
            Some(ids) => ids.iter().map(|s| s.to_string()).collect(),
            None => targets.keys().cloned().collect(),
        };
        Plan::new_unchecked(install, Settings::default(), Commands::default(), targets)
    }

    #[test]
    fn blocking_edges_become_needs_and_provides() {
        let p = plan(
            vec![
                ("a", spec(0, &[])),
                ("b", spec(1, &[("a", &[DepType::Buildtime])])),
                ("c", spec(2, &[("a", &[DepType::RuntimePost])])),
            ],
            None,
        );
        let g = TaskGraph::from_plan(&p);

        assert!(g.get("b").unwrap().needs.contains_key("a"));
        assert_eq!(
            g.get("a").unwrap().provides.iter().collect::<Vec<_>>(),
            vec!["b"]
        );
        assert!(g.get("c").unwrap().needs.is_empty());
        assert!(g.get("c").unwrap().soft_deps.contains_key("a"));
    }

    #[test]
    fn blocker_edge_clears_nodeps() {
        let mut binary = spec(1, &[("a", &[DepType::Blocker])]);
        binary.prebuilt = true;
        binary.defines_install_hooks = false;
        let mut plain = spec(2, &[("a", &[DepType::Runtime])]);
        plain.prebuilt = true;
        plain.defines_install_hooks = false;

        let p = plan(
            vec![("a", spec(0, &[])), ("b", binary), ("c", plain)],
            None,
        );
        let g = TaskGraph::from_plan(&p);

        assert!(!g.get("b").unwrap().nodeps);
        assert!(g.get("c").unwrap().nodeps);
    }

    #[test]
    fn optional_edges_follow_prebuilt_setting() {
        let mut p = plan(
            vec![
                ("a", spec(0, &[])),
                ("b", spec(1, &[("a", &[DepType::Optional])])),
            ],
            None,
        );
        assert!(TaskGraph::from_plan(&p).get("b").unwrap().needs.contains_key("a"));

        p.settings.use_prebuilt = true;
        assert!(TaskGraph::from_plan(&p).get("b").unwrap().needs.is_empty());
    }

    #[test]
    fn incidental_tasks_are_spliced_out() {
        // c -> r -> a, with r not in the install set.
        let p = plan(
            vec![
                ("a", spec(0, &[])),
                ("r", spec(1, &[("a", &[DepType::Runtime])])),
                ("c", spec(2, &[("r", &[DepType::Buildtime])])),
            ],
            Some(&["a", "c"]),
        );
        let g = TaskGraph::from_plan(&p);

        assert!(!g.contains("r"));
        assert_eq!(g.get("c").unwrap().needs.keys().collect::<Vec<_>>(), vec!["a"]);
        assert!(g.get("a").unwrap().provides.contains("c"));
        assert!(!g.get("a").unwrap().provides.contains("r"));
    }

    #[test]
    fn splicing_a_two_cycle_member_leaves_no_self_edge() {
        let p = plan(
            vec![
                ("a", spec(0, &[("r", &[DepType::Runtime])])),
                ("r", spec(1, &[("a", &[DepType::Runtime])])),
            ],
            Some(&["a"]),
        );
        let g = TaskGraph::from_plan(&p);

        let a = g.get("a").unwrap();
        assert!(a.needs.is_empty());
        assert!(a.provides.is_empty());
    }

    #[test]
    fn transitive_provides_covers_the_whole_chain() {
        let p = plan(
            vec![
                ("a", spec(0, &[])),
                ("b", spec(1, &[("a", &[DepType::Runtime])])),
                ("c", spec(2, &[("b", &[DepType::Runtime])])),
                ("d", spec(3, &[("a", &[DepType::Runtime])])),
            ],
            None,
        );
        let mut g = TaskGraph::from_plan(&p);
        g.compute_transitive_provides();

        let tp: Vec<_> = g.get("a").unwrap().transitive_provides.iter().cloned().collect();
        assert_eq!(tp, vec!["b", "c", "d"]);
        assert_eq!(g.get("b").unwrap().transitive_provides.len(), 1);
        assert!(g.get("c").unwrap().transitive_provides.is_empty());
    }

    #[test]
    fn remove_edge_updates_both_sides() {
        let p = plan(
            vec![
                ("a", spec(0, &[])),
                ("b", spec(1, &[("a", &[DepType::Buildtime, DepType::Runtime])])),
            ],
            None,
        );
        let mut g = TaskGraph::from_plan(&p);

        let types = g.remove_edge("b", "a").expect("edge exists");
        assert_eq!(types, vec![DepType::Buildtime, DepType::Runtime]);
        assert!(g.get("a").unwrap().provides.is_empty());
        assert!(g.remove_edge("b", "a").is_none());
    }

    #[test]
    fn topological_order_puts_dependencies_first() {
        let p = plan(
            vec![
                ("z", spec(0, &[])),
                ("m", spec(1, &[("z", &[DepType::Runtime])])),
            ],
            None,
        );
        let g = TaskGraph::from_plan(&p);
        assert_eq!(g.topological_order().unwrap(), vec!["z", "m"]);
    }
}
