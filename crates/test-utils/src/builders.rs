use std::collections::BTreeMap;

use parmerge::config::{Commands, Plan, RawDep, RawPlan, RawTarget, Settings};
use parmerge::types::Action;

/// Builder for `Plan` to simplify test setup.
pub struct PlanBuilder {
    plan: RawPlan,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self {
            plan: RawPlan {
                install: None,
                settings: Settings {
                    fetch_jobs: 4,
                    build_jobs: 4,
                    ..Settings::default()
                },
                commands: Commands::default(),
                target: BTreeMap::new(),
            },
        }
    }

    /// Add a target; its `idx` defaults to insertion order.
    pub fn with_target(mut self, id: &str, target: TargetBuilder) -> Self {
        let mut target = target.build();
        if target.idx.is_none() {
            target.idx = Some(self.plan.target.len());
        }
        self.plan.target.insert(id.to_string(), target);
        self
    }

    pub fn with_install(mut self, ids: &[&str]) -> Self {
        self.plan.install = Some(ids.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_settings(mut self, f: impl FnOnce(&mut Settings)) -> Self {
        f(&mut self.plan.settings);
        self
    }

    pub fn with_commands(mut self, fetch: &str, build: &str) -> Self {
        self.plan.commands.fetch = Some(fetch.to_string());
        self.plan.commands.build = Some(build.to_string());
        self
    }

    pub fn raw(self) -> RawPlan {
        self.plan
    }

    pub fn build(self) -> Plan {
        Plan::try_from(self.plan).expect("Failed to build valid plan from builder")
    }
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `RawTarget`.
pub struct TargetBuilder {
    target: RawTarget,
}

impl TargetBuilder {
    pub fn new() -> Self {
        Self {
            target: RawTarget {
                action: Action::Merge,
                idx: None,
                prebuilt: false,
                defines_install_hooks: true,
                deps: BTreeMap::new(),
            },
        }
    }

    /// Add a dependency edge with the given tags, e.g. `&["buildtime"]`.
    pub fn dep(mut self, head: &str, types: &[&str]) -> Self {
        self.target.deps.insert(
            head.to_string(),
            RawDep {
                types: types.iter().map(|t| t.to_string()).collect(),
            },
        );
        self
    }

    /// Shorthand for a `buildtime` dependency.
    pub fn after(self, head: &str) -> Self {
        self.dep(head, &["buildtime"])
    }

    pub fn idx(mut self, idx: usize) -> Self {
        self.target.idx = Some(idx);
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.target.action = action;
        self
    }

    /// Prebuilt artifact with no install hooks, so it may install early.
    pub fn prebuilt_without_hooks(mut self) -> Self {
        self.target.prebuilt = true;
        self.target.defines_install_hooks = false;
        self
    }

    pub fn build(self) -> RawTarget {
        self.target
    }
}

impl Default for TargetBuilder {
    fn default() -> Self {
        Self::new()
    }
}
