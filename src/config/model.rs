// src/config/model.rs

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::types::{Action, DepType, Phase, TaskId};

/// Plan file as written by the dependency resolver, before validation.
///
/// ```toml
/// install = ["app/foo"]
///
/// [settings]
/// build_jobs = 8
/// max_retries = 1
///
/// [commands]
/// fetch = "emerge --fetchonly ={target}"
/// build = "emerge --nodeps ={target}"
///
/// [target."app/foo"]
/// action = "merge"
/// idx = 1
/// [target."app/foo".deps."lib/bar"]
/// types = ["buildtime", "runtime"]
/// ```
///
/// Everything except `[target.<id>]` is optional and has defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawPlan {
    /// Final target set. Tree members not listed here are spliced out of the
    /// graph. `None` keeps every member.
    #[serde(default)]
    pub install: Option<Vec<TaskId>>,

    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub commands: Commands,

    /// All tree members from `[target.<id>]`.
    #[serde(default)]
    pub target: BTreeMap<TaskId, RawTarget>,
}

/// `[settings]` section. Command-line flags are layered on top.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub fetch_jobs: usize,
    pub build_jobs: usize,
    /// `0` means no unpack pool is instantiated.
    pub unpack_jobs: usize,
    pub max_retries: u32,
    /// Optional ceiling on the 1-minute load average.
    pub load_average: Option<f64>,
    pub use_prebuilt: bool,
    pub unpack_only: bool,
    pub show_output: bool,
    pub status_interval_secs: u64,
    pub notify_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fetch_jobs: 4,
            build_jobs: default_build_jobs(),
            unpack_jobs: 0,
            max_retries: 1,
            load_average: None,
            use_prebuilt: false,
            unpack_only: false,
            show_output: false,
            status_interval_secs: 60,
            notify_interval_secs: 120,
        }
    }
}

fn default_build_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// `[commands]` section: shell templates for the default command work function.
///
/// `{target}`, `{action}` and `{phase}` are substituted before running.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct Commands {
    #[serde(default)]
    pub fetch: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub unpack: Option<String>,
}

impl Commands {
    /// Non-empty template for `phase`, if configured.
    pub fn template(&self, phase: Phase) -> Option<&str> {
        let cmd = match phase {
            Phase::Fetch => &self.fetch,
            Phase::Build => &self.build,
            Phase::Unpack => &self.unpack,
        };
        cmd.as_deref().filter(|c| !c.trim().is_empty())
    }
}

/// `[target.<id>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTarget {
    #[serde(default)]
    pub action: Action,

    /// Flat resolver order. Targets without one are ordered after every
    /// indexed target, by id.
    #[serde(default)]
    pub idx: Option<usize>,

    /// A prebuilt artifact will be installed instead of building from source.
    #[serde(default)]
    pub prebuilt: bool,

    /// Whether installing the target runs hooks that need its dependencies
    /// already installed.
    #[serde(default = "default_true")]
    pub defines_install_hooks: bool,

    #[serde(default)]
    pub deps: BTreeMap<TaskId, RawDep>,
}

fn default_true() -> bool {
    true
}

/// One dependency edge as written by the resolver.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawDep {
    #[serde(default)]
    pub types: Vec<String>,
}

/// Validated plan.
///
/// Only constructed through `TryFrom<RawPlan>` (see `config::validate`), so
/// every dependency points at a known target and carries known tags.
#[derive(Debug, Clone)]
pub struct Plan {
    pub install: BTreeSet<TaskId>,
    pub settings: Settings,
    pub commands: Commands,
    pub targets: BTreeMap<TaskId, TargetSpec>,
}

impl Plan {
    pub(crate) fn new_unchecked(
        install: BTreeSet<TaskId>,
        settings: Settings,
        commands: Commands,
        targets: BTreeMap<TaskId, TargetSpec>,
    ) -> Self {
        Self {
            install,
            settings,
            commands,
            targets,
        }
    }
}

/// A validated target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSpec {
    pub action: Action,
    pub idx: usize,
    pub prebuilt: bool,
    pub defines_install_hooks: bool,
    pub deps: BTreeMap<TaskId, Vec<DepType>>,
}

impl TargetSpec {
    /// Prebuilt targets without install hooks may start installing before
    /// their dependencies have finished.
    pub fn nodeps(&self) -> bool {
        self.prebuilt && !self.defines_install_hooks
    }
}
