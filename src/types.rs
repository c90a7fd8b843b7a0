use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical target identifier used throughout the crate.
pub type TaskId = String;

/// What the resolver decided to do with a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Fetch and build/install the target.
    #[default]
    Merge,
    /// Part of the tree for ordering only; no work is performed.
    Nomerge,
    /// Remove the target; runs build-phase work but has nothing to fetch.
    Uninstall,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Merge => "merge",
            Action::Nomerge => "nomerge",
            Action::Uninstall => "uninstall",
        };
        f.write_str(s)
    }
}

/// Dependency-type tag attached to a `needs` edge by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepType {
    Blocker,
    Buildtime,
    BuildtimeSlot,
    Runtime,
    RuntimeSlot,
    Optional,
    Ignored,
    RuntimePost,
    Soft,
}

impl DepType {
    pub fn as_str(self) -> &'static str {
        match self {
            DepType::Blocker => "blocker",
            DepType::Buildtime => "buildtime",
            DepType::BuildtimeSlot => "buildtime-slot",
            DepType::Runtime => "runtime",
            DepType::RuntimeSlot => "runtime-slot",
            DepType::Optional => "optional",
            DepType::Ignored => "ignored",
            DepType::RuntimePost => "runtime-post",
            DepType::Soft => "soft",
        }
    }

    /// Whether an edge carrying this tag orders the build phase.
    ///
    /// `optional` only blocks when building from source: prebuilt artifacts
    /// were already built against whatever was present.
    pub fn is_blocking(self, use_prebuilt: bool) -> bool {
        match self {
            DepType::Blocker
            | DepType::Buildtime
            | DepType::BuildtimeSlot
            | DepType::Runtime
            | DepType::RuntimeSlot => true,
            DepType::Optional => !use_prebuilt,
            DepType::Ignored | DepType::RuntimePost | DepType::Soft => false,
        }
    }
}

impl fmt::Display for DepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "blocker" => Ok(DepType::Blocker),
            "buildtime" => Ok(DepType::Buildtime),
            "buildtime-slot" => Ok(DepType::BuildtimeSlot),
            "runtime" => Ok(DepType::Runtime),
            "runtime-slot" => Ok(DepType::RuntimeSlot),
            "optional" => Ok(DepType::Optional),
            "ignored" => Ok(DepType::Ignored),
            "runtime-post" => Ok(DepType::RuntimePost),
            "soft" => Ok(DepType::Soft),
            other => Err(format!("unknown dependency type '{other}'")),
        }
    }
}

/// Join a list of tags the way they are shown in logs and dry-run output.
pub fn join_dep_types(types: &[DepType]) -> String {
    types
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Independently pooled stage of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Fetch,
    Build,
    Unpack,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Fetch, Phase::Build, Phase::Unpack];

    /// Progressive verb used in status and "still running" lines.
    pub fn verb(self) -> &'static str {
        match self {
            Phase::Fetch => "Fetching",
            Phase::Build => "Building",
            Phase::Unpack => "Unpacking",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Fetch => "fetch",
            Phase::Build => "build",
            Phase::Unpack => "unpack",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_blocks_only_from_source() {
        assert!(DepType::Optional.is_blocking(false));
        assert!(!DepType::Optional.is_blocking(true));
        assert!(DepType::Blocker.is_blocking(true));
        assert!(!DepType::RuntimePost.is_blocking(false));
    }

    #[test]
    fn parses_kebab_case_tags() {
        assert_eq!("runtime-slot".parse::<DepType>(), Ok(DepType::RuntimeSlot));
        assert!("sometimes".parse::<DepType>().is_err());
    }
}
