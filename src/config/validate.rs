use std::collections::{BTreeMap, BTreeSet};

use crate::config::model::{Plan, RawPlan, RawTarget, Settings, TargetSpec};
use crate::errors::{ParmergeError, Result};
use crate::types::{DepType, TaskId};

impl TryFrom<RawPlan> for Plan {
    type Error = ParmergeError;

    fn try_from(raw: RawPlan) -> std::result::Result<Self, Self::Error> {
        ensure_has_targets(&raw)?;
        validate_settings(&raw.settings)?;
        let install = validate_install_set(&raw)?;
        let targets = validate_targets(&raw.target)?;
        Ok(Plan::new_unchecked(install, raw.settings, raw.commands, targets))
    }
}

fn ensure_has_targets(raw: &RawPlan) -> Result<()> {
    if raw.target.is_empty() {
        return Err(ParmergeError::ConfigError(
            "plan must contain at least one [target.<id>] section".to_string(),
        ));
    }
    Ok(())
}

/// Check pool sizes and throttling settings.
pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.build_jobs == 0 {
        return Err(ParmergeError::ConfigError(
            "build_jobs must be >= 1 (got 0)".to_string(),
        ));
    }
    if settings.fetch_jobs == 0 {
        return Err(ParmergeError::ConfigError(
            "fetch_jobs must be >= 1 (got 0)".to_string(),
        ));
    }
    if settings.unpack_only && settings.unpack_jobs == 0 {
        return Err(ParmergeError::ConfigError(
            "unpack_only requires unpack_jobs >= 1".to_string(),
        ));
    }
    if let Some(load) = settings.load_average {
        if !(load.is_finite() && load > 0.0) {
            return Err(ParmergeError::ConfigError(format!(
                "load_average must be a positive number (got {load})"
            )));
        }
    }

    Ok(())
}

fn validate_install_set(raw: &RawPlan) -> Result<BTreeSet<TaskId>> {
    match &raw.install {
        None => Ok(raw.target.keys().cloned().collect()),
        Some(install) => {
            for id in install {
                if !raw.target.contains_key(id) {
                    return Err(ParmergeError::ConfigError(format!(
                        "install set names '{id}', which is not in the tree"
                    )));
                }
            }
            Ok(install.iter().cloned().collect())
        }
    }
}

fn validate_targets(raw: &BTreeMap<TaskId, RawTarget>) -> Result<BTreeMap<TaskId, TargetSpec>> {
    let mut next_idx = raw
        .values()
        .filter_map(|t| t.idx)
        .max()
        .map_or(0, |max| max + 1);

    let mut targets = BTreeMap::new();

    for (id, target) in raw.iter() {
        let mut deps = BTreeMap::new();

        for (dep, edge) in target.deps.iter() {
            if dep == id {
                return Err(ParmergeError::ConfigError(format!(
                    "target '{id}' cannot depend on itself"
                )));
            }
            if !raw.contains_key(dep) {
                return Err(ParmergeError::ConfigError(format!(
                    "target '{id}' has unknown dependency '{dep}'"
                )));
            }

            let mut types = Vec::with_capacity(edge.types.len());
            for tag in edge.types.iter() {
                let parsed = tag
                    .parse::<DepType>()
                    .map_err(|_| ParmergeError::UnknownDepType {
                        tail: id.clone(),
                        head: dep.clone(),
                        tag: tag.clone(),
                    })?;
                types.push(parsed);
            }
            deps.insert(dep.clone(), types);
        }

        let idx = match target.idx {
            Some(idx) => idx,
            None => {
                let idx = next_idx;
                next_idx += 1;
                idx
            }
        };

        targets.insert(
            id.clone(),
            TargetSpec {
                action: target.action,
                idx,
                prebuilt: target.prebuilt,
                defines_install_hooks: target.defines_install_hooks,
                deps,
            },
        );
    }

    Ok(targets)
}
