// src/config/loader.rs

use std::fs;
use std::path::Path;

use crate::config::model::{Plan, RawPlan};
use crate::errors::Result;

/// Load a plan file and return the raw, unvalidated `RawPlan`.
///
/// Files ending in `.json` are parsed as JSON; everything else as TOML.
/// Use [`load_and_validate`] to also run semantic validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawPlan> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let plan: RawPlan = if is_json {
        serde_json::from_str(&contents)?
    } else {
        toml::from_str(&contents)?
    };

    Ok(plan)
}

/// Load a plan from path and validate it.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<Plan> {
    let raw = load_from_path(&path)?;
    let plan = Plan::try_from(raw)?;
    Ok(plan)
}
