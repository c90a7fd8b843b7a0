//! Plan loading and validation for parmerge.
//!
//! Responsibilities:
//! - Define the serde-backed data model (`model.rs`).
//! - Load a plan file from disk (`loader.rs`).
//! - Validate tags, references and settings (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path};
pub use model::{Commands, Plan, RawDep, RawPlan, RawTarget, Settings, TargetSpec};
pub use validate::validate_settings;
