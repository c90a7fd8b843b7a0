// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParmergeError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown dependency type '{tag}' on edge {tail} -> {head}")]
    UnknownDepType {
        tail: String,
        head: String,
        tag: String,
    },

    #[error("Deadlock: {} task(s) can never be scheduled: {}", stuck.len(), stuck.join(", "))]
    Deadlock { stuck: Vec<String> },

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ParmergeError>;
