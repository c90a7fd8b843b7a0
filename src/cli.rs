// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::model::Settings;

/// Command-line arguments for `parmerge`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "parmerge",
    version,
    about = "Fetch, build and install a resolved dependency tree in parallel.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the plan file produced by the resolver (TOML or JSON).
    #[arg(long, value_name = "PATH", default_value = "plan.toml")]
    pub plan: PathBuf,

    /// Number of parallel build/install jobs.
    #[arg(short = 'j', long, value_name = "N")]
    pub jobs: Option<usize>,

    /// Number of parallel fetch jobs.
    #[arg(long, value_name = "N")]
    pub fetch_jobs: Option<usize>,

    /// Number of parallel unpack jobs (0 disables the unpack pool).
    #[arg(long, value_name = "N")]
    pub unpack_jobs: Option<usize>,

    /// How many times a failed target is retried before giving up.
    #[arg(long, value_name = "N")]
    pub max_retries: Option<u32>,

    /// Throttle new builds to one while the 1-minute load average exceeds this.
    #[arg(long, value_name = "LOAD")]
    pub load_average: Option<f64>,

    /// Fetch and unpack every target instead of building it.
    #[arg(long)]
    pub unpack_only: bool,

    /// Treat prebuilt artifacts as available (`optional` edges stop blocking).
    #[arg(long)]
    pub use_prebuilt: bool,

    /// Stream job output while jobs are running.
    #[arg(long)]
    pub show_output: bool,

    /// Append one JSON line per job event to this file.
    #[arg(long, value_name = "PATH")]
    pub event_log: Option<PathBuf>,

    /// Write the final failure list (JSON) to this file.
    #[arg(long, value_name = "PATH")]
    pub failure_file: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `PARMERGE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Build the task graph, break cycles and print it without running anything.
    #[arg(long)]
    pub dry_run: bool,
}

impl CliArgs {
    /// Layer command-line flags over the plan's `[settings]` section.
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(n) = self.jobs {
            settings.build_jobs = n;
        }
        if let Some(n) = self.fetch_jobs {
            settings.fetch_jobs = n;
        }
        if let Some(n) = self.unpack_jobs {
            settings.unpack_jobs = n;
        }
        if let Some(n) = self.max_retries {
            settings.max_retries = n;
        }
        if let Some(load) = self.load_average {
            settings.load_average = Some(load);
        }
        settings.unpack_only |= self.unpack_only;
        settings.use_prebuilt |= self.use_prebuilt;
        settings.show_output |= self.show_output;
    }
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
