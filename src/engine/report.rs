// src/engine/report.rs

//! End-of-run reporting: the run summary, the JSON failure file and the
//! JSONL event log.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::errors::Result;
use crate::exec::job::{format_elapsed, JobState};
use crate::types::{Phase, TaskId};

/// A task that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTask {
    pub target: TaskId,
    pub phase: Phase,
    pub retcode: i32,
    pub attempts: u32,
    /// The failing attempt's log, kept on disk.
    pub log: PathBuf,
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub completed: usize,
    pub total: usize,
    pub failed: Vec<FailedTask>,
    pub elapsed: chrono::Duration,
}

impl RunSummary {
    /// Summary for a run that scheduled nothing (dry runs).
    pub fn empty(total: usize) -> Self {
        Self {
            completed: 0,
            total,
            failed: Vec::new(),
            elapsed: chrono::Duration::zero(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Human-readable lines printed once the run is over.
    pub fn lines(&self) -> Vec<String> {
        let elapsed = format_elapsed(self.elapsed);

        if self.failed.is_empty() {
            return vec![format!(
                "Completed {}/{} task(s) in {elapsed}",
                self.completed, self.total
            )];
        }

        let mut lines = vec![format!(
            "Completed {}/{} task(s) in {elapsed}; {} failed:",
            self.completed,
            self.total,
            self.failed.len()
        )];
        for f in &self.failed {
            lines.push(format!(
                "  {} ({} failed with retcode {} after {} attempt(s)); log: {}",
                f.target,
                f.phase,
                f.retcode,
                f.attempts,
                f.log.display()
            ));
        }
        lines
    }
}

/// Write `failed` as a pretty JSON array to `path`.
pub fn write_failure_file(path: &Path, failed: &[FailedTask]) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut file, failed)?;
    writeln!(file)?;
    file.flush()?;
    Ok(())
}

/// Append-only JSONL log of every job state event.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl EventLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, state: &JobState) -> Result<()> {
        serde_json::to_writer(&mut self.writer, state)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
