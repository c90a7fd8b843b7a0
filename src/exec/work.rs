// src/exec/work.rs

//! Pluggable work function abstraction.
//!
//! Phase pools call a [`WorkFunction`] for every job instead of knowing what
//! "fetch" or "build" means. This makes it easy to swap in a scripted fake in
//! tests while production uses [`CommandWork`], which runs a shell command
//! template per phase in its own process group.

use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::model::{Commands, Settings};
use crate::errors::{ParmergeError, Result};
use crate::exec::job::WorkItem;
use crate::types::Phase;

pub type WorkFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<i32>> + Send + 'a>>;

/// Trait abstracting how one job's work is performed.
///
/// The implementation writes everything the job prints to `log_path` and
/// resolves to the job's return code (`0` = success). Errors and panics are
/// caught by the pool and turned into a non-zero return code, so they never
/// reach the scheduler.
pub trait WorkFunction: Send + Sync + 'static {
    fn execute<'a>(
        &'a self,
        item: &'a WorkItem,
        log_path: &'a Path,
        cancel: CancellationToken,
    ) -> WorkFuture<'a>;
}

/// Process groups of currently running work processes.
///
/// Each work process leads its own group, so killing the group also reaps
/// anything it spawned.
#[derive(Debug, Clone, Default)]
pub struct ProcessGroups {
    inner: Arc<Mutex<HashSet<u32>>>,
}

impl ProcessGroups {
    fn register(&self, pgid: u32) {
        if let Ok(mut groups) = self.inner.lock() {
            groups.insert(pgid);
        }
    }

    fn unregister(&self, pgid: u32) {
        if let Ok(mut groups) = self.inner.lock() {
            groups.remove(&pgid);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Group ids currently registered.
    pub fn ids(&self) -> Vec<u32> {
        self.inner
            .lock()
            .map(|g| g.iter().copied().collect())
            .unwrap_or_default()
    }

    /// SIGKILL every registered group. Returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        self.ids()
            .into_iter()
            .filter(|pgid| kill_process_group(*pgid).is_ok())
            .count()
    }
}

/// Send SIGKILL to every process in group `pgid`.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pgid out of range"))?;
    // SAFETY: killpg has no memory-safety preconditions.
    let ret = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pgid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process groups are only supported on unix",
    ))
}

/// Production work function: runs `[commands].<phase>` through `sh -c`.
#[derive(Debug, Clone)]
pub struct CommandWork {
    commands: Commands,
    groups: ProcessGroups,
}

impl CommandWork {
    /// Check that every phase this run will use has a command template.
    pub fn new(commands: Commands, settings: &Settings) -> Result<Self> {
        let mut phases = vec![Phase::Fetch];
        if settings.unpack_only {
            phases.push(Phase::Unpack);
        } else {
            phases.push(Phase::Build);
        }

        for phase in phases {
            if commands.template(phase).is_none() {
                return Err(ParmergeError::ConfigError(format!(
                    "[commands].{phase} is required for this run"
                )));
            }
        }

        Ok(Self {
            commands,
            groups: ProcessGroups::default(),
        })
    }

    /// Handle to the process groups of running commands.
    pub fn process_groups(&self) -> ProcessGroups {
        self.groups.clone()
    }

    async fn run(
        &self,
        item: &WorkItem,
        log_path: &Path,
        cancel: CancellationToken,
    ) -> anyhow::Result<i32> {
        let template = self
            .commands
            .template(item.phase)
            .with_context(|| format!("no command configured for the {} phase", item.phase))?;
        let rendered = render(template, item);

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("opening job log {:?}", log_path))?;
        let err_log = log.try_clone().context("duplicating job log handle")?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&rendered)
            .env("PARMERGE_TARGET", &item.target)
            .env("PARMERGE_PHASE", item.phase.to_string())
            .env("PARMERGE_ACTION", item.action.to_string())
            .env("PARMERGE_ATTEMPT", item.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(
            task = %item.target,
            phase = %item.phase,
            cmd = %rendered,
            "spawning work process"
        );

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {} process for '{}'", item.phase, item.target))?;

        let pgid = child.id();
        if let Some(pgid) = pgid {
            self.groups.register(pgid);
        }

        let outcome = tokio::select! {
            status = child.wait() => status
                .map(exit_code)
                .with_context(|| format!("waiting for {} process of '{}'", item.phase, item.target)),

            _ = cancel.cancelled() => {
                info!(
                    task = %item.target,
                    phase = %item.phase,
                    "run cancelled; killing work process group"
                );
                if let Some(pgid) = pgid {
                    if let Err(e) = kill_process_group(pgid) {
                        warn!(pgid, error = %e, "failed to kill process group");
                    }
                }
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "work process already gone");
                }
                Ok(-1)
            }
        };

        if let Some(pgid) = pgid {
            self.groups.unregister(pgid);
        }

        outcome
    }
}

impl WorkFunction for CommandWork {
    fn execute<'a>(
        &'a self,
        item: &'a WorkItem,
        log_path: &'a Path,
        cancel: CancellationToken,
    ) -> WorkFuture<'a> {
        Box::pin(self.run(item, log_path, cancel))
    }
}

/// Substitute `{target}`, `{action}` and `{phase}` in a command template.
pub fn render(template: &str, item: &WorkItem) -> String {
    template
        .replace("{target}", &item.target)
        .replace("{action}", &item.action.to_string())
        .replace("{phase}", &item.phase.to_string())
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
