// src/engine/runtime.rs

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{ParmergeError, Result};
use crate::exec::job::JobState;
use crate::exec::loadavg::load_average;
use crate::exec::pool::{PhaseWorkerPool, PoolContext};
use crate::exec::work::WorkFunction;
use crate::types::Phase;

use super::core::{CoreCommand, LogClose, SchedulerCore};
use super::output::{OutputHandle, OutputMessage, OutputWorker};
use super::report::{write_failure_file, EventLog, RunSummary};

/// IO-side settings of a run.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long to wait for a job event before running periodic checks.
    pub tick: Duration,
    /// Upper bound on waiting for workers after cancellation.
    pub shutdown_grace: Duration,
    /// Directory for job logs; the system temp dir when `None`.
    pub log_dir: Option<PathBuf>,
    pub event_log: Option<PathBuf>,
    pub failure_file: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
            log_dir: None,
            event_log: None,
            failure_file: None,
        }
    }
}

/// Drives [`SchedulerCore`] from job events and timer ticks, and carries
/// out its commands against the phase pools and the output worker.
///
/// All scheduling semantics live in the core; this type only moves data
/// between channels, pools, the terminal and the filesystem.
pub struct Runtime {
    core: SchedulerCore,
    events_rx: mpsc::UnboundedReceiver<JobState>,
    pools: BTreeMap<Phase, PhaseWorkerPool>,
    output: OutputWorker,
    out: OutputHandle,
    event_log: Option<EventLog>,
    cancel: CancellationToken,
    config: RuntimeConfig,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("pools", &self.pools)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Spawn the phase pools this run needs and wire them to the core.
    pub fn new(
        core: SchedulerCore,
        work: Arc<dyn WorkFunction>,
        output: OutputWorker,
        cancel: CancellationToken,
        config: RuntimeConfig,
    ) -> Result<Self> {
        let event_log = config.event_log.as_deref().map(EventLog::create).transpose()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = PoolContext {
            work,
            events: events_tx,
            cancel: cancel.clone(),
            log_dir: config.log_dir.clone(),
        };

        let mut pools = BTreeMap::new();
        for phase in Phase::ALL {
            let size = core.capacity(phase);
            if size > 0 {
                pools.insert(phase, PhaseWorkerPool::spawn(phase, size, ctx.clone()));
            }
        }

        let out = output.handle();
        Ok(Self {
            core,
            events_rx,
            pools,
            output,
            out,
            event_log,
            cancel,
            config,
        })
    }

    /// Run until the graph drains, a failure ends the run, the scheduler
    /// deadlocks, or the run is cancelled.
    pub async fn run(mut self) -> Result<RunSummary> {
        info!(pools = self.pools.len(), "parmerge runtime started");

        match self.drive().await {
            Ok(()) => self.finish().await,
            Err(ParmergeError::Cancelled) => self.abort().await,
            Err(e) => {
                self.shutdown_pools().await;
                self.output.close().await;
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let seeded = self.core.seed();
        self.execute(seeded).await?;
        let initial = self.core.schedule(current_load())?;
        self.execute(initial).await?;

        let cancel = self.cancel.clone();
        loop {
            if self.core.is_done() {
                return Ok(());
            }

            let commands = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ParmergeError::Cancelled),
                received = tokio::time::timeout(self.config.tick, self.events_rx.recv()) => {
                    match received {
                        Ok(Some(job)) => {
                            debug!(task = %job.target, phase = %job.phase, done = job.done, "job event");
                            let mut commands = self.core.handle_event(job, Utc::now());
                            commands.extend(self.core.schedule(current_load())?);
                            commands
                        }
                        Ok(None) => {
                            return Err(ParmergeError::Other(anyhow::anyhow!(
                                "job event channel closed while work was outstanding"
                            )));
                        }
                        Err(_) => self.core.tick(Utc::now(), load_average())?,
                    }
                }
            };

            self.execute(commands).await?;
        }
    }

    async fn execute(&mut self, commands: Vec<CoreCommand>) -> Result<()> {
        for command in commands {
            match command {
                CoreCommand::Dispatch(item) => {
                    let pool = self.pools.get(&item.phase).ok_or_else(|| {
                        ParmergeError::Other(anyhow::anyhow!("no {} pool for {}", item.phase, item.target))
                    })?;
                    pool.submit(item).await?;
                }
                other => self.emit(other),
            }
        }
        Ok(())
    }

    /// Carry out a command that does not start work.
    fn emit(&mut self, command: CoreCommand) {
        match command {
            CoreCommand::Dispatch(item) => {
                debug!(task = %item.target, phase = %item.phase, "not dispatching during shutdown");
            }
            CoreCommand::Print(line) => self.out.line(line),
            CoreCommand::FlushLog {
                path,
                header,
                close,
            } => self.out.send(OutputMessage::Log {
                path,
                header,
                close,
            }),
            CoreCommand::DiscardLog(path) => self.out.send(OutputMessage::Discard(path)),
            CoreCommand::Record(state) => {
                if let Some(log) = self.event_log.as_mut() {
                    if let Err(e) = log.record(&state) {
                        warn!(path = %log.path().display(), error = %e, "failed to write event log");
                    }
                }
            }
        }
    }

    async fn finish(mut self) -> Result<RunSummary> {
        let summary = self.core.summary(Utc::now());
        for line in summary.lines() {
            self.out.line(line);
        }

        self.shutdown_pools().await;
        self.write_failures(&summary);
        self.output.close().await;

        info!(
            completed = summary.completed,
            failed = summary.failed.len(),
            "parmerge runtime finished"
        );
        Ok(summary)
    }

    /// Cancellation path: wait for workers to kill their jobs, account for
    /// events already in flight, then print whatever the running jobs had
    /// written and remove their logs.
    async fn abort(mut self) -> Result<RunSummary> {
        warn!("run cancelled; stopping workers");

        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, self.shutdown_pools()).await.is_err() {
            warn!(?grace, "workers did not stop in time");
        }

        // Finish events of killed jobs are recorded but not applied: their
        // logs are still reported as running and flushed below.
        while let Ok(job) = self.events_rx.try_recv() {
            if job.done {
                self.emit(CoreCommand::Record(job));
                continue;
            }
            for command in self.core.handle_event(job, Utc::now()) {
                if matches!(command, CoreCommand::Record(_)) {
                    self.emit(command);
                }
            }
        }

        for path in self.core.running_logs() {
            self.out.send(OutputMessage::Log {
                header: Some(format!("=== partial output of {} ===", path.display())),
                path,
                close: LogClose::Unlink,
            });
        }
        self.out.line("Exiting on signal");

        let summary = self.core.summary(Utc::now());
        self.write_failures(&summary);
        self.output.close().await;

        Err(ParmergeError::Cancelled)
    }

    async fn shutdown_pools(&mut self) {
        let pools = std::mem::take(&mut self.pools);
        for (_, pool) in pools {
            pool.shutdown().await;
        }
    }

    fn write_failures(&self, summary: &RunSummary) {
        let Some(path) = self.config.failure_file.as_deref() else {
            return;
        };
        match write_failure_file(path, &summary.failed) {
            Ok(()) => debug!(path = %path.display(), "failure file written"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to write failure file"),
        }
    }
}

fn current_load() -> Option<f64> {
    load_average().map(|l| l[0])
}
