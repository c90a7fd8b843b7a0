// src/exec/pool.rs

//! Fixed-size worker pool for one phase.
//!
//! Workers share a single job queue. Each worker pulls a [`WorkItem`], runs
//! the [`WorkFunction`] for it with output going to a private temp log, and
//! reports two [`JobState`] events on the shared completion queue: one when
//! the job starts and one when it finishes.
//!
//! A single [`PoolMessage::Shutdown`] stops the whole pool: every worker that
//! sees it puts it back before exiting, so all of them eventually see it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{ParmergeError, Result};
use crate::exec::job::{JobState, WorkItem};
use crate::exec::work::WorkFunction;
use crate::types::Phase;

/// Return code reported when the work function errors or panics.
pub const WORK_ERROR_RETCODE: i32 = -1;

/// Message on a pool's job queue.
#[derive(Debug, Clone)]
pub enum PoolMessage {
    Job(WorkItem),
    Shutdown,
}

/// Everything a worker needs besides its queue.
#[derive(Clone)]
pub struct PoolContext {
    pub work: Arc<dyn WorkFunction>,
    pub events: mpsc::UnboundedSender<JobState>,
    pub cancel: CancellationToken,
    /// Directory for job logs; the system temp dir when `None`.
    pub log_dir: Option<PathBuf>,
}

/// Pool of `size` workers for `phase`.
pub struct PhaseWorkerPool {
    phase: Phase,
    size: usize,
    tx: mpsc::Sender<PoolMessage>,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for PhaseWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseWorkerPool")
            .field("phase", &self.phase)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl PhaseWorkerPool {
    /// Spawn `size` workers on the current Tokio runtime.
    pub fn spawn(phase: Phase, size: usize, ctx: PoolContext) -> Self {
        // The scheduler never has more than `size` jobs in flight per pool;
        // the extra room is for the shutdown pill.
        let (tx, rx) = mpsc::channel::<PoolMessage>(size + 2);
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..size)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    phase,
                    Arc::clone(&rx),
                    tx.clone(),
                    ctx.clone(),
                ))
            })
            .collect();

        info!(phase = %phase, size, "worker pool started");

        Self {
            phase,
            size,
            tx,
            handles,
        }
    }

    /// Queue a job for the next idle worker.
    pub async fn submit(&self, item: WorkItem) -> Result<()> {
        self.tx
            .send(PoolMessage::Job(item))
            .await
            .map_err(|_| ParmergeError::Other(anyhow::anyhow!("{} pool is closed", self.phase)))
    }

    /// Send one shutdown pill and wait for every worker to exit.
    pub async fn shutdown(self) {
        if self.tx.send(PoolMessage::Shutdown).await.is_err() {
            debug!(phase = %self.phase, "pool queue already closed");
        }
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(phase = %self.phase, error = %e, "worker task ended abnormally");
            }
        }
        debug!(phase = %self.phase, "worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    phase: Phase,
    rx: Arc<Mutex<mpsc::Receiver<PoolMessage>>>,
    tx: mpsc::Sender<PoolMessage>,
    ctx: PoolContext,
) {
    debug!(phase = %phase, worker_id, "worker started");

    loop {
        let msg = {
            let mut queue = rx.lock().await;
            tokio::select! {
                msg = queue.recv() => msg,
                _ = ctx.cancel.cancelled() => None,
            }
        };

        match msg {
            Some(PoolMessage::Job(item)) => run_job(&ctx, item).await,
            Some(PoolMessage::Shutdown) => {
                if tx.try_send(PoolMessage::Shutdown).is_err() {
                    debug!(phase = %phase, worker_id, "could not pass shutdown on");
                }
                break;
            }
            None => break,
        }
    }

    debug!(phase = %phase, worker_id, "worker exiting");
}

async fn run_job(ctx: &PoolContext, item: WorkItem) {
    let log_path = match create_log(ctx.log_dir.as_deref(), &item) {
        Ok(path) => path,
        Err(e) => {
            error!(task = %item.target, phase = %item.phase, error = %e, "cannot create job log");
            let now = Utc::now();
            let started = JobState::started(&item, PathBuf::new(), now);
            send_event(ctx, started.clone());
            send_event(ctx, started.finished(WORK_ERROR_RETCODE, Utc::now()));
            return;
        }
    };

    let started = JobState::started(&item, log_path.clone(), Utc::now());
    send_event(ctx, started.clone());

    // Run the work on its own task so a panic is contained to this job.
    let work = Arc::clone(&ctx.work);
    let cancel = ctx.cancel.clone();
    let job_item = item.clone();
    let job_log = log_path.clone();
    let joined = tokio::spawn(async move { work.execute(&job_item, &job_log, cancel).await }).await;

    let retcode = match joined {
        Ok(Ok(code)) => code,
        Ok(Err(err)) => {
            warn!(task = %item.target, phase = %item.phase, error = %err, "work function failed");
            append_to_log(&log_path, &format!("parmerge: {} failed: {err:#}\n", item.phase)).await;
            WORK_ERROR_RETCODE
        }
        Err(join_err) => {
            let reason = panic_message(join_err);
            error!(task = %item.target, phase = %item.phase, %reason, "work function panicked");
            append_to_log(&log_path, &format!("parmerge: {} panicked: {reason}\n", item.phase)).await;
            WORK_ERROR_RETCODE
        }
    };

    send_event(ctx, started.finished(retcode, Utc::now()));
}

fn send_event(ctx: &PoolContext, state: JobState) {
    if ctx.events.send(state).is_err() {
        debug!("scheduler stopped listening for job events");
    }
}

fn create_log(dir: Option<&Path>, item: &WorkItem) -> std::io::Result<PathBuf> {
    let prefix = format!("{}-{}-", item.phase, sanitize(&item.target));
    let dir = dir.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
    let file = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".log")
        .tempfile_in(dir)?;
    let (_file, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

fn sanitize(target: &str) -> String {
    target
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

async fn append_to_log(path: &Path, text: &str) {
    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await
    }
    .await;

    if let Err(e) = result {
        warn!(log = ?path, error = %e, "could not write to job log");
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
