// src/engine/core.rs

//! Pure scheduler state machine.
//!
//! [`SchedulerCore`] consumes [`JobState`] events and clock ticks and
//! produces [`CoreCommand`]s describing what the IO shell should do next:
//! dispatch work to a phase pool, print a line, flush a job log, or record
//! an event.
//!
//! The async shell (`engine::runtime::Runtime`) owns the channels, pools,
//! output worker and signal handling. The core has no Tokio types and does
//! no IO, so it can be unit tested by feeding events directly.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::model::Settings;
use crate::dag::{ScoredReadyQueue, TaskGraph};
use crate::errors::{ParmergeError, Result};
use crate::exec::job::{format_elapsed, JobState, WorkItem};
use crate::types::{Action, Phase, TaskId};

use super::report::{FailedTask, RunSummary};

/// What the output worker should do with a log after flushing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogClose {
    /// The job is still running; remember the offset.
    KeepOpen,
    /// Final flush; keep the file on disk.
    Keep,
    /// Final flush; delete the file.
    Unlink,
}

/// Instruction from the core to the IO shell.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreCommand {
    /// Submit to the pool for `item.phase`.
    Dispatch(WorkItem),
    /// Print one status line.
    Print(String),
    /// Print unread log output, optionally preceded by `header`.
    FlushLog {
        path: PathBuf,
        header: Option<String>,
        close: LogClose,
    },
    /// Delete a log without printing it.
    DiscardLog(PathBuf),
    /// Append to the event log.
    Record(JobState),
}

/// Scheduling knobs taken from [`Settings`].
#[derive(Debug, Clone)]
pub struct CoreOptions {
    pub fetch_jobs: usize,
    pub build_jobs: usize,
    pub unpack_jobs: usize,
    pub max_retries: u32,
    pub load_average: Option<f64>,
    pub unpack_only: bool,
    pub show_output: bool,
    pub status_interval: chrono::Duration,
    pub notify_interval: chrono::Duration,
}

impl CoreOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let (build_jobs, unpack_jobs) = if settings.unpack_only {
            (0, settings.unpack_jobs)
        } else {
            (settings.build_jobs, 0)
        };

        Self {
            fetch_jobs: settings.fetch_jobs,
            build_jobs,
            unpack_jobs,
            max_retries: settings.max_retries,
            load_average: settings.load_average,
            unpack_only: settings.unpack_only,
            show_output: settings.show_output,
            status_interval: seconds(settings.status_interval_secs),
            notify_interval: seconds(settings.notify_interval_secs),
        }
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000))
}

#[derive(Debug)]
struct RunningJob {
    state: JobState,
    last_notify: DateTime<Utc>,
}

/// Ready queue, in-flight jobs and capacity of one phase.
#[derive(Debug)]
struct PhaseSlots {
    ready: ScoredReadyQueue,
    /// Dispatched jobs; `None` until the worker reports the start.
    running: BTreeMap<TaskId, Option<RunningJob>>,
    capacity: usize,
}

impl PhaseSlots {
    fn new(capacity: usize) -> Self {
        Self {
            ready: ScoredReadyQueue::new(),
            running: BTreeMap::new(),
            capacity,
        }
    }

    fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.running.is_empty()
    }

    /// `running/queued`, where queued counts running and ready jobs.
    fn progress(&self) -> String {
        let running = self.running.len();
        format!("{running}/{}", running + self.ready.len())
    }
}

/// Scheduler state: the task graph plus per-phase queues and bookkeeping.
#[derive(Debug)]
pub struct SchedulerCore {
    graph: TaskGraph,
    options: CoreOptions,
    fetch: PhaseSlots,
    build: PhaseSlots,
    unpack: PhaseSlots,
    /// Tasks whose fetch succeeded (or that never needed one).
    fetched: HashSet<TaskId>,
    /// Tasks that have entered the build-ready queue at least once.
    build_scheduled: HashSet<TaskId>,
    retry_queue: VecDeque<(TaskId, Phase)>,
    failed: Vec<FailedTask>,
    finished: Vec<TaskId>,
    total: usize,
    started_at: DateTime<Utc>,
    last_output: DateTime<Utc>,
}

impl SchedulerCore {
    pub fn new(graph: TaskGraph, options: CoreOptions, now: DateTime<Utc>) -> Self {
        let total = graph.len();
        Self {
            fetch: PhaseSlots::new(options.fetch_jobs),
            build: PhaseSlots::new(options.build_jobs),
            unpack: PhaseSlots::new(options.unpack_jobs),
            graph,
            options,
            fetched: HashSet::new(),
            build_scheduled: HashSet::new(),
            retry_queue: VecDeque::new(),
            failed: Vec::new(),
            finished: Vec::new(),
            total,
            started_at: now,
            last_output: now,
        }
    }

    /// Queue every merge for fetching. Tasks that never fetch are marked
    /// fetched and promoted straight away.
    pub fn seed(&mut self) -> Vec<CoreCommand> {
        let mut commands = Vec::new();

        let mut no_fetch = Vec::new();
        for task in self.graph.tasks() {
            match task.action {
                Action::Merge => {
                    self.fetch.ready.push(task);
                }
                Action::Nomerge | Action::Uninstall => no_fetch.push(task.id.clone()),
            }
        }

        info!(
            tasks = self.total,
            fetch_ready = self.fetch.ready.len(),
            "scheduler seeded"
        );

        for id in no_fetch {
            self.fetched.insert(id.clone());
            self.promote(&id, &mut commands);
        }

        commands
    }

    /// Apply a job state event reported by a pool.
    pub fn handle_event(&mut self, job: JobState, now: DateTime<Utc>) -> Vec<CoreCommand> {
        let mut commands = vec![CoreCommand::Record(job.clone())];

        if !job.done {
            self.job_started(job, now, &mut commands);
            return commands;
        }

        if self.slots_mut(job.phase).running.remove(&job.target).is_none() {
            warn!(task = %job.target, phase = %job.phase, "completion for a job that is not running; ignoring");
            return commands;
        }

        let elapsed = format_elapsed(job.elapsed(now));
        debug!(task = %job.target, phase = %job.phase, retcode = ?job.retcode, %elapsed, "job finished");

        match job.phase {
            Phase::Fetch => self.fetch_finished(&job, now, &mut commands),
            Phase::Build | Phase::Unpack if job.succeeded() => {
                let verb = if job.phase == Phase::Build {
                    "Completed"
                } else {
                    "Unpacked"
                };
                self.print(
                    &mut commands,
                    now,
                    format!("{verb} {} (in {elapsed})", job.display_name),
                );
                self.close_log(&job, &mut commands);
                self.finish(&job.target, &mut commands);
            }
            Phase::Build | Phase::Unpack => {
                commands.push(CoreCommand::FlushLog {
                    path: job.log_path.clone(),
                    header: Some(failure_header(&job)),
                    close: LogClose::Keep,
                });
                self.job_failed(&job, now, &mut commands);
            }
        }

        commands
    }

    /// Fill every pool up to its capacity.
    ///
    /// `load` is the one-minute load average; above the configured ceiling
    /// at most one build runs. When nothing is running or ready, the head
    /// of the retry queue is re-dispatched; failing that, a non-empty graph
    /// with no recorded failures is a deadlock.
    pub fn schedule(&mut self, load: Option<f64>) -> Result<Vec<CoreCommand>> {
        let mut commands = Vec::new();

        let build_cap = match (self.options.load_average, load) {
            (Some(ceiling), Some(current)) if current > ceiling => {
                debug!(current, ceiling, "load above ceiling; throttling builds");
                self.build.capacity.min(1)
            }
            _ => self.build.capacity,
        };

        self.fill(Phase::Fetch, self.fetch.capacity, &mut commands);
        self.fill(Phase::Build, build_cap, &mut commands);
        self.fill(Phase::Unpack, self.unpack.capacity, &mut commands);

        if self.is_idle() {
            if let Some((id, phase)) = self.retry_queue.pop_front() {
                self.requeue(&id, phase);
                let cap = self.slots(phase).capacity;
                self.fill(phase, cap, &mut commands);
            } else if !self.graph.is_empty() && self.failed.is_empty() {
                let stuck: Vec<String> = self.graph.ids().map(str::to_string).collect();
                error!(stuck = stuck.len(), "no task can make progress");
                return Err(ParmergeError::Deadlock { stuck });
            }
        }

        Ok(commands)
    }

    /// Periodic housekeeping between events: scheduling under the current
    /// load, "still running" notices and the status line.
    pub fn tick(&mut self, now: DateTime<Utc>, load: Option<[f64; 3]>) -> Result<Vec<CoreCommand>> {
        let mut commands = self.schedule(load.map(|l| l[0]))?;

        self.notify_running(now, &mut commands);

        if now - self.last_output >= self.options.status_interval {
            let line = self.status_line(now, load);
            self.print(&mut commands, now, line);
        }

        Ok(commands)
    }

    /// True once nothing else can happen: the graph drained, or every
    /// remaining task is stuck behind a recorded failure.
    pub fn is_done(&self) -> bool {
        self.is_idle()
            && self.retry_queue.is_empty()
            && (self.graph.is_empty() || !self.failed.is_empty())
    }

    /// Logs of jobs whose start has been reported but not their finish.
    pub fn running_logs(&self) -> Vec<PathBuf> {
        Phase::ALL
            .iter()
            .flat_map(|phase| self.slots(*phase).running.values())
            .flatten()
            .map(|job| job.state.log_path.clone())
            .collect()
    }

    pub fn summary(&self, now: DateTime<Utc>) -> RunSummary {
        RunSummary {
            completed: self.finished.len(),
            total: self.total,
            failed: self.failed.clone(),
            elapsed: now - self.started_at,
        }
    }

    pub fn status_line(&self, now: DateTime<Utc>, load: Option<[f64; 3]>) -> String {
        let building = self.build.running.len() + self.unpack.running.len();
        let mut parts = vec![format!(
            "Pending {}/{}",
            self.graph.len().saturating_sub(building),
            self.total
        )];

        parts.push(format!("Fetching {}", self.fetch.progress()));
        if self.options.unpack_only {
            parts.push(format!("Unpacking {}", self.unpack.progress()));
        } else {
            parts.push(format!("Building {}", self.build.progress()));
        }
        if !self.retry_queue.is_empty() {
            parts.push(format!("Retrying {}", self.retry_queue.len()));
        }

        let mut info = vec![
            format!("Time {}", now.format("%H:%M:%S")),
            format!("Elapsed {}", format_elapsed(now - self.started_at)),
        ];
        if let Some([one, five, fifteen]) = load {
            info.push(format!("Load {one:.2} {five:.2} {fifteen:.2}"));
        }

        format!("{}, [{}]", parts.join(", "), info.join(" | "))
    }

    /// Pool size for `phase`; zero when the run does not use it.
    pub fn capacity(&self, phase: Phase) -> usize {
        self.slots(phase).capacity
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn failed(&self) -> &[FailedTask] {
        &self.failed
    }

    /// Task ids in the order they finished.
    pub fn finished(&self) -> &[TaskId] {
        &self.finished
    }

    pub fn retry_len(&self) -> usize {
        self.retry_queue.len()
    }

    pub fn running_count(&self, phase: Phase) -> usize {
        self.slots(phase).running.len()
    }

    pub fn ready_len(&self, phase: Phase) -> usize {
        self.slots(phase).ready.len()
    }

    pub fn is_fetched(&self, id: &str) -> bool {
        self.fetched.contains(id)
    }

    /// Mark `target` done and release its dependents.
    ///
    /// Runs as a work list: dependents left with no needs that are
    /// `nomerge` finish in the same call, everything else is promoted.
    /// A `nodeps` task that still has needs becomes `nomerge` and stays in
    /// the graph until they clear. Calling it for a task already removed
    /// is a no-op.
    pub fn finish(&mut self, target: &str, commands: &mut Vec<CoreCommand>) {
        let mut work = VecDeque::from([target.to_string()]);
        let mut released_any = false;

        while let Some(id) = work.pop_front() {
            let Some(task) = self.graph.get(&id) else {
                continue;
            };

            if !self.options.unpack_only && task.nodeps && !task.needs.is_empty() {
                debug!(task = %id, needs = task.needs.len(), "installed ahead of its dependencies");
                if let Some(task) = self.graph.get_mut(&id) {
                    task.action = Action::Nomerge;
                }
                continue;
            }

            let provides: Vec<TaskId> = task.provides.iter().cloned().collect();
            let mut promote = Vec::new();

            for dep in provides {
                let Some(dependent) = self.graph.get_mut(&dep) else {
                    continue;
                };
                if dependent.needs.remove(&id).is_none() {
                    continue;
                }
                released_any = true;
                if !dependent.needs.is_empty() || self.options.unpack_only {
                    continue;
                }
                if dependent.action == Action::Nomerge {
                    work.push_back(dep);
                } else {
                    promote.push(dep);
                }
            }

            self.graph.remove(&id);
            self.build_scheduled.remove(&id);
            self.fetched.remove(&id);
            self.finished.push(id.clone());
            debug!(task = %id, remaining = self.graph.len(), "task finished");

            for dep in promote {
                self.promote(&dep, commands);
            }
        }

        if released_any {
            self.fetch.ready.rescore(&self.graph);
            self.build.ready.rescore(&self.graph);
        }
    }

    fn job_started(&mut self, job: JobState, now: DateTime<Utc>, commands: &mut Vec<CoreCommand>) {
        if job.phase != Phase::Fetch {
            self.print(
                commands,
                now,
                format!(
                    "Started {} (logged in {})",
                    job.display_name,
                    job.log_path.display()
                ),
            );
        }

        match self.slots_mut(job.phase).running.get_mut(&job.target) {
            Some(slot) => {
                *slot = Some(RunningJob {
                    state: job,
                    last_notify: now,
                });
            }
            None => {
                warn!(task = %job.target, phase = %job.phase, "start reported for a job that was not dispatched");
            }
        }
    }

    fn fetch_finished(&mut self, job: &JobState, now: DateTime<Utc>, commands: &mut Vec<CoreCommand>) {
        if self.options.unpack_only {
            if job.succeeded() {
                self.close_log(job, commands);
                self.fetched.insert(job.target.clone());
                if let Some(task) = self.graph.get(&job.target) {
                    self.unpack.ready.push(task);
                }
            } else {
                commands.push(CoreCommand::FlushLog {
                    path: job.log_path.clone(),
                    header: Some(failure_header(job)),
                    close: LogClose::Keep,
                });
                let attempts = self
                    .graph
                    .get(&job.target)
                    .map_or(1, |t| t.try_count.saturating_add(1));
                self.give_up(job, attempts, now, commands);
            }
            return;
        }

        if job.succeeded() {
            self.close_log(job, commands);
        } else {
            self.print(
                commands,
                now,
                format!(
                    "Failed to fetch {}; the build will fetch it again",
                    job.display_name
                ),
            );
            commands.push(CoreCommand::FlushLog {
                path: job.log_path.clone(),
                header: Some(failure_header(job)),
                close: LogClose::Unlink,
            });
        }

        self.fetched.insert(job.target.clone());
        self.promote(&job.target, commands);
    }

    fn job_failed(&mut self, job: &JobState, now: DateTime<Utc>, commands: &mut Vec<CoreCommand>) {
        let max_retries = self.options.max_retries;
        let Some(task) = self.graph.get_mut(&job.target) else {
            return;
        };

        if task.try_count < max_retries {
            task.try_count += 1;
            let attempt = task.try_count.saturating_add(1);
            self.retry_queue.push_back((job.target.clone(), job.phase));
            self.print(
                commands,
                now,
                format!(
                    "Failed {}. Will retry later (attempt {attempt} of {}).",
                    job.display_name,
                    max_retries.saturating_add(1)
                ),
            );
            return;
        }

        let attempts = task.try_count.saturating_add(1);
        self.give_up(job, attempts, now, commands);
    }

    /// Record a terminal failure. Dependents stay blocked behind it.
    fn give_up(&mut self, job: &JobState, attempts: u32, now: DateTime<Utc>, commands: &mut Vec<CoreCommand>) {
        let retcode = job.retcode.unwrap_or(-1);
        error!(task = %job.target, phase = %job.phase, retcode, attempts, "giving up");

        if !self.failed.iter().any(|f| f.target == job.target) {
            self.failed.push(FailedTask {
                target: job.target.clone(),
                phase: job.phase,
                retcode,
                attempts,
                log: job.log_path.clone(),
            });
        }
        self.print(
            commands,
            now,
            format!(
                "Failed {} after {attempts} attempt(s). Log kept at {}",
                job.display_name,
                job.log_path.display()
            ),
        );
    }

    /// Move a fetched task forward: into the build-ready queue once its
    /// needs allow, or straight to finish for `nomerge`.
    fn promote(&mut self, id: &str, commands: &mut Vec<CoreCommand>) {
        let Some(task) = self.graph.get(id) else {
            return;
        };
        if !self.fetched.contains(id) {
            return;
        }

        if self.options.unpack_only {
            if task.action != Action::Merge {
                self.finish(id, commands);
            }
            return;
        }

        match task.action {
            Action::Nomerge => {
                if task.needs.is_empty() {
                    self.finish(id, commands);
                }
            }
            Action::Merge | Action::Uninstall => {
                if task.build_unblocked() && self.build_scheduled.insert(id.to_string()) {
                    self.build.ready.push(task);
                }
            }
        }
    }

    /// Put a task taken from the retry queue back into its phase's queue.
    fn requeue(&mut self, id: &str, phase: Phase) {
        let Some(task) = self.graph.get(id) else {
            return;
        };
        info!(task = %id, %phase, attempt = task.try_count.saturating_add(1), "retrying");
        match phase {
            Phase::Unpack => self.unpack.ready.push(task),
            Phase::Fetch | Phase::Build => self.build.ready.push(task),
        };
    }

    fn fill(&mut self, phase: Phase, cap: usize, commands: &mut Vec<CoreCommand>) {
        loop {
            let slots = self.slots_mut(phase);
            if slots.running.len() >= cap {
                break;
            }
            let Some(id) = slots.ready.pop() else {
                break;
            };

            let Some(item) = self.work_item(&id, phase) else {
                debug!(task = %id, %phase, "dropping stale ready entry");
                continue;
            };

            self.slots_mut(phase).running.insert(id, None);
            debug!(task = %item.target, %phase, attempt = item.attempt, "dispatching");
            commands.push(CoreCommand::Dispatch(item));
        }
    }

    /// The item to dispatch for `id`, or `None` when the entry no longer
    /// qualifies for `phase`.
    fn work_item(&self, id: &str, phase: Phase) -> Option<WorkItem> {
        let task = self.graph.get(id)?;
        if self.slots(phase).running.contains_key(id) {
            return None;
        }

        let eligible = match phase {
            Phase::Fetch => !self.fetched.contains(id),
            Phase::Build => task.action != Action::Nomerge && task.build_unblocked(),
            Phase::Unpack => self.fetched.contains(id),
        };
        if !eligible {
            return None;
        }

        Some(WorkItem {
            target: task.id.clone(),
            action: task.action,
            phase,
            attempt: task.try_count.saturating_add(1),
        })
    }

    fn notify_running(&mut self, now: DateTime<Utc>, commands: &mut Vec<CoreCommand>) {
        let show_output = self.options.show_output;
        let interval = self.options.notify_interval;
        let mut notices = Vec::new();

        for phase in [Phase::Build, Phase::Unpack] {
            for job in self.slots_mut(phase).running.values_mut().flatten() {
                if show_output {
                    commands.push(CoreCommand::FlushLog {
                        path: job.state.log_path.clone(),
                        header: None,
                        close: LogClose::KeepOpen,
                    });
                    continue;
                }
                if now - job.last_notify < interval {
                    continue;
                }
                job.last_notify = now;
                notices.push((
                    format!(
                        "Still {} {} ({}). Logs in {}",
                        phase.verb().to_lowercase(),
                        job.state.display_name,
                        format_elapsed(job.state.elapsed(now)),
                        job.state.log_path.display()
                    ),
                    job.state.log_path.clone(),
                ));
            }
        }

        for (line, path) in notices {
            self.print(commands, now, line);
            commands.push(CoreCommand::FlushLog {
                path,
                header: None,
                close: LogClose::KeepOpen,
            });
        }
    }

    fn close_log(&self, job: &JobState, commands: &mut Vec<CoreCommand>) {
        if self.options.show_output {
            commands.push(CoreCommand::FlushLog {
                path: job.log_path.clone(),
                header: None,
                close: LogClose::Unlink,
            });
        } else {
            commands.push(CoreCommand::DiscardLog(job.log_path.clone()));
        }
    }

    fn print(&mut self, commands: &mut Vec<CoreCommand>, now: DateTime<Utc>, line: String) {
        self.last_output = now;
        commands.push(CoreCommand::Print(line));
    }

    fn is_idle(&self) -> bool {
        self.fetch.is_idle() && self.build.is_idle() && self.unpack.is_idle()
    }

    fn slots(&self, phase: Phase) -> &PhaseSlots {
        match phase {
            Phase::Fetch => &self.fetch,
            Phase::Build => &self.build,
            Phase::Unpack => &self.unpack,
        }
    }

    fn slots_mut(&mut self, phase: Phase) -> &mut PhaseSlots {
        match phase {
            Phase::Fetch => &mut self.fetch,
            Phase::Build => &mut self.build,
            Phase::Unpack => &mut self.unpack,
        }
    }
}

fn failure_header(job: &JobState) -> String {
    format!(
        "=== {} of {} failed (retcode {}, attempt {}); log: {} ===",
        job.phase.verb(),
        job.display_name,
        job.retcode.unwrap_or(-1),
        job.attempt,
        job.log_path.display()
    )
}
