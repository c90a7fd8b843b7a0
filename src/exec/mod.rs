// src/exec/mod.rs

//! Job execution layer.
//!
//! - [`job`] defines the [`WorkItem`] sent to workers and the [`JobState`]
//!   events they report.
//! - [`work`] provides the [`WorkFunction`] trait and the production
//!   [`CommandWork`], which runs shell command templates in their own
//!   process groups.
//! - [`pool`] implements the fixed-size [`PhaseWorkerPool`].
//! - [`loadavg`] reads the system load average for build throttling.

pub mod job;
pub mod loadavg;
pub mod pool;
pub mod work;

pub use job::{format_elapsed, JobState, WorkItem};
pub use pool::{PhaseWorkerPool, PoolContext, PoolMessage, WORK_ERROR_RETCODE};
pub use work::{kill_process_group, CommandWork, ProcessGroups, WorkFunction, WorkFuture};
