// src/engine/mod.rs

//! Scheduling engine.
//!
//! - [`core`] is the pure state machine: it owns the task graph and the
//!   per-phase ready queues, consumes job events and emits commands.
//! - [`runtime`] is the async shell that feeds events into the core and
//!   carries its commands out against the worker pools.
//! - [`output`] serialises status lines and incremental job logs.
//! - [`cancel`] turns SIGINT / SIGTERM into cancellation.
//! - [`report`] holds the run summary, failure file and event log.

pub mod cancel;
pub mod core;
pub mod output;
pub mod report;
pub mod runtime;

pub use core::{CoreCommand, CoreOptions, LogClose, SchedulerCore};
pub use output::{OutputHandle, OutputMessage, OutputWorker};
pub use report::{EventLog, FailedTask, RunSummary};
pub use runtime::{Runtime, RuntimeConfig};
