// src/exec/job.rs

//! Job descriptions sent to workers and the state events they report back.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Action, Phase, TaskId};

/// One unit of work handed to a phase pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub target: TaskId,
    pub action: Action,
    pub phase: Phase,
    /// 1 for the first try, incremented per retry.
    pub attempt: u32,
}

impl WorkItem {
    pub fn display_name(&self) -> String {
        match self.action {
            Action::Uninstall => format!("{} (uninstall)", self.target),
            _ => self.target.clone(),
        }
    }
}

/// State of a job as reported by a worker.
///
/// Each job produces exactly two events: one with `done == false` when it
/// starts and one with `done == true` when it finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub target: TaskId,
    pub phase: Phase,
    pub display_name: String,
    pub attempt: u32,
    pub log_path: PathBuf,
    pub start: DateTime<Utc>,
    pub finish: Option<DateTime<Utc>>,
    pub retcode: Option<i32>,
    pub done: bool,
}

impl JobState {
    pub fn started(item: &WorkItem, log_path: PathBuf, start: DateTime<Utc>) -> Self {
        Self {
            target: item.target.clone(),
            phase: item.phase,
            display_name: item.display_name(),
            attempt: item.attempt,
            log_path,
            start,
            finish: None,
            retcode: None,
            done: false,
        }
    }

    pub fn finished(&self, retcode: i32, finish: DateTime<Utc>) -> Self {
        Self {
            finish: Some(finish),
            retcode: Some(retcode),
            done: true,
            ..self.clone()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.done && self.retcode == Some(0)
    }

    /// Wall time from start to finish, or to `now` while running.
    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.finish.unwrap_or(now) - self.start
    }
}

/// Format a duration like `1m2.3s` or `4.0s`.
pub fn format_elapsed(d: chrono::Duration) -> String {
    let millis = d.num_milliseconds().max(0);
    let secs = millis as f64 / 1000.0;
    if secs >= 60.0 {
        let mins = (secs / 60.0).floor();
        format!("{}m{:.1}s", mins as u64, secs - mins * 60.0)
    } else {
        format!("{secs:.1}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(chrono::Duration::milliseconds(4_000)), "4.0s");
        assert_eq!(format_elapsed(chrono::Duration::milliseconds(62_300)), "1m2.3s");
        assert_eq!(format_elapsed(chrono::Duration::milliseconds(-5)), "0.0s");
    }

    #[test]
    fn finished_keeps_identity() {
        let item = WorkItem {
            target: "a".into(),
            action: Action::Uninstall,
            phase: Phase::Build,
            attempt: 2,
        };
        let start = Utc::now();
        let s = JobState::started(&item, PathBuf::from("/tmp/a.log"), start);
        let f = s.finished(0, start + chrono::Duration::seconds(3));

        assert!(!s.done);
        assert!(f.succeeded());
        assert_eq!(f.display_name, "a (uninstall)");
        assert_eq!(f.elapsed(Utc::now()), chrono::Duration::seconds(3));
    }
}
