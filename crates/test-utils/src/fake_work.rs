use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use parmerge::exec::{WorkFunction, WorkFuture, WorkItem};
use parmerge::types::Phase;

/// One observation made by [`FakeWork`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    Started { target: String, phase: Phase },
    Finished { target: String, phase: Phase, retcode: i32 },
}

#[derive(Debug, Default)]
struct FakeState {
    /// Remaining scripted failures per (target, phase).
    failures: HashMap<(String, Phase), u32>,
    hang: HashSet<(String, Phase)>,
    events: Vec<FakeEvent>,
    running: HashMap<Phase, usize>,
    max_running: HashMap<Phase, usize>,
}

/// A fake work function that:
/// - records every start and finish, in order
/// - tracks the highest concurrency seen per phase
/// - fails scripted (target, phase) pairs a given number of times
/// - optionally never finishes a job until the run is cancelled.
#[derive(Debug, Clone)]
pub struct FakeWork {
    state: Arc<Mutex<FakeState>>,
    delay: Duration,
}

impl FakeWork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            delay: Duration::from_millis(10),
        }
    }

    /// How long each job "runs".
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail `target`'s `phase` the next `times` attempts.
    pub fn fail(self, target: &str, phase: Phase, times: u32) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((target.to_string(), phase), times);
        self
    }

    /// Keep `target`'s `phase` running until cancellation.
    pub fn hang(self, target: &str, phase: Phase) -> Self {
        self.state
            .lock()
            .unwrap()
            .hang
            .insert((target.to_string(), phase));
        self
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Targets started in `phase`, in start order (retries repeat).
    pub fn started(&self, phase: Phase) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FakeEvent::Started { target, phase: p } if p == phase => Some(target),
                _ => None,
            })
            .collect()
    }

    pub fn max_concurrent(&self, phase: Phase) -> usize {
        self.state
            .lock()
            .unwrap()
            .max_running
            .get(&phase)
            .copied()
            .unwrap_or(0)
    }

    /// Index of an event in the recorded order.
    pub fn position(&self, event: &FakeEvent) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    fn on_start(&self, item: &WorkItem) -> (bool, i32) {
        let mut state = self.state.lock().unwrap();
        let key = (item.target.clone(), item.phase);

        let running = state.running.entry(item.phase).or_insert(0);
        *running += 1;
        let now = *running;
        let max = state.max_running.entry(item.phase).or_insert(0);
        *max = (*max).max(now);

        state.events.push(FakeEvent::Started {
            target: item.target.clone(),
            phase: item.phase,
        });

        let retcode = match state.failures.get_mut(&key) {
            Some(left) if *left > 0 => {
                *left -= 1;
                1
            }
            _ => 0,
        };
        (state.hang.contains(&key), retcode)
    }

    fn on_finish(&self, item: &WorkItem, retcode: i32) {
        let mut state = self.state.lock().unwrap();
        if let Some(running) = state.running.get_mut(&item.phase) {
            *running = running.saturating_sub(1);
        }
        state.events.push(FakeEvent::Finished {
            target: item.target.clone(),
            phase: item.phase,
            retcode,
        });
    }
}

impl Default for FakeWork {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkFunction for FakeWork {
    fn execute<'a>(
        &'a self,
        item: &'a WorkItem,
        log_path: &'a Path,
        cancel: CancellationToken,
    ) -> WorkFuture<'a> {
        Box::pin(async move {
            let (hang, scripted) = self.on_start(item);
            tokio::fs::write(
                log_path,
                format!("fake {} of {} (attempt {})\n", item.phase, item.target, item.attempt),
            )
            .await?;

            let retcode = if hang {
                cancel.cancelled().await;
                -9
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => scripted,
                    _ = cancel.cancelled() => -9,
                }
            };

            self.on_finish(item, retcode);
            Ok(retcode)
        })
    }
}
