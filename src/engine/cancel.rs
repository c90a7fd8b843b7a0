// src/engine/cancel.rs

//! SIGINT / SIGTERM handling.
//!
//! The first signal cancels the run token: the runtime flushes partial
//! output and workers kill their process groups. A second signal runs the
//! hard-kill hook and exits immediately.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Exit status used when a second signal forces an immediate exit.
pub const FORCED_EXIT_CODE: i32 = 1;

/// Listen for termination signals in the background.
pub fn spawn_signal_listener<F>(cancel: CancellationToken, hard_kill: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        let mut signals = match Signals::new() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install signal handlers");
                return;
            }
        };

        let Some(name) = signals.next().await else {
            return;
        };
        warn!(signal = name, "cancelling run; send the signal again to kill all jobs now");
        cancel.cancel();

        if let Some(name) = signals.next().await {
            error!(signal = name, "second signal; killing all jobs and exiting");
            hard_kill();
            std::process::exit(FORCED_EXIT_CODE);
        }
    })
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn next(&mut self) -> Option<&'static str> {
        tokio::select! {
            s = self.interrupt.recv() => s.map(|_| "SIGINT"),
            s = self.terminate.recv() => s.map(|_| "SIGTERM"),
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Option<&'static str> {
        tokio::signal::ctrl_c().await.ok().map(|_| "ctrl-c")
    }
}
