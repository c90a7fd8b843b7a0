// src/engine/output.rs

//! Serialised terminal output.
//!
//! All status lines and job logs go through one blocking worker so that
//! concurrent jobs never interleave mid-line. Logs are read incrementally:
//! the worker remembers how far it got in each file and only prints what
//! was appended since. Once a log has been closed any later request for it
//! is ignored, so every log is flushed to completion at most once.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::core::LogClose;

/// Request for the output worker.
#[derive(Debug)]
pub enum OutputMessage {
    Line(String),
    Log {
        path: PathBuf,
        header: Option<String>,
        close: LogClose,
    },
    Discard(PathBuf),
    Shutdown,
}

/// Cheap cloneable sender side of the output worker.
#[derive(Debug, Clone)]
pub struct OutputHandle {
    tx: mpsc::UnboundedSender<OutputMessage>,
}

impl OutputHandle {
    pub fn send(&self, msg: OutputMessage) {
        if self.tx.send(msg).is_err() {
            debug!("output worker already stopped; dropping message");
        }
    }

    pub fn line(&self, line: impl Into<String>) {
        self.send(OutputMessage::Line(line.into()));
    }
}

/// Running output worker.
#[derive(Debug)]
pub struct OutputWorker {
    handle: OutputHandle,
    task: JoinHandle<()>,
}

impl OutputWorker {
    /// Start the worker on Tokio's blocking pool, writing to `out`.
    pub fn spawn(out: Box<dyn Write + Send>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = tokio::task::spawn_blocking(move || {
            let mut printer = LogPrinter::new(out);
            while let Some(msg) = rx.blocking_recv() {
                if matches!(msg, OutputMessage::Shutdown) {
                    break;
                }
                printer.handle(msg);
            }
            printer.flush();
        });

        Self {
            handle: OutputHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> OutputHandle {
        self.handle.clone()
    }

    /// Process everything queued so far, then stop the worker.
    pub async fn close(self) {
        self.handle.send(OutputMessage::Shutdown);
        if let Err(e) = self.task.await {
            warn!(error = %e, "output worker panicked");
        }
    }
}

/// Synchronous state of the output worker.
pub struct LogPrinter {
    out: Box<dyn Write + Send>,
    offsets: HashMap<PathBuf, u64>,
    closed: HashSet<PathBuf>,
}

impl LogPrinter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out,
            offsets: HashMap::new(),
            closed: HashSet::new(),
        }
    }

    pub fn handle(&mut self, msg: OutputMessage) {
        let result = match msg {
            OutputMessage::Line(line) => writeln!(self.out, "{line}"),
            OutputMessage::Log {
                path,
                header,
                close,
            } => self.flush_log(&path, header.as_deref(), close),
            OutputMessage::Discard(path) => {
                self.close(&path, LogClose::Unlink);
                Ok(())
            }
            OutputMessage::Shutdown => Ok(()),
        };

        if let Err(e) = result {
            warn!(error = %e, "failed to write output");
        }
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.out.flush() {
            warn!(error = %e, "failed to flush output");
        }
    }

    fn flush_log(&mut self, path: &Path, header: Option<&str>, close: LogClose) -> io::Result<()> {
        if self.closed.contains(path) {
            return Ok(());
        }

        let offset = self.offsets.get(path).copied().unwrap_or(0);
        let chunk = match read_from(path, offset) {
            Ok(chunk) => chunk,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "log already gone");
                Vec::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read job log");
                Vec::new()
            }
        };

        if let Some(header) = header {
            writeln!(self.out, "{header}")?;
        }
        if !chunk.is_empty() {
            self.out.write_all(&chunk)?;
            if !chunk.ends_with(b"\n") {
                writeln!(self.out)?;
            }
        }
        self.out.flush()?;

        self.offsets
            .insert(path.to_path_buf(), offset + chunk.len() as u64);
        if close != LogClose::KeepOpen {
            self.close(path, close);
        }
        Ok(())
    }

    fn close(&mut self, path: &Path, close: LogClose) {
        self.offsets.remove(path);
        self.closed.insert(path.to_path_buf());

        if close == LogClose::Unlink {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove job log"),
            }
        }
    }
}

fn read_from(path: &Path, offset: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}
