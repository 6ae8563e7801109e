//! Run log — the append-only record read by the reporting tools.
//!
//! Every terminal per-disk outcome (SUCCESS, FAIL, STRANGE) and every
//! run-wide transition (START, DEGRADED, DONE) is appended as one line:
//! `KIND field1 field2 ...`. The log is write-only from the scheduler's
//! point of view; nothing in this crate reads it back except tests.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::StateResult;

/// Log line kinds, in the vocabulary the reporting tools understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Start,
    Success,
    Fail,
    Strange,
    Info,
    Warning,
    Degraded,
    Done,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LogKind::Start => "START",
            LogKind::Success => "SUCCESS",
            LogKind::Fail => "FAIL",
            LogKind::Strange => "STRANGE",
            LogKind::Info => "INFO",
            LogKind::Warning => "WARNING",
            LogKind::Degraded => "DEGRADED",
            LogKind::Done => "DONE",
        }
    }
}

enum Backend {
    File(File),
    /// Captures lines in memory; used by tests asserting log output.
    Memory(Vec<String>),
}

/// Shared handle to the run log. `Clone` + `Send` + `Sync`.
#[derive(Clone)]
pub struct RunLog {
    backend: Arc<Mutex<Backend>>,
}

impl RunLog {
    /// Open (or create) the run log file, appending to existing content.
    pub fn open(path: &Path) -> StateResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            backend: Arc::new(Mutex::new(Backend::File(file))),
        })
    }

    /// An in-memory log capturing lines for inspection.
    pub fn memory() -> Self {
        Self {
            backend: Arc::new(Mutex::new(Backend::Memory(Vec::new()))),
        }
    }

    /// Append one log line. A failed write is reported on the operator
    /// log but never fails the caller — losing a report line must not
    /// abort a dump.
    pub fn append(&self, kind: LogKind, fields: &[&str]) {
        let mut line = kind.as_str().to_string();
        for field in fields {
            line.push(' ');
            line.push_str(field);
        }

        let mut backend = self.backend.lock().expect("run log lock poisoned");
        match &mut *backend {
            Backend::File(file) => {
                if let Err(e) = writeln!(file, "{line}") {
                    warn!(error = %e, "run log append failed");
                }
            }
            Backend::Memory(lines) => lines.push(line),
        }
    }

    /// Captured lines; empty for file-backed logs.
    pub fn lines(&self) -> Vec<String> {
        let backend = self.backend.lock().expect("run log lock poisoned");
        match &*backend {
            Backend::File(_) => Vec::new(),
            Backend::Memory(lines) => lines.clone(),
        }
    }
}
