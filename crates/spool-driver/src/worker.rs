//! Worker channels.
//!
//! Each worker — dumper, chunker, or taper — is an external program
//! driven over a line-oriented bidirectional channel. The transport is
//! not part of the contract: production spawns a subprocess and speaks
//! over its stdin/stdout; tests connect an in-process peer. Either way
//! every result line is parsed and folded into one serialized event
//! stream consumed by the driver's loop, so the ledgers are only ever
//! touched from a single logical thread of control.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{DriverError, DriverResult};
use crate::proto::{Command, Reply, parse_reply};

/// Index of a worker in the driver's tables.
pub type WorkerId = usize;

/// What kind of worker sits behind a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Dumper,
    Chunker,
    Taper,
}

impl WorkerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::Dumper => "dumper",
            WorkerKind::Chunker => "chunker",
            WorkerKind::Taper => "taper",
        }
    }
}

/// One event on the driver's serialized stream.
#[derive(Debug)]
pub struct Event {
    pub worker: WorkerId,
    pub payload: EventPayload,
}

#[derive(Debug)]
pub enum EventPayload {
    Reply(Reply),
    /// The worker produced a line the protocol cannot parse.
    Bogus { line: String, error: String },
    /// The worker's channel closed.
    Eof,
}

/// Sending half of a worker channel, held by the driver.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub kind: WorkerKind,
    tx: mpsc::UnboundedSender<Command>,
}

impl WorkerHandle {
    /// Queue one command. Exactly one command is outstanding per
    /// channel at a time; the driver's state machine enforces that.
    pub fn send(&self, command: Command) -> DriverResult<()> {
        self.tx
            .send(command)
            .map_err(|_| DriverError::ChannelClosed(format!("{} {}", self.kind.as_str(), self.id)))
    }
}

/// Spawn a worker subprocess and wire its stdio into the event stream.
pub fn spawn_process(
    id: WorkerId,
    kind: WorkerKind,
    program: &Path,
    events: mpsc::UnboundedSender<Event>,
) -> DriverResult<WorkerHandle> {
    let mut child = tokio::process::Command::new(program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DriverError::WorkerSpawn {
            kind: kind.as_str(),
            reason: format!("{}: {e}", program.display()),
        })?;

    let mut stdin = child.stdin.take().ok_or_else(|| DriverError::WorkerSpawn {
        kind: kind.as_str(),
        reason: "no stdin handle".to_string(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| DriverError::WorkerSpawn {
        kind: kind.as_str(),
        reason: "no stdout handle".to_string(),
    })?;

    let (tx, mut command_rx) = mpsc::unbounded_channel::<Command>();

    // Writer: one line per command.
    tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            let line = format!("{}\n", command.to_line());
            if stdin.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        // Channel dropped: closing stdin tells the worker to exit.
    });

    // Reader: parse result lines into events; EOF retires the channel.
    // The child handle lives here so the process is reaped (or killed)
    // when the channel winds down.
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let payload = match parse_reply(&line) {
                        Ok(reply) => EventPayload::Reply(reply),
                        Err(error) => EventPayload::Bogus {
                            line,
                            error: error.to_string(),
                        },
                    };
                    if events.send(Event { worker: id, payload }).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(worker = id, "worker channel EOF");
                    let _ = events.send(Event {
                        worker: id,
                        payload: EventPayload::Eof,
                    });
                    break;
                }
                Err(e) => {
                    warn!(worker = id, error = %e, "worker channel read error");
                    let _ = events.send(Event {
                        worker: id,
                        payload: EventPayload::Eof,
                    });
                    break;
                }
            }
        }
        let _ = child.wait().await;
    });

    Ok(WorkerHandle { id, kind, tx })
}

/// Connect an in-process worker for tests: the returned `LocalWorker`
/// is the far end of the channel.
pub fn connect_local(
    id: WorkerId,
    kind: WorkerKind,
    events: mpsc::UnboundedSender<Event>,
) -> (WorkerHandle, LocalWorker) {
    let (tx, command_rx) = mpsc::unbounded_channel();
    (
        WorkerHandle { id, kind, tx },
        LocalWorker {
            id,
            commands: command_rx,
            events,
        },
    )
}

/// The far end of an in-process worker channel.
///
/// Replies injected here go through the same parse path as subprocess
/// output, so a test can exercise the bogus-line handling too.
pub struct LocalWorker {
    id: WorkerId,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Event>,
}

impl LocalWorker {
    /// Next command the driver sent, if any.
    pub fn next_command(&mut self) -> Option<Command> {
        self.commands.try_recv().ok()
    }

    /// Inject one raw result line, parsed exactly like wire input.
    pub fn reply_line(&self, line: &str) {
        let payload = match parse_reply(line) {
            Ok(reply) => EventPayload::Reply(reply),
            Err(error) => EventPayload::Bogus {
                line: line.to_string(),
                error: error.to_string(),
            },
        };
        let _ = self.events.send(Event {
            worker: self.id,
            payload,
        });
    }

    /// Inject a channel EOF.
    pub fn eof(&self) {
        let _ = self.events.send(Event {
            worker: self.id,
            payload: EventPayload::Eof,
        });
    }
}
