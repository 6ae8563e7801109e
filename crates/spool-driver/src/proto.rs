//! The worker command/result protocol.
//!
//! Workers are driven over a line-oriented channel: the driver writes
//! one command line, the worker answers with result lines of the form
//! `<TOKEN> <args...>`. One command is outstanding per channel at a
//! time. Every dispatched job carries a generation-stamped serial so an
//! asynchronous result can be matched to the right in-flight job even
//! across retries; a serial mismatch is a protocol bug and is logged,
//! never silently ignored.
//!
//! Fields are whitespace-delimited; the trailing `message` of failure
//! results takes the rest of the line verbatim. Parsing fails closed: a
//! line that doesn't match a known token and argument layout is
//! rejected with a diagnostic and the worker is treated as bogus.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use spool_core::{EpochDay, Kb};

/// Protocol-level parse failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("empty result line")]
    Empty,

    #[error("unknown result token {0:?}")]
    UnknownToken(String),

    #[error("bad {field} in {token}: {text:?}")]
    BadField {
        token: &'static str,
        field: &'static str,
        text: String,
    },

    #[error("missing {field} in {token}")]
    MissingField {
        token: &'static str,
        field: &'static str,
    },

    #[error("malformed serial {0:?}")]
    BadSerial(String),
}

// ── Serials ────────────────────────────────────────────────────────

/// Generation-stamped job serial: `generation-sequence`.
///
/// The sequence is monotonically increasing across the run; a retried
/// job gets a fresh serial, so a stale result from the first attempt
/// can never be attributed to the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Serial {
    pub generation: u32,
    pub sequence: u32,
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.sequence)
    }
}

impl FromStr for Serial {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ProtoError::BadSerial(s.to_string());
        let (generation, sequence) = s.split_once('-').ok_or_else(bad)?;
        Ok(Serial {
            generation: generation.parse().map_err(|_| bad())?,
            sequence: sequence.parse().map_err(|_| bad())?,
        })
    }
}

/// Hands out serials for one run.
#[derive(Debug)]
pub struct SerialAllocator {
    generation: u32,
    next_sequence: u32,
}

impl SerialAllocator {
    pub fn new(generation: u32) -> Self {
        Self {
            generation,
            next_sequence: 1,
        }
    }

    pub fn next(&mut self) -> Serial {
        let serial = Serial {
            generation: self.generation,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        serial
    }
}

// ── Commands (driver → worker) ─────────────────────────────────────

/// Job parameters common to the dump-carrying commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpSpec {
    pub host: String,
    /// Client capability flags, opaque to the driver.
    pub features: String,
    pub device: String,
    pub level: u32,
    /// "Changes since" day passed to the dump program.
    pub dumpdate: EpochDay,
    pub program: String,
    /// Option string for the client, opaque, no embedded whitespace.
    pub options: String,
}

/// Commands the driver sends to workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Taper: load and label the night's tape.
    StartTaper { label: String },
    /// Chunker: open a holding file and report a PORT for the dumper.
    FileWrite {
        serial: Serial,
        path: PathBuf,
        /// Usable space in the file, KiB.
        use_kb: Kb,
        chunk_kb: Kb,
        spec: DumpSpec,
    },
    /// Taper: accept a dump stream on a port, direct to tape.
    PortWrite { serial: Serial, spec: DumpSpec },
    /// Dumper: dump and stream to the given port.
    PortDump {
        serial: Serial,
        port: u16,
        spec: DumpSpec,
    },
    /// Chunker: continue into the next holding file.
    Continue {
        serial: Serial,
        path: PathBuf,
        use_kb: Kb,
        chunk_kb: Kb,
    },
    /// Cancel the in-flight job; the worker answers ABORT-FINISHED.
    Abort { serial: Serial },
    /// Clean shutdown at end of run.
    Quit,
}

impl Command {
    /// Serialize to the wire line (no trailing newline).
    pub fn to_line(&self) -> String {
        match self {
            Command::StartTaper { label } => format!("START-TAPER {label}"),
            Command::FileWrite {
                serial,
                path,
                use_kb,
                chunk_kb,
                spec,
            } => format!(
                "FILE-WRITE {serial} {} {use_kb} {chunk_kb} {}",
                path.display(),
                spec_fields(spec)
            ),
            Command::PortWrite { serial, spec } => {
                format!("PORT-WRITE {serial} {}", spec_fields(spec))
            }
            Command::PortDump { serial, port, spec } => {
                format!("PORT-DUMP {serial} {port} {}", spec_fields(spec))
            }
            Command::Continue {
                serial,
                path,
                use_kb,
                chunk_kb,
            } => format!("CONTINUE {serial} {} {use_kb} {chunk_kb}", path.display()),
            Command::Abort { serial } => format!("ABORT {serial}"),
            Command::Quit => "QUIT".to_string(),
        }
    }
}

fn spec_fields(spec: &DumpSpec) -> String {
    format!(
        "{} {} {} {} {} {} {}",
        spec.host,
        spec.features,
        spec.device,
        spec.level,
        spec.dumpdate,
        spec.program,
        spec.options
    )
}

// ── Results (worker → driver) ──────────────────────────────────────

/// Results workers send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Chunker/taper: listening on this port for the dump stream.
    Port { port: u16 },
    Done {
        serial: Serial,
        origin_kb: Kb,
        dumped_kb: Kb,
        secs: u64,
    },
    TryAgain { serial: Serial, message: String },
    Failed { serial: Serial, message: String },
    /// Chunker: the granted space fell short by this much.
    NoRoom { serial: Serial, shortfall_kb: Kb },
    /// Chunker: out of granted space, needs another segment.
    RqMoreDisk { serial: Serial },
    AbortFinished { serial: Serial },
    TapeError { serial: Serial, message: String },
    TaperOk { serial: Serial },
}

impl Reply {
    pub fn serial(&self) -> Option<Serial> {
        match self {
            Reply::Port { .. } => None,
            Reply::Done { serial, .. }
            | Reply::TryAgain { serial, .. }
            | Reply::Failed { serial, .. }
            | Reply::NoRoom { serial, .. }
            | Reply::RqMoreDisk { serial }
            | Reply::AbortFinished { serial }
            | Reply::TapeError { serial, .. }
            | Reply::TaperOk { serial } => Some(*serial),
        }
    }
}

/// Parse one result line. Fails closed on anything unrecognized.
pub fn parse_reply(line: &str) -> Result<Reply, ProtoError> {
    let mut fields = line.split_whitespace();
    let token = fields.next().ok_or(ProtoError::Empty)?;

    fn field<'a>(
        fields: &mut impl Iterator<Item = &'a str>,
        token: &'static str,
        name: &'static str,
    ) -> Result<&'a str, ProtoError> {
        fields.next().ok_or(ProtoError::MissingField {
            token,
            field: name,
        })
    }

    fn num<T: FromStr>(
        text: &str,
        token: &'static str,
        name: &'static str,
    ) -> Result<T, ProtoError> {
        text.parse().map_err(|_| ProtoError::BadField {
            token,
            field: name,
            text: text.to_string(),
        })
    }

    fn serial_of(
        text: &str,
    ) -> Result<Serial, ProtoError> {
        text.parse()
    }

    // The free-text message is everything after the serial field.
    let rest_after = |prefix_fields: usize| -> String {
        line.split_whitespace()
            .skip(prefix_fields)
            .collect::<Vec<_>>()
            .join(" ")
    };

    match token {
        "PORT" => {
            let port = field(&mut fields, "PORT", "port")?;
            Ok(Reply::Port {
                port: num(port, "PORT", "port")?,
            })
        }
        "DONE" => {
            let serial = serial_of(field(&mut fields, "DONE", "serial")?)?;
            let origin = field(&mut fields, "DONE", "origin_kb")?;
            let dumped = field(&mut fields, "DONE", "dumped_kb")?;
            let secs = field(&mut fields, "DONE", "secs")?;
            Ok(Reply::Done {
                serial,
                origin_kb: num(origin, "DONE", "origin_kb")?,
                dumped_kb: num(dumped, "DONE", "dumped_kb")?,
                secs: num(secs, "DONE", "secs")?,
            })
        }
        "TRYAGAIN" => {
            let serial = serial_of(field(&mut fields, "TRYAGAIN", "serial")?)?;
            Ok(Reply::TryAgain {
                serial,
                message: rest_after(2),
            })
        }
        "FAILED" => {
            let serial = serial_of(field(&mut fields, "FAILED", "serial")?)?;
            Ok(Reply::Failed {
                serial,
                message: rest_after(2),
            })
        }
        "NO-ROOM" => {
            let serial = serial_of(field(&mut fields, "NO-ROOM", "serial")?)?;
            let shortfall = field(&mut fields, "NO-ROOM", "shortfall_kb")?;
            Ok(Reply::NoRoom {
                serial,
                shortfall_kb: num(shortfall, "NO-ROOM", "shortfall_kb")?,
            })
        }
        "RQ-MORE-DISK" => {
            let serial = serial_of(field(&mut fields, "RQ-MORE-DISK", "serial")?)?;
            Ok(Reply::RqMoreDisk { serial })
        }
        "ABORT-FINISHED" => {
            let serial = serial_of(field(&mut fields, "ABORT-FINISHED", "serial")?)?;
            Ok(Reply::AbortFinished { serial })
        }
        "TAPE-ERROR" => {
            let serial = serial_of(field(&mut fields, "TAPE-ERROR", "serial")?)?;
            Ok(Reply::TapeError {
                serial,
                message: rest_after(2),
            })
        }
        "TAPER-OK" => {
            let serial = serial_of(field(&mut fields, "TAPER-OK", "serial")?)?;
            Ok(Reply::TaperOk { serial })
        }
        other => Err(ProtoError::UnknownToken(other.to_string())),
    }
}
