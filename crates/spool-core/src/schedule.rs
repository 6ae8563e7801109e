//! Schedule record wire format.
//!
//! The planner hands the driver one whitespace-delimited line per
//! filesystem:
//!
//! ```text
//! host device priority level dumpdate size time [dlevel ddumpdate dsize dtime]
//! ```
//!
//! The trailing four fields are the precomputed degraded-mode
//! alternative and are either all present or all absent. Emit and parse
//! round-trip exactly; a malformed line is rejected with its line number
//! and a diagnostic, never patched up.

use crate::error::{CoreError, CoreResult};
use crate::types::{DegradedEntry, ScheduleEntry};

/// Serialize one schedule entry to its wire line (no trailing newline).
pub fn emit_line(entry: &ScheduleEntry) -> String {
    let mut line = format!(
        "{} {} {} {} {} {} {}",
        entry.host,
        entry.device,
        entry.priority,
        entry.level,
        entry.dumpdate,
        entry.size,
        entry.time_secs,
    );
    if let Some(deg) = &entry.degraded {
        line.push_str(&format!(
            " {} {} {} {}",
            deg.level, deg.dumpdate, deg.size, deg.time_secs
        ));
    }
    line
}

/// Serialize a whole schedule, one line per entry.
pub fn emit_schedule(entries: &[ScheduleEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&emit_line(entry));
        out.push('\n');
    }
    out
}

/// Parse one schedule line. `line_no` is used in diagnostics only.
pub fn parse_line(text: &str, line_no: usize) -> CoreResult<ScheduleEntry> {
    let malformed = |reason: &str| CoreError::MalformedSchedule {
        line: line_no,
        reason: reason.to_string(),
    };

    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() != 7 && fields.len() != 11 {
        return Err(malformed(&format!(
            "expected 7 or 11 fields, got {}",
            fields.len()
        )));
    }

    fn num<T: std::str::FromStr>(
        field: &str,
        name: &str,
        line_no: usize,
    ) -> CoreResult<T> {
        field.parse().map_err(|_| CoreError::MalformedSchedule {
            line: line_no,
            reason: format!("bad {name}: {field:?}"),
        })
    }

    let level: u32 = num(fields[3], "level", line_no)?;
    if level > crate::types::MAX_LEVEL {
        return Err(malformed(&format!("level {level} out of range")));
    }

    let degraded = if fields.len() == 11 {
        let dlevel: u32 = num(fields[7], "degraded level", line_no)?;
        if dlevel > crate::types::MAX_LEVEL {
            return Err(malformed(&format!("degraded level {dlevel} out of range")));
        }
        Some(DegradedEntry {
            level: dlevel,
            dumpdate: num(fields[8], "degraded dumpdate", line_no)?,
            size: num(fields[9], "degraded size", line_no)?,
            time_secs: num(fields[10], "degraded time", line_no)?,
        })
    } else {
        None
    };

    Ok(ScheduleEntry {
        host: fields[0].to_string(),
        device: fields[1].to_string(),
        priority: num(fields[2], "priority", line_no)?,
        level,
        dumpdate: num(fields[4], "dumpdate", line_no)?,
        size: num(fields[5], "size", line_no)?,
        time_secs: num(fields[6], "time", line_no)?,
        degraded,
    })
}

/// Parse a whole schedule. Blank lines are skipped; any malformed line
/// fails the parse.
pub fn parse_schedule(text: &str) -> CoreResult<Vec<ScheduleEntry>> {
    let mut entries = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        entries.push(parse_line(line, idx + 1)?);
    }
    Ok(entries)
}
