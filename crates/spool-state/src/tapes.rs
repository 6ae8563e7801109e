//! Tape inventory.
//!
//! Flat file, one tape per line: `date label reuse|no-reuse`, ordered
//! most-recently-used first after loading. `date` is an epoch day,
//! 0 for a tape that has never been written.

use std::path::Path;

use spool_core::TapeRecord;

use crate::error::{StateError, StateResult};

/// In-memory view of the tape inventory file.
#[derive(Debug, Clone)]
pub struct TapeList {
    tapes: Vec<TapeRecord>,
}

impl TapeList {
    /// Load the inventory from a flat file.
    pub fn load(path: &Path) -> StateResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse inventory text. Lines are `date label reuse|no-reuse`;
    /// blank lines are skipped, anything else is an error.
    pub fn parse(content: &str) -> StateResult<Self> {
        let mut tapes = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let malformed = |reason: String| StateError::Tapelist {
                line: idx + 1,
                reason,
            };

            let fields: Vec<&str> = line.split_whitespace().collect();
            let [date, label, reuse] = fields[..] else {
                return Err(malformed(format!(
                    "expected 3 fields, got {}",
                    fields.len()
                )));
            };
            let date = date
                .parse()
                .map_err(|_| malformed(format!("bad date: {date:?}")))?;
            let reuse = match reuse {
                "reuse" => true,
                "no-reuse" => false,
                other => return Err(malformed(format!("bad reuse flag: {other:?}"))),
            };
            tapes.push(TapeRecord {
                date,
                label: label.to_string(),
                reuse,
            });
        }
        // Most recently written first; never-used tapes sort last.
        tapes.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(Self { tapes })
    }

    /// Look up a tape by label.
    pub fn lookup(&self, label: &str) -> Option<&TapeRecord> {
        self.tapes.iter().find(|t| t.label == label)
    }

    /// Tapes eligible for overwrite tonight: reusable tapes beyond the
    /// `tapecycle` most recent generations, oldest first.
    pub fn reusable(&self, tapecycle: u32) -> Vec<&TapeRecord> {
        let mut eligible: Vec<&TapeRecord> = self
            .tapes
            .iter()
            .skip(tapecycle as usize)
            .filter(|t| t.reuse)
            .collect();
        eligible.sort_by(|a, b| a.date.cmp(&b.date));
        eligible
    }

    pub fn len(&self) -> usize {
        self.tapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tapes.is_empty()
    }
}
