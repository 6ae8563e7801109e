//! Domain types shared by the spool planner and driver.
//!
//! Sizes are kibibytes throughout (`Kb`); dump dates are days since the
//! Unix epoch (`EpochDay`). Both match the units used in the schedule
//! record format and the historical stats store.

use serde::{Deserialize, Serialize};

/// Size in kibibytes.
pub type Kb = u64;

/// A calendar day counted from the Unix epoch.
pub type EpochDay = u64;

/// Stable dense index of a filesystem within one run's disk table.
///
/// The canonical handle used by queues, ledgers, and job serials; the
/// `host`/`device` pair only appears at the edges (schedule records,
/// stats store keys, log lines).
pub type DiskId = usize;

/// Highest incremental dump level. Levels are 0 (full) through 9.
pub const MAX_LEVEL: u32 = 9;

// ── Filesystems ────────────────────────────────────────────────────

/// How a filesystem participates in the dump cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DumpStrategy {
    /// Normal full/incremental rotation.
    Standard,
    /// Never dump at level 0; incrementals only, no overdue tracking.
    NoFull,
    /// Full dumps only; never bump to an incremental.
    NoInc,
    /// Incrementals only, but a missing level 0 is still an error to report.
    IncrOnly,
    /// Excluded from the run entirely.
    Skip,
}

/// Client-side compression applied to the dump stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Compression {
    #[default]
    None,
    Fast,
    Best,
}

/// One filesystem from the disklist. Immutable for the run once loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Disk {
    pub host: String,
    /// Device path on the client, e.g. `/dev/sda1` or `/export/home`.
    pub device: String,
    pub strategy: DumpStrategy,
    /// Base scheduling priority; higher runs earlier.
    pub priority: u32,
    pub compression: Compression,
    /// Concurrency group on the host; disks sharing a spindle are never
    /// dumped simultaneously. `-1` means ungrouped.
    pub spindle: i32,
    /// Maximum simultaneous dumps on this disk's host.
    pub max_dumps: u32,
    /// Network interface this disk's dump traffic is accounted against.
    pub interface: String,
    /// Never stage on holding disk; dump direct to tape only.
    pub no_hold: bool,
    /// Seconds after run start before this disk may be dispatched.
    pub start_delay_secs: u64,
}

// ── Historical stats ───────────────────────────────────────────────

/// Last successful dump at one level.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LevelStats {
    /// Origin (uncompressed) size.
    pub size: Kb,
    /// Size as written to holding disk / tape.
    pub csize: Kb,
    /// Wall-clock duration of the dump.
    pub secs: u64,
    /// Day the dump completed; 0 = never dumped at this level.
    pub date: EpochDay,
    /// Tape the dump landed on, if it reached tape.
    pub label: Option<String>,
    /// File number on that tape.
    pub filenum: u32,
}

/// Operator-requested overrides pending for a filesystem.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PendingCommands {
    /// Force a level 0 tonight regardless of the cycle.
    pub force_full: bool,
    /// Force a bump to the next incremental level.
    pub force_bump: bool,
    /// Suppress bumping even if the threshold is met.
    pub force_no_bump: bool,
}

/// Per-filesystem dump history, one record per (host, device).
///
/// Read once at estimate time, written once at dump completion. Never
/// advanced on failure so a rerun is not bumped past the missed dump.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoricalStats {
    /// Per-level history, indexed by dump level 0–9.
    pub levels: [LevelStats; 10],
    /// Weighted running average dump rate, KiB per second.
    pub dump_rate: f64,
    /// Weighted running average compressed/origin ratio.
    pub compression_ratio: f64,
    /// Level of the most recent successful dump; -1 = new disk.
    pub last_level: i32,
    /// Consecutive runs completed at `last_level`.
    pub runs_at_level: u32,
    pub commands: PendingCommands,
}

impl Default for HistoricalStats {
    fn default() -> Self {
        Self {
            levels: Default::default(),
            dump_rate: 0.0,
            compression_ratio: 1.0,
            last_level: -1,
            runs_at_level: 0,
            commands: PendingCommands::default(),
        }
    }
}

impl HistoricalStats {
    /// True if this filesystem has never completed a full dump.
    pub fn is_new(&self) -> bool {
        self.levels[0].date == 0
    }

    /// Day of the last successful full dump, if any.
    pub fn last_full_day(&self) -> Option<EpochDay> {
        (self.levels[0].date != 0).then_some(self.levels[0].date)
    }

    /// Stats for `level`, if a dump at that level has ever succeeded.
    pub fn at_level(&self, level: u32) -> Option<&LevelStats> {
        let stats = self.levels.get(level as usize)?;
        (stats.date != 0).then_some(stats)
    }
}

// ── Tapes ──────────────────────────────────────────────────────────

/// One entry in the tape inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TapeRecord {
    /// Day the tape was last written; 0 = never used.
    pub date: EpochDay,
    pub label: String,
    /// Whether the tape may be overwritten once it falls out of the cycle.
    pub reuse: bool,
}

// ── Schedule ───────────────────────────────────────────────────────

/// Degraded-mode alternative precomputed by the planner: the dump to run
/// instead if tape is unavailable or the full does not fit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DegradedEntry {
    pub level: u32,
    pub dumpdate: EpochDay,
    pub size: Kb,
    pub time_secs: u64,
}

/// One filesystem selected to run tonight.
///
/// Created by the fit engine, serialized to the schedule, and owned by
/// the driver for the rest of the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    pub host: String,
    pub device: String,
    pub priority: u32,
    pub level: u32,
    pub dumpdate: EpochDay,
    /// Estimated dump size at `level`.
    pub size: Kb,
    /// Estimated dump duration.
    pub time_secs: u64,
    pub degraded: Option<DegradedEntry>,
}

impl ScheduleEntry {
    /// Composite key into the stats store and log lines.
    pub fn disk_key(&self) -> String {
        format!("{}:{}", self.host, self.device)
    }

    /// Estimated throughput in KiB/s, `None` when the estimate carries
    /// no usable duration.
    pub fn est_kps(&self) -> Option<f64> {
        (self.time_secs > 0).then(|| self.size as f64 / self.time_secs as f64)
    }

    /// Replace level/date/size/time with the degraded alternative.
    /// Returns false (and changes nothing) when no alternative exists.
    pub fn demote(&mut self) -> bool {
        let Some(deg) = self.degraded.take() else {
            return false;
        };
        self.level = deg.level;
        self.dumpdate = deg.dumpdate;
        self.size = deg.size;
        self.time_secs = deg.time_secs;
        true
    }
}
