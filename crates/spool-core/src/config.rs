//! spool.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};
use crate::types::Kb;

/// Top-level configuration for one spool installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolConfig {
    pub tape: TapeConfig,
    pub cycle: CycleConfig,
    #[serde(default)]
    pub bump: BumpConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Network interfaces dumps are admission-controlled against.
    #[serde(default, rename = "interface")]
    pub interfaces: Vec<InterfaceConfig>,
    /// Local staging disks for dump images.
    #[serde(default, rename = "holdingdisk")]
    pub holding_disks: Vec<HoldingDiskConfig>,
}

/// Tape geometry and labeling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapeConfig {
    /// Usable tape length in KiB.
    pub length_kb: Kb,
    /// Per-file overhead: one filemark is written before and one after
    /// each dump image.
    pub filemark_kb: Kb,
    pub label: Option<String>,
}

/// Dump and tape rotation cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Days over which every filesystem gets at least one full dump.
    pub dumpcycle_days: u32,
    /// Scheduled runs within one dumpcycle.
    pub runs_per_cycle: u32,
    /// Tape generations before a tape may be overwritten.
    pub tapecycle: u32,
}

/// Incremental bump thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BumpConfig {
    /// Threshold at level 1, in KiB.
    pub size_kb: Kb,
    /// Threshold multiplier applied once per level above 1.
    pub mult: f64,
    /// Minimum consecutive runs at a level before bumping.
    pub days: u32,
}

impl Default for BumpConfig {
    fn default() -> Self {
        Self {
            size_kb: 10_240,
            mult: 1.5,
            days: 2,
        }
    }
}

/// Worker pool sizing and the external worker programs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of dumper/chunker pairs run in parallel.
    pub inparallel: u32,
    /// Per-slot scan class: `T` scans the run queue from the
    /// large/high-priority end, `S` from the small end. Padded with its
    /// last character when shorter than `inparallel`.
    pub dump_order: String,
    /// Default cap on simultaneous dumps per host.
    pub max_dumps_per_host: u32,
    pub dumper: Option<PathBuf>,
    pub chunker: Option<PathBuf>,
    pub taper: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            inparallel: 4,
            dump_order: "TTSS".to_string(),
            max_dumps_per_host: 1,
            dumper: None,
            chunker: None,
            taper: None,
        }
    }
}

/// Planner and driver timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Seconds allowed per requested estimate level; the per-host
    /// timeout is this times the number of levels queried.
    pub etimeout_secs: u64,
    /// Base delay between dump starts on the same host.
    pub dtimeout_secs: u64,
    /// Delay before a TRYAGAIN job is requeued.
    pub retry_delay_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            etimeout_secs: 300,
            dtimeout_secs: 30,
            retry_delay_secs: 30,
        }
    }
}

/// One network interface and its admission budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    pub max_kbps: u64,
}

/// One holding disk available for staging dumps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldingDiskConfig {
    pub directory: PathBuf,
    pub capacity_kb: Kb,
    /// Chunk size; also the per-reservation header overhead unit.
    pub chunk_kb: Kb,
}

impl SpoolConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse and validate configuration text.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> CoreResult<Self> {
        let config: SpoolConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> CoreResult<()> {
        if self.tape.length_kb == 0 {
            return Err(CoreError::InvalidConfig(
                "tape.length_kb must be positive".to_string(),
            ));
        }
        if self.cycle.dumpcycle_days == 0 || self.cycle.runs_per_cycle == 0 {
            return Err(CoreError::InvalidConfig(
                "cycle.dumpcycle_days and cycle.runs_per_cycle must be positive".to_string(),
            ));
        }
        if self.workers.inparallel == 0 {
            return Err(CoreError::InvalidConfig(
                "workers.inparallel must be positive".to_string(),
            ));
        }
        if self.workers.dump_order.is_empty()
            || !self.workers.dump_order.chars().all(|c| c == 'T' || c == 'S')
        {
            return Err(CoreError::InvalidConfig(format!(
                "workers.dump_order must be a non-empty string of T/S, got {:?}",
                self.workers.dump_order
            )));
        }
        if self.bump.mult < 1.0 {
            return Err(CoreError::InvalidConfig(
                "bump.mult must be at least 1.0".to_string(),
            ));
        }
        for hd in &self.holding_disks {
            if hd.chunk_kb == 0 || hd.capacity_kb < hd.chunk_kb {
                return Err(CoreError::InvalidConfig(format!(
                    "holdingdisk {} must have 0 < chunk_kb <= capacity_kb",
                    hd.directory.display()
                )));
            }
        }
        Ok(())
    }

    /// Scan class for worker slot `slot`: `true` = big-end scan.
    ///
    /// Slots past the end of `dump_order` inherit its last character.
    pub fn slot_scans_big_end(&self, slot: usize) -> bool {
        let order = &self.workers.dump_order;
        let c = order
            .chars()
            .nth(slot)
            .or_else(|| order.chars().last())
            .unwrap_or('T');
        c == 'T'
    }
}
