//! Disklist loader.
//!
//! The disklist is a TOML file enumerating every filesystem eligible for
//! backup, with per-disk strategy overrides:
//!
//! ```toml
//! [[disk]]
//! host = "web1"
//! device = "/export/home"
//! priority = 10
//! strategy = "standard"
//! spindle = 0
//! interface = "eth0"
//! ```

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use spool_core::{Compression, Disk, DumpStrategy};

use crate::error::{StateError, StateResult};

#[derive(Debug, Deserialize)]
struct DisklistFile {
    #[serde(default, rename = "disk")]
    disks: Vec<DiskEntry>,
}

/// One disklist entry as written; optional fields take defaults here so
/// the in-memory `Disk` is fully populated.
#[derive(Debug, Deserialize)]
struct DiskEntry {
    host: String,
    device: String,
    #[serde(default = "default_strategy")]
    strategy: DumpStrategy,
    #[serde(default)]
    priority: u32,
    #[serde(default)]
    compression: Compression,
    #[serde(default = "default_spindle")]
    spindle: i32,
    #[serde(default = "default_max_dumps")]
    max_dumps: u32,
    #[serde(default = "default_interface")]
    interface: String,
    #[serde(default)]
    no_hold: bool,
    #[serde(default)]
    start_delay_secs: u64,
}

fn default_strategy() -> DumpStrategy {
    DumpStrategy::Standard
}

fn default_spindle() -> i32 {
    -1
}

fn default_max_dumps() -> u32 {
    1
}

fn default_interface() -> String {
    "default".to_string()
}

/// Load the disklist from a TOML file.
///
/// Duplicate (host, device) pairs are rejected — the planner's disk
/// table is keyed by dense index and a duplicate would shadow history.
pub fn load_disklist(path: &Path) -> StateResult<Vec<Disk>> {
    let content = std::fs::read_to_string(path)?;
    parse_disklist(&content)
}

/// Parse disklist text.
pub fn parse_disklist(content: &str) -> StateResult<Vec<Disk>> {
    let file: DisklistFile =
        toml::from_str(content).map_err(|e| StateError::Disklist(e.to_string()))?;

    let mut seen = HashSet::new();
    let mut disks = Vec::with_capacity(file.disks.len());
    for entry in file.disks {
        if !seen.insert((entry.host.clone(), entry.device.clone())) {
            return Err(StateError::Disklist(format!(
                "duplicate disk {}:{}",
                entry.host, entry.device
            )));
        }
        disks.push(Disk {
            host: entry.host,
            device: entry.device,
            strategy: entry.strategy,
            priority: entry.priority,
            compression: entry.compression,
            spindle: entry.spindle,
            max_dumps: entry.max_dumps,
            interface: entry.interface,
            no_hold: entry.no_hold,
            start_delay_secs: entry.start_delay_secs,
        });
    }
    Ok(disks)
}
