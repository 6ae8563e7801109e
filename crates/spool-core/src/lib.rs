//! spool-core — shared types for the spool backup orchestrator.
//!
//! This crate defines:
//! - The domain types shared by the planner and driver (`Disk`,
//!   `HistoricalStats`, `ScheduleEntry`, `TapeRecord`)
//! - The `spool.toml` configuration parser
//! - The schedule record wire format exchanged between planner and driver

pub mod config;
pub mod error;
pub mod schedule;
pub mod types;

pub use config::{BumpConfig, SpoolConfig};
pub use error::{CoreError, CoreResult};
pub use schedule::{emit_line, emit_schedule, parse_line, parse_schedule};
pub use types::*;
