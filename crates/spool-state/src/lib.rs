//! spool-state — the planner and driver's external collaborators.
//!
//! Narrow, typed interfaces over the on-disk artifacts the scheduler
//! consumes but does not own:
//!
//! - the disklist (which filesystems exist and how to dump them)
//! - the historical stats store (per-filesystem, per-level dump history)
//! - the tape inventory
//! - the append-only run log read by the reporting tools
//!
//! The stats store is backed by [redb](https://docs.rs/redb) with JSON
//! values; an in-memory backend exists for tests. The rest are flat
//! files with fail-closed parsers.

pub mod disklist;
pub mod error;
pub mod runlog;
pub mod stats;
pub mod tables;
pub mod tapes;

pub use disklist::load_disklist;
pub use error::{StateError, StateResult};
pub use runlog::{LogKind, RunLog};
pub use stats::StatsStore;
pub use tapes::TapeList;
