//! spool-driver — the runtime scheduler.
//!
//! Consumes the planner's schedule and runs it against a pool of
//! dumper/chunker worker pairs plus one taper, with:
//!
//! - per-interface bandwidth admission (`bandwidth`)
//! - holding-disk space allocation and chunked reservations (`holding`)
//! - the line-oriented worker command/result protocol (`proto`)
//! - worker process/channel management (`worker`)
//! - the single-threaded event loop and job state machine (`driver`)
//!
//! All scheduler state is owned by one `Driver` and mutated only from
//! its event loop; worker I/O is folded into a single serialized event
//! stream before it touches the ledgers.

pub mod bandwidth;
pub mod driver;
pub mod error;
pub mod holding;
pub mod proto;
pub mod queue;
pub mod worker;

pub use bandwidth::BandwidthLedger;
pub use driver::{Driver, RunSummary, WorkerSet};
pub use error::{DriverError, DriverResult};
pub use holding::HoldingLedger;
pub use proto::{Command, Reply, Serial};
