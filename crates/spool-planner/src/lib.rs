//! spool-planner — the estimate & fit engine.
//!
//! For every filesystem in the disklist the planner:
//! 1. Chooses up to three candidate dump levels (due full, current
//!    incremental, possible bump)
//! 2. Queries the filesystem's remote agent for size estimates at those
//!    levels, concurrently across hosts
//! 3. Picks a level, a priority, and a degraded-mode alternative
//! 4. Fits the aggregate schedule to tape capacity (four-pass fit with
//!    an undo log)
//! 5. Balances full-dump volume across the dump cycle
//!
//! The output is an ordered list of `ScheduleEntry` records — the sole
//! input to the driver.

pub mod balance;
pub mod error;
pub mod estimate;
pub mod fit;
pub mod planner;

pub use error::{PlanError, PlanResult};
pub use estimate::{EstimateSource, FixedEstimates, LevelEstimate};
pub use fit::{FitReport, fit_schedule};
pub use planner::Planner;
