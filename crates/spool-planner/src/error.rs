//! Planner error types.

use thiserror::Error;

/// Result type alias for planning operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors that abort the whole planning run.
///
/// Per-filesystem problems (estimate timeouts, unreachable agents) are
/// not errors at this level — they fail the one filesystem, are logged,
/// and planning continues.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("stats store error: {0}")]
    State(#[from] spool_state::StateError),

    #[error("schedule format error: {0}")]
    Core(#[from] spool_core::CoreError),

    #[error("estimate task panicked: {0}")]
    EstimateTask(String),
}
