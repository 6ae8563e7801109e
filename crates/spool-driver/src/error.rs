//! Driver error types.

use thiserror::Error;

/// Result type alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors fatal to the run.
///
/// Per-job failures are not errors at this level — they are state
/// transitions handled inside the event loop.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("schedule error: {0}")]
    Schedule(#[from] spool_core::CoreError),

    #[error("stats store error: {0}")]
    State(#[from] spool_state::StateError),

    #[error("failed to spawn {kind} worker: {reason}")]
    WorkerSpawn { kind: &'static str, reason: String },

    #[error("worker channel closed: {0}")]
    ChannelClosed(String),
}
