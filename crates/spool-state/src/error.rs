//! Error types for the spool collaborator stores.

use thiserror::Error;

/// Result type alias for store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur in the collaborator stores.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("disklist parse error: {0}")]
    Disklist(String),

    #[error("tapelist line {line}: {reason}")]
    Tapelist { line: usize, reason: String },
}
