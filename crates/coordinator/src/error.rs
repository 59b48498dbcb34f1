//! Coordinator error types.

/// Errors produced when starting or querying a composite transfer.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("primary channel unavailable")]
    PrimaryUnavailable,

    #[error("too many concurrent transfers (limit {limit})")]
    CapacityExceeded { limit: usize },

    #[error("transfer not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] tandem_transfer::TransferError),
}
