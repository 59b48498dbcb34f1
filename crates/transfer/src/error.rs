use tandem_protocol::constants::{
    CODE_BAD_REQUEST, CODE_CAPACITY, CODE_MERGE_FAILED, CODE_WRITE_FAILED, is_retryable_code,
};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Missing or malformed chunk metadata. Never retried.
    #[error("invalid chunk metadata: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk {chunk_index} of {file_id} failed after {attempts} attempt(s): {source}")]
    ChunkUploadFailed {
        file_id: String,
        chunk_index: u32,
        attempts: u32,
        #[source]
        source: SinkError,
    },

    /// Fatal for the file id; the upload must restart from the first chunk.
    #[error("merge failed for {file_id}: {reason}")]
    MergeFailed { file_id: String, reason: String },

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// HTTP-equivalent status reported to a remote sender.
    pub fn wire_code(&self) -> i32 {
        match self {
            Self::Validation(_) => CODE_BAD_REQUEST,
            Self::MergeFailed { .. } => CODE_MERGE_FAILED,
            Self::CapacityExceeded(_) => CODE_CAPACITY,
            Self::Io(_) | Self::ChunkUploadFailed { .. } | Self::Cancelled => CODE_WRITE_FAILED,
        }
    }
}

/// Failure reported by a [`crate::ChunkSink`] for one send attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SinkError {
    /// HTTP-equivalent code when the receiver answered, `None` for transport failures.
    pub code: Option<i32>,
    pub message: String,
    pub retryable: bool,
}

impl SinkError {
    /// A transport-level failure (timeout, closed connection). Retryable.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            retryable: true,
        }
    }

    /// An explicit rejection from the receiver.
    pub fn rejected(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
            retryable: is_retryable_code(code),
        }
    }
}

impl From<&TransferError> for SinkError {
    fn from(err: &TransferError) -> Self {
        SinkError::rejected(err.wire_code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes() {
        assert_eq!(TransferError::Validation("x".into()).wire_code(), 400);
        assert_eq!(TransferError::CapacityExceeded("x".into()).wire_code(), 429);
        assert_eq!(
            TransferError::MergeFailed {
                file_id: "f".into(),
                reason: "missing chunk 1".into()
            }
            .wire_code(),
            410
        );
        let io = std::io::Error::other("disk full");
        assert_eq!(TransferError::Io(io).wire_code(), 500);
    }

    #[test]
    fn rejection_retry_classification() {
        assert!(!SinkError::from(&TransferError::Validation("bad".into())).retryable);
        assert!(SinkError::from(&TransferError::Io(std::io::Error::other("x"))).retryable);
        assert!(SinkError::transient("timeout").retryable);
    }

    #[test]
    fn upload_failed_names_chunk() {
        let err = TransferError::ChunkUploadFailed {
            file_id: "f-1".into(),
            chunk_index: 7,
            attempts: 3,
            source: SinkError::transient("connection reset"),
        };
        let msg = err.to_string();
        assert!(msg.contains("chunk 7"));
        assert!(msg.contains("connection reset"));
    }
}
