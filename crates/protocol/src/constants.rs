use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default chunk size for primary-channel uploads (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default chunk size for secondary channels (BLE MTU).
pub const DEFAULT_SECONDARY_MTU: usize = 4096;

/// Maximum WebSocket message size in bytes (50 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// How often the server pings idle connections.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Read deadline: if nothing arrives within this window the peer is gone.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// Timeout for text request/response operations.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for a binary chunk upload, including a possible merge.
pub const WS_BINARY_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Missing chunk payload or invalid chunk metadata.
pub const CODE_BAD_REQUEST: i32 = 400;

/// The upload scope was discarded after a failed merge; restart from chunk 0.
pub const CODE_MERGE_FAILED: i32 = 410;

/// Too many uploads in flight on the receiver.
pub const CODE_CAPACITY: i32 = 429;

/// Chunk could not be written.
pub const CODE_WRITE_FAILED: i32 = 500;

/// Returns `true` if a sender may retry a chunk rejected with `code`.
pub fn is_retryable_code(code: i32) -> bool {
    !matches!(code, CODE_BAD_REQUEST | CODE_MERGE_FAILED | CODE_CAPACITY)
}

/// Text envelope type identifier.
///
/// Chunk uploads themselves travel as binary frames (see [`crate::binary`]);
/// their replies, the merge status query and upload aborts use text
/// envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ChunkAck,
    GetMergeStatus,
    MergeStatus,
    AbortUpload,
    UploadAborted,
    Error,
}
