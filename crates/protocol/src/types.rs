use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a transfer.
///
/// Transitions only move forward: `pending -> in_progress -> {completed,
/// cancelled, failed}`. Every terminal state is entered from `in_progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "failed")]
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Returns `true` if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
                | (InProgress, Failed)
        )
    }
}

/// Header sent with every chunk on the primary channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    /// Request id used to correlate the reply; filled in by the transport.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub file_id: String,
    pub file_name: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
}

/// Successful reply to a chunk upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub success: bool,
    pub chunk_index: u32,
    /// Distinct chunk indices received so far for this file id.
    pub chunks_received: u32,
    pub total_chunks: u32,
}

/// Payload of a `get_merge_status` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeStatusRequest {
    pub file_id: String,
}

/// Payload of an `abort_upload` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortUploadRequest {
    pub file_id: String,
}

/// Reply to `abort_upload`; `aborted` is `false` if nothing was receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortUploadResponse {
    pub aborted: bool,
}

/// A file reassembled by the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub transfer_id: String,
    pub original_name: String,
    pub file_name: String,
    pub size: u64,
    pub path: String,
    /// SHA-256 hex digest of the merged output.
    pub checksum: String,
    pub transfer_type: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Receiver-side state of one file id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MergeState {
    Unknown,
    Receiving { received: u32, total: u32 },
    Merging,
    Merged { file: StoredFile },
    Failed { reason: String },
}

/// Point-in-time view of a single-channel transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSnapshot {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub chunks_completed: u32,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    /// Percentage in `0.0..=100.0`.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Point-in-time view of a composite transfer spanning several channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DualTransferSnapshot {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub primary_transfer_id: String,
    pub secondary_transfer_ids: Vec<String>,
    pub primary_ratio: f64,
    pub secondary_ratio: f64,
    pub primary_progress: f64,
    pub secondary_progress: f64,
    pub combined_progress: f64,
    /// Bytes per second across all channels.
    pub combined_speed: f64,
    pub status: TransferStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_transfer_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Disconnected,
    Connected,
}

/// A secondary-channel endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    pub state: DeviceState,
    /// RSSI in dBm.
    pub signal_quality: i32,
    /// Nominal link throughput in bytes per second.
    pub nominal_speed: u64,
    pub connected_at: DateTime<Utc>,
}

/// A candidate device returned by a discovery scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: String,
    pub signal_quality: i32,
}
