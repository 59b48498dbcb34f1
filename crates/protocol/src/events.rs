use serde::{Deserialize, Serialize};

use crate::types::{Device, StoredFile};

/// Lifecycle events pushed to observers.
///
/// The set is closed: every component reports through one of these variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransferEvent {
    #[serde(rename_all = "camelCase")]
    TransferStarted {
        transfer_id: String,
        file_name: String,
        file_size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TransferProgress {
        transfer_id: String,
        progress: f64,
        bytes_transferred: u64,
        /// Bytes per second.
        speed: f64,
    },
    #[serde(rename_all = "camelCase")]
    TransferCompleted {
        transfer_id: String,
        file_name: String,
        file_size: u64,
        /// Set when the completion is a receiver-side merge.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stored: Option<StoredFile>,
    },
    #[serde(rename_all = "camelCase")]
    TransferCancelled { transfer_id: String },
    DeviceConnected { device: Device },
    #[serde(rename_all = "camelCase")]
    DeviceDisconnected { device_id: String },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        message: String,
    },
}

impl TransferEvent {
    /// Wire tag of this event, e.g. `transfer-started`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TransferStarted { .. } => "transfer-started",
            Self::TransferProgress { .. } => "transfer-progress",
            Self::TransferCompleted { .. } => "transfer-completed",
            Self::TransferCancelled { .. } => "transfer-cancelled",
            Self::DeviceConnected { .. } => "device-connected",
            Self::DeviceDisconnected { .. } => "device-disconnected",
            Self::Error { .. } => "error",
        }
    }

    /// Transfer id this event refers to, if any.
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            Self::TransferStarted { transfer_id, .. }
            | Self::TransferProgress { transfer_id, .. }
            | Self::TransferCompleted { transfer_id, .. }
            | Self::TransferCancelled { transfer_id } => Some(transfer_id),
            Self::Error { transfer_id, .. } => transfer_id.as_deref(),
            Self::DeviceConnected { .. } | Self::DeviceDisconnected { .. } => None,
        }
    }
}
