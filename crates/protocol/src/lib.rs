//! Wire protocol shared by tandem senders, receivers and observers.
//!
//! Covers the chunk upload header/response pair, the closed lifecycle
//! event vocabulary, status snapshots and the binary frame codec used on
//! the primary channel.

pub mod binary;
pub mod constants;
pub mod envelope;
pub mod events;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{Envelope, ErrorBody};
pub use events::TransferEvent;
pub use types::{
    AbortUploadRequest, AbortUploadResponse, ChunkHeader, ChunkUploadResponse, Device, DeviceState, DiscoveredDevice, DualTransferSnapshot,
    MergeState, MergeStatusRequest, StoredFile, TransferSnapshot, TransferStatus,
};
