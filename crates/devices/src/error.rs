/// Errors from the device registry and secondary transports.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device is unknown, disconnected or lost its link.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("device {device_id} already has {limit} transfers in flight")]
    CapacityExceeded { device_id: String, limit: usize },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error(transparent)]
    Transfer(#[from] tandem_transfer::TransferError),
}
