//! Multi-channel transfer coordination.
//!
//! One logical transfer is split into a primary-channel byte range and one
//! range per secondary device by the [`BandwidthAllocator`]. The
//! [`ChannelTransferCoordinator`] runs the pieces concurrently and folds their
//! progress into a single weighted figure.
//!
//! A composite completes only when every sub-transfer completes. A failed or
//! cancelled sub-transfer never stops its siblings, but once all of them are
//! terminal the composite is marked failed and lists the ids that fell short.

pub mod allocator;
pub mod coordinator;
pub mod error;

pub use allocator::{Allocation, BandwidthAllocator};
pub use coordinator::{
    ActiveTransfers, ChannelTransferCoordinator, CoordinatorConfig, TransferStats, format_duration,
};
pub use error::CoordinatorError;
