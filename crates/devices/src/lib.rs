//! Secondary-channel endpoints.
//!
//! [`DeviceRegistry`] tracks connected devices and the sub-transfers attached
//! to them; [`SecondaryTransport`] is the send primitive behind it, with
//! [`SimulatedTransport`] standing in for real short-range radio I/O.

mod error;
mod registry;
mod transport;

pub use error::DeviceError;
pub use registry::{DeviceRegistry, RegistryConfig};
pub use transport::{
    LinkInfo, SecondaryTransport, SimulatedTransport, SimulatedTransportConfig, TransportFuture,
};

pub use tandem_protocol::{Device, DeviceState, DiscoveredDevice};
