use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tandem_protocol::DiscoveredDevice;
use tandem_protocol::constants::DEFAULT_SECONDARY_MTU;
use tracing::{debug, trace};

use crate::DeviceError;

/// Boxed future returned by [`SecondaryTransport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DeviceError>> + Send + 'a>>;

/// Link properties reported when a device connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    /// RSSI in dBm.
    pub signal_quality: i32,
    /// Nominal throughput in bytes per second.
    pub nominal_speed: u64,
}

/// Send primitive for a secondary (short-range, low-bandwidth) channel.
///
/// Real radio backends and [`SimulatedTransport`] both sit behind this
/// trait, so the registry and coordinator never see the medium.
pub trait SecondaryTransport: Send + Sync {
    /// Point-in-time scan for candidate devices.
    fn discover(&self) -> TransportFuture<'_, Vec<DiscoveredDevice>>;

    fn connect<'a>(&'a self, device_id: &'a str) -> TransportFuture<'a, LinkInfo>;

    /// Delivers one MTU-sized chunk to a connected device.
    fn send<'a>(
        &'a self,
        device_id: &'a str,
        chunk_index: u32,
        data: &'a [u8],
    ) -> TransportFuture<'a, ()>;

    fn disconnect<'a>(&'a self, device_id: &'a str) -> TransportFuture<'a, ()>;

    /// Largest chunk accepted by [`send`](Self::send).
    fn mtu(&self) -> usize {
        DEFAULT_SECONDARY_MTU
    }
}

// ---------------------------------------------------------------------------
// Simulated transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SimulatedTransportConfig {
    pub discovery_delay: Duration,
    pub connect_delay: Duration,
    /// Delay applied to every chunk send.
    pub chunk_latency: Duration,
    pub mtu: usize,
    pub signal_quality: i32,
    pub nominal_speed: u64,
}

impl Default for SimulatedTransportConfig {
    fn default() -> Self {
        Self {
            discovery_delay: Duration::from_secs(1),
            connect_delay: Duration::from_millis(500),
            chunk_latency: Duration::from_millis(50),
            mtu: DEFAULT_SECONDARY_MTU,
            signal_quality: -50,
            // 2 Mbps.
            nominal_speed: 250_000,
        }
    }
}

impl SimulatedTransportConfig {
    /// No artificial delays; useful in tests.
    pub fn instant() -> Self {
        Self {
            discovery_delay: Duration::ZERO,
            connect_delay: Duration::ZERO,
            chunk_latency: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// In-memory stand-in for a short-range radio.
///
/// Links exist between `connect` and `disconnect`; [`drop_link`](Self::drop_link)
/// simulates a device walking out of range.
pub struct SimulatedTransport {
    config: SimulatedTransportConfig,
    links: Mutex<HashSet<String>>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(SimulatedTransportConfig::default())
    }
}

impl SimulatedTransport {
    pub fn new(config: SimulatedTransportConfig) -> Self {
        Self {
            config,
            links: Mutex::new(HashSet::new()),
        }
    }

    /// Breaks the link to `device_id`; subsequent sends fail.
    pub fn drop_link(&self, device_id: &str) {
        self.links.lock().unwrap().remove(device_id);
    }

    fn is_linked(&self, device_id: &str) -> bool {
        self.links.lock().unwrap().contains(device_id)
    }
}

impl SecondaryTransport for SimulatedTransport {
    fn discover(&self) -> TransportFuture<'_, Vec<DiscoveredDevice>> {
        Box::pin(async move {
            tokio::time::sleep(self.config.discovery_delay).await;
            let found = [
                ("bt-dev-1", "Android Phone", -45),
                ("bt-dev-2", "iPhone", -55),
                ("bt-dev-3", "Laptop", -30),
            ]
            .into_iter()
            .map(|(id, name, rssi)| DiscoveredDevice {
                id: id.into(),
                name: name.into(),
                signal_quality: rssi,
            })
            .collect();
            Ok(found)
        })
    }

    fn connect<'a>(&'a self, device_id: &'a str) -> TransportFuture<'a, LinkInfo> {
        Box::pin(async move {
            tokio::time::sleep(self.config.connect_delay).await;
            self.links.lock().unwrap().insert(device_id.to_string());
            debug!(device_id, "simulated link up");
            Ok(LinkInfo {
                signal_quality: self.config.signal_quality,
                nominal_speed: self.config.nominal_speed,
            })
        })
    }

    fn send<'a>(
        &'a self,
        device_id: &'a str,
        chunk_index: u32,
        data: &'a [u8],
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if data.len() > self.config.mtu {
                return Err(DeviceError::Transport(format!(
                    "chunk of {} bytes exceeds MTU {}",
                    data.len(),
                    self.config.mtu
                )));
            }
            if !self.is_linked(device_id) {
                return Err(DeviceError::DeviceUnavailable(device_id.to_string()));
            }
            tokio::time::sleep(self.config.chunk_latency).await;
            // The link may drop while the chunk is in the air.
            if !self.is_linked(device_id) {
                return Err(DeviceError::DeviceUnavailable(device_id.to_string()));
            }
            trace!(device_id, chunk_index, bytes = data.len(), "simulated chunk sent");
            Ok(())
        })
    }

    fn disconnect<'a>(&'a self, device_id: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.drop_link(device_id);
            debug!(device_id, "simulated link down");
            Ok(())
        })
    }

    fn mtu(&self) -> usize {
        self.config.mtu
    }
}
