//! Registry of connected secondary-channel devices.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tandem_protocol::{Device, DeviceState, DiscoveredDevice, TransferEvent};
use tandem_transfer::{ChunkPlan, EventSender, ProgressThrottle, Transfer};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::DeviceError;
use crate::transport::SecondaryTransport;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Sub-transfers allowed in flight per device.
    pub max_parallel_per_device: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_parallel_per_device: 5,
        }
    }
}

/// Tracks connected devices and the sub-transfers attributed to each.
///
/// Disconnecting a device cancels its attached transfers before the device
/// is removed, so no live transfer ever references a missing device.
pub struct DeviceRegistry {
    transport: Arc<dyn SecondaryTransport>,
    config: RegistryConfig,
    devices: RwLock<HashMap<String, Device>>,
    attached: RwLock<HashMap<String, Vec<Transfer>>>,
    connecting: Mutex<()>,
    events: EventSender,
}

impl DeviceRegistry {
    pub fn new(
        transport: Arc<dyn SecondaryTransport>,
        config: RegistryConfig,
        events: EventSender,
    ) -> Self {
        Self {
            transport,
            config,
            devices: RwLock::new(HashMap::new()),
            attached: RwLock::new(HashMap::new()),
            connecting: Mutex::new(()),
            events,
        }
    }

    /// Scans for candidate devices. Results are never cached.
    pub async fn discover(&self) -> Result<Vec<DiscoveredDevice>, DeviceError> {
        let found = self.transport.discover().await?;
        info!(count = found.len(), "device scan complete");
        Ok(found)
    }

    /// Connects `device_id`, or returns the existing entry if already connected.
    pub async fn connect(&self, device_id: &str, name: &str) -> Result<Device, DeviceError> {
        let _guard = self.connecting.lock().await;
        if let Some(device) = self.devices.read().await.get(device_id) {
            return Ok(device.clone());
        }

        info!(device_id, name, "connecting device");
        let link = match self.transport.connect(device_id).await {
            Ok(link) => link,
            Err(e) => {
                warn!(device_id, "connect failed: {e}");
                self.events.emit(TransferEvent::Error {
                    transfer_id: None,
                    device_id: Some(device_id.to_string()),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let device = Device {
            id: device_id.to_string(),
            name: name.to_string(),
            state: DeviceState::Connected,
            signal_quality: link.signal_quality,
            nominal_speed: link.nominal_speed,
            connected_at: Utc::now(),
        };
        self.devices
            .write()
            .await
            .insert(device_id.to_string(), device.clone());
        self.events.emit(TransferEvent::DeviceConnected {
            device: device.clone(),
        });
        Ok(device)
    }

    /// Cancels the device's attached transfers, then removes it.
    ///
    /// Returns `false` if the device was not connected.
    pub async fn disconnect(&self, device_id: &str) -> bool {
        let mut devices = self.devices.write().await;
        if !devices.contains_key(device_id) {
            return false;
        }

        let transfers = self
            .attached
            .write()
            .await
            .remove(device_id)
            .unwrap_or_default();
        for transfer in transfers {
            if transfer.cancel() {
                let transfer_id = transfer.id();
                info!(device_id, transfer_id = %transfer_id, "transfer cancelled by disconnect");
                self.events
                    .emit(TransferEvent::TransferCancelled { transfer_id });
            }
        }

        devices.remove(device_id);
        drop(devices);

        if let Err(e) = self.transport.disconnect(device_id).await {
            warn!(device_id, "transport disconnect failed: {e}");
        }
        info!(device_id, "device disconnected");
        self.events.emit(TransferEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
        });
        true
    }

    pub async fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn is_connected(&self, device_id: &str) -> bool {
        self.devices.read().await.contains_key(device_id)
    }

    pub async fn connected_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Active transfers attributed to `device_id`.
    pub async fn active_transfers(&self, device_id: &str) -> Vec<Transfer> {
        self.attached
            .read()
            .await
            .get(device_id)
            .map(|list| list.iter().filter(|t| t.is_active()).cloned().collect())
            .unwrap_or_default()
    }

    /// Plans `[offset, offset + len)` of `path` in MTU-sized chunks.
    pub fn plan(&self, path: &Path, offset: u64, len: u64) -> ChunkPlan {
        ChunkPlan::new(path, offset, len, self.transport.mtu())
    }

    /// Sends `plan` to `device_id`, driving `transfer` to a terminal state.
    ///
    /// Fails with [`DeviceError::DeviceUnavailable`] if the device is not
    /// connected and [`DeviceError::CapacityExceeded`] if it is at its
    /// parallel limit; in both cases `transfer` is marked failed.
    pub async fn run_transfer(
        &self,
        device_id: &str,
        plan: &ChunkPlan,
        transfer: &Transfer,
    ) -> Result<(), DeviceError> {
        let transfer_id = transfer.id();

        let result = match self.attach(device_id, transfer).await {
            Ok(()) => {
                let result = self.drive(device_id, plan, transfer).await;
                self.detach(device_id, &transfer_id).await;
                result
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                if transfer.complete() {
                    info!(device_id, transfer_id = %transfer_id, "secondary transfer complete");
                    self.events.emit(TransferEvent::TransferCompleted {
                        transfer_id,
                        file_name: transfer.snapshot().file_name,
                        file_size: plan.total_bytes(),
                        stored: None,
                    });
                }
            }
            Err(DeviceError::Cancelled) => {
                transfer.cancel();
            }
            Err(e) => {
                warn!(device_id, transfer_id = %transfer_id, "secondary transfer failed: {e}");
                transfer.fail(e.to_string());
                self.events.emit(TransferEvent::Error {
                    transfer_id: Some(transfer_id),
                    device_id: Some(device_id.to_string()),
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn drive(
        &self,
        device_id: &str,
        plan: &ChunkPlan,
        transfer: &Transfer,
    ) -> Result<(), DeviceError> {
        if plan.chunk_size() > self.transport.mtu() {
            return Err(DeviceError::Transport(format!(
                "chunk size {} exceeds MTU {}",
                plan.chunk_size(),
                self.transport.mtu()
            )));
        }

        let transfer_id = transfer.id();
        transfer.start();
        self.events.emit(TransferEvent::TransferStarted {
            transfer_id: transfer_id.clone(),
            file_name: transfer.snapshot().file_name,
            file_size: plan.total_bytes(),
            device_id: Some(device_id.to_string()),
        });

        let started = Instant::now();
        let mut throttle = ProgressThrottle::default();
        let mut reader = plan.reader();

        for spec in plan.chunks() {
            if transfer.is_cancelled() {
                return Err(DeviceError::Cancelled);
            }
            let data = reader.read(spec).await?;
            if let Err(e) = self.transport.send(device_id, spec.index, &data).await {
                if transfer.is_cancelled() {
                    return Err(DeviceError::Cancelled);
                }
                return Err(e);
            }
            transfer.record_chunk(data.len() as u64);

            let pct = transfer.progress_percent();
            if throttle.should_emit(pct) {
                let bytes = transfer.bytes_transferred();
                let secs = started.elapsed().as_secs_f64();
                self.events.emit(TransferEvent::TransferProgress {
                    transfer_id: transfer_id.clone(),
                    progress: pct,
                    bytes_transferred: bytes,
                    speed: if secs > 0.0 { bytes as f64 / secs } else { 0.0 },
                });
            }
        }

        if transfer.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        Ok(())
    }

    async fn attach(&self, device_id: &str, transfer: &Transfer) -> Result<(), DeviceError> {
        let devices = self.devices.read().await;
        if !devices.contains_key(device_id) {
            return Err(DeviceError::DeviceUnavailable(device_id.to_string()));
        }

        let mut attached = self.attached.write().await;
        let list = attached.entry(device_id.to_string()).or_default();
        list.retain(|t| t.is_active());
        if list.len() >= self.config.max_parallel_per_device {
            return Err(DeviceError::CapacityExceeded {
                device_id: device_id.to_string(),
                limit: self.config.max_parallel_per_device,
            });
        }
        list.push(transfer.clone());
        debug!(device_id, transfer_id = %transfer.id(), "transfer attached");
        Ok(())
    }

    async fn detach(&self, device_id: &str, transfer_id: &str) {
        let mut attached = self.attached.write().await;
        if let Some(list) = attached.get_mut(device_id) {
            list.retain(|t| t.id() != transfer_id);
            if list.is_empty() {
                attached.remove(device_id);
            }
        }
    }

    /// Cancels every attached transfer and disconnects every device.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.devices.read().await.keys().cloned().collect();
        for id in ids {
            self.disconnect(&id).await;
        }
        info!("device registry shut down");
    }
}
