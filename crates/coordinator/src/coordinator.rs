//! Composite transfers split across the primary channel and secondary devices.
//!
//! A [`ChannelTransferCoordinator`] starts one primary sub-transfer (chunked
//! upload through a [`ChunkSink`]) and one secondary sub-transfer per device
//! (MTU-sized sends through the [`DeviceRegistry`]), then samples their
//! progress on a fixed interval until every sub-transfer is terminal.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tandem_devices::DeviceRegistry;
use tandem_protocol::{DualTransferSnapshot, TransferEvent, TransferSnapshot, TransferStatus};
use tandem_transfer::{
    ChunkPlan, ChunkSender, ChunkSink, DEFAULT_CHUNK_SIZE, EventSender, ProgressThrottle,
    RetryPolicy, Transfer, TransferError, UploadSource, validate_file_name,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::allocator::{Allocation, BandwidthAllocator};
use crate::error::CoordinatorError;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Composites allowed to be in progress at once.
    pub max_concurrent_transfers: usize,
    /// How often each composite's progress is sampled.
    pub monitor_interval: Duration,
    /// Chunk size for the primary channel.
    pub chunk_size: usize,
    pub retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 10,
            monitor_interval: Duration::from_millis(500),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of [`ChannelTransferCoordinator::get_active_transfers`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTransfers {
    pub transfers: Vec<DualTransferSnapshot>,
    /// In-progress primary sub-transfers.
    pub primary_transfers: Vec<TransferSnapshot>,
}

/// Timing figures for one composite.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStats {
    pub progress: f64,
    pub elapsed_secs: f64,
    /// `None` until some progress has been made.
    pub eta_secs: Option<f64>,
    pub elapsed: String,
    pub eta: String,
}

// ---------------------------------------------------------------------------
// Composite record
// ---------------------------------------------------------------------------

struct DualTransfer {
    id: String,
    file_name: String,
    file_size: u64,
    allocation: Allocation,
    primary: Transfer,
    secondaries: Vec<Transfer>,
    cancel: CancellationToken,
    started: Instant,
    state: std::sync::RwLock<DualState>,
}

struct DualState {
    status: TransferStatus,
    primary_progress: f64,
    secondary_progress: f64,
    combined_progress: f64,
    combined_speed: f64,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    failed_transfer_ids: Vec<String>,
}

/// Outcome of one monitor sample.
enum Sample {
    Progress { progress: f64, speed: f64 },
    Completed,
    Failed(Vec<String>),
    /// Already terminal; nothing was written.
    Stopped,
}

impl DualTransfer {
    fn subs(&self) -> impl Iterator<Item = &Transfer> {
        std::iter::once(&self.primary).chain(self.secondaries.iter())
    }

    fn status(&self) -> TransferStatus {
        self.state.read().unwrap().status
    }

    /// Recomputes weighted progress and settles the terminal status once
    /// every sub-transfer has finished.
    fn sample(&self) -> Sample {
        let primary = self.primary.progress_percent();
        let secondary = if self.secondaries.is_empty() {
            100.0
        } else {
            self.secondaries
                .iter()
                .map(Transfer::progress_percent)
                .sum::<f64>()
                / self.secondaries.len() as f64
        };
        let combined = primary * self.allocation.primary_ratio
            + secondary * self.allocation.secondary_ratio;
        let secs = self.started.elapsed().as_secs_f64();
        let speed = if secs > 0.0 {
            self.file_size as f64 * combined / 100.0 / secs
        } else {
            0.0
        };
        let all_done = self.subs().all(|t| !t.is_active());
        let failed: Vec<String> = self
            .subs()
            .filter(|t| t.status() != TransferStatus::Completed)
            .map(Transfer::id)
            .collect();

        let mut s = self.state.write().unwrap();
        if s.status.is_terminal() {
            return Sample::Stopped;
        }
        s.primary_progress = primary;
        s.secondary_progress = secondary;
        s.combined_progress = combined;
        s.combined_speed = speed;

        if !all_done {
            return Sample::Progress {
                progress: combined,
                speed,
            };
        }
        s.ended_at = Some(Utc::now());
        if failed.is_empty() {
            s.status = TransferStatus::Completed;
            Sample::Completed
        } else {
            s.status = TransferStatus::Failed;
            s.failed_transfer_ids = failed.clone();
            Sample::Failed(failed)
        }
    }

    /// Marks the composite cancelled and cancels every sub-transfer.
    ///
    /// Returns `false` if it was already terminal.
    fn cancel(&self) -> bool {
        {
            let mut s = self.state.write().unwrap();
            if s.status.is_terminal() {
                return false;
            }
            s.status = TransferStatus::Cancelled;
            s.ended_at = Some(Utc::now());
        }
        for sub in self.subs() {
            sub.cancel();
        }
        self.cancel.cancel();
        true
    }

    fn snapshot(&self) -> DualTransferSnapshot {
        let s = self.state.read().unwrap();
        DualTransferSnapshot {
            id: self.id.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            primary_transfer_id: self.primary.id(),
            secondary_transfer_ids: self.secondaries.iter().map(Transfer::id).collect(),
            primary_ratio: self.allocation.primary_ratio,
            secondary_ratio: self.allocation.secondary_ratio,
            primary_progress: s.primary_progress,
            secondary_progress: s.secondary_progress,
            combined_progress: s.combined_progress,
            combined_speed: s.combined_speed,
            status: s.status,
            started_at: s.started_at,
            ended_at: s.ended_at,
            failed_transfer_ids: s.failed_transfer_ids.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Owns every composite transfer started through it.
pub struct ChannelTransferCoordinator {
    config: CoordinatorConfig,
    primary: Arc<dyn ChunkSink>,
    registry: Arc<DeviceRegistry>,
    allocator: BandwidthAllocator,
    transfers: Arc<RwLock<HashMap<String, Arc<DualTransfer>>>>,
    events: EventSender,
    cancel: CancellationToken,
}

impl ChannelTransferCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        primary: Arc<dyn ChunkSink>,
        registry: Arc<DeviceRegistry>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            primary,
            registry,
            allocator: BandwidthAllocator,
            transfers: Arc::new(RwLock::new(HashMap::new())),
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Starts sending `path` over the primary channel and `device_ids`,
    /// using the default 60/40 split.
    ///
    /// Returns as soon as every sub-transfer has been spawned.
    pub async fn start_dual_transfer(
        &self,
        path: &Path,
        device_ids: &[String],
    ) -> Result<DualTransferSnapshot, CoordinatorError> {
        self.check_admission().await?;
        let file_size = tokio::fs::metadata(path).await?.len();
        let allocation = self.allocator.allocate(file_size, device_ids.len());
        self.launch(path, file_size, device_ids, allocation).await
    }

    /// Like [`start_dual_transfer`](Self::start_dual_transfer), but weighs the
    /// split by throughput: `primary_speed` in Mbps against each device's
    /// nominal speed.
    pub async fn start_dual_transfer_with_speeds(
        &self,
        path: &Path,
        device_ids: &[String],
        primary_speed: f64,
    ) -> Result<DualTransferSnapshot, CoordinatorError> {
        self.check_admission().await?;
        let file_size = tokio::fs::metadata(path).await?.len();

        let mut speeds = Vec::with_capacity(device_ids.len());
        for id in device_ids {
            let mbps = match self.registry.get(id).await {
                Some(device) => device.nominal_speed as f64 * 8.0 / 1_000_000.0,
                None => 0.0,
            };
            speeds.push(mbps);
        }
        let allocation = self
            .allocator
            .allocate_by_capability(file_size, primary_speed, &speeds);
        self.launch(path, file_size, device_ids, allocation).await
    }

    async fn check_admission(&self) -> Result<(), CoordinatorError> {
        if !self.primary.is_available() {
            return Err(CoordinatorError::PrimaryUnavailable);
        }
        if self.active_count().await >= self.config.max_concurrent_transfers {
            return Err(CoordinatorError::CapacityExceeded {
                limit: self.config.max_concurrent_transfers,
            });
        }
        Ok(())
    }

    async fn active_count(&self) -> usize {
        self.transfers
            .read()
            .await
            .values()
            .filter(|d| !d.status().is_terminal())
            .count()
    }

    async fn launch(
        &self,
        path: &Path,
        file_size: u64,
        device_ids: &[String],
        allocation: Allocation,
    ) -> Result<DualTransferSnapshot, CoordinatorError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::Validation(format!("no file name in {}", path.display())))?
            .to_string();
        validate_file_name(&file_name)?;

        let id = uuid::Uuid::new_v4().to_string();
        let cancel = self.cancel.child_token();

        let primary_id = format!("{id}-primary");
        let source = UploadSource::new(
            primary_id.clone(),
            file_name.clone(),
            ChunkPlan::new(path, 0, allocation.primary_size, self.config.chunk_size),
        );
        let primary = source
            .new_transfer(primary_id)
            .with_cancel_token(cancel.child_token());

        let mut secondaries = Vec::with_capacity(device_ids.len());
        let mut plans = Vec::with_capacity(device_ids.len());
        for (i, (device_id, (offset, len))) in device_ids
            .iter()
            .zip(allocation.secondary_ranges())
            .enumerate()
        {
            let plan = self.registry.plan(path, offset, len);
            let transfer = Transfer::new(format!("{id}-sec-{i}"), file_name.clone(), len, plan.total_chunks())
                .with_device(device_id.clone())
                .with_cancel_token(cancel.child_token());
            secondaries.push(transfer);
            plans.push(plan);
        }

        let dual = Arc::new(DualTransfer {
            id: id.clone(),
            file_name: file_name.clone(),
            file_size,
            allocation,
            primary,
            secondaries,
            cancel,
            started: Instant::now(),
            state: std::sync::RwLock::new(DualState {
                status: TransferStatus::InProgress,
                primary_progress: 0.0,
                secondary_progress: 0.0,
                combined_progress: 0.0,
                combined_speed: 0.0,
                started_at: Utc::now(),
                ended_at: None,
                failed_transfer_ids: Vec::new(),
            }),
        });

        {
            // Re-check under the write lock so concurrent starts cannot overshoot.
            let mut transfers = self.transfers.write().await;
            let active = transfers
                .values()
                .filter(|d| !d.status().is_terminal())
                .count();
            if active >= self.config.max_concurrent_transfers {
                return Err(CoordinatorError::CapacityExceeded {
                    limit: self.config.max_concurrent_transfers,
                });
            }
            transfers.insert(id.clone(), Arc::clone(&dual));
        }

        info!(
            transfer_id = %id,
            file_name = %file_name,
            file_size,
            primary_bytes = dual.allocation.primary_size,
            devices = device_ids.len(),
            "dual transfer started"
        );
        self.events.emit(TransferEvent::TransferStarted {
            transfer_id: id.clone(),
            file_name,
            file_size,
            device_id: None,
        });

        self.spawn_primary(source, dual.primary.clone());
        for ((device_id, plan), transfer) in device_ids.iter().zip(plans).zip(dual.secondaries.iter())
        {
            self.spawn_secondary(device_id.clone(), plan, transfer.clone());
        }
        self.spawn_monitor(Arc::clone(&dual));

        Ok(dual.snapshot())
    }

    fn spawn_primary(&self, source: UploadSource, transfer: Transfer) {
        let sender =
            ChunkSender::new(Arc::clone(&self.primary)).with_retry(self.config.retry.clone());
        let events = self.events.clone();
        tokio::spawn(async move {
            match sender.send(&source, &transfer, None).await {
                Ok(report) => {
                    debug!(transfer_id = %transfer.id(), chunks = report.chunks_sent, "primary sub-transfer done");
                }
                Err(TransferError::Cancelled) => {
                    debug!(transfer_id = %transfer.id(), "primary sub-transfer cancelled");
                }
                Err(e) => {
                    warn!(transfer_id = %transfer.id(), "primary sub-transfer failed: {e}");
                    events.emit(TransferEvent::Error {
                        transfer_id: Some(transfer.id()),
                        device_id: None,
                        message: e.to_string(),
                    });
                }
            }
        });
    }

    fn spawn_secondary(&self, device_id: String, plan: ChunkPlan, transfer: Transfer) {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            // The registry reports failures itself.
            if let Err(e) = registry.run_transfer(&device_id, &plan, &transfer).await {
                debug!(device_id = %device_id, transfer_id = %transfer.id(), "secondary sub-transfer ended: {e}");
            }
        });
    }

    fn spawn_monitor(&self, dual: Arc<DualTransfer>) {
        let events = self.events.clone();
        let period = self.config.monitor_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut throttle = ProgressThrottle::default();
            loop {
                tokio::select! {
                    biased;
                    _ = dual.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match dual.sample() {
                    Sample::Progress { progress, speed } => {
                        if throttle.should_emit(progress) {
                            events.emit(TransferEvent::TransferProgress {
                                transfer_id: dual.id.clone(),
                                progress,
                                bytes_transferred: (dual.file_size as f64 * progress / 100.0) as u64,
                                speed,
                            });
                        }
                    }
                    Sample::Completed => {
                        info!(transfer_id = %dual.id, "dual transfer complete");
                        events.emit(TransferEvent::TransferProgress {
                            transfer_id: dual.id.clone(),
                            progress: 100.0,
                            bytes_transferred: dual.file_size,
                            speed: dual.snapshot().combined_speed,
                        });
                        events.emit(TransferEvent::TransferCompleted {
                            transfer_id: dual.id.clone(),
                            file_name: dual.file_name.clone(),
                            file_size: dual.file_size,
                            stored: None,
                        });
                        break;
                    }
                    Sample::Failed(failed) => {
                        warn!(transfer_id = %dual.id, failed = ?failed, "dual transfer failed");
                        events.emit(TransferEvent::Error {
                            transfer_id: Some(dual.id.clone()),
                            device_id: None,
                            message: format!("sub-transfers did not complete: {}", failed.join(", ")),
                        });
                        break;
                    }
                    Sample::Stopped => break,
                }
            }
            debug!(transfer_id = %dual.id, "monitor stopped");
        });
    }

    /// Cancels a composite and all of its sub-transfers, and stops tracking it.
    ///
    /// Returns `Ok(false)` if the composite had already finished.
    pub async fn cancel_transfer(&self, id: &str) -> Result<bool, CoordinatorError> {
        let mut transfers = self.transfers.write().await;
        let dual = transfers
            .get(id)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound(id.to_string()))?;
        if !dual.cancel() {
            return Ok(false);
        }
        transfers.remove(id);
        drop(transfers);

        info!(transfer_id = %id, "dual transfer cancelled");
        self.events.emit(TransferEvent::TransferCancelled {
            transfer_id: id.to_string(),
        });
        Ok(true)
    }

    /// Current state of a composite. A terminal composite is reported once,
    /// then forgotten.
    pub async fn get_transfer_status(&self, id: &str) -> Option<DualTransferSnapshot> {
        let dual = self.transfers.read().await.get(id).cloned()?;
        let snapshot = dual.snapshot();
        if snapshot.status.is_terminal() {
            self.transfers.write().await.remove(id);
        }
        Some(snapshot)
    }

    /// Every tracked composite plus in-progress primary sub-transfers.
    /// Terminal composites included here are forgotten afterwards.
    pub async fn get_active_transfers(&self) -> ActiveTransfers {
        let duals: Vec<Arc<DualTransfer>> = self.transfers.read().await.values().cloned().collect();

        let mut transfers: Vec<DualTransferSnapshot> = duals.iter().map(|d| d.snapshot()).collect();
        transfers.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        let primary_transfers = duals
            .iter()
            .filter(|d| d.primary.status() == TransferStatus::InProgress)
            .map(|d| d.primary.snapshot())
            .collect();

        let finished: Vec<&str> = transfers
            .iter()
            .filter(|t| t.status.is_terminal())
            .map(|t| t.id.as_str())
            .collect();
        if !finished.is_empty() {
            let mut map = self.transfers.write().await;
            for id in finished {
                map.remove(id);
            }
        }

        ActiveTransfers {
            transfers,
            primary_transfers,
        }
    }

    /// Elapsed time and estimated time remaining. Does not count as a report.
    pub async fn stats(&self, id: &str) -> Result<TransferStats, CoordinatorError> {
        let dual = self
            .transfers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound(id.to_string()))?;

        let progress = dual.snapshot().combined_progress;
        let elapsed_secs = dual.started.elapsed().as_secs_f64();
        let eta_secs = if progress >= 100.0 {
            Some(0.0)
        } else if progress > 0.0 {
            Some(elapsed_secs * (100.0 - progress) / progress)
        } else {
            None
        };

        Ok(TransferStats {
            progress,
            elapsed_secs,
            eta_secs,
            elapsed: format_duration(Duration::from_secs_f64(elapsed_secs)),
            eta: eta_secs
                .map(|s| format_duration(Duration::from_secs_f64(s)))
                .unwrap_or_else(|| "unknown".into()),
        })
    }

    /// Cancels every composite still in progress.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.transfers.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.cancel_transfer(&id).await {
                debug!(transfer_id = %id, "skip on shutdown: {e}");
            }
        }
        self.cancel.cancel();
        info!("transfer coordinator shut down");
    }
}

/// Formats a duration as `"1h 2m 3s"`, `"4m 5s"` or `"6s"`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, total % 3600 / 60, total % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
