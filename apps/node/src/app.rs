//! Application orchestrator: wires store, server, devices and coordinators.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tandem_chunk_server::{ChunkClient, ChunkServer, ServerConfig};
use tandem_coordinator::{ChannelTransferCoordinator, CoordinatorConfig, format_duration};
use tandem_devices::{DeviceRegistry, SimulatedTransport};
use tandem_protocol::{TransferEvent, TransferStatus};
use tandem_transfer::{ChunkSink, ChunkStore, EventSender, StoreSink};
use tokio::sync::mpsc;

use crate::config::{Config, SendJob, expand_home};

/// Runs the node until shutdown is requested.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let (events, events_rx) = EventSender::channel();
    tokio::spawn(log_events(events_rx));

    // -- Receiver --
    let store_config = config.store_config();
    tokio::fs::create_dir_all(&store_config.root).await?;
    tracing::info!(root = %store_config.root.display(), "upload store ready");
    let store = Arc::new(ChunkStore::new(store_config, events.clone()));

    let server = ChunkServer::new(ServerConfig { port: config.port }, Arc::clone(&store));
    let server_run = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = server_run.run().await {
            tracing::error!("chunk server error: {e}");
        }
    });

    let port = loop {
        let p = server.port().await;
        if p > 0 {
            break p;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    tracing::info!(port, "chunk server listening");

    // -- Secondary channels --
    let registry = Arc::new(DeviceRegistry::new(
        Arc::new(SimulatedTransport::new(config.transport_config())),
        config.registry_config(),
        events.clone(),
    ));

    // -- Startup transfers --
    let mut coordinators = Coordinators::new(
        config.coordinator_config(),
        Arc::clone(&store),
        Arc::clone(&registry),
        events.clone(),
    );
    for job in &config.sends {
        if let Err(e) = start_job(&config, job, &registry, &mut coordinators).await {
            tracing::error!(path = %job.path, "send job failed to start: {e:#}");
        }
    }

    tracing::info!(name = %config.name, coordinators = coordinators.len(), "node ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received, shutting down");

    // -- Graceful shutdown --
    tracing::info!("stopping services...");
    coordinators.shutdown().await;
    registry.shutdown().await;
    server.shutdown();

    Ok(())
}

/// Coordinators keyed by primary sink: one per peer URL, plus one for the
/// local store. Jobs sending to the same sink share its concurrency limit.
struct Coordinators {
    config: CoordinatorConfig,
    store: Arc<ChunkStore>,
    registry: Arc<DeviceRegistry>,
    events: EventSender,
    by_sink: HashMap<Option<String>, Arc<ChannelTransferCoordinator>>,
}

impl Coordinators {
    fn new(
        config: CoordinatorConfig,
        store: Arc<ChunkStore>,
        registry: Arc<DeviceRegistry>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            events,
            by_sink: HashMap::new(),
        }
    }

    /// Returns the coordinator for `peer_url`, connecting on first use.
    async fn for_peer(
        &mut self,
        peer_url: Option<&str>,
    ) -> anyhow::Result<Arc<ChannelTransferCoordinator>> {
        let key = peer_url.map(str::to_string);
        if let Some(coordinator) = self.by_sink.get(&key) {
            return Ok(Arc::clone(coordinator));
        }

        let primary: Arc<dyn ChunkSink> = match peer_url {
            Some(url) => Arc::new(ChunkClient::connect(url).await?),
            None => Arc::new(StoreSink::new(Arc::clone(&self.store))),
        };
        let coordinator = Arc::new(ChannelTransferCoordinator::new(
            self.config.clone(),
            primary,
            Arc::clone(&self.registry),
            self.events.clone(),
        ));
        self.by_sink.insert(key, Arc::clone(&coordinator));
        Ok(coordinator)
    }

    fn len(&self) -> usize {
        self.by_sink.len()
    }

    async fn shutdown(&self) {
        for coordinator in self.by_sink.values() {
            coordinator.shutdown().await;
        }
    }
}

/// Connects the job's devices and starts its composite transfer.
async fn start_job(
    config: &Config,
    job: &SendJob,
    registry: &Arc<DeviceRegistry>,
    coordinators: &mut Coordinators,
) -> anyhow::Result<()> {
    let coordinator = coordinators.for_peer(job.peer_url.as_deref()).await?;

    if !job.devices.is_empty() {
        let found = registry.discover().await?;
        for id in &job.devices {
            let name = found
                .iter()
                .find(|d| &d.id == id)
                .map(|d| d.name.clone())
                .unwrap_or_else(|| id.clone());
            if let Err(e) = registry.connect(id, &name).await {
                tracing::warn!(device_id = %id, "device not connected: {e}");
            }
        }
    }

    let path: PathBuf = expand_home(&job.path);
    let started = coordinator.start_dual_transfer(&path, &job.devices).await?;
    tracing::info!(
        transfer_id = %started.id,
        file = %path.display(),
        primary_ratio = started.primary_ratio,
        "send job started"
    );

    tokio::spawn(watch_transfer(
        coordinator,
        started.id,
        Duration::from_millis(config.monitor_interval_ms),
    ));
    Ok(())
}

/// Polls a composite until it reports a terminal status.
async fn watch_transfer(coordinator: Arc<ChannelTransferCoordinator>, id: String, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Ok(stats) = coordinator.stats(&id).await {
            tracing::debug!(
                transfer_id = %id,
                progress = stats.progress,
                elapsed = %stats.elapsed,
                eta = %stats.eta,
                "transfer status"
            );
        }
        let Some(snapshot) = coordinator.get_transfer_status(&id).await else {
            break;
        };
        match snapshot.status {
            TransferStatus::Completed => {
                let took = snapshot
                    .ended_at
                    .and_then(|end| (end - snapshot.started_at).to_std().ok())
                    .map(format_duration)
                    .unwrap_or_default();
                tracing::info!(transfer_id = %id, took = %took, "send job completed");
                break;
            }
            TransferStatus::Failed => {
                tracing::error!(
                    transfer_id = %id,
                    failed = ?snapshot.failed_transfer_ids,
                    "send job failed"
                );
                break;
            }
            TransferStatus::Cancelled => break,
            _ => {}
        }
    }
}

async fn log_events(mut rx: mpsc::Receiver<TransferEvent>) {
    while let Some(event) = rx.recv().await {
        match &event {
            TransferEvent::TransferProgress {
                transfer_id,
                progress,
                speed,
                ..
            } => {
                tracing::debug!(%transfer_id, progress, speed, "transfer progress");
            }
            TransferEvent::Error {
                transfer_id,
                device_id,
                message,
            } => {
                tracing::warn!(?transfer_id, ?device_id, "{message}");
            }
            other => {
                tracing::info!(event = other.name(), transfer_id = ?other.transfer_id(), "transfer event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tandem_coordinator::CoordinatorError;

    use super::*;

    #[tokio::test]
    async fn local_jobs_share_one_coordinator() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("big.bin");
        std::fs::write(&file, vec![7u8; 200_000]).unwrap();

        let config = Config {
            upload_dir: tmp.path().join("uploads").to_string_lossy().into_owned(),
            max_concurrent_transfers: 1,
            chunk_size: 1024,
            ..Config::default()
        };
        let store = Arc::new(ChunkStore::new(config.store_config(), EventSender::disabled()));
        let registry = Arc::new(DeviceRegistry::new(
            Arc::new(SimulatedTransport::new(config.transport_config())),
            config.registry_config(),
            EventSender::disabled(),
        ));
        let mut coordinators = Coordinators::new(
            config.coordinator_config(),
            store,
            Arc::clone(&registry),
            EventSender::disabled(),
        );

        let job = SendJob {
            path: file.to_string_lossy().into_owned(),
            peer_url: None,
            devices: Vec::new(),
        };
        start_job(&config, &job, &registry, &mut coordinators).await.unwrap();
        let err = start_job(&config, &job, &registry, &mut coordinators)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoordinatorError>(),
            Some(CoordinatorError::CapacityExceeded { limit: 1 })
        ));
        assert_eq!(coordinators.len(), 1);

        let first = coordinators.for_peer(None).await.unwrap();
        let again = coordinators.for_peer(None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        coordinators.shutdown().await;
    }
}
