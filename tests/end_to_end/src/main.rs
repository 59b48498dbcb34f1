fn main() {
    println!("Run `cargo test -p tandem-e2e` to execute the end-to-end tests.");
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use tandem_chunk_server::{ChunkClient, ChunkServer, ClientError, ServerConfig};
    use tandem_coordinator::{ChannelTransferCoordinator, CoordinatorConfig};
    use tandem_devices::{
        DeviceRegistry, RegistryConfig, SimulatedTransport, SimulatedTransportConfig,
    };
    use tandem_protocol::{ChunkHeader, DualTransferSnapshot, MergeState, TransferStatus};
    use tandem_transfer::{
        ChunkPlan, ChunkSender, ChunkSink, ChunkStore, EventSender, RetryPolicy, StoreConfig,
        UploadSource, file_checksum,
    };
    use tempfile::TempDir;

    struct Receiver {
        server: Arc<ChunkServer>,
        url: String,
        _handle: tokio::task::JoinHandle<()>,
    }

    impl Drop for Receiver {
        fn drop(&mut self) {
            self.server.shutdown();
        }
    }

    async fn start_receiver(root: &Path) -> Receiver {
        let store = Arc::new(ChunkStore::new(StoreConfig::new(root), EventSender::disabled()));
        let server = ChunkServer::new(ServerConfig { port: 0 }, store);
        let run = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            run.run().await.unwrap();
        });
        let port = loop {
            let p = server.port().await;
            if p > 0 {
                break p;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        Receiver {
            server,
            url: format!("ws://127.0.0.1:{port}"),
            _handle: handle,
        }
    }

    fn write_source(dir: &Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        let path = dir.join(name);
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn upload_over_websocket_is_byte_identical() {
        let tmp = TempDir::new().unwrap();
        let receiver = start_receiver(&tmp.path().join("inbox")).await;
        let (path, data) = write_source(tmp.path(), "archive.tar", 2_500_000);

        let client = ChunkClient::connect(&receiver.url).await.unwrap();
        let plan = ChunkPlan::new(&path, 0, data.len() as u64, 1_000_000);
        assert_eq!(plan.total_chunks(), 3);
        let source = UploadSource::new("archive-1", "archive.tar", plan);
        let transfer = source.new_transfer("t-archive");

        let sender = ChunkSender::new(client).with_retry(fast_retry());
        let report = sender.send(&source, &transfer, None).await.unwrap();
        assert_eq!(report.chunks_sent, 3);
        assert_eq!(report.last_ack.unwrap().chunks_received, 3);
        assert_eq!(transfer.status(), TransferStatus::Completed);

        let merged = receiver.server.store().merged_files().await;
        assert_eq!(merged.len(), 1);
        assert_eq!(std::fs::read(&merged[0].path).unwrap(), data);

        let state = sender.sink().merge_status("archive-1").await.unwrap();
        let MergeState::Merged { file } = state else {
            panic!("expected merged state, got {state:?}");
        };
        assert_eq!(file.checksum, file_checksum(&path).await.unwrap());
        assert_eq!(file.size, 2_500_000);
    }

    #[tokio::test]
    async fn out_of_order_chunks_merge_in_index_order() {
        let tmp = TempDir::new().unwrap();
        let receiver = start_receiver(&tmp.path().join("inbox")).await;
        let client = ChunkClient::connect(&receiver.url).await.unwrap();

        let parts: [&[u8]; 3] = [b"alpha-", b"beta-", b"gamma"];
        for index in [2u32, 0, 1] {
            let header = ChunkHeader {
                id: String::new(),
                file_id: "greek".into(),
                file_name: "greek.txt".into(),
                chunk_index: index,
                total_chunks: 3,
            };
            client.upload_chunk(&header, parts[index as usize]).await.unwrap();
        }

        match client.merge_status("greek").await.unwrap() {
            MergeState::Merged { file } => {
                assert_eq!(std::fs::read(&file.path).unwrap(), b"alpha-beta-gamma");
            }
            other => panic!("expected merged state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_chunk_is_rejected_without_retry() {
        let tmp = TempDir::new().unwrap();
        let receiver = start_receiver(&tmp.path().join("inbox")).await;
        let client = ChunkClient::connect(&receiver.url).await.unwrap();

        let header = ChunkHeader {
            id: String::new(),
            file_id: "empty".into(),
            file_name: "empty.bin".into(),
            chunk_index: 0,
            total_chunks: 1,
        };
        match client.upload_chunk(&header, &[]).await {
            Err(ClientError::Remote { code, message }) => {
                assert_eq!(code, 400);
                assert_eq!(message, "no chunk provided");
            }
            other => panic!("expected 400 rejection, got {other:?}"),
        }
        let sink_err = client.send_chunk(&header, &[]).await.unwrap_err();
        assert!(!sink_err.retryable);
        assert_eq!(client.merge_status("empty").await.unwrap(), MergeState::Unknown);
    }

    async fn dual_setup(
        receiver: &Receiver,
        transport: SimulatedTransportConfig,
    ) -> ChannelTransferCoordinator {
        let client = ChunkClient::connect(&receiver.url).await.unwrap();
        let registry = Arc::new(DeviceRegistry::new(
            Arc::new(SimulatedTransport::new(transport)),
            RegistryConfig::default(),
            EventSender::disabled(),
        ));
        for found in registry.discover().await.unwrap() {
            registry.connect(&found.id, &found.name).await.unwrap();
        }
        ChannelTransferCoordinator::new(
            CoordinatorConfig {
                monitor_interval: Duration::from_millis(10),
                chunk_size: 64 * 1024,
                retry: fast_retry(),
                ..CoordinatorConfig::default()
            },
            Arc::new(client),
            registry,
            EventSender::disabled(),
        )
    }

    async fn poll_until_terminal(c: &ChannelTransferCoordinator, id: &str) -> DualTransferSnapshot {
        tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                let snap = c
                    .get_transfer_status(id)
                    .await
                    .expect("transfer evicted before its terminal report");
                if snap.status.is_terminal() {
                    return snap;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("transfer should finish")
    }

    #[tokio::test]
    async fn dual_transfer_over_websocket_and_devices() {
        let tmp = TempDir::new().unwrap();
        let receiver = start_receiver(&tmp.path().join("inbox")).await;
        let transport = SimulatedTransportConfig::instant();
        let coordinator = dual_setup(&receiver, transport).await;
        let (path, data) = write_source(tmp.path(), "film.mkv", 300_000);

        let devices = vec!["bt-dev-1".to_string(), "bt-dev-3".to_string()];
        let started = coordinator.start_dual_transfer(&path, &devices).await.unwrap();
        assert_eq!(started.secondary_transfer_ids.len(), 2);

        let done = poll_until_terminal(&coordinator, &started.id).await;
        assert_eq!(done.status, TransferStatus::Completed);
        assert_eq!(done.combined_progress, 100.0);
        assert!(coordinator.get_transfer_status(&started.id).await.is_none());

        let merged = receiver.server.store().merged_files().await;
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].size, 180_000);
        assert_eq!(std::fs::read(&merged[0].path).unwrap(), data[..180_000]);
    }

    #[tokio::test]
    async fn cancelled_dual_transfer_is_forgotten() {
        let tmp = TempDir::new().unwrap();
        let receiver = start_receiver(&tmp.path().join("inbox")).await;
        let transport = SimulatedTransportConfig {
            chunk_latency: Duration::from_millis(25),
            ..SimulatedTransportConfig::instant()
        };
        let coordinator = dual_setup(&receiver, transport).await;
        let (path, _) = write_source(tmp.path(), "big.iso", 1_000_000);

        let started = coordinator
            .start_dual_transfer(&path, &["bt-dev-2".to_string()])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(coordinator.cancel_transfer(&started.id).await.unwrap());
        assert!(coordinator.get_transfer_status(&started.id).await.is_none());
        let active = coordinator.get_active_transfers().await;
        assert!(active.transfers.is_empty());
        assert!(active.primary_transfers.is_empty());

        let registry = coordinator.registry();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.active_transfers("bt-dev-2").await.is_empty());
        assert!(registry.is_connected("bt-dev-2").await);

        // Whether the primary finished or not, no chunk scope is left behind.
        let store = receiver.server.store();
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.pending_uploads().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("receiver slot should be freed");
        let leftover = std::fs::read_dir(store.root())
            .map(|dir| {
                dir.flatten()
                    .any(|e| e.file_name().to_string_lossy().ends_with("-primary"))
            })
            .unwrap_or(false);
        assert!(!leftover);
    }
}
