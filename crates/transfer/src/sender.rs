//! Client-side chunk sender: sequential sends with bounded retry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tandem_protocol::{ChunkHeader, ChunkUploadResponse};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunked::ChunkPlan;
use crate::error::{SinkError, TransferError};
use crate::record::Transfer;
use crate::validation::{validate_file_id, validate_file_name};

/// Boxed future returned by [`ChunkSink`] methods.
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SinkError>> + Send + 'a>>;

/// Delivers one chunk to a receiver and returns its acknowledgement.
///
/// Implemented by network transports and by the in-process [`crate::StoreSink`].
pub trait ChunkSink: Send + Sync {
    fn send_chunk<'a>(
        &'a self,
        header: &'a ChunkHeader,
        data: &'a [u8],
    ) -> SinkFuture<'a, ChunkUploadResponse>;

    /// Asks the receiver to discard chunks it holds for `file_id`.
    ///
    /// Resolves to `true` if something was discarded. Sinks without
    /// receiver-side state keep the default no-op.
    fn abort_upload<'a>(&'a self, _file_id: &'a str) -> SinkFuture<'a, bool> {
        Box::pin(async { Ok(false) })
    }

    /// Returns `false` when the channel is known to be down.
    fn is_available(&self) -> bool {
        true
    }
}

impl<T: ChunkSink + ?Sized> ChunkSink for Arc<T> {
    fn send_chunk<'a>(
        &'a self,
        header: &'a ChunkHeader,
        data: &'a [u8],
    ) -> SinkFuture<'a, ChunkUploadResponse> {
        (**self).send_chunk(header, data)
    }

    fn abort_upload<'a>(&'a self, file_id: &'a str) -> SinkFuture<'a, bool> {
        (**self).abort_upload(file_id)
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }
}

/// Per-chunk retry schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per chunk, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles after each further failure.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exp)
    }
}

/// Progress reported after every acknowledged chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct SendProgress {
    pub file_id: String,
    pub chunk_index: u32,
    pub bytes_sent: u64,
    pub total_bytes: u64,
    /// Bytes per second since the first chunk was attempted.
    pub throughput: f64,
}

impl SendProgress {
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.bytes_sent as f64 / self.total_bytes as f64 * 100.0
    }
}

/// What to send: the identity the receiver files chunks under, plus the byte plan.
#[derive(Debug, Clone)]
pub struct UploadSource {
    pub file_id: String,
    pub file_name: String,
    pub plan: ChunkPlan,
}

impl UploadSource {
    pub fn new(file_id: impl Into<String>, file_name: impl Into<String>, plan: ChunkPlan) -> Self {
        Self {
            file_id: file_id.into(),
            file_name: file_name.into(),
            plan,
        }
    }

    /// Creates a pending [`Transfer`] sized for this source.
    pub fn new_transfer(&self, id: impl Into<String>) -> Transfer {
        Transfer::new(
            id,
            self.file_name.clone(),
            self.plan.total_bytes(),
            self.plan.total_chunks(),
        )
    }
}

/// Outcome of a completed send.
#[derive(Debug, Clone)]
pub struct SendReport {
    pub file_id: String,
    pub chunks_sent: u32,
    pub bytes_sent: u64,
    pub elapsed: Duration,
    /// Acknowledgement of the final chunk.
    pub last_ack: Option<ChunkUploadResponse>,
}

/// Drives one upload through a [`ChunkSink`].
///
/// Chunk `i + 1` is only read once chunk `i` is acknowledged. A chunk is
/// attempted up to [`RetryPolicy::max_attempts`] times; non-retryable
/// rejections fail immediately.
pub struct ChunkSender<S> {
    sink: S,
    retry: RetryPolicy,
}

impl<S: ChunkSink> ChunkSender<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Sends every chunk of `source`, updating `transfer` as chunks land.
    ///
    /// Cancellation is observed through `transfer`'s token between chunks
    /// and during backoff; an in-flight send is allowed to finish but is
    /// neither retried nor followed by another chunk. Once chunks may have
    /// reached the receiver, a cancelled or failed send asks the sink to
    /// discard them so the receiver's slot is freed.
    pub async fn send(
        &self,
        source: &UploadSource,
        transfer: &Transfer,
        progress_tx: Option<&mpsc::Sender<SendProgress>>,
    ) -> Result<SendReport, TransferError> {
        validate_file_id(&source.file_id)?;
        validate_file_name(&source.file_name)?;

        let cancel = transfer.cancel_token();
        check_cancelled(&cancel)?;
        transfer.start();

        let plan = &source.plan;
        let total_chunks = plan.total_chunks();
        let total_bytes = plan.total_bytes();
        let started = Instant::now();
        let mut bytes_sent = 0u64;
        let mut last_ack = None;
        let mut reader = plan.reader();

        info!(
            file_id = %source.file_id,
            total_chunks,
            total_bytes,
            "starting chunked upload"
        );

        for spec in plan.chunks() {
            if let Err(e) = check_cancelled(&cancel) {
                transfer.cancel();
                self.release(&source.file_id).await;
                return Err(e);
            }

            let data = match reader.read(spec).await {
                Ok(data) => data,
                Err(e) => {
                    transfer.fail(e.to_string());
                    self.release(&source.file_id).await;
                    return Err(e);
                }
            };

            let header = ChunkHeader {
                id: String::new(),
                file_id: source.file_id.clone(),
                file_name: source.file_name.clone(),
                chunk_index: spec.index,
                total_chunks,
            };

            let ack = match self.send_with_retry(&header, &data, &cancel).await {
                Ok(ack) => ack,
                Err(TransferError::Cancelled) => {
                    transfer.cancel();
                    self.release(&source.file_id).await;
                    return Err(TransferError::Cancelled);
                }
                Err(e) => {
                    transfer.fail(e.to_string());
                    self.release(&source.file_id).await;
                    return Err(e);
                }
            };

            transfer.record_chunk(data.len() as u64);
            bytes_sent += data.len() as u64;

            if let Some(tx) = progress_tx {
                let secs = started.elapsed().as_secs_f64();
                let _ = tx.try_send(SendProgress {
                    file_id: source.file_id.clone(),
                    chunk_index: spec.index,
                    bytes_sent,
                    total_bytes,
                    throughput: if secs > 0.0 { bytes_sent as f64 / secs } else { 0.0 },
                });
            }

            debug!(
                file_id = %source.file_id,
                chunk_index = spec.index,
                chunks_received = ack.chunks_received,
                "chunk acknowledged"
            );
            last_ack = Some(ack);
        }

        transfer.complete();
        let elapsed = started.elapsed();
        info!(
            file_id = %source.file_id,
            bytes_sent,
            elapsed_ms = elapsed.as_millis() as u64,
            "chunked upload complete"
        );

        Ok(SendReport {
            file_id: source.file_id.clone(),
            chunks_sent: total_chunks,
            bytes_sent,
            elapsed,
            last_ack,
        })
    }

    async fn release(&self, file_id: &str) {
        match self.sink.abort_upload(file_id).await {
            Ok(true) => info!(file_id, "receiver discarded partial upload"),
            Ok(false) => {}
            Err(e) => warn!(file_id, "could not release partial upload: {e}"),
        }
    }

    async fn send_with_retry(
        &self,
        header: &ChunkHeader,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<ChunkUploadResponse, TransferError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.sink.send_chunk(header, data).await;
            check_cancelled(cancel)?;

            let err = match result {
                Ok(ack) => return Ok(ack),
                Err(err) => err,
            };

            if !err.retryable || attempt >= max_attempts {
                warn!(
                    file_id = %header.file_id,
                    chunk_index = header.chunk_index,
                    attempt,
                    "chunk upload failed: {err}"
                );
                return Err(TransferError::ChunkUploadFailed {
                    file_id: header.file_id.clone(),
                    chunk_index: header.chunk_index,
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                file_id = %header.file_id,
                chunk_index = header.chunk_index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "chunk upload attempt failed, retrying: {err}"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), TransferError> {
    if cancel.is_cancelled() {
        Err(TransferError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use tandem_protocol::TransferStatus;
    use tempfile::TempDir;

    use super::*;

    /// Sink that records attempts and fails scripted chunk indices.
    #[derive(Default)]
    struct ScriptedSink {
        /// chunk index -> number of leading attempts to fail.
        failures: HashMap<u32, u32>,
        non_retryable: bool,
        attempts: Mutex<Vec<u32>>,
        delivered: Mutex<Vec<(u32, Vec<u8>)>>,
        aborted: Mutex<Vec<String>>,
    }

    impl ScriptedSink {
        fn failing(index: u32, times: u32) -> Self {
            Self {
                failures: HashMap::from([(index, times)]),
                ..Self::default()
            }
        }

        fn attempts_for(&self, index: u32) -> usize {
            self.attempts
                .lock()
                .unwrap()
                .iter()
                .filter(|&&i| i == index)
                .count()
        }
    }

    impl ChunkSink for ScriptedSink {
        fn send_chunk<'a>(
            &'a self,
            header: &'a ChunkHeader,
            data: &'a [u8],
        ) -> SinkFuture<'a, ChunkUploadResponse> {
            Box::pin(async move {
                let idx = header.chunk_index;
                let prior = {
                    let mut attempts = self.attempts.lock().unwrap();
                    let prior = attempts.iter().filter(|&&i| i == idx).count() as u32;
                    attempts.push(idx);
                    prior
                };
                if prior < self.failures.get(&idx).copied().unwrap_or(0) {
                    return Err(if self.non_retryable {
                        SinkError::rejected(400, "no chunk provided")
                    } else {
                        SinkError::transient(format!("boom on chunk {idx}"))
                    });
                }
                let mut delivered = self.delivered.lock().unwrap();
                delivered.push((idx, data.to_vec()));
                Ok(ChunkUploadResponse {
                    success: true,
                    chunk_index: idx,
                    chunks_received: delivered.len() as u32,
                    total_chunks: header.total_chunks,
                })
            })
        }

        fn abort_upload<'a>(&'a self, file_id: &'a str) -> SinkFuture<'a, bool> {
            Box::pin(async move {
                self.aborted.lock().unwrap().push(file_id.to_string());
                Ok(true)
            })
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    fn write_source(dir: &TempDir, len: usize, chunk_size: usize) -> (UploadSource, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = dir.path().join("input.bin");
        std::fs::write(&path, &data).unwrap();
        let plan = ChunkPlan::new(&path, 0, len as u64, chunk_size);
        (UploadSource::new("file-1", "input.bin", plan), data)
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn sends_all_chunks_in_order() {
        let tmp = TempDir::new().unwrap();
        let (source, data) = write_source(&tmp, 2500, 1000);
        let transfer = source.new_transfer("t1");
        let sender = ChunkSender::new(ScriptedSink::default()).with_retry(fast_retry());
        let (tx, mut rx) = mpsc::channel(16);

        let report = sender.send(&source, &transfer, Some(&tx)).await.unwrap();
        assert_eq!(report.chunks_sent, 3);
        assert_eq!(report.bytes_sent, 2500);
        assert_eq!(report.last_ack.unwrap().chunks_received, 3);
        assert_eq!(transfer.status(), TransferStatus::Completed);

        let delivered = sender.sink().delivered.lock().unwrap().clone();
        let indices: Vec<u32> = delivered.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        let joined: Vec<u8> = delivered.into_iter().flat_map(|(_, d)| d).collect();
        assert_eq!(joined, data);

        let mut last = None;
        while let Ok(p) = rx.try_recv() {
            last = Some(p);
        }
        let last = last.unwrap();
        assert_eq!(last.bytes_sent, 2500);
        assert_eq!(last.percentage(), 100.0);
        assert!(sender.sink().aborted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let tmp = TempDir::new().unwrap();
        let (source, _) = write_source(&tmp, 3000, 1000);
        let transfer = source.new_transfer("t1");
        let sender = ChunkSender::new(ScriptedSink::failing(1, 2)).with_retry(fast_retry());

        sender.send(&source, &transfer, None).await.unwrap();
        assert_eq!(sender.sink().attempts_for(1), 3);
        assert_eq!(transfer.chunks_completed(), 3);
    }

    #[tokio::test]
    async fn three_failures_abort_before_next_chunk() {
        let tmp = TempDir::new().unwrap();
        let (source, _) = write_source(&tmp, 3000, 1000);
        let transfer = source.new_transfer("t1");
        let sender = ChunkSender::new(ScriptedSink::failing(1, 3)).with_retry(fast_retry());

        let err = sender.send(&source, &transfer, None).await.unwrap_err();
        match err {
            TransferError::ChunkUploadFailed {
                chunk_index,
                attempts,
                source,
                ..
            } => {
                assert_eq!(chunk_index, 1);
                assert_eq!(attempts, 3);
                assert!(source.message.contains("chunk 1"));
            }
            other => panic!("expected ChunkUploadFailed, got {other:?}"),
        }
        assert_eq!(sender.sink().attempts_for(2), 0);
        assert_eq!(transfer.status(), TransferStatus::Failed);
        assert_eq!(transfer.chunks_completed(), 1);
        assert_eq!(*sender.sink().aborted.lock().unwrap(), vec!["file-1".to_string()]);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let tmp = TempDir::new().unwrap();
        let (source, _) = write_source(&tmp, 1000, 1000);
        let transfer = source.new_transfer("t1");
        let sink = ScriptedSink {
            non_retryable: true,
            ..ScriptedSink::failing(0, 1)
        };
        let sender = ChunkSender::new(sink).with_retry(fast_retry());

        let err = sender.send(&source, &transfer, None).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::ChunkUploadFailed { attempts: 1, .. }
        ));
        assert_eq!(sender.sink().attempts_for(0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_one_then_two_seconds() {
        let tmp = TempDir::new().unwrap();
        let (source, _) = write_source(&tmp, 10, 10);
        let transfer = source.new_transfer("t1");
        let sender = ChunkSender::new(ScriptedSink::failing(0, 3));

        let started = tokio::time::Instant::now();
        let err = sender.send(&source, &transfer, None).await.unwrap_err();
        assert!(matches!(err, TransferError::ChunkUploadFailed { .. }));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3), "waited {waited:?}");
        assert!(waited < Duration::from_secs(7), "waited {waited:?}");
    }

    #[tokio::test]
    async fn cancellation_during_backoff_stops_retries() {
        let tmp = TempDir::new().unwrap();
        let (source, _) = write_source(&tmp, 2000, 1000);
        let transfer = source.new_transfer("t1");
        let sender = Arc::new(
            ChunkSender::new(ScriptedSink::failing(0, 3)).with_retry(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(30),
            }),
        );

        let task = {
            let sender = Arc::clone(&sender);
            let transfer = transfer.clone();
            tokio::spawn(async move { sender.send(&source, &transfer, None).await })
        };

        while sender.sink().attempts_for(0) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transfer.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("sender should stop promptly")
            .unwrap();
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(sender.sink().attempts_for(0), 1);
        assert_eq!(transfer.status(), TransferStatus::Cancelled);
        assert_eq!(*sender.sink().aborted.lock().unwrap(), vec!["file-1".to_string()]);
    }

    #[tokio::test]
    async fn invalid_identity_is_rejected_before_sending() {
        let tmp = TempDir::new().unwrap();
        let (mut source, _) = write_source(&tmp, 10, 10);
        source.file_name = "../escape".into();
        let transfer = source.new_transfer("t1");
        let sender = ChunkSender::new(ScriptedSink::default());

        let err = sender.send(&source, &transfer, None).await.unwrap_err();
        assert!(matches!(err, TransferError::Validation(_)));
        assert_eq!(transfer.status(), TransferStatus::Pending);
        assert!(sender.sink().attempts.lock().unwrap().is_empty());
        assert!(sender.sink().aborted.lock().unwrap().is_empty());
    }
}
