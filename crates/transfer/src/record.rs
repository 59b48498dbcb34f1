use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tandem_protocol::{TransferSnapshot, TransferStatus};
use tokio_util::sync::CancellationToken;

/// One logical upload of one file over one channel (thread-safe, cheap to clone).
///
/// Status only moves forward (see [`TransferStatus::can_transition_to`]);
/// illegal transitions are ignored and reported as `false`. Failing or
/// cancelling a pending transfer starts it first, so its snapshot carries
/// both timestamps. Cancelling the
/// record also trips its cancellation token so the task driving it stops
/// at the next chunk boundary.
#[derive(Clone)]
pub struct Transfer {
    inner: Arc<RwLock<TransferInner>>,
    cancel: CancellationToken,
}

struct TransferInner {
    id: String,
    file_name: String,
    file_size: u64,
    total_chunks: u32,
    chunks_completed: u32,
    bytes_transferred: u64,
    status: TransferStatus,
    device_id: Option<String>,
    started: Option<(Instant, DateTime<Utc>)>,
    ended: Option<(Instant, DateTime<Utc>)>,
    error: String,
}

impl Transfer {
    pub fn new(
        id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        total_chunks: u32,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TransferInner {
                id: id.into(),
                file_name: file_name.into(),
                file_size,
                total_chunks,
                chunks_completed: 0,
                bytes_transferred: 0,
                status: TransferStatus::Pending,
                device_id: None,
                started: None,
                ended: None,
                error: String::new(),
            })),
            cancel: CancellationToken::new(),
        }
    }

    /// Attributes the transfer to a secondary-channel device.
    pub fn with_device(self, device_id: impl Into<String>) -> Self {
        self.inner.write().unwrap().device_id = Some(device_id.into());
        self
    }

    /// Replaces the cancellation token, typically with a child of a parent scope.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn start(&self) -> bool {
        self.transition(TransferStatus::InProgress, None)
    }

    /// Records one successfully delivered chunk of `bytes` bytes.
    ///
    /// Returns the new completed-chunk count, which never exceeds
    /// `total_chunks`. Ignored unless the transfer is in progress.
    pub fn record_chunk(&self, bytes: u64) -> u32 {
        let mut s = self.inner.write().unwrap();
        if s.status == TransferStatus::InProgress && s.chunks_completed < s.total_chunks {
            s.chunks_completed += 1;
            s.bytes_transferred = (s.bytes_transferred + bytes).min(s.file_size);
        }
        s.chunks_completed
    }

    pub fn complete(&self) -> bool {
        self.transition(TransferStatus::Completed, None)
    }

    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.transition(TransferStatus::Failed, Some(reason.into()))
    }

    /// Marks the transfer cancelled and trips its token.
    ///
    /// Returns `false` (and leaves the token alone) if already terminal.
    pub fn cancel(&self) -> bool {
        let changed = self.transition(TransferStatus::Cancelled, None);
        if changed {
            self.cancel.cancel();
        }
        changed
    }

    fn transition(&self, next: TransferStatus, error: Option<String>) -> bool {
        let mut s = self.inner.write().unwrap();
        let now = (Instant::now(), Utc::now());
        let abandoned = matches!(next, TransferStatus::Cancelled | TransferStatus::Failed);
        if s.status == TransferStatus::Pending && abandoned {
            s.status = TransferStatus::InProgress;
            s.started = Some(now);
        }
        if !s.status.can_transition_to(next) {
            return false;
        }
        match next {
            TransferStatus::InProgress => s.started = Some(now),
            _ => s.ended = Some(now),
        }
        if let Some(error) = error {
            s.error = error;
        }
        s.status = next;
        true
    }

    /// Token the driving task polls between chunk operations.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_active(&self) -> bool {
        !self.status().is_terminal()
    }

    pub fn id(&self) -> String {
        self.inner.read().unwrap().id.clone()
    }

    pub fn device_id(&self) -> Option<String> {
        self.inner.read().unwrap().device_id.clone()
    }

    pub fn status(&self) -> TransferStatus {
        self.inner.read().unwrap().status
    }

    pub fn total_chunks(&self) -> u32 {
        self.inner.read().unwrap().total_chunks
    }

    pub fn chunks_completed(&self) -> u32 {
        self.inner.read().unwrap().chunks_completed
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.inner.read().unwrap().bytes_transferred
    }

    /// Completed chunks as a percentage. A transfer with nothing to send is 100%.
    pub fn progress_percent(&self) -> f64 {
        let s = self.inner.read().unwrap();
        percent(s.chunks_completed, s.total_chunks)
    }

    /// Time spent in progress so far (or until the terminal transition).
    pub fn elapsed(&self) -> Duration {
        let s = self.inner.read().unwrap();
        match (s.started, s.ended) {
            (Some((start, _)), Some((end, _))) => end.saturating_duration_since(start),
            (Some((start, _)), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        let s = self.inner.read().unwrap();
        TransferSnapshot {
            id: s.id.clone(),
            file_name: s.file_name.clone(),
            file_size: s.file_size,
            total_chunks: s.total_chunks,
            chunks_completed: s.chunks_completed,
            bytes_transferred: s.bytes_transferred,
            status: s.status,
            progress: percent(s.chunks_completed, s.total_chunks),
            device_id: s.device_id.clone(),
            started_at: s.started.map(|(_, at)| at),
            ended_at: s.ended.map(|(_, at)| at),
            error: s.error.clone(),
        }
    }
}

fn percent(done: u32, total: u32) -> f64 {
    if total == 0 {
        return 100.0;
    }
    f64::from(done) / f64::from(total) * 100.0
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.inner.read().unwrap();
        f.debug_struct("Transfer")
            .field("id", &s.id)
            .field("status", &s.status)
            .field("chunks_completed", &s.chunks_completed)
            .field("total_chunks", &s.total_chunks)
            .finish()
    }
}
