//! Uploader side of the primary channel.
//!
//! Requests carry a UUID; the read pump routes each reply to the waiting
//! caller by that id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tandem_protocol::binary::encode_chunk_frame;
use tandem_protocol::constants::{
    WS_BINARY_REQUEST_TIMEOUT, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
    WS_REQUEST_TIMEOUT,
};
use tandem_protocol::{
    AbortUploadRequest, AbortUploadResponse, ChunkHeader, ChunkUploadResponse, Envelope,
    MergeState, MergeStatusRequest, MessageType,
};
use tandem_transfer::{ChunkSink, SinkError, SinkFuture};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::ClientError;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Envelope>>>>;

/// WebSocket connection to a [`ChunkServer`](crate::ChunkServer).
pub struct ChunkClient {
    url: String,
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: Pending,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
    _ping_handle: tokio::task::JoinHandle<()>,
}

impl ChunkClient {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();
        debug!(url, "connected to chunk server");

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(write_pump(write, write_rx, cancel.clone()));
        let read_handle = tokio::spawn(read_pump(
            read,
            pending.clone(),
            connected.clone(),
            write_tx.clone(),
            cancel.clone(),
        ));
        let ping_handle = tokio::spawn(ping_pump(write_tx.clone(), cancel.clone()));

        Ok(Self {
            url: url.to_string(),
            write_tx,
            pending,
            connected,
            cancel,
            _read_handle: read_handle,
            _write_handle: write_handle,
            _ping_handle: ping_handle,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Uploads one chunk and waits for its acknowledgement.
    ///
    /// A fresh request id replaces whatever `header.id` holds.
    pub async fn upload_chunk(
        &self,
        header: &ChunkHeader,
        data: &[u8],
    ) -> Result<ChunkUploadResponse, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let header = ChunkHeader {
            id: id.clone(),
            ..header.clone()
        };
        let frame = encode_chunk_frame(&header, data)?;

        let reply = self
            .request(id, tungstenite::Message::Binary(frame.into()), WS_BINARY_REQUEST_TIMEOUT)
            .await?;
        if reply.kind != MessageType::ChunkAck {
            return Err(ClientError::UnexpectedReply(format!("{:?}", reply.kind)));
        }
        reply
            .parse_payload()?
            .ok_or_else(|| ClientError::UnexpectedReply("chunk_ack without payload".into()))
    }

    /// Asks the receiver where `file_id` stands.
    pub async fn merge_status(&self, file_id: &str) -> Result<MergeState, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Envelope::new(
            &id,
            MessageType::GetMergeStatus,
            Some(&MergeStatusRequest {
                file_id: file_id.to_string(),
            }),
        )?;
        let json = serde_json::to_string(&msg)?;

        let reply = self
            .request(id, tungstenite::Message::Text(json.into()), WS_REQUEST_TIMEOUT)
            .await?;
        reply
            .parse_payload()?
            .ok_or_else(|| ClientError::UnexpectedReply("merge_status without payload".into()))
    }

    /// Asks the receiver to drop the chunks it holds for `file_id`.
    ///
    /// Returns `false` if nothing was receiving under that id.
    pub async fn abort_upload(&self, file_id: &str) -> Result<bool, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Envelope::new(
            &id,
            MessageType::AbortUpload,
            Some(&AbortUploadRequest {
                file_id: file_id.to_string(),
            }),
        )?;
        let json = serde_json::to_string(&msg)?;

        let reply = self
            .request(id, tungstenite::Message::Text(json.into()), WS_REQUEST_TIMEOUT)
            .await?;
        if reply.kind != MessageType::UploadAborted {
            return Err(ClientError::UnexpectedReply(format!("{:?}", reply.kind)));
        }
        let body: AbortUploadResponse = reply
            .parse_payload()?
            .ok_or_else(|| ClientError::UnexpectedReply("upload_aborted without payload".into()))?;
        Ok(body.aborted)
    }

    async fn request(
        &self,
        id: String,
        frame: tungstenite::Message,
        timeout: Duration,
    ) -> Result<Envelope, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if self.write_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Closed);
        }

        let result = tokio::time::timeout(timeout, rx).await;
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(reply)) => match reply.error {
                Some(err) => Err(ClientError::Remote {
                    code: err.code,
                    message: err.message,
                }),
                None => Ok(reply),
            },
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl Drop for ChunkClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
        self._ping_handle.abort();
    }
}

impl ChunkSink for ChunkClient {
    fn send_chunk<'a>(
        &'a self,
        header: &'a ChunkHeader,
        data: &'a [u8],
    ) -> SinkFuture<'a, ChunkUploadResponse> {
        Box::pin(async move { self.upload_chunk(header, data).await.map_err(to_sink_error) })
    }

    fn abort_upload<'a>(&'a self, file_id: &'a str) -> SinkFuture<'a, bool> {
        Box::pin(async move { ChunkClient::abort_upload(self, file_id).await.map_err(to_sink_error) })
    }

    fn is_available(&self) -> bool {
        self.is_connected()
    }
}

/// Receiver rejections keep their code; everything else is retryable.
fn to_sink_error(err: ClientError) -> SinkError {
    match err {
        ClientError::Remote { code, message } => SinkError::rejected(code, message),
        other => SinkError::transient(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                match msg {
                    Some(m) => {
                        if let Err(e) = write.send(m).await {
                            error!("WebSocket write error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}

async fn read_pump<S>(
    mut read: S,
    pending: Pending,
    connected: Arc<AtomicBool>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                warn!("no traffic from chunk server, closing");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);
                        match msg {
                            tungstenite::Message::Text(text) => {
                                route_reply(&text, &pending).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    connected.store(false, Ordering::Relaxed);
    // Dropping the senders wakes every waiter with `Closed`.
    pending.lock().await.clear();
    cancel.cancel();
}

async fn route_reply(text: &str, pending: &Pending) {
    let msg: Envelope = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse reply: {e}");
            return;
        }
    };
    trace!(kind = ?msg.kind, id = %msg.id, "received reply");

    match pending.lock().await.remove(&msg.id) {
        Some(tx) => {
            let _ = tx.send(msg);
        }
        None => warn!(id = %msg.id, "reply without a pending request"),
    }
}

async fn ping_pump(write_tx: mpsc::Sender<tungstenite::Message>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if write_tx.send(tungstenite::Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
