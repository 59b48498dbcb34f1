//! Server-side connection: read/write pumps and request dispatch.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tandem_protocol::binary::decode_chunk_frame;
use tandem_protocol::constants::{
    CODE_BAD_REQUEST, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
};
use tandem_protocol::{
    AbortUploadRequest, AbortUploadResponse, Envelope, MergeStatusRequest, MessageType,
};
use tandem_transfer::ChunkStore;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::SEND_BUFFER_SIZE;

/// Handle for queueing frames to one peer. Cheap to clone.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Queues an envelope as a JSON text frame.
    pub fn send_msg(&self, msg: &Envelope) -> Result<(), SendError> {
        let json = serde_json::to_string(msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            warn!("send buffer full or closed, dropping reply");
            SendError
        })
    }

    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// One accepted uploader connection.
pub struct ChunkConnection {
    pub remote_addr: String,
    sender: Sender,
    cancel: CancellationToken,
}

impl ChunkConnection {
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Starts the pumps for an upgraded stream.
///
/// Chunks from one connection are handled in arrival order; the reply to
/// chunk `i` is queued before chunk `i + 1` is read.
pub fn spawn_connection<S>(
    ws_stream: S,
    remote_addr: String,
    store: Arc<ChunkStore>,
    server_cancel: CancellationToken,
) -> ChunkConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };

    let (ws_sink, ws_stream) = ws_stream.split();
    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    {
        let sender = sender.clone();
        let cancel = cancel.clone();
        let remote_addr = remote_addr.clone();
        tokio::spawn(async move {
            read_pump(ws_stream, sender, store, cancel.clone()).await;
            cancel.cancel();
            info!(peer = %remote_addr, "uploader disconnected");
        });
    }

    ChunkConnection {
        remote_addr,
        sender,
        cancel,
    }
}

async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

async fn read_pump<S>(mut stream: S, sender: Sender, store: Arc<ChunkStore>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
{
    // Any inbound frame proves the peer is alive.
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                warn!("no traffic within {WS_PONG_WAIT:?}, closing connection");
                break;
            }

            frame = stream.next() => {
                let ws_msg = match frame {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        error!("read pump error: {e}");
                        break;
                    }
                    None => break,
                };
                deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                match ws_msg {
                    WsMessage::Binary(data) => {
                        if data.len() > WS_MAX_MESSAGE_SIZE {
                            error!("binary message exceeds max size ({} > {WS_MAX_MESSAGE_SIZE})", data.len());
                            continue;
                        }
                        dispatch_binary(&store, &sender, &data).await;
                    }
                    WsMessage::Text(text) => {
                        dispatch_text(&store, &sender, &text).await;
                    }
                    WsMessage::Ping(data) => {
                        let _ = sender.tx.try_send(WsMessage::Pong(data));
                    }
                    WsMessage::Pong(_) => trace!("received pong"),
                    WsMessage::Close(_) => {
                        debug!("received close frame");
                        break;
                    }
                    WsMessage::Frame(_) => {}
                }
            }
        }
    }
}

/// Handles one chunk frame and queues its acknowledgement.
async fn dispatch_binary(store: &ChunkStore, sender: &Sender, data: &[u8]) {
    let reply = handle_chunk_frame(store, data).await;
    let _ = sender.send_msg(&reply);
}

async fn handle_chunk_frame(store: &ChunkStore, data: &[u8]) -> Envelope {
    let frame = match decode_chunk_frame(data) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("rejecting malformed chunk frame: {e}");
            return Envelope::error("", CODE_BAD_REQUEST, e.to_string());
        }
    };
    let header = frame.header;

    if frame.data.is_empty() {
        return Envelope::error(&header.id, CODE_BAD_REQUEST, "no chunk provided");
    }

    match store.accept_chunk(&header, &frame.data).await {
        Ok(outcome) => Envelope::new(&header.id, MessageType::ChunkAck, Some(&outcome.to_response()))
            .unwrap_or_else(|e| Envelope::error(&header.id, CODE_BAD_REQUEST, e.to_string())),
        Err(e) => {
            debug!(file_id = %header.file_id, chunk_index = header.chunk_index, "chunk rejected: {e}");
            Envelope::error(&header.id, e.wire_code(), e.to_string())
        }
    }
}

async fn dispatch_text(store: &ChunkStore, sender: &Sender, text: &str) {
    let msg: Envelope = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("invalid envelope JSON: {e}");
            return;
        }
    };
    let reply = handle_request(store, &msg).await;
    let _ = sender.send_msg(&reply);
}

async fn handle_request(store: &ChunkStore, msg: &Envelope) -> Envelope {
    match msg.kind {
        MessageType::GetMergeStatus => {
            let req = match msg.parse_payload::<MergeStatusRequest>() {
                Ok(Some(req)) => req,
                Ok(None) => return msg.reply_error(CODE_BAD_REQUEST, "missing fileId"),
                Err(e) => return msg.reply_error(CODE_BAD_REQUEST, e.to_string()),
            };
            let state = store.merge_status(&req.file_id).await;
            msg.reply(MessageType::MergeStatus, Some(&state))
                .unwrap_or_else(|e| msg.reply_error(CODE_BAD_REQUEST, e.to_string()))
        }
        MessageType::AbortUpload => {
            let req = match msg.parse_payload::<AbortUploadRequest>() {
                Ok(Some(req)) => req,
                Ok(None) => return msg.reply_error(CODE_BAD_REQUEST, "missing fileId"),
                Err(e) => return msg.reply_error(CODE_BAD_REQUEST, e.to_string()),
            };
            match store.abort(&req.file_id).await {
                Ok(aborted) => msg
                    .reply(MessageType::UploadAborted, Some(&AbortUploadResponse { aborted }))
                    .unwrap_or_else(|e| msg.reply_error(CODE_BAD_REQUEST, e.to_string())),
                Err(e) => msg.reply_error(e.wire_code(), e.to_string()),
            }
        }
        other => {
            warn!(kind = ?other, "unhandled message type");
            msg.reply_error(CODE_BAD_REQUEST, "unexpected message type")
        }
    }
}
