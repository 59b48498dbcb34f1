//! WebSocket transport for the primary channel.
//!
//! [`ChunkServer`] feeds binary chunk frames into a
//! [`ChunkStore`](tandem_transfer::ChunkStore) and answers each with a
//! `chunk_ack` or `error` envelope. Text envelopes query merge status and
//! abort partial uploads. [`ChunkClient`] is the sending half: it
//! implements [`ChunkSink`](tandem_transfer::ChunkSink) so a
//! [`ChunkSender`](tandem_transfer::ChunkSender) can drive uploads over it.

mod client;
mod connection;
mod server;

pub use client::ChunkClient;
pub use connection::{ChunkConnection, SendError, Sender};
pub use server::{ChunkServer, ServerConfig};

/// Outbound frame buffer per connection.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the chunk server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Errors produced by [`ChunkClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("receiver error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}
