//! Chunked file transfer over an unreliable channel.
//!
//! The sending side slices a file into ordered chunks and pushes them one at
//! a time through a [`ChunkSink`], retrying each with exponential backoff.
//! The receiving side ([`ChunkStore`]) persists chunks as they land and
//! merges them exactly once, in index order, when the set is complete.

mod chunked;
mod error;
mod events;
mod progress;
mod record;
mod sender;
mod store;
mod validation;

pub use chunked::{
    ChunkIter, ChunkPlan, ChunkReader, ChunkSpec, checksum_bytes, file_checksum, total_chunks,
};
pub use error::{SinkError, TransferError};
pub use events::{EVENT_CHANNEL_CAPACITY, EventSender};
pub use progress::ProgressThrottle;
pub use record::Transfer;
pub use sender::{
    ChunkSender, ChunkSink, RetryPolicy, SendProgress, SendReport, SinkFuture, UploadSource,
};
pub use store::{AcceptOutcome, ChunkStore, StoreConfig, StoreSink};
pub use validation::{validate_file_id, validate_file_name};

pub use tandem_protocol::constants::DEFAULT_CHUNK_SIZE;
