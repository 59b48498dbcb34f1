//! Binary chunk frames: 4-byte big-endian header length + JSON header + raw chunk bytes.

use crate::types::ChunkHeader;

/// A decoded chunk frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub header: ChunkHeader,
    pub data: Vec<u8>,
}

/// Parses a raw binary WebSocket frame into a [`ChunkFrame`].
pub fn decode_chunk_frame(frame: &[u8]) -> Result<ChunkFrame, FrameError> {
    let Some((len_bytes, rest)) = frame.split_first_chunk::<4>() else {
        return Err(FrameError::TooShort);
    };
    let header_len = u32::from_be_bytes(*len_bytes) as usize;

    if rest.len() < header_len {
        return Err(FrameError::HeaderTruncated {
            expected: header_len,
            got: rest.len(),
        });
    }

    let (header_bytes, data) = rest.split_at(header_len);
    let header: ChunkHeader =
        serde_json::from_slice(header_bytes).map_err(|e| FrameError::InvalidJson(e.to_string()))?;

    Ok(ChunkFrame {
        header,
        data: data.to_vec(),
    })
}

/// Encodes a chunk header and its bytes into one binary frame.
pub fn encode_chunk_frame(header: &ChunkHeader, data: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + data.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(data);
    Ok(buf)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),
}
