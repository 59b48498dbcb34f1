use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{DEFAULT_CHUNK_SIZE, TransferError};

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub async fn file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Chunk planning
// ---------------------------------------------------------------------------

/// Number of chunks needed for `len` bytes: `ceil(len / chunk_size)`.
pub fn total_chunks(len: u64, chunk_size: usize) -> u32 {
    let chunk_size = chunk_size.max(1) as u64;
    len.div_ceil(chunk_size) as u32
}

/// One ordinal chunk of a [`ChunkPlan`]. `offset` is relative to the plan start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub index: u32,
    pub offset: u64,
    pub len: usize,
}

/// Splits the byte range `[offset, offset + len)` of a file into chunks.
///
/// The plan holds no file handle; [`ChunkPlan::reader`] fetches chunk bytes
/// on demand, so iterating stays lazy and restartable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    path: PathBuf,
    offset: u64,
    len: u64,
    chunk_size: usize,
}

impl ChunkPlan {
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
    pub fn new(path: impl Into<PathBuf>, offset: u64, len: u64, chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            path: path.into(),
            offset,
            len,
            chunk_size,
        }
    }

    /// Plans the whole file at `path`.
    pub async fn whole_file(path: impl Into<PathBuf>, chunk_size: usize) -> Result<Self, TransferError> {
        let path = path.into();
        let len = tokio::fs::metadata(&path).await?.len();
        Ok(Self::new(path, 0, len, chunk_size))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute start of the planned range within the file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn total_bytes(&self) -> u64 {
        self.len
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u32 {
        total_chunks(self.len, self.chunk_size)
    }

    /// Returns a fresh iterator over every chunk, index 0 first.
    pub fn chunks(&self) -> ChunkIter {
        ChunkIter {
            len: self.len,
            chunk_size: self.chunk_size as u64,
            next: 0,
            total: self.total_chunks(),
        }
    }

    /// Returns a reader that opens the file on its first read and keeps
    /// the handle for every later chunk.
    pub fn reader(&self) -> ChunkReader {
        ChunkReader {
            path: self.path.clone(),
            base: self.offset,
            file: None,
            position: None,
        }
    }
}

/// Reads a plan's chunks through one file handle.
///
/// Sequential reads skip the seek; any other order seeks first.
#[derive(Debug)]
pub struct ChunkReader {
    path: PathBuf,
    base: u64,
    file: Option<tokio::fs::File>,
    /// Absolute file position after the last read.
    position: Option<u64>,
}

impl ChunkReader {
    /// Reads the bytes of `spec`.
    pub async fn read(&mut self, spec: ChunkSpec) -> Result<Vec<u8>, TransferError> {
        let file = match self.file.take() {
            Some(file) => file,
            None => tokio::fs::File::open(&self.path).await?,
        };
        let file = self.file.insert(file);
        let at = self.base + spec.offset;
        if self.position != Some(at) {
            file.seek(SeekFrom::Start(at)).await?;
        }
        let mut buf = vec![0u8; spec.len];
        if let Err(e) = file.read_exact(&mut buf).await {
            self.position = None;
            return Err(e.into());
        }
        self.position = Some(at + spec.len as u64);
        Ok(buf)
    }
}

/// Iterator over the [`ChunkSpec`]s of a plan.
#[derive(Debug, Clone)]
pub struct ChunkIter {
    len: u64,
    chunk_size: u64,
    next: u32,
    total: u32,
}

impl Iterator for ChunkIter {
    type Item = ChunkSpec;

    fn next(&mut self) -> Option<ChunkSpec> {
        if self.next >= self.total {
            return None;
        }
        let offset = u64::from(self.next) * self.chunk_size;
        let len = self.chunk_size.min(self.len - offset) as usize;
        let spec = ChunkSpec {
            index: self.next,
            offset,
            len,
        };
        self.next += 1;
        Some(spec)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.total - self.next) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ChunkIter {}
