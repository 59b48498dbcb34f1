//! Receiver side: persists chunks per file id and merges them exactly once.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tandem_protocol::{ChunkHeader, ChunkUploadResponse, MergeState, StoredFile, TransferEvent};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{SinkError, TransferError};
use crate::events::EventSender;
use crate::sender::{ChunkSink, SinkFuture};
use crate::validation::{validate_file_id, validate_file_name};

/// Transfer type recorded for files assembled from chunks.
const TRANSFER_TYPE_CHUNKED: &str = "chunked";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding per-file chunk scopes and merged output.
    pub root: PathBuf,
    /// Maximum number of file ids receiving chunks at once.
    pub max_pending_uploads: usize,
    /// A receiving upload with no chunk for this long may be reclaimed
    /// once the store is full.
    pub idle_timeout: Duration,
    /// Merged and failed file ids remembered for status queries.
    pub max_history: usize,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_pending_uploads: 10,
            idle_timeout: Duration::from_secs(600),
            max_history: 1024,
        }
    }
}

/// Result of accepting one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptOutcome {
    pub chunk_index: u32,
    /// Distinct indices received so far for the file id.
    pub chunks_received: u32,
    pub total_chunks: u32,
    /// Set on the call that completed the merge.
    pub merged: Option<StoredFile>,
}

impl AcceptOutcome {
    pub fn to_response(&self) -> ChunkUploadResponse {
        ChunkUploadResponse {
            success: true,
            chunk_index: self.chunk_index,
            chunks_received: self.chunks_received,
            total_chunks: self.total_chunks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Receiving,
    Merging,
    /// Merged, aborted or reclaimed; the scope is gone from the index.
    Closed,
}

struct ScopeState {
    file_name: String,
    total_chunks: u32,
    received: BTreeSet<u32>,
    phase: Phase,
    last_activity: Instant,
}

/// Chunk-holding scope for one file id.
///
/// `gate` serializes chunk writes and the merge decision; `state` stays
/// readable for status queries while a merge holds the gate.
struct Scope {
    dir: PathBuf,
    gate: Mutex<()>,
    state: StdRwLock<ScopeState>,
}

/// What a merged file id was uploaded as.
#[derive(Debug, Clone)]
struct MergedEntry {
    transfer_id: String,
    file_name: String,
    total_chunks: u32,
}

impl MergedEntry {
    fn matches(&self, header: &ChunkHeader) -> bool {
        self.total_chunks == header.total_chunks && self.file_name == header.file_name
    }
}

/// Insertion-ordered map that forgets its oldest keys past `limit`.
struct History<V> {
    limit: usize,
    entries: HashMap<String, V>,
    order: VecDeque<String>,
}

impl<V> History<V> {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    fn insert(&mut self, key: String, value: V) {
        if self.entries.insert(key.clone(), value).is_some() {
            self.order.retain(|k| *k != key);
        }
        self.order.push_back(key);
        while self.entries.len() > self.limit {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn remove(&mut self, key: &str) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    fn retain(&mut self, mut keep: impl FnMut(&V) -> bool) {
        self.entries.retain(|_, v| keep(v));
        let entries = &self.entries;
        self.order.retain(|k| entries.contains_key(k));
    }
}

/// Receives chunks and reassembles them into files under [`StoreConfig::root`].
///
/// Chunks for `file_id` live in `root/<file_id>/chunk-<index>` until the last
/// distinct index arrives; that arrival merges them into
/// `root/<uuid>-<file_name>` and removes the scope. A failed merge removes
/// the scope and any partial output so the upload can restart cleanly.
/// Uploads that stop short are released by [`ChunkStore::abort`] or, when
/// the store is full, reclaimed after [`StoreConfig::idle_timeout`].
///
/// Merged outputs are kept in a registry keyed by their transfer id until
/// [`ChunkStore::remove_file`] deletes them.
pub struct ChunkStore {
    config: StoreConfig,
    scopes: RwLock<HashMap<String, Arc<Scope>>>,
    merged: RwLock<History<MergedEntry>>,
    failed: RwLock<History<String>>,
    files: RwLock<HashMap<String, StoredFile>>,
    events: EventSender,
}

impl ChunkStore {
    pub fn new(config: StoreConfig, events: EventSender) -> Self {
        Self {
            scopes: RwLock::new(HashMap::new()),
            merged: RwLock::new(History::new(config.max_history)),
            failed: RwLock::new(History::new(config.max_history)),
            files: RwLock::new(HashMap::new()),
            config,
            events,
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Persists one chunk and merges the file when every index is present.
    ///
    /// Returns the distinct-index count for the file id. Duplicate chunks
    /// overwrite the stored copy without raising the count. A chunk for an
    /// already merged file id is acknowledged without effect when its
    /// `fileName` and `totalChunks` match the merged upload; otherwise it
    /// starts a new upload under the same file id.
    pub async fn accept_chunk(
        &self,
        header: &ChunkHeader,
        data: &[u8],
    ) -> Result<AcceptOutcome, TransferError> {
        validate_chunk(header, data)?;
        let file_id = header.file_id.as_str();

        let Some(scope) = self.scope_for(header).await? else {
            return Ok(merged_noop(header));
        };
        let _gate = scope.gate.lock().await;

        let closed = scope.state.read().unwrap().phase == Phase::Closed;
        if closed {
            let duplicate = self
                .merged
                .read()
                .await
                .get(file_id)
                .is_some_and(|entry| entry.matches(header));
            if duplicate {
                return Ok(merged_noop(header));
            }
            return Err(TransferError::MergeFailed {
                file_id: file_id.to_string(),
                reason: "upload scope was discarded".into(),
            });
        }

        {
            let state = scope.state.read().unwrap();
            if state.total_chunks != header.total_chunks {
                return Err(TransferError::Validation(format!(
                    "totalChunks {} does not match {} for {file_id}",
                    header.total_chunks, state.total_chunks
                )));
            }
            if state.file_name != header.file_name {
                return Err(TransferError::Validation(format!(
                    "fileName {} does not match {} for {file_id}",
                    header.file_name, state.file_name
                )));
            }
        }

        tokio::fs::create_dir_all(&scope.dir).await?;
        let chunk_path = chunk_path(&scope.dir, header.chunk_index);
        if let Err(e) = tokio::fs::write(&chunk_path, data).await {
            error!(file_id, chunk_index = header.chunk_index, "failed to write chunk: {e}");
            return Err(e.into());
        }

        let (received, ready) = {
            let mut state = scope.state.write().unwrap();
            state.received.insert(header.chunk_index);
            state.last_activity = Instant::now();
            let received = state.received.len() as u32;
            let ready = received == state.total_chunks && state.phase == Phase::Receiving;
            if ready {
                state.phase = Phase::Merging;
            }
            (received, ready)
        };

        debug!(
            file_id,
            chunk_index = header.chunk_index,
            received,
            total = header.total_chunks,
            "chunk stored"
        );

        let mut outcome = AcceptOutcome {
            chunk_index: header.chunk_index,
            chunks_received: received,
            total_chunks: header.total_chunks,
            merged: None,
        };

        if ready {
            info!(file_id, total = header.total_chunks, "all chunks received, merging");
            let result = self.merge(file_id, &scope).await;
            scope.state.write().unwrap().phase = Phase::Closed;

            // Record the outcome before dropping the scope so a late chunk
            // never recreates it.
            let result = match result {
                Ok(stored) => {
                    self.files
                        .write()
                        .await
                        .insert(stored.transfer_id.clone(), stored.clone());
                    self.merged.write().await.insert(
                        file_id.to_string(),
                        MergedEntry {
                            transfer_id: stored.transfer_id.clone(),
                            file_name: header.file_name.clone(),
                            total_chunks: header.total_chunks,
                        },
                    );
                    Ok(stored)
                }
                Err(reason) => {
                    self.failed
                        .write()
                        .await
                        .insert(file_id.to_string(), reason.clone());
                    Err(reason)
                }
            };
            self.scopes.write().await.remove(file_id);

            match result {
                Ok(stored) => {
                    self.events.emit(TransferEvent::TransferCompleted {
                        transfer_id: stored.transfer_id.clone(),
                        file_name: stored.original_name.clone(),
                        file_size: stored.size,
                        stored: Some(stored.clone()),
                    });
                    outcome.merged = Some(stored);
                }
                Err(reason) => {
                    warn!(file_id, "merge failed: {reason}");
                    self.events.emit(TransferEvent::Error {
                        transfer_id: Some(file_id.to_string()),
                        device_id: None,
                        message: format!("merge failed: {reason}"),
                    });
                    return Err(TransferError::MergeFailed {
                        file_id: file_id.to_string(),
                        reason,
                    });
                }
            }
        }

        Ok(outcome)
    }

    /// Discards the chunks held for `file_id` and frees its upload slot.
    ///
    /// Returns `false` when nothing is receiving under that id, including
    /// an upload that is already merging.
    pub async fn abort(&self, file_id: &str) -> Result<bool, TransferError> {
        validate_file_id(file_id)?;
        let scope = self.scopes.read().await.get(file_id).cloned();
        let Some(scope) = scope else {
            return Ok(false);
        };

        let _gate = scope.gate.lock().await;
        {
            let mut state = scope.state.write().unwrap();
            if state.phase != Phase::Receiving {
                return Ok(false);
            }
            state.phase = Phase::Closed;
        }
        {
            let mut scopes = self.scopes.write().await;
            if scopes.get(file_id).is_some_and(|s| Arc::ptr_eq(s, &scope)) {
                scopes.remove(file_id);
            }
        }
        remove_scope_dir(file_id, &scope.dir).await;
        info!(file_id, "upload aborted");
        Ok(true)
    }

    /// Current receiver-side state of `file_id`.
    pub async fn merge_status(&self, file_id: &str) -> MergeState {
        let merged = self
            .merged
            .read()
            .await
            .get(file_id)
            .map(|entry| entry.transfer_id.clone());
        if let Some(transfer_id) = merged {
            if let Some(file) = self.files.read().await.get(&transfer_id) {
                return MergeState::Merged { file: file.clone() };
            }
        }
        if let Some(scope) = self.scopes.read().await.get(file_id) {
            let state = scope.state.read().unwrap();
            return match state.phase {
                Phase::Receiving => MergeState::Receiving {
                    received: state.received.len() as u32,
                    total: state.total_chunks,
                },
                Phase::Merging | Phase::Closed => MergeState::Merging,
            };
        }
        if let Some(reason) = self.failed.read().await.get(file_id) {
            return MergeState::Failed {
                reason: reason.clone(),
            };
        }
        MergeState::Unknown
    }

    /// Every stored file, oldest first.
    pub async fn merged_files(&self) -> Vec<StoredFile> {
        let mut files: Vec<StoredFile> = self.files.read().await.values().cloned().collect();
        files.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at));
        files
    }

    /// Looks up a stored file by the transfer id assigned at merge.
    pub async fn stored_file(&self, transfer_id: &str) -> Option<StoredFile> {
        self.files.read().await.get(transfer_id).cloned()
    }

    /// Deletes a stored file from disk and forgets it.
    ///
    /// Returns `false` for an unknown transfer id. A file already missing
    /// from disk is still dropped from the registry.
    pub async fn remove_file(&self, transfer_id: &str) -> Result<bool, TransferError> {
        let Some(file) = self.stored_file(transfer_id).await else {
            return Ok(false);
        };
        match tokio::fs::remove_file(&file.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(transfer_id, path = %file.path, "stored file already gone");
            }
            Err(e) => return Err(e.into()),
        }
        self.files.write().await.remove(transfer_id);
        self.merged
            .write()
            .await
            .retain(|entry| entry.transfer_id != transfer_id);
        info!(transfer_id, path = %file.path, "stored file removed");
        Ok(true)
    }

    /// Number of file ids currently receiving chunks.
    pub async fn pending_uploads(&self) -> usize {
        self.scopes.read().await.len()
    }

    /// Returns the scope for the header's file id, creating it if needed.
    ///
    /// `None` means the chunk duplicates an already merged upload.
    async fn scope_for(&self, header: &ChunkHeader) -> Result<Option<Arc<Scope>>, TransferError> {
        let file_id = header.file_id.as_str();
        let mut scopes = self.scopes.write().await;
        if let Some(scope) = scopes.get(file_id) {
            return Ok(Some(Arc::clone(scope)));
        }
        let duplicate = self
            .merged
            .read()
            .await
            .get(file_id)
            .is_some_and(|entry| entry.matches(header));
        if duplicate {
            debug!(
                file_id,
                chunk_index = header.chunk_index,
                "chunk for merged file ignored"
            );
            return Ok(None);
        }

        if scopes.len() >= self.config.max_pending_uploads {
            self.reclaim_idle(&mut scopes).await;
        }
        if scopes.len() >= self.config.max_pending_uploads {
            return Err(TransferError::CapacityExceeded(format!(
                "{} uploads already in progress",
                scopes.len()
            )));
        }

        if self.merged.write().await.remove(file_id).is_some() {
            info!(file_id, "new upload replaces merged file id");
        }
        // A fresh upload after a failed merge starts clean.
        self.failed.write().await.remove(file_id);

        let scope = Arc::new(Scope {
            dir: self.config.root.join(file_id),
            gate: Mutex::new(()),
            state: StdRwLock::new(ScopeState {
                file_name: header.file_name.clone(),
                total_chunks: header.total_chunks,
                received: BTreeSet::new(),
                phase: Phase::Receiving,
                last_activity: Instant::now(),
            }),
        });
        scopes.insert(file_id.to_string(), Arc::clone(&scope));
        Ok(Some(scope))
    }

    /// Closes and drops receiving scopes idle for at least the idle timeout.
    ///
    /// Scopes whose gate is held are busy and left alone.
    async fn reclaim_idle(&self, scopes: &mut HashMap<String, Arc<Scope>>) {
        let now = Instant::now();
        let mut idle = Vec::new();
        for (file_id, scope) in scopes.iter() {
            let Ok(_gate) = scope.gate.try_lock() else {
                continue;
            };
            let mut state = scope.state.write().unwrap();
            if state.phase == Phase::Receiving
                && now.duration_since(state.last_activity) >= self.config.idle_timeout
            {
                state.phase = Phase::Closed;
                idle.push(file_id.clone());
            }
        }

        for file_id in idle {
            if let Some(scope) = scopes.remove(&file_id) {
                remove_scope_dir(&file_id, &scope.dir).await;
                warn!(file_id, "reclaimed idle upload");
            }
        }
    }

    /// Concatenates chunks `0..total` into the output file.
    ///
    /// Always removes the chunk directory; on failure also removes the
    /// partial output. Errors are returned as human-readable reasons.
    async fn merge(&self, file_id: &str, scope: &Scope) -> Result<StoredFile, String> {
        let (file_name, total_chunks) = {
            let state = scope.state.read().unwrap();
            (state.file_name.clone(), state.total_chunks)
        };
        let transfer_id = uuid::Uuid::new_v4().to_string();
        let stored_name = format!("{transfer_id}-{file_name}");
        let output = self.config.root.join(&stored_name);

        let result = write_merged(&scope.dir, &output, total_chunks).await;

        remove_scope_dir(file_id, &scope.dir).await;

        let (size, checksum) = match result {
            Ok(v) => v,
            Err(reason) => {
                match tokio::fs::remove_file(&output).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(file_id, "failed to remove partial output: {e}"),
                }
                return Err(reason);
            }
        };

        info!(file_id, size, path = %output.display(), "file merged");
        Ok(StoredFile {
            transfer_id,
            original_name: file_name,
            file_name: stored_name,
            size,
            path: output.to_string_lossy().into_owned(),
            checksum,
            transfer_type: TRANSFER_TYPE_CHUNKED.into(),
            uploaded_at: Utc::now(),
        })
    }
}

async fn remove_scope_dir(file_id: &str, dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(file_id, "failed to remove chunk directory: {e}"),
    }
}

async fn write_merged(dir: &Path, output: &Path, total_chunks: u32) -> Result<(u64, String), String> {
    let mut out = tokio::fs::File::create(output)
        .await
        .map_err(|e| format!("cannot create output: {e}"))?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;

    for index in 0..total_chunks {
        let data = match tokio::fs::read(chunk_path(dir, index)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(format!("missing chunk {index}"));
            }
            Err(e) => return Err(format!("cannot read chunk {index}: {e}")),
        };
        out.write_all(&data)
            .await
            .map_err(|e| format!("write failed at chunk {index}: {e}"))?;
        hasher.update(&data);
        size += data.len() as u64;
    }

    out.flush()
        .await
        .map_err(|e| format!("flush failed: {e}"))?;
    Ok((size, hex::encode(hasher.finalize())))
}

/// Acknowledgement for a chunk whose file id was already merged.
fn merged_noop(header: &ChunkHeader) -> AcceptOutcome {
    AcceptOutcome {
        chunk_index: header.chunk_index,
        chunks_received: header.total_chunks,
        total_chunks: header.total_chunks,
        merged: None,
    }
}

fn chunk_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("chunk-{index}"))
}

fn validate_chunk(header: &ChunkHeader, data: &[u8]) -> Result<(), TransferError> {
    validate_file_id(&header.file_id)?;
    validate_file_name(&header.file_name)?;
    if data.is_empty() {
        return Err(TransferError::Validation("no chunk provided".into()));
    }
    if header.total_chunks == 0 {
        return Err(TransferError::Validation("totalChunks must be at least 1".into()));
    }
    if header.chunk_index >= header.total_chunks {
        return Err(TransferError::Validation(format!(
            "chunkIndex {} out of range for {} chunks",
            header.chunk_index, header.total_chunks
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-process sink
// ---------------------------------------------------------------------------

/// [`ChunkSink`] that hands chunks straight to a local [`ChunkStore`].
#[derive(Clone)]
pub struct StoreSink {
    store: Arc<ChunkStore>,
}

impl StoreSink {
    pub fn new(store: Arc<ChunkStore>) -> Self {
        Self { store }
    }
}

impl ChunkSink for StoreSink {
    fn send_chunk<'a>(
        &'a self,
        header: &'a ChunkHeader,
        data: &'a [u8],
    ) -> SinkFuture<'a, ChunkUploadResponse> {
        Box::pin(async move {
            self.store
                .accept_chunk(header, data)
                .await
                .map(|outcome| outcome.to_response())
                .map_err(|e| SinkError::from(&e))
        })
    }

    fn abort_upload<'a>(&'a self, file_id: &'a str) -> SinkFuture<'a, bool> {
        Box::pin(async move {
            self.store
                .abort(file_id)
                .await
                .map_err(|e| SinkError::from(&e))
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn header(file_id: &str, index: u32, total: u32) -> ChunkHeader {
        ChunkHeader {
            id: String::new(),
            file_id: file_id.into(),
            file_name: "video.mp4".into(),
            chunk_index: index,
            total_chunks: total,
        }
    }

    fn store(tmp: &TempDir) -> ChunkStore {
        ChunkStore::new(StoreConfig::new(tmp.path()), EventSender::disabled())
    }

    fn split(data: &[u8], chunk: usize) -> Vec<Vec<u8>> {
        data.chunks(chunk).map(|c| c.to_vec()).collect()
    }

    fn dir_entries(path: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(path)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn out_of_order_chunks_merge_byte_identical() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let data: Vec<u8> = (0..2_500_000u32).map(|i| (i % 253) as u8).collect();
        let chunks = split(&data, 1_000_000);
        assert_eq!(chunks[2].len(), 500_000);

        let first = store.accept_chunk(&header("f1", 2, 3), &chunks[2]).await.unwrap();
        assert_eq!(first.chunks_received, 1);
        let second = store.accept_chunk(&header("f1", 0, 3), &chunks[0]).await.unwrap();
        assert_eq!(second.chunks_received, 2);
        assert!(second.merged.is_none());

        let last = store.accept_chunk(&header("f1", 1, 3), &chunks[1]).await.unwrap();
        assert_eq!(last.chunks_received, 3);
        let stored = last.merged.expect("merge should happen on the last chunk");

        let merged = std::fs::read(&stored.path).unwrap();
        assert_eq!(merged, data);
        assert_eq!(stored.size, 2_500_000);
        assert_eq!(stored.original_name, "video.mp4");
        assert_eq!(stored.checksum, crate::checksum_bytes(&data));
        assert!(!tmp.path().join("f1").exists());
    }

    #[tokio::test]
    async fn every_permutation_of_four_chunks_merges() {
        let data: Vec<u8> = (0..40u8).collect();
        let chunks = split(&data, 10);
        let orders = [
            [0, 1, 2, 3],
            [3, 2, 1, 0],
            [1, 3, 0, 2],
            [2, 0, 3, 1],
        ];
        for order in orders {
            let tmp = TempDir::new().unwrap();
            let store = store(&tmp);
            let mut merged = None;
            for idx in order {
                let outcome = store
                    .accept_chunk(&header("perm", idx, 4), &chunks[idx as usize])
                    .await
                    .unwrap();
                merged = outcome.merged.or(merged);
            }
            let stored = merged.unwrap();
            assert_eq!(std::fs::read(&stored.path).unwrap(), data, "order {order:?}");
        }
    }

    #[tokio::test]
    async fn duplicate_chunk_does_not_inflate_count() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        store.accept_chunk(&header("dup", 0, 2), b"aa").await.unwrap();
        let again = store.accept_chunk(&header("dup", 0, 2), b"aa").await.unwrap();
        assert_eq!(again.chunks_received, 1);
        assert!(again.merged.is_none());

        let done = store.accept_chunk(&header("dup", 1, 2), b"bb").await.unwrap();
        assert!(done.merged.is_some());

        // Late duplicate after the merge is a no-op.
        let late = store.accept_chunk(&header("dup", 1, 2), b"bb").await.unwrap();
        assert!(late.merged.is_none());
        assert_eq!(late.chunks_received, 2);
        assert_eq!(store.merged_files().await.len(), 1);
        let outputs: Vec<String> = dir_entries(tmp.path());
        assert_eq!(outputs.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_final_chunks_merge_once() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(store(&tmp));
        store.accept_chunk(&header("race", 0, 2), b"first-").await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store.accept_chunk(&header("race", 1, 2), b"second").await
            }));
        }

        let mut merges = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().merged.is_some() {
                merges += 1;
            }
        }
        assert_eq!(merges, 1);
        assert_eq!(dir_entries(tmp.path()).len(), 1);
    }

    #[tokio::test]
    async fn missing_chunk_fails_merge_and_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let (events, mut rx) = EventSender::channel();
        let store = ChunkStore::new(StoreConfig::new(tmp.path()), events);

        store.accept_chunk(&header("gone", 0, 3), b"000").await.unwrap();
        store.accept_chunk(&header("gone", 1, 3), b"111").await.unwrap();
        std::fs::remove_file(tmp.path().join("gone").join("chunk-0")).unwrap();

        let err = store
            .accept_chunk(&header("gone", 2, 3), b"222")
            .await
            .unwrap_err();
        match &err {
            TransferError::MergeFailed { file_id, reason } => {
                assert_eq!(file_id, "gone");
                assert!(reason.contains("missing chunk 0"));
            }
            other => panic!("expected MergeFailed, got {other:?}"),
        }

        assert!(dir_entries(tmp.path()).is_empty(), "no orphaned state");
        assert!(matches!(
            store.merge_status("gone").await,
            MergeState::Failed { .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransferEvent::Error { .. }
        ));

        // Restarting the upload works from a clean slate.
        for (i, part) in [b"000", b"111", b"222"].iter().enumerate() {
            store
                .accept_chunk(&header("gone", i as u32, 3), *part)
                .await
                .unwrap();
        }
        match store.merge_status("gone").await {
            MergeState::Merged { file } => {
                assert_eq!(std::fs::read(&file.path).unwrap(), b"000111222");
            }
            other => panic!("expected merged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn validation_rejects_without_state() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let empty = store.accept_chunk(&header("v", 0, 2), b"").await;
        assert!(matches!(empty, Err(TransferError::Validation(_))));
        let out_of_range = store.accept_chunk(&header("v", 2, 2), b"x").await;
        assert!(matches!(out_of_range, Err(TransferError::Validation(_))));
        let traversal = store.accept_chunk(&header("../v", 0, 2), b"x").await;
        assert!(matches!(traversal, Err(TransferError::Validation(_))));

        assert_eq!(store.pending_uploads().await, 0);
        assert!(dir_entries(tmp.path()).is_empty());
        assert_eq!(store.merge_status("v").await, MergeState::Unknown);
    }

    #[tokio::test]
    async fn mismatched_total_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.accept_chunk(&header("m", 0, 3), b"x").await.unwrap();
        let err = store.accept_chunk(&header("m", 1, 4), b"y").await.unwrap_err();
        assert!(matches!(err, TransferError::Validation(_)));
        assert_eq!(
            store.merge_status("m").await,
            MergeState::Receiving {
                received: 1,
                total: 3
            }
        );
    }

    #[tokio::test]
    async fn capacity_limits_new_uploads_only() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            max_pending_uploads: 1,
            ..StoreConfig::new(tmp.path())
        };
        let store = ChunkStore::new(config, EventSender::disabled());

        store.accept_chunk(&header("a", 0, 2), b"x").await.unwrap();
        let err = store.accept_chunk(&header("b", 0, 2), b"x").await.unwrap_err();
        assert!(matches!(err, TransferError::CapacityExceeded(_)));
        assert!(!tmp.path().join("b").exists());

        // Existing scope keeps accepting; its merge frees the slot.
        tokio_test::assert_ok!(store.accept_chunk(&header("a", 1, 2), b"y").await);
        tokio_test::assert_ok!(store.accept_chunk(&header("b", 0, 1), b"x").await);
    }

    #[tokio::test]
    async fn reupload_with_new_header_replaces_merged_file_id() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let old = store
            .accept_chunk(&header("x", 0, 1), b"old")
            .await
            .unwrap()
            .merged
            .unwrap();

        let first = store.accept_chunk(&header("x", 0, 2), b"new-").await.unwrap();
        assert_eq!(first.chunks_received, 1);
        assert!(first.merged.is_none());
        let new = store
            .accept_chunk(&header("x", 1, 2), b"data")
            .await
            .unwrap()
            .merged
            .expect("second upload merges");

        assert_ne!(new.transfer_id, old.transfer_id);
        assert_eq!(std::fs::read(&new.path).unwrap(), b"new-data");
        assert_eq!(std::fs::read(&old.path).unwrap(), b"old");
        match store.merge_status("x").await {
            MergeState::Merged { file } => assert_eq!(file.transfer_id, new.transfer_id),
            other => panic!("expected merged, got {other:?}"),
        }
        assert_eq!(store.merged_files().await.len(), 2);

        // A repeat of the latest header is still a duplicate.
        let late = store.accept_chunk(&header("x", 1, 2), b"data").await.unwrap();
        assert!(late.merged.is_none());
        assert_eq!(store.pending_uploads().await, 0);
    }

    #[tokio::test]
    async fn reupload_with_new_file_name_is_not_a_duplicate() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.accept_chunk(&header("n", 0, 1), b"one").await.unwrap();

        let renamed = ChunkHeader {
            file_name: "other.mp4".into(),
            ..header("n", 0, 1)
        };
        let outcome = store.accept_chunk(&renamed, b"two").await.unwrap();
        let stored = outcome.merged.expect("renamed upload merges");
        assert_eq!(stored.original_name, "other.mp4");
        assert_eq!(std::fs::read(&stored.path).unwrap(), b"two");
    }

    #[tokio::test]
    async fn history_forgets_oldest_file_ids() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            max_history: 2,
            ..StoreConfig::new(tmp.path())
        };
        let store = ChunkStore::new(config, EventSender::disabled());

        for id in ["h1", "h2", "h3"] {
            store.accept_chunk(&header(id, 0, 1), b"z").await.unwrap();
        }
        assert_eq!(store.merge_status("h1").await, MergeState::Unknown);
        assert!(matches!(store.merge_status("h2").await, MergeState::Merged { .. }));
        assert!(matches!(store.merge_status("h3").await, MergeState::Merged { .. }));
        // Outputs stay on disk and in the registry.
        assert_eq!(store.merged_files().await.len(), 3);
    }

    #[tokio::test]
    async fn abort_discards_chunks_and_frees_the_slot() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            max_pending_uploads: 1,
            ..StoreConfig::new(tmp.path())
        };
        let store = ChunkStore::new(config, EventSender::disabled());

        store.accept_chunk(&header("a", 0, 3), b"x").await.unwrap();
        assert!(tmp.path().join("a").exists());
        assert!(store.abort("a").await.unwrap());

        assert!(!tmp.path().join("a").exists());
        assert_eq!(store.pending_uploads().await, 0);
        assert_eq!(store.merge_status("a").await, MergeState::Unknown);
        assert!(!store.abort("a").await.unwrap());

        let next = store.accept_chunk(&header("b", 0, 1), b"y").await.unwrap();
        assert!(next.merged.is_some());
        assert!(!store.abort("b").await.unwrap(), "merged uploads are not aborted");
        assert!(matches!(
            store.abort("../b").await,
            Err(TransferError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn repeated_aborts_never_exhaust_capacity() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            max_pending_uploads: 2,
            ..StoreConfig::new(tmp.path())
        };
        let store = ChunkStore::new(config, EventSender::disabled());

        for round in 0..5 {
            let id = format!("cancelled-{round}");
            store.accept_chunk(&header(&id, 0, 4), b"part").await.unwrap();
            assert!(store.abort(&id).await.unwrap());
        }
        let done = store.accept_chunk(&header("after", 0, 1), b"ok").await.unwrap();
        assert!(done.merged.is_some());
        assert_eq!(dir_entries(tmp.path()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_upload_is_reclaimed_when_full() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            max_pending_uploads: 1,
            idle_timeout: Duration::from_secs(60),
            ..StoreConfig::new(tmp.path())
        };
        let store = ChunkStore::new(config, EventSender::disabled());

        store.accept_chunk(&header("stale", 0, 2), b"x").await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        let busy = store.accept_chunk(&header("fresh", 0, 1), b"y").await;
        assert!(matches!(busy, Err(TransferError::CapacityExceeded(_))));

        tokio::time::advance(Duration::from_secs(31)).await;
        let fresh = store.accept_chunk(&header("fresh", 0, 1), b"y").await.unwrap();
        assert!(fresh.merged.is_some());
        assert!(!tmp.path().join("stale").exists());
        assert_eq!(store.merge_status("stale").await, MergeState::Unknown);
    }

    #[tokio::test]
    async fn stored_file_lookup_and_removal() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let stored = store
            .accept_chunk(&header("r", 0, 1), b"keep")
            .await
            .unwrap()
            .merged
            .unwrap();
        let id = stored.transfer_id.clone();

        assert_eq!(store.stored_file(&id).await, Some(stored.clone()));
        assert_eq!(store.stored_file("nope").await, None);

        assert!(store.remove_file(&id).await.unwrap());
        assert!(!Path::new(&stored.path).exists());
        assert_eq!(store.stored_file(&id).await, None);
        assert_eq!(store.merge_status("r").await, MergeState::Unknown);
        assert!(store.merged_files().await.is_empty());
        assert!(!store.remove_file(&id).await.unwrap());
    }

    #[tokio::test]
    async fn remove_file_tolerates_missing_output() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let stored = store
            .accept_chunk(&header("m2", 0, 1), b"gone")
            .await
            .unwrap()
            .merged
            .unwrap();
        std::fs::remove_file(&stored.path).unwrap();

        assert!(store.remove_file(&stored.transfer_id).await.unwrap());
        assert!(store.merged_files().await.is_empty());
    }

    #[tokio::test]
    async fn merge_emits_completion_event() {
        let tmp = TempDir::new().unwrap();
        let (events, mut rx) = EventSender::channel();
        let store = ChunkStore::new(StoreConfig::new(tmp.path()), events);

        store.accept_chunk(&header("ev", 0, 1), b"only").await.unwrap();
        match rx.try_recv().unwrap() {
            TransferEvent::TransferCompleted {
                file_name,
                file_size,
                stored,
                ..
            } => {
                assert_eq!(file_name, "video.mp4");
                assert_eq!(file_size, 4);
                assert!(stored.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn store_sink_maps_rejections() {
        let tmp = TempDir::new().unwrap();
        let sink = StoreSink::new(Arc::new(store(&tmp)));

        let ack = sink.send_chunk(&header("s", 0, 2), b"x").await.unwrap();
        assert_eq!(ack.chunks_received, 1);

        let err = sink.send_chunk(&header("s", 5, 2), b"x").await.unwrap_err();
        assert_eq!(err.code, Some(400));
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn store_sink_aborts_partial_upload() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(store(&tmp));
        let sink = StoreSink::new(Arc::clone(&store));

        sink.send_chunk(&header("p", 0, 2), b"x").await.unwrap();
        assert!(sink.abort_upload("p").await.unwrap());
        assert!(!sink.abort_upload("p").await.unwrap());
        assert_eq!(store.pending_uploads().await, 0);
    }
}
