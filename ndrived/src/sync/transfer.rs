use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use ndrive_core::{
    ApiErrorClass, ChunkUpload, CommitOperation, CommitRequest, CommitResult, RemoteClient,
    RemoteError,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::digest::{DigestAlgorithm, file_digest, same_digest};
use super::state_db::{
    StateDb, StateDbError, TransferDirection, TransferRecord, TransferStatus, now_ms,
};

const DOWNLOAD_ATTEMPTS: u32 = 2;
pub const DEFAULT_CHUNK_SIZE: u64 = 20 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    State(#[from] StateDbError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("transfer paused")]
    Paused,
    #[error("download integrity check failed: expected {expected}, got {actual}")]
    Corrupt { expected: String, actual: String },
    #[error("download truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },
    #[error("batch {batch_id} is missing {missing} chunks")]
    Incomplete { batch_id: String, missing: u64 },
}

/// Chunks the server acknowledged, one bit per chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitmap {
    bits: Vec<u8>,
    len: u64,
}

impl ChunkBitmap {
    pub fn new(len: u64) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8) as usize],
            len,
        }
    }

    pub fn from_bytes(mut bits: Vec<u8>, len: u64) -> Self {
        bits.resize(len.div_ceil(8) as usize, 0);
        let mut bitmap = Self { bits, len };
        bitmap.clear_padding();
        bitmap
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Out-of-range indices are ignored.
    pub fn set(&mut self, index: u64) {
        if index < self.len {
            self.bits[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    pub fn is_set(&self, index: u64) -> bool {
        index < self.len && self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    pub fn count(&self) -> u64 {
        self.bits.iter().map(|b| u64::from(b.count_ones())).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }

    /// Length of the run of acknowledged chunks starting at 0.
    pub fn contiguous_prefix(&self) -> u64 {
        (0..self.len).take_while(|i| self.is_set(*i)).count() as u64
    }

    pub fn missing(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).filter(|i| !self.is_set(*i))
    }

    fn clear_padding(&mut self) {
        let tail = self.len % 8;
        if tail != 0
            && let Some(last) = self.bits.last_mut()
        {
            *last &= (1u8 << tail) - 1;
        }
    }
}

pub struct UploadRequest<'a> {
    pub doc_pair_id: i64,
    pub source: &'a Path,
    pub file_name: &'a str,
    pub commit: CommitRequest,
}

/// Runs uploads and downloads for one engine, at most `limit` at a time.
#[derive(Clone)]
pub struct TransferClient {
    remote: RemoteClient,
    limit: Arc<Semaphore>,
    engine_id: String,
    algorithm: DigestAlgorithm,
    chunk_size: u64,
}

impl TransferClient {
    pub fn new(remote: RemoteClient, engine_id: impl Into<String>, concurrency: usize) -> Self {
        Self {
            remote,
            limit: Arc::new(Semaphore::new(concurrency.max(1))),
            engine_id: engine_id.into(),
            algorithm: DigestAlgorithm::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Uploads `source` through a batch and commits it. Chunks already
    /// acknowledged by a previous attempt recorded in `ledger` are skipped.
    pub async fn upload(
        &self,
        ledger: Option<&StateDb>,
        request: UploadRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<CommitResult, TransferError> {
        let _permit = self
            .limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;

        let size = tokio::fs::metadata(request.source).await?.len();
        let digest = file_digest(request.source, self.algorithm).await?;
        let (mut record, resumed) = match self
            .resume_upload(ledger, request.doc_pair_id, &digest)
            .await?
        {
            Some(record) => (record, true),
            None => (self.start_upload(request.doc_pair_id, size, &digest).await?, false),
        };
        let batch_id = record.batch_id.clone().unwrap_or_default();
        if resumed
            && record.uploaded.is_complete()
            && let Some(result) = self.created_earlier(&request.commit, &digest).await?
        {
            info!(batch = %batch_id, new_ref = %result.new_ref, "batch already committed by an earlier attempt");
            let _ = self.remote.drop_batch(&batch_id).await;
            forget(ledger, record.id).await?;
            return Ok(result);
        }
        record.status = TransferStatus::Ongoing;
        record.id = persist(ledger, &record).await?;

        let mut file = tokio::fs::File::open(request.source).await?;
        let missing: Vec<u64> = record.uploaded.missing().collect();
        debug!(
            batch = %batch_id,
            total = record.chunk_count,
            pending = missing.len(),
            "uploading chunks"
        );
        for index in missing {
            if cancel.is_cancelled() {
                record.status = TransferStatus::Paused;
                persist(ledger, &record).await?;
                return Err(TransferError::Paused);
            }
            let offset = index * record.chunk_size;
            let len = record.chunk_size.min(size.saturating_sub(offset));
            let mut bytes = vec![0u8; len as usize];
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut bytes).await?;
            let chunk = ChunkUpload {
                batch_id: &batch_id,
                file_index: record.file_index,
                chunk_index: index,
                chunk_count: record.chunk_count,
                file_name: request.file_name,
                file_size: size,
            };
            self.remote.put_chunk(&chunk, bytes).await?;
            record.uploaded.set(index);
            persist(ledger, &record).await?;
        }

        if !record.uploaded.is_complete() {
            return Err(TransferError::Incomplete {
                batch_id,
                missing: record.chunk_count - record.uploaded.count(),
            });
        }
        let result = match self
            .remote
            .commit_batch(&batch_id, record.file_index, &request.commit)
            .await
        {
            Ok(result) => result,
            Err(err) if err.classification() == ApiErrorClass::Transient => {
                // The server may have applied the commit before the failure.
                match self.created_earlier(&request.commit, &digest).await {
                    Ok(Some(result)) => {
                        warn!(batch = %batch_id, new_ref = %result.new_ref, error = %err, "commit response lost, document exists");
                        result
                    }
                    _ => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        };
        forget(ledger, record.id).await?;
        info!(batch = %batch_id, new_ref = %result.new_ref, size, "upload committed");
        Ok(result)
    }

    /// For a create, the document a previous commit of the same content
    /// already produced under the target parent.
    async fn created_earlier(
        &self,
        commit: &CommitRequest,
        digest: &str,
    ) -> Result<Option<CommitResult>, TransferError> {
        let (CommitOperation::CreateDocument, Some(parent), Some(name)) = (
            commit.operation,
            commit.target_parent.as_deref(),
            commit.name.as_deref(),
        ) else {
            return Ok(None);
        };
        let found = self
            .remote
            .child_named(parent, name)
            .await?
            .filter(|doc| doc.digest.as_deref().is_some_and(|d| same_digest(d, digest)));
        Ok(found.map(|doc| CommitResult {
            new_ref: doc.uid,
            digest: doc.digest,
        }))
    }

    async fn resume_upload(
        &self,
        ledger: Option<&StateDb>,
        doc_pair_id: i64,
        digest: &str,
    ) -> Result<Option<TransferRecord>, TransferError> {
        let Some(ledger) = ledger else {
            return Ok(None);
        };
        let Some(mut record) = ledger.transfer(doc_pair_id, TransferDirection::Up).await? else {
            return Ok(None);
        };
        let Some(batch_id) = record.batch_id.clone() else {
            return Ok(None);
        };
        let content_changed = record
            .digest
            .as_deref()
            .is_none_or(|previous| !same_digest(previous, digest));
        let expired = record.expires_at.is_some_and(|at| at <= now_ms());
        if content_changed || expired {
            debug!(batch = %batch_id, content_changed, expired, "discarding previous batch");
            let _ = self.remote.drop_batch(&batch_id).await;
            return Ok(None);
        }
        match self.remote.batch_status(&batch_id, record.file_index).await {
            Ok(ack) => {
                for index in ack.received_chunks {
                    record.uploaded.set(index);
                }
                info!(
                    batch = %batch_id,
                    acknowledged = record.uploaded.count(),
                    total = record.chunk_count,
                    "resuming upload"
                );
                Ok(Some(record))
            }
            Err(RemoteError::NotFound(_)) => {
                warn!(batch = %batch_id, "upload batch expired on the server, restarting");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn start_upload(
        &self,
        doc_pair_id: i64,
        size: u64,
        digest: &str,
    ) -> Result<TransferRecord, TransferError> {
        let batch = self.remote.open_batch().await?;
        let chunk_size = if batch.chunk_size > 0 {
            batch.chunk_size
        } else {
            self.chunk_size
        };
        // An empty file is still sent as one empty chunk.
        let chunk_count = size.div_ceil(chunk_size).max(1);
        Ok(TransferRecord {
            id: 0,
            doc_pair_id,
            direction: TransferDirection::Up,
            batch_id: Some(batch.batch_id),
            file_index: 0,
            chunk_size,
            chunk_count,
            uploaded: ChunkBitmap::new(chunk_count),
            status: TransferStatus::Todo,
            engine_id: self.engine_id.clone(),
            tmp_path: None,
            digest: Some(digest.to_string()),
            expires_at: batch.expires_at,
        })
    }

    /// Downloads the content of `uid` over `target`, returning its digest.
    /// A digest mismatch is retried once before giving up.
    pub async fn download(
        &self,
        ledger: Option<&StateDb>,
        doc_pair_id: i64,
        uid: &str,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, TransferError> {
        let _permit = self
            .limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let record = TransferRecord {
            id: 0,
            doc_pair_id,
            direction: TransferDirection::Down,
            batch_id: None,
            file_index: 0,
            chunk_size: 0,
            chunk_count: 0,
            uploaded: ChunkBitmap::new(0),
            status: TransferStatus::Ongoing,
            engine_id: self.engine_id.clone(),
            tmp_path: Some(partial.to_string_lossy().to_string()),
            digest: None,
            expires_at: None,
        };
        let record_id = persist(ledger, &record).await?;

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match self.download_once(uid, &partial, cancel).await {
                Err(TransferError::Corrupt { expected, actual }) if attempt < DOWNLOAD_ATTEMPTS => {
                    warn!(uid, %expected, %actual, attempt, "corrupted download, retrying");
                }
                other => break other,
            }
        };

        let outcome = match outcome {
            Ok(digest) => replace_target(&partial, target)
                .await
                .map(|_| digest)
                .map_err(TransferError::from),
            Err(err) => Err(err),
        };
        if outcome.is_err() {
            let _ = tokio::fs::remove_file(&partial).await;
        }
        forget(ledger, record_id).await?;
        outcome
    }

    async fn download_once(
        &self,
        uid: &str,
        partial: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, TransferError> {
        let content = self.remote.content(uid).await?;
        let algorithm = content
            .digest_algorithm
            .as_deref()
            .map(DigestAlgorithm::from_server)
            .unwrap_or(self.algorithm);
        let mut hasher = algorithm.hasher();
        let mut file = tokio::fs::File::create(partial).await?;
        let mut stream = content.response.bytes_stream();
        let mut received: u64 = 0;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(TransferError::Paused);
            }
            let chunk = chunk.map_err(RemoteError::from)?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            received += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = content.content_length
            && expected != received
        {
            return Err(TransferError::Truncated {
                expected,
                actual: received,
            });
        }
        let actual = hasher.finish();
        if let Some(expected) = content.digest
            && !same_digest(&expected, &actual)
        {
            return Err(TransferError::Corrupt {
                expected: expected.to_ascii_lowercase(),
                actual,
            });
        }
        Ok(actual)
    }

    /// Removes temp files of downloads interrupted by a previous run.
    pub async fn clean_stale_downloads(&self, ledger: &StateDb) -> Result<usize, TransferError> {
        let mut cleaned = 0;
        for record in ledger.transfers().await? {
            if record.direction != TransferDirection::Down {
                continue;
            }
            if let Some(tmp) = &record.tmp_path {
                match tokio::fs::remove_file(tmp).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            let mut txn = ledger.write().await?;
            txn.delete_transfer(record.id).await?;
            txn.commit().await?;
            cleaned += 1;
        }
        if cleaned > 0 {
            info!(cleaned, "removed stale download temp files");
        }
        Ok(cleaned)
    }
}

async fn forget(ledger: Option<&StateDb>, record_id: i64) -> Result<(), TransferError> {
    if let Some(ledger) = ledger {
        let mut txn = ledger.write().await?;
        txn.delete_transfer(record_id).await?;
        txn.commit().await?;
    }
    Ok(())
}

async fn persist(ledger: Option<&StateDb>, record: &TransferRecord) -> Result<i64, TransferError> {
    let Some(ledger) = ledger else {
        return Ok(record.id);
    };
    let mut txn = ledger.write().await?;
    let id = txn.upsert_transfer(record).await?;
    txn.commit().await?;
    Ok(id)
}

/// Moves a finished download over `target`. Windows refuses to replace a
/// read-only file, so the bit is cleared there first.
async fn replace_target(partial: &Path, target: &Path) -> io::Result<()> {
    #[cfg(windows)]
    if let Ok(metadata) = tokio::fs::metadata(target).await
        && metadata.permissions().readonly()
    {
        let mut perms = metadata.permissions();
        perms.set_readonly(false);
        tokio::fs::set_permissions(target, perms).await?;
    }
    tokio::fs::rename(partial, target).await
}

/// Hidden sibling used while a download is in flight.
pub fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.ndrive-part"))
}

pub fn is_partial_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".ndrive-part")
}

#[cfg(test)]
#[path = "transfer_tests.rs"]
mod tests;
