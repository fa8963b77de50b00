//! Per-shard multipart uploader.
//!
//! A shard owns one compressed sink and one multipart upload session. All
//! sink and part bookkeeping happens under the shard's mutex, which is held
//! across the part upload so a shard never has two flushes in flight.

use bytes::Bytes;
use object_store::path::Path;
use snafu::prelude::*;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::MIN_PART_SIZE;
use crate::emit;
use crate::error::{InvalidStateSnafu, ShardError, SinkSnafu, StoreSnafu};
use crate::metrics::events::{PartUploaded, ShardFinished, ShardOutcome};
use crate::sink::{CompressedSink, DEFAULT_COMPRESSION_LEVEL};
use crate::storage::{BlobStoreRef, PartTag, UploadSession};

/// Lifecycle of a shard's upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// Session open, batches accepted.
    Accepting,
    /// `complete()` in progress.
    Finalizing,
    /// Object assembled. Terminal.
    Completed,
    /// A store call failed; only `abort()` is allowed.
    Failed,
    /// Session discarded. Terminal.
    Aborted,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShardState::Accepting => "accepting",
            ShardState::Finalizing => "finalizing",
            ShardState::Completed => "completed",
            ShardState::Failed => "failed",
            ShardState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// An uploaded chunk of a shard's compressed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub shard_id: usize,
    /// 1-based, contiguous within a shard.
    pub part_number: usize,
    pub tag: PartTag,
    pub size: usize,
}

/// What a shard wrote over its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSummary {
    pub shard_id: usize,
    pub key: Path,
    pub batches: u64,
    pub records: u64,
    pub parts: usize,
    pub uploaded_bytes: u64,
}

/// Tuning shared by every shard of a pipeline.
#[derive(Debug, Clone, Copy)]
pub struct ShardOptions {
    /// Buffered compressed bytes that trigger a part upload.
    pub min_part_size: usize,
    pub compression_level: u32,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            min_part_size: MIN_PART_SIZE,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

struct ShardInner {
    state: ShardState,
    sink: CompressedSink,
    parts: Vec<Part>,
    batches: u64,
    records: u64,
}

/// Streams batches for one output object into a multipart upload.
pub struct ShardUploader {
    shard_id: usize,
    key: Path,
    session: UploadSession,
    store: BlobStoreRef,
    min_part_size: usize,
    inner: Mutex<ShardInner>,
    uploaded_bytes: AtomicU64,
}

impl fmt::Debug for ShardUploader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardUploader")
            .field("shard_id", &self.shard_id)
            .field("key", &self.key)
            .field("session", &self.session.id)
            .finish()
    }
}

impl ShardUploader {
    /// Open an upload session for `key` and return a shard accepting batches.
    pub async fn create(
        shard_id: usize,
        key: Path,
        store: BlobStoreRef,
        options: ShardOptions,
    ) -> Result<Self, ShardError> {
        let session = store
            .create_multipart_upload(&key)
            .await
            .context(StoreSnafu {
                shard: shard_id,
                operation: "create upload",
            })?;

        debug!(shard = shard_id, session = %session.id, "Opened upload session for {}", key);

        Ok(Self {
            shard_id,
            key,
            session,
            store,
            min_part_size: options.min_part_size.max(1),
            inner: Mutex::new(ShardInner {
                state: ShardState::Accepting,
                sink: CompressedSink::new(options.compression_level),
                parts: Vec::new(),
                batches: 0,
                records: 0,
            }),
            uploaded_bytes: AtomicU64::new(0),
        })
    }

    /// Compress a batch into the sink, uploading a part once the buffer
    /// reaches the part threshold.
    pub async fn write_batch<S: AsRef<str>>(&self, records: &[S]) -> Result<(), ShardError> {
        let mut inner = self.inner.lock().await;
        self.ensure_state(&inner, ShardState::Accepting, "write batch")?;

        inner.sink.write(records).context(SinkSnafu {
            shard: self.shard_id,
        })?;
        inner.batches += 1;
        inner.records += records.len() as u64;

        if inner.sink.buffered_size() >= self.min_part_size {
            let bytes = inner.sink.extract_and_reset();
            self.upload_part(&mut inner, bytes).await?;
        }

        Ok(())
    }

    /// Finalize the stream, upload the residual bytes as the last part and
    /// assemble the object.
    pub async fn complete(&self) -> Result<ShardSummary, ShardError> {
        let mut inner = self.inner.lock().await;
        self.ensure_state(&inner, ShardState::Accepting, "complete")?;
        inner.state = ShardState::Finalizing;

        if let Err(e) = inner.sink.finalize() {
            inner.state = ShardState::Failed;
            return Err(e).context(SinkSnafu {
                shard: self.shard_id,
            });
        }

        let residual = inner.sink.extract_and_reset();
        if !residual.is_empty() {
            self.upload_part(&mut inner, residual).await?;
        }

        let parts: Vec<(usize, PartTag)> = inner
            .parts
            .iter()
            .map(|part| (part.part_number, part.tag.clone()))
            .collect();

        if let Err(e) = self
            .store
            .complete_multipart_upload(&self.session, &parts)
            .await
        {
            inner.state = ShardState::Failed;
            return Err(e).context(StoreSnafu {
                shard: self.shard_id,
                operation: "complete upload",
            });
        }

        inner.state = ShardState::Completed;
        emit!(ShardFinished {
            outcome: ShardOutcome::Completed
        });

        let summary = ShardSummary {
            shard_id: self.shard_id,
            key: self.key.clone(),
            batches: inner.batches,
            records: inner.records,
            parts: inner.parts.len(),
            uploaded_bytes: self.uploaded_bytes(),
        };
        info!(
            shard = self.shard_id,
            records = summary.records,
            parts = summary.parts,
            bytes = summary.uploaded_bytes,
            "Completed {}",
            self.key
        );
        Ok(summary)
    }

    /// Abort the upload session unless the shard already reached a terminal
    /// state. Returns whether an abort was sent to the store.
    pub async fn abort(&self) -> Result<bool, ShardError> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, ShardState::Completed | ShardState::Aborted) {
            return Ok(false);
        }

        self.store
            .abort_multipart_upload(&self.session)
            .await
            .context(StoreSnafu {
                shard: self.shard_id,
                operation: "abort upload",
            })?;

        inner.state = ShardState::Aborted;
        emit!(ShardFinished {
            outcome: ShardOutcome::Aborted
        });
        warn!(shard = self.shard_id, "Aborted upload of {}", self.key);
        Ok(true)
    }

    /// Upload `bytes` as the next part. Caller holds the shard lock.
    async fn upload_part(&self, inner: &mut ShardInner, bytes: Bytes) -> Result<(), ShardError> {
        let part_number = inner.parts.len() + 1;
        let size = bytes.len();

        let tag = match self
            .store
            .upload_part(&self.session, part_number, bytes)
            .await
        {
            Ok(tag) => tag,
            Err(e) => {
                inner.state = ShardState::Failed;
                return Err(e).context(StoreSnafu {
                    shard: self.shard_id,
                    operation: "upload part",
                });
            }
        };

        inner.parts.push(Part {
            shard_id: self.shard_id,
            part_number,
            tag,
            size,
        });
        self.uploaded_bytes.fetch_add(size as u64, Ordering::Relaxed);
        emit!(PartUploaded { bytes: size as u64 });
        debug!(shard = self.shard_id, part_number, size, "Uploaded part");
        Ok(())
    }

    fn ensure_state(
        &self,
        inner: &ShardInner,
        expected: ShardState,
        operation: &'static str,
    ) -> Result<(), ShardError> {
        ensure!(
            inner.state == expected,
            InvalidStateSnafu {
                shard: self.shard_id,
                state: inner.state,
                operation,
            }
        );
        Ok(())
    }

    pub fn shard_id(&self) -> usize {
        self.shard_id
    }

    /// Bytes committed through uploaded parts so far.
    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::Relaxed)
    }

    pub async fn state(&self) -> ShardState {
        self.inner.lock().await.state
    }

    /// Snapshot of the parts uploaded so far, in part-number order.
    pub async fn parts(&self) -> Vec<Part> {
        self.inner.lock().await.parts.clone()
    }
}
