//! Fan-out pipeline.
//!
//! Reads input in fixed-size batches and assigns them round-robin to N
//! shard uploaders, each writing one gzip object through a multipart upload.
//!
//! # Architecture
//!
//! - **Dispatcher** (the caller's task): reads batches and hands each to the
//!   next shard's lane, holding an in-flight permit per batch. When all
//!   permits are taken the dispatcher blocks, bounding memory.
//! - **Lanes**: one task per shard applying its batches in dispatch order.
//! - **Completion**: at end of input every shard that has not failed is
//!   completed concurrently.
//!
//! A failed shard drops the batches still routed to it; the other shards
//! receive all of theirs. The first failure fails the run. Upload sessions left open by a failed
//! run are only aborted when `abort_on_failure` is set.

mod lane;
mod shard;
#[cfg(test)]
pub(crate) mod testing;

pub use shard::{Part, ShardOptions, ShardState, ShardSummary, ShardUploader};

use futures::future::join_all;
use object_store::path::Path;
use snafu::prelude::*;
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, MIN_PART_SIZE};
use crate::emit;
use crate::error::{
    ChannelClosedSnafu, ConfigError, ConfigSnafu, InvalidBatchSizeSnafu,
    InvalidCompressionLevelSnafu, InvalidMaxInFlightSnafu, InvalidShardCountSnafu, PipelineError,
    PipelineStorageSnafu, ShardSnafu, TaskJoinSnafu,
};
use crate::metrics::events::{BatchesDispatched, InFlightBatches, RecordsDispatched};
use crate::sink::DEFAULT_COMPRESSION_LEVEL;
use crate::source::BatchReader;
use crate::storage::{BlobStoreRef, StorageProvider};

use lane::{Dispatched, ShardLanes};

/// Runtime parameters of a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub shard_count: usize,
    /// Records per batch.
    pub batch_size: usize,
    /// Batches dispatched but not yet written before the dispatcher blocks.
    pub max_in_flight: usize,
    /// Compressed bytes buffered per shard before a part is uploaded.
    pub min_part_size: usize,
    pub compression_level: u32,
    /// Abort every incomplete upload session after the first fatal error.
    pub abort_on_failure: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            shard_count: 12,
            batch_size: 2000,
            max_in_flight: 24,
            min_part_size: MIN_PART_SIZE,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            abort_on_failure: false,
        }
    }
}

impl PipelineOptions {
    /// Set the shard count, resetting the in-flight limit to twice that.
    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self.max_in_flight = shard_count.saturating_mul(2);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_min_part_size(mut self, min_part_size: usize) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    pub fn with_abort_on_failure(mut self, abort_on_failure: bool) -> Self {
        self.abort_on_failure = abort_on_failure;
        self
    }

    /// Check the options the pipeline cannot run without.
    ///
    /// The part threshold is not held to the store minimum here so that
    /// small thresholds can be used against stores that accept them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(self.shard_count >= 1, InvalidShardCountSnafu);
        ensure!(self.batch_size >= 1, InvalidBatchSizeSnafu);
        ensure!(self.max_in_flight >= 1, InvalidMaxInFlightSnafu);
        ensure!(
            self.compression_level <= 9,
            InvalidCompressionLevelSnafu {
                level: self.compression_level
            }
        );
        Ok(())
    }

    fn shard_options(&self) -> ShardOptions {
        ShardOptions {
            min_part_size: self.min_part_size,
            compression_level: self.compression_level,
        }
    }
}

/// Statistics about a completed run.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub records: u64,
    pub batches: u64,
    pub uploaded_bytes: u64,
    /// Per-shard summaries, ordered by shard id.
    pub shards: Vec<ShardSummary>,
}

/// Object key for shard `shard` under `path`.
pub fn shard_key(path: &str, shard: usize) -> Path {
    Path::from(format!("{path}.{shard}.csv.gz"))
}

/// Counts from the dispatch phase, plus the first shard write failure.
struct DispatchSummary {
    records: u64,
    batches: u64,
    write_failure: Option<PipelineError>,
}

/// A set of open shard uploads ready to receive input.
#[derive(Debug)]
pub struct Pipeline {
    shards: Vec<Arc<ShardUploader>>,
    options: PipelineOptions,
    shutdown: CancellationToken,
}

impl Pipeline {
    /// Open one upload session per shard under `path`.
    pub async fn create(
        store: BlobStoreRef,
        path: &str,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        options.validate().context(ConfigSnafu)?;

        let shard_options = options.shard_options();
        let created = join_all((0..options.shard_count).map(|shard_id| {
            ShardUploader::create(
                shard_id,
                shard_key(path, shard_id),
                store.clone(),
                shard_options,
            )
        }))
        .await;

        let mut shards = Vec::with_capacity(created.len());
        let mut first_error = None;
        for result in created {
            match result {
                Ok(shard) => shards.push(Arc::new(shard)),
                Err(e) => {
                    error!(error = %e, "Failed to open upload session");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(source) = first_error {
            if options.abort_on_failure {
                abort_shards(&shards).await;
            }
            return Err(source).context(ShardSnafu);
        }

        info!(
            "Opened {} upload sessions under {} (batch_size={}, max_in_flight={})",
            shards.len(),
            path,
            options.batch_size,
            options.max_in_flight
        );

        Ok(Self {
            shards,
            options,
            shutdown: CancellationToken::new(),
        })
    }

    /// Stop dispatching when `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shards(&self) -> &[Arc<ShardUploader>] {
        &self.shards
    }

    /// Stream `input` into the shards, then complete every upload.
    ///
    /// A shard that fails stops accepting batches but the others keep
    /// receiving theirs and are completed. The run still fails with the
    /// first shard error.
    pub async fn run<R: AsyncBufRead + Unpin>(
        self,
        input: R,
    ) -> Result<PipelineStats, PipelineError> {
        let dispatch = match self.dispatch(input).await {
            Ok(dispatch) => dispatch,
            Err(e) => return Err(self.fail(e).await),
        };
        let (records, batches) = (dispatch.records, dispatch.batches);

        info!(records, batches, "Input exhausted, completing shards");

        let completed = self.complete_all().await;
        let shards = match (dispatch.write_failure, completed) {
            (Some(e), _) | (None, Err(e)) => return Err(self.fail(e).await),
            (None, Ok(shards)) => shards,
        };

        let uploaded_bytes = shards.iter().map(|s| s.uploaded_bytes).sum();
        info!(
            records,
            batches,
            uploaded_bytes,
            "All {} shards completed",
            shards.len()
        );

        Ok(PipelineStats {
            records,
            batches,
            uploaded_bytes,
            shards,
        })
    }

    /// Read and route batches until input ends or shutdown.
    async fn dispatch<R: AsyncBufRead + Unpin>(
        &self,
        input: R,
    ) -> Result<DispatchSummary, PipelineError> {
        let shard_count = self.shards.len();
        let max_in_flight = self.options.max_in_flight;
        let in_flight = Arc::new(Semaphore::new(max_in_flight));
        let lanes = ShardLanes::spawn(&self.shards, max_in_flight);
        let mut reader = BatchReader::new(input, self.options.batch_size);

        let mut cursor = 0;
        let mut records = 0u64;
        let mut batches = 0u64;

        let dispatched: Result<(), PipelineError> = loop {
            let next = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break Err(PipelineError::Interrupted),
                next = reader.next_batch() => next,
            };

            let batch = match next {
                Ok(Some(batch)) => batch,
                Ok(None) => break Ok(()),
                Err(source) => break Err(PipelineError::ReadInput { source }),
            };

            // Backpressure: wait for a lane to finish a batch
            let permit = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break Err(PipelineError::Interrupted),
                permit = in_flight.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break ChannelClosedSnafu.fail(),
                },
            };
            emit!(InFlightBatches {
                count: max_in_flight - in_flight.available_permits()
            });

            let batch_records = batch.len() as u64;
            if !lanes.send(cursor, Dispatched { batch, permit }).await {
                break ChannelClosedSnafu.fail();
            }

            records += batch_records;
            batches += 1;
            emit!(RecordsDispatched {
                count: batch_records
            });
            emit!(BatchesDispatched { count: 1 });

            cursor = (cursor + 1) % shard_count;
        };

        if dispatched.is_err() {
            warn!("Dispatch stopped early, draining lanes");
        }

        let drained = lanes.finish().await;
        emit!(InFlightBatches { count: 0 });

        // A shard failure is the root cause when both fail
        if let Err(e) = dispatched {
            return Err(drained.err().unwrap_or(e));
        }

        Ok(DispatchSummary {
            records,
            batches,
            write_failure: drained.err(),
        })
    }

    /// Complete every shard that has not failed, concurrently.
    /// Returns summaries ordered by shard id.
    async fn complete_all(&self) -> Result<Vec<ShardSummary>, PipelineError> {
        let mut tasks = JoinSet::new();
        for shard in &self.shards {
            if shard.state().await == ShardState::Failed {
                continue;
            }
            let shard = shard.clone();
            tasks.spawn(async move { shard.complete().await });
        }

        let mut summaries = Vec::with_capacity(self.shards.len());
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.context(TaskJoinSnafu)? {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    error!(error = %e, "Shard completion failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(source) = first_error {
            return Err(source).context(ShardSnafu);
        }

        summaries.sort_by_key(|summary| summary.shard_id);
        Ok(summaries)
    }

    /// Apply the failure policy and hand the error back.
    async fn fail(&self, e: PipelineError) -> PipelineError {
        error!(error = %e, "Pipeline failed");
        if self.options.abort_on_failure {
            abort_shards(&self.shards).await;
        } else {
            warn!("Leaving incomplete upload sessions open; abort_on_failure is disabled");
        }
        e
    }
}

/// Abort every shard that has not reached a terminal state.
async fn abort_shards(shards: &[Arc<ShardUploader>]) {
    let results = join_all(shards.iter().map(|shard| shard.abort())).await;
    let mut aborted = 0;
    for (shard, result) in shards.iter().zip(results) {
        match result {
            Ok(true) => aborted += 1,
            Ok(false) => {}
            Err(e) => error!(
                shard = shard.shard_id(),
                error = %e,
                "Failed to abort upload session"
            ),
        }
    }
    info!("Aborted {} incomplete upload sessions", aborted);
}

/// Build the store described by `config` and stream `input` through a pipeline.
pub async fn run_pipeline<R: AsyncBufRead + Unpin>(
    config: &Config,
    input: R,
    shutdown: CancellationToken,
) -> Result<PipelineStats, PipelineError> {
    config.validate().context(ConfigSnafu)?;

    let storage = StorageProvider::for_url_with_options(
        &config.destination.url(),
        config.destination.storage_options.clone(),
    )
    .await
    .context(PipelineStorageSnafu)?;
    info!(
        "Writing {} shards to {}",
        config.sharding.shard_count,
        storage.canonical_url()
    );

    Pipeline::create(
        Arc::new(storage),
        &config.destination.path,
        config.pipeline_options(),
    )
    .await?
    .with_shutdown(shutdown)
    .run(input)
    .await
}
