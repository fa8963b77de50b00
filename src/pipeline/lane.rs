//! Ordered delivery lanes, one per shard.
//!
//! Each lane is a task draining a bounded channel into its shard, so the
//! batches a shard receives are written in the order they were dispatched.
//! A batch travels with its in-flight permit, released once the shard has
//! written it. After a write fails the lane keeps draining, dropping the
//! shard's remaining batches, so dispatch to other shards never stalls.

use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::error::{PipelineError, ShardError, ShardSnafu, TaskJoinSnafu};
use crate::source::Batch;

use super::ShardUploader;

/// A batch on its way to a shard.
pub(super) struct Dispatched {
    pub batch: Batch,
    pub permit: OwnedSemaphorePermit,
}

pub(super) struct ShardLanes {
    senders: Vec<mpsc::Sender<Dispatched>>,
    tasks: JoinSet<(usize, Result<(), ShardError>)>,
}

impl ShardLanes {
    /// Spawn a lane for every shard.
    pub fn spawn(shards: &[Arc<ShardUploader>], capacity: usize) -> Self {
        let mut tasks = JoinSet::new();
        let senders = shards
            .iter()
            .map(|shard| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                let shard = shard.clone();
                tasks.spawn(async move {
                    let shard_id = shard.shard_id();
                    (shard_id, Self::run(shard, rx).await)
                });
                tx
            })
            .collect();

        Self { senders, tasks }
    }

    /// Hand a batch to lane `index`. Returns false if that lane has stopped.
    pub async fn send(&self, index: usize, item: Dispatched) -> bool {
        self.senders[index].send(item).await.is_ok()
    }

    /// Close every lane and wait for queued batches to drain.
    ///
    /// Returns the first shard failure, in the order lanes stopped.
    pub async fn finish(mut self) -> Result<(), PipelineError> {
        self.senders.clear();

        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let (shard_id, result) = joined.context(TaskJoinSnafu)?;
            match result {
                Ok(()) => debug!(shard = shard_id, "Lane drained"),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(source) => Err(source).context(ShardSnafu),
            None => Ok(()),
        }
    }

    async fn run(
        shard: Arc<ShardUploader>,
        mut rx: mpsc::Receiver<Dispatched>,
    ) -> Result<(), ShardError> {
        let mut failure = None;
        let mut dropped = 0u64;

        while let Some(Dispatched { batch, permit }) = rx.recv().await {
            if failure.is_some() {
                dropped += batch.len() as u64;
                continue;
            }

            let result = shard.write_batch(&batch.records).await;
            drop(permit);

            if let Err(e) = result {
                error!(
                    shard = shard.shard_id(),
                    batch = batch.seq,
                    error = %e,
                    "Batch write failed"
                );
                failure = Some(e);
            }
        }

        match failure {
            Some(e) => {
                if dropped > 0 {
                    error!(
                        shard = shard.shard_id(),
                        records = dropped,
                        "Dropped records routed to failed shard"
                    );
                }
                Err(e)
            }
            None => Ok(()),
        }
    }
}
