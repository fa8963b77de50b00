//! flurry: fan-out streaming of line records into sharded gzip objects.
//!
//! Input lines are grouped into fixed-size batches and distributed
//! round-robin across N shards. Each shard compresses its records into a
//! single gzip stream and uploads it as a multipart object named
//! `{path}.{shard}.csv.gz`, so memory stays bounded regardless of input size.
//!
//! # Example
//!
//! ```ignore
//! use flurry::{Config, run_pipeline, error::PipelineError};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let config = Config::new("my-bucket", "exports/users");
//!     let input = tokio::io::BufReader::new(tokio::io::stdin());
//!     let stats = run_pipeline(&config, input, CancellationToken::new()).await?;
//!     println!("Uploaded {} records", stats.records);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod signal;
pub mod sink;
pub mod source;
pub mod storage;

// Re-export main types
pub use config::Config;
pub use pipeline::{
    Pipeline, PipelineOptions, PipelineStats, ShardState, ShardUploader, run_pipeline, shard_key,
};
pub use sink::CompressedSink;
pub use storage::{BlobStore, BlobStoreRef, StorageProvider};
