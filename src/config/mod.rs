//! Configuration parsing and validation.
//!
//! Configuration comes from an optional YAML file; command-line flags are
//! applied on top by the binary before validation.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{
    ConfigError, EmptyBucketSnafu, InvalidBatchSizeSnafu, InvalidCompressionLevelSnafu,
    InvalidMaxInFlightSnafu, InvalidShardCountSnafu, PartSizeOverflowSnafu,
    PartSizeTooSmallSnafu, ReadFileSnafu, YamlParseSnafu,
};
use crate::pipeline::PipelineOptions;

/// Byte size constants (binary/IEC units).
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Smallest part a multipart store accepts, other than the final part.
pub const MIN_PART_SIZE: usize = 5 * MB;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub destination: DestinationConfig,
    #[serde(default)]
    pub sharding: ShardingConfig,
    /// Metrics configuration (optional, disabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Where shard objects are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    /// Bucket name (S3) or storage URL.
    /// Examples: "my-bucket", "s3://my-bucket", "gs://my-bucket", "memory://"
    pub bucket: String,

    /// Key prefix for shard objects; shard `i` is written to `{path}.{i}.csv.gz`.
    pub path: String,

    /// Storage options (credentials, region, endpoint, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

impl DestinationConfig {
    /// Storage URL for the configured bucket. Bare names are treated as S3 buckets.
    pub fn url(&self) -> String {
        if self.bucket.contains("://") || self.bucket.contains("::") {
            self.bucket.clone()
        } else {
            format!("s3://{}", self.bucket)
        }
    }
}

/// Fan-out and upload tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardingConfig {
    /// Number of output shards (default: 12).
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Records per batch (default: 2000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum batches dispatched but not yet written (default: 2 x shard_count).
    #[serde(default)]
    pub max_in_flight: Option<usize>,

    /// Compressed bytes buffered per shard before a part is uploaded (default: 5).
    #[serde(default = "default_part_size_mb")]
    pub part_size_mb: usize,

    /// gzip level, 0-9 (default: 6).
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Abort every incomplete upload session after the first fatal error (default: false).
    #[serde(default)]
    pub abort_on_failure: bool,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            batch_size: default_batch_size(),
            max_in_flight: None,
            part_size_mb: default_part_size_mb(),
            compression_level: default_compression_level(),
            abort_on_failure: false,
        }
    }
}

fn default_shard_count() -> usize {
    12
}

fn default_batch_size() -> usize {
    2000
}

fn default_part_size_mb() -> usize {
    5
}

fn default_compression_level() -> u32 {
    6
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP server, e.g. "0.0.0.0:9090".
    /// The endpoint is only started when this is set.
    #[serde(default)]
    pub address: Option<String>,
}

impl Config {
    /// Create a configuration with default sharding for the given destination.
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            destination: DestinationConfig {
                bucket: bucket.into(),
                path: path.into(),
                storage_options: HashMap::new(),
            },
            sharding: ShardingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).context(YamlParseSnafu)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.destination.bucket.is_empty(), EmptyBucketSnafu);
        ensure!(self.sharding.shard_count >= 1, InvalidShardCountSnafu);
        ensure!(self.sharding.batch_size >= 1, InvalidBatchSizeSnafu);
        ensure!(self.max_in_flight() >= 1, InvalidMaxInFlightSnafu);
        ensure!(
            self.sharding.compression_level <= 9,
            InvalidCompressionLevelSnafu {
                level: self.sharding.compression_level
            }
        );
        let part_size = self.part_size().context(PartSizeOverflowSnafu {
            size_mb: self.sharding.part_size_mb,
        })?;
        ensure!(
            part_size >= MIN_PART_SIZE,
            PartSizeTooSmallSnafu {
                size: part_size,
                min: MIN_PART_SIZE
            }
        );
        Ok(())
    }

    /// Effective in-flight limit.
    pub fn max_in_flight(&self) -> usize {
        self.sharding
            .max_in_flight
            .unwrap_or(self.sharding.shard_count.saturating_mul(2))
    }

    /// Part threshold in bytes, or `None` if it overflows.
    pub fn part_size(&self) -> Option<usize> {
        self.sharding.part_size_mb.checked_mul(MB)
    }

    /// Pipeline options derived from this configuration.
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            shard_count: self.sharding.shard_count,
            batch_size: self.sharding.batch_size,
            max_in_flight: self.max_in_flight(),
            min_part_size: self.part_size().unwrap_or(usize::MAX),
            compression_level: self.sharding.compression_level,
            abort_on_failure: self.sharding.abort_on_failure,
        }
    }
}
