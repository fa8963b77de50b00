//! Error types for flurry using snafu.
//!
//! One enum per layer, each with context selectors, aggregated into
//! [`PipelineError`] at the top.

use snafu::prelude::*;

use crate::pipeline::ShardState;

// ============ Sink Errors ============

/// Errors raised by the compressed sink.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// Operation attempted after the sink was finalized.
    #[snafu(display("Cannot {operation} a finalized sink"))]
    SinkFinalized { operation: &'static str },

    /// The gzip encoder failed.
    #[snafu(display("Compression failed"))]
    Compress { source: std::io::Error },
}

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed"))]
    ObjectStore { source: object_store::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error"))]
    S3Config { source: object_store::Error },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error"))]
    GcsConfig { source: object_store::Error },
}

impl StorageError {
    /// Whether this error came back from a store request, as opposed to
    /// a local configuration problem.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::ObjectStore { .. })
    }
}

// ============ Shard Errors ============

/// Errors raised by a shard uploader.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ShardError {
    /// Operation is not valid in the shard's current state.
    #[snafu(display("Shard {shard}: cannot {operation} while {state}"))]
    InvalidState {
        shard: usize,
        state: ShardState,
        operation: &'static str,
    },

    /// The shard's compressed sink failed.
    #[snafu(display("Shard {shard}: sink error"))]
    Sink { shard: usize, source: SinkError },

    /// A blob store call failed.
    #[snafu(display("Shard {shard}: {operation} failed"))]
    Store {
        shard: usize,
        operation: &'static str,
        source: StorageError,
    },
}

impl ShardError {
    /// Check if this error is a state violation rather than an I/O failure.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, ShardError::InvalidState { .. })
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Shard count must be at least one.
    #[snafu(display("Shard count must be at least 1"))]
    InvalidShardCount,

    /// Batch size must be at least one record.
    #[snafu(display("Batch size must be at least 1"))]
    InvalidBatchSize,

    /// In-flight limit must be at least one batch.
    #[snafu(display("Max in-flight batches must be at least 1"))]
    InvalidMaxInFlight,

    /// Part threshold below what the store accepts.
    #[snafu(display("Part size must be at least {min} bytes, got {size}"))]
    PartSizeTooSmall { size: usize, min: usize },

    /// Part size in MB does not fit in bytes.
    #[snafu(display("Part size of {size_mb} MB is too large"))]
    PartSizeOverflow { size_mb: usize },

    /// Compression level outside 0..=9.
    #[snafu(display("Compression level must be between 0 and 9, got {level}"))]
    InvalidCompressionLevel { level: u32 },

    /// Destination bucket is empty.
    #[snafu(display("Destination bucket cannot be empty"))]
    EmptyBucket,

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Storage provider could not be constructed.
    #[snafu(display("Storage error"))]
    PipelineStorage { source: StorageError },

    /// A shard failed.
    #[snafu(display("Shard error"))]
    Shard { source: ShardError },

    /// Reading input failed.
    #[snafu(display("Failed to read input"))]
    ReadInput { source: std::io::Error },

    /// Task join error.
    #[snafu(display("Task join error"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Channel send error.
    #[snafu(display("Channel closed unexpectedly"))]
    ChannelClosed,

    /// Neither a config file nor a bucket and path were given.
    #[snafu(display("A config file or both --bucket and --path are required"))]
    MissingDestination,

    /// Shutdown was requested before the run finished.
    #[snafu(display("Interrupted before all shards completed"))]
    Interrupted,

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },
}

impl PipelineError {
    /// The shard error behind this failure, if any.
    pub fn shard_error(&self) -> Option<&ShardError> {
        match self {
            PipelineError::Shard { source } => Some(source),
            _ => None,
        }
    }
}
