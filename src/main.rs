//! flurry: stream stdin lines into N gzip objects on blob storage.
//!
//! Records are batched, dealt round-robin to shards and uploaded with
//! multipart uploads as `{path}.{shard}.csv.gz`.

use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use flurry::config::Config;
use flurry::error::{
    AddressParseSnafu, ConfigSnafu, MetricsSnafu, MissingDestinationSnafu, PipelineError,
};
use flurry::logging::init_tracing;
use flurry::signal::cancel_on_signal;
use flurry::{metrics, run_pipeline};

/// Sharded gzip uploader for line-oriented input.
#[derive(Parser, Debug)]
#[command(name = "flurry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file. Flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Destination bucket name or storage URL (s3://, gs://, memory://).
    #[arg(long)]
    bucket: Option<String>,

    /// Object key prefix; shard i is written to `{path}.{i}.csv.gz`.
    #[arg(long)]
    path: Option<String>,

    /// Number of output shards.
    #[arg(long)]
    shards: Option<usize>,

    /// Records per batch.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Batches in flight before reading pauses (default: 2 x shards).
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Part size threshold in MB.
    #[arg(long)]
    part_size_mb: Option<usize>,

    /// Gzip level, 0-9.
    #[arg(long)]
    compression_level: Option<u32>,

    /// Abort every incomplete upload if the run fails.
    #[arg(long)]
    abort_on_failure: bool,

    /// Address for the Prometheus endpoint, e.g. 0.0.0.0:9090.
    #[arg(long)]
    metrics_address: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Dry run - validate configuration without processing.
    #[arg(long)]
    dry_run: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    init_tracing(&args.log_level);
    info!("flurry starting");

    let config = build_config(&args)?;
    config.validate().context(ConfigSnafu)?;

    if let Some(address) = &config.metrics.address {
        let addr = address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
        debug!("Metrics endpoint listening on http://{}/metrics", address);
    }

    if args.dry_run {
        info!("Dry run mode - validating configuration");
        info!("Destination: {}", config.destination.url());
        info!("Path: {}", config.destination.path);
        info!("Shards: {}", config.sharding.shard_count);
        info!("Batch size: {}", config.sharding.batch_size);
        info!("Max in flight: {}", config.max_in_flight());
        info!("Configuration is valid");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    let input = BufReader::new(tokio::io::stdin());
    let stats = run_pipeline(&config, input, shutdown).await?;

    info!("Pipeline completed successfully");
    info!("  Records: {}", stats.records);
    info!("  Batches: {}", stats.batches);
    info!("  Bytes uploaded: {}", stats.uploaded_bytes);
    for shard in &stats.shards {
        info!(
            "  {}: {} records in {} parts",
            shard.key, shard.records, shard.parts
        );
    }

    Ok(())
}

/// Build configuration from the config file, if any, and command line flags.
fn build_config(args: &Args) -> Result<Config, PipelineError> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).context(ConfigSnafu)?,
        None => {
            let (Some(bucket), Some(path)) = (&args.bucket, &args.path) else {
                return MissingDestinationSnafu.fail();
            };
            Config::new(bucket.clone(), path.clone())
        }
    };

    if let Some(bucket) = &args.bucket {
        config.destination.bucket = bucket.clone();
    }
    if let Some(path) = &args.path {
        config.destination.path = path.clone();
    }
    if let Some(shards) = args.shards {
        config.sharding.shard_count = shards;
    }
    if let Some(batch_size) = args.batch_size {
        config.sharding.batch_size = batch_size;
    }
    if let Some(max_in_flight) = args.max_in_flight {
        config.sharding.max_in_flight = Some(max_in_flight);
    }
    if let Some(part_size_mb) = args.part_size_mb {
        config.sharding.part_size_mb = part_size_mb;
    }
    if let Some(level) = args.compression_level {
        config.sharding.compression_level = level;
    }
    if args.abort_on_failure {
        config.sharding.abort_on_failure = true;
    }
    if let Some(address) = &args.metrics_address {
        config.metrics.address = Some(address.clone());
    }

    Ok(config)
}
