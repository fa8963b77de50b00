//! Prometheus metrics endpoint.
//!
//! Serves `/metrics` and a `/health` probe for the lifetime of a run, so a
//! long upload can be watched from outside the process.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{MetricsError, PrometheusInitSnafu};

/// Histogram buckets for store request latency, in seconds. Part uploads of
/// several MiB dominate the upper range.
const REQUEST_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Initialize the Prometheus recorder and spawn the HTTP endpoint on `addr`.
///
/// The endpoint exposes:
/// - `/metrics` - Prometheus metrics in text format
/// - `/health` - liveness check (returns 200 OK)
///
/// Must be called from within a tokio runtime.
///
/// # Example
///
/// ```ignore
/// use std::net::SocketAddr;
/// use flurry::metrics;
///
/// let addr: SocketAddr = "0.0.0.0:9090".parse()?;
/// metrics::init(addr)?;
/// ```
pub fn init(addr: SocketAddr) -> Result<(), MetricsError> {
    let handle = builder()?
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    tokio::spawn(run_server(addr, handle));

    Ok(())
}

/// Exporter with flurry's histogram buckets applied.
fn builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("flurry_storage_request_duration_seconds".to_string()),
            REQUEST_DURATION_BUCKETS,
        )
        .context(PrometheusInitSnafu)
}

fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle))
}

async fn run_server(addr: SocketAddr, handle: PrometheusHandle) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    info!("Metrics endpoint listening on http://{}/metrics", addr);
    if let Err(e) = axum::serve(listener, router(handle)).await {
        error!("Metrics server error: {}", e);
    }
}

/// Handler for `/metrics`.
async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

/// Handler for `/health`.
async fn health_handler() -> &'static str {
    "ok\n"
}
