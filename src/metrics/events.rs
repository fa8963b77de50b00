//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which records the matching
//! counter, gauge or histogram.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when records are handed to a shard.
pub struct RecordsDispatched {
    pub count: u64,
}

impl InternalEvent for RecordsDispatched {
    fn emit(self) {
        trace!(count = self.count, "Records dispatched");
        counter!("flurry_records_dispatched_total").increment(self.count);
    }
}

/// Event emitted when a batch is assigned to a shard.
pub struct BatchesDispatched {
    pub count: u64,
}

impl InternalEvent for BatchesDispatched {
    fn emit(self) {
        trace!(count = self.count, "Batches dispatched");
        counter!("flurry_batches_dispatched_total").increment(self.count);
    }
}

/// Event emitted when a shard uploads a part.
pub struct PartUploaded {
    pub bytes: u64,
}

impl InternalEvent for PartUploaded {
    fn emit(self) {
        trace!(bytes = self.bytes, "Part uploaded");
        counter!("flurry_parts_uploaded_total").increment(1);
        counter!("flurry_bytes_uploaded_total").increment(self.bytes);
    }
}

/// Outcome of a shard's upload session.
#[derive(Debug, Clone, Copy)]
pub enum ShardOutcome {
    Completed,
    Aborted,
}

impl ShardOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ShardOutcome::Completed => "completed",
            ShardOutcome::Aborted => "aborted",
        }
    }
}

/// Event emitted when a shard session reaches a terminal state.
pub struct ShardFinished {
    pub outcome: ShardOutcome,
}

impl InternalEvent for ShardFinished {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), "Shard finished");
        counter!("flurry_shards_finished_total", "outcome" => self.outcome.as_str()).increment(1);
    }
}

// ============================================================================
// Gauge events for backpressure
// ============================================================================

/// Event emitted when the number of dispatched-but-unwritten batches changes.
pub struct InFlightBatches {
    pub count: usize,
}

impl InternalEvent for InFlightBatches {
    fn emit(self) {
        trace!(count = self.count, "In-flight batches");
        gauge!("flurry_in_flight_batches").set(self.count as f64);
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    CreateMultipart,
    PutPart,
    CompleteMultipart,
    AbortMultipart,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::CreateMultipart => "create_multipart",
            StorageOperation::PutPart => "put_part",
            StorageOperation::CompleteMultipart => "complete_multipart",
            StorageOperation::AbortMultipart => "abort_multipart",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn from_result<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "flurry_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a storage request completes with duration.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request duration"
        );
        histogram!(
            "flurry_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
