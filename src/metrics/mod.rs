//! Metrics and observability infrastructure for flurry.
//!
//! - `events`: Internal event types and the `InternalEvent` trait
//! - `server`: Prometheus HTTP server and initialization

pub mod events;
pub mod server;

pub use server::init;

/// Emit an internal event.
///
/// This macro calls the `InternalEvent::emit()` method on the given event,
/// which records the corresponding metric.
///
/// # Example
///
/// ```ignore
/// use flurry::metrics::events::{BatchesDispatched, RecordsDispatched};
///
/// emit!(RecordsDispatched { count: 2000 });
/// emit!(BatchesDispatched { count: 1 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
