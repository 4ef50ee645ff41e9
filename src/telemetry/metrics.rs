//! Metric instrument factories for workq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workq"` meter; without an
//! OTLP endpoint the global provider is a no-op.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

use crate::error::Result;

/// Returns the shared meter for workq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workq")
}

/// Counter: priority queue operations.
/// Labels: `namespace`, `operation`, `result` ("ok" | "empty" | error kind).
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("workq.queue.operations")
        .with_description("Number of priority queue operations")
        .build()
}

/// Counter: lock store operations.
/// Labels: `operation`, `result`.
pub fn lock_operations() -> Counter<u64> {
    meter()
        .u64_counter("workq.lock.operations")
        .with_description("Number of lock store operations")
        .build()
}

/// Counter: consumer progress updates.
/// Labels: `consumer`, `result`.
pub fn progress_updates() -> Counter<u64> {
    meter()
        .u64_counter("workq.progress.updates")
        .with_description("Number of consumer progress updates")
        .build()
}

/// Histogram: time between lease and disposition, in milliseconds.
/// Labels: `namespace`, `disposition`.
pub fn item_processing_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workq.item.processing_ms")
        .with_description("Leased item processing duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Label value for an operation's outcome.
pub(crate) fn result_label<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    }
}

/// Record one queue operation.
pub(crate) fn record_queue(namespace: &str, operation: &'static str, result: &'static str) {
    queue_operations().add(
        1,
        &[
            KeyValue::new("namespace", namespace.to_string()),
            KeyValue::new("operation", operation),
            KeyValue::new("result", result),
        ],
    );
}

/// Record one lock operation.
pub(crate) fn record_lock(operation: &'static str, result: &'static str) {
    lock_operations().add(
        1,
        &[
            KeyValue::new("operation", operation),
            KeyValue::new("result", result),
        ],
    );
}

/// Record one progress update.
pub(crate) fn record_progress(consumer: &str, result: &'static str) {
    progress_updates().add(
        1,
        &[
            KeyValue::new("consumer", consumer.to_string()),
            KeyValue::new("result", result),
        ],
    );
}
