//! Item processing span helpers.
//!
//! Provides span creation and disposition recording for leased items
//! flowing through a worker.

use tracing::Span;

use crate::model::Item;

/// Start a span for processing one leased item.
///
/// The `item.disposition` field is declared empty and is filled in by
/// [`record_disposition`].
pub fn start_item_span(namespace: &str, item: &Item) -> Span {
    tracing::info_span!(
        "item.process",
        "queue.namespace" = namespace,
        "item.id" = item.id.0,
        "item.discriminator" = %item.unit.discriminator,
        "item.priority" = item.priority,
        "item.disposition" = tracing::field::Empty,
    )
}

/// Record how processing ended, both as a span field and as an event.
pub fn record_disposition(span: &Span, disposition: &str) {
    span.record("item.disposition", disposition);
    span.in_scope(|| {
        tracing::info!(disposition = disposition, "item_disposed");
    });
}
