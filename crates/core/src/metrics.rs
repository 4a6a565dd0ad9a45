//! Metrics definitions for the payment ledger.
//!
//! This module defines all metrics used throughout the coordinator and
//! synchronizer. Metrics are collected using the `metrics` crate and
//! can be exported to Prometheus via `metrics-exporter-prometheus`.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

/// Initialize all metric descriptions.
/// Call this once at startup before any metrics are recorded.
pub fn init_metrics() {
    describe_counter!(
        "transfers_submitted_total",
        "Total number of token transfers submitted to the chain"
    );
    describe_histogram!(
        "receipt_wait_duration_seconds",
        "Time spent waiting for a transfer receipt in seconds"
    );
    describe_counter!(
        "events_processed_total",
        "Total number of transfer events applied to the ledger mirror"
    );
    describe_counter!(
        "duplicate_events_total",
        "Total number of transfer events absorbed as duplicates"
    );
    describe_counter!(
        "event_errors_total",
        "Total number of per-event processing errors (isolated, not fatal)"
    );
    describe_counter!(
        "backfill_sweeps_total",
        "Total number of backfill sweeps executed"
    );
    describe_counter!(
        "backfill_events_total",
        "Total number of transfer events recovered by backfill"
    );
    describe_counter!(
        "requests_expired_total",
        "Total number of payment requests transitioned to expired"
    );
}

/// Record a submitted transfer.
pub fn record_transfer_submitted() {
    counter!("transfers_submitted_total").increment(1);
}

/// Record time spent waiting for a receipt.
pub fn record_receipt_wait(duration_secs: f64) {
    histogram!("receipt_wait_duration_seconds").record(duration_secs);
}

/// Record an event applied to the mirror.
///
/// # Arguments
/// * `source` - Delivery path ("live" or "backfill")
pub fn record_event_processed(source: &'static str) {
    counter!("events_processed_total", "source" => source).increment(1);
}

/// Record a duplicate event absorbed by the idempotent upsert.
pub fn record_duplicate_event(source: &'static str) {
    counter!("duplicate_events_total", "source" => source).increment(1);
}

/// Record an isolated per-event processing error.
pub fn record_event_error(source: &'static str) {
    counter!("event_errors_total", "source" => source).increment(1);
}

/// Record a completed backfill sweep.
pub fn record_backfill_sweep(events: u64) {
    counter!("backfill_sweeps_total").increment(1);
    counter!("backfill_events_total").increment(events);
}

/// Record requests expired by the sweep or lazily.
pub fn record_requests_expired(count: u64) {
    counter!("requests_expired_total").increment(count);
}

/// A timer that records receipt wait duration when dropped.
pub struct ReceiptTimer {
    start: Instant,
}

impl ReceiptTimer {
    /// Start a new receipt timer.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for ReceiptTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReceiptTimer {
    fn drop(&mut self) {
        record_receipt_wait(self.start.elapsed().as_secs_f64());
    }
}
