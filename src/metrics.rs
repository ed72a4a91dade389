//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Relay state and reconnects
//! - Batches and records applied
//! - Duplicate/regressing batches dropped
//! - Replication lag and the degraded flag
//! - Upstream read latency
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `wal_relay_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Nothing is exported unless a recorder is installed (the binary installs
//! the Prometheus exporter when given `--metrics-addr`).

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a subscribe attempt.
pub fn record_subscribe(namespace: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("wal_relay_subscribe_attempts_total", "namespace" => namespace.to_string(), "status" => status).increment(1);
}

/// Record a session ending and the relay reconnecting.
pub fn record_reconnect(namespace: &str, reason: &str) {
    counter!("wal_relay_reconnects_total", "namespace" => namespace.to_string(), "reason" => reason.to_string()).increment(1);
}

/// Record the relay state (numeric code, see `RelayState::as_code`).
pub fn record_relay_state(namespace: &str, code: u8) {
    gauge!("wal_relay_state", "namespace" => namespace.to_string()).set(f64::from(code));
}

/// Record a batch arriving at the sink.
pub fn record_batch_received(namespace: &str, records: usize, bytes: usize) {
    counter!("wal_relay_batches_received_total", "namespace" => namespace.to_string()).increment(1);
    histogram!("wal_relay_batch_records", "namespace" => namespace.to_string()).record(records as f64);
    histogram!("wal_relay_batch_bytes", "namespace" => namespace.to_string()).record(bytes as f64);
}

/// Record a batch applied.
pub fn record_batch_applied(namespace: &str, records: usize, duration: Duration) {
    counter!("wal_relay_batches_applied_total", "namespace" => namespace.to_string()).increment(1);
    counter!("wal_relay_records_applied_total", "namespace" => namespace.to_string()).increment(records as u64);
    histogram!("wal_relay_apply_duration_seconds", "namespace" => namespace.to_string())
        .record(duration.as_secs_f64());
}

/// Record a failed apply attempt that will be retried.
pub fn record_apply_retry(namespace: &str) {
    counter!("wal_relay_apply_retries_total", "namespace" => namespace.to_string()).increment(1);
}

/// Record a batch dropped for being at or below the applied offset.
pub fn record_duplicate_dropped(namespace: &str, records: usize) {
    counter!("wal_relay_duplicate_batches_total", "namespace" => namespace.to_string()).increment(1);
    counter!("wal_relay_duplicate_records_total", "namespace" => namespace.to_string()).increment(records as u64);
}

/// Record an overlapping batch whose applied prefix was trimmed.
pub fn record_overlap_trimmed(namespace: &str, trimmed: usize) {
    counter!("wal_relay_overlap_trimmed_records_total", "namespace" => namespace.to_string()).increment(trimmed as u64);
}

/// Record lag against the upstream tail.
pub fn record_lag(namespace: &str, segments: u64, records: Option<u64>) {
    gauge!("wal_relay_lag_segments", "namespace" => namespace.to_string()).set(segments as f64);
    if let Some(records) = records {
        gauge!("wal_relay_lag_records", "namespace" => namespace.to_string()).set(records as f64);
    }
}

/// Record the degraded flag (1 = lagging past threshold).
pub fn record_degraded(namespace: &str, degraded: bool) {
    gauge!("wal_relay_degraded", "namespace" => namespace.to_string()).set(if degraded { 1.0 } else { 0.0 });
}

/// Record the replica's durable offset.
pub fn record_current_offset(namespace: &str, segment_id: u64, offset: u64) {
    gauge!("wal_relay_current_segment", "namespace" => namespace.to_string()).set(segment_id as f64);
    gauge!("wal_relay_current_offset", "namespace" => namespace.to_string()).set(offset as f64);
}

/// Record an upstream read (XREAD) and its latency.
pub fn record_stream_read(namespace: &str, duration: Duration) {
    histogram!("wal_relay_stream_read_duration_seconds", "namespace" => namespace.to_string())
        .record(duration.as_secs_f64());
}

/// Record the upstream trimming past the resume point.
pub fn record_stream_trimmed(namespace: &str) {
    counter!("wal_relay_stream_trimmed_total", "namespace" => namespace.to_string()).increment(1);
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_sqlite_retry(operation: &str) {
    counter!("wal_relay_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}
