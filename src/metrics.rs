// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the log sync engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `log_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `mode`: all, trace, user
//! - `outcome`: success, partial, failure
//! - `backend`: source, store

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a finished sync run
pub fn record_sync_run(mode: &str, outcome: &str) {
    counter!(
        "log_sync_runs_total",
        "mode" => mode.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record wall time of a sync run
pub fn record_sync_duration(mode: &str, duration: Duration) {
    histogram!(
        "log_sync_run_seconds",
        "mode" => mode.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record the per-run record accounting
pub fn record_sync_counts(mode: &str, fetched: usize, skipped: usize, migrated: usize, failed: usize) {
    let mode = mode.to_string();
    counter!("log_sync_records_fetched_total", "mode" => mode.clone()).increment(fetched as u64);
    counter!("log_sync_records_skipped_total", "mode" => mode.clone()).increment(skipped as u64);
    counter!("log_sync_records_migrated_total", "mode" => mode.clone()).increment(migrated as u64);
    counter!("log_sync_records_failed_total", "mode" => mode).increment(failed as u64);
}

/// Record a retried operation attempt
pub fn record_retry(operation: &str) {
    counter!(
        "log_sync_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a record that could not be written after retries
pub fn record_write_failure(error_kind: &str) {
    counter!(
        "log_sync_write_failures_total",
        "error_type" => error_kind.to_string()
    )
    .increment(1);
}

/// Record a run that hit its deadline
pub fn record_timeout(mode: &str, phase: &str) {
    counter!(
        "log_sync_timeouts_total",
        "mode" => mode.to_string(),
        "phase" => phase.to_string()
    )
    .increment(1);
}

/// Record an already-migrated key whose buffered payload differs from the durable copy
pub fn record_payload_conflict() {
    counter!("log_sync_payload_conflicts_total").increment(1);
}

/// Record backend operation latency
pub fn record_latency(backend: &str, operation: &str, duration: Duration) {
    histogram!(
        "log_sync_backend_seconds",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "log_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "log_sync_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Set the completion time of the latest successful run (epoch millis)
pub fn set_last_synced_at(millis: i64) {
    gauge!("log_sync_last_synced_at_millis").set(millis as f64);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    backend: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(backend: &'static str, operation: &'static str) -> Self {
        Self {
            backend,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.backend, self.operation, self.start.elapsed());
    }
}
