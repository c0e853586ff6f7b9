// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Caller-facing API: the three sync entry points and health reporting.

use std::time::{Duration, Instant};

use tracing::debug;

use super::{HealthCheck, SyncEngine, SyncError, SyncRequest, SyncResponse};
use crate::metrics;
use crate::resilience::circuit_breaker::CircuitState;
use crate::storage::traits::StorageError;

/// Upper bound on a single health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

impl SyncEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Sync entry points
    // ═══════════════════════════════════════════════════════════════════════════

    /// Migrate every record currently in the buffer.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use log_sync_engine::SyncEngine;
    /// # async fn example(engine: &SyncEngine) {
    /// match engine.sync_all_logs().await {
    ///     Ok(response) => println!("migrated {}", response.total_synced),
    ///     Err(e) => eprintln!("sync failed ({}): {}, {} migrated", e.kind(), e, e.total_synced()),
    /// }
    /// # }
    /// ```
    pub async fn sync_all_logs(&self) -> Result<SyncResponse, SyncError> {
        self.run(SyncRequest::all()).await.into_response()
    }

    /// Migrate the records of one trace. Blank ids fail with `InvalidArgument`.
    pub async fn sync_by_trace(&self, trace_id: &str) -> Result<SyncResponse, SyncError> {
        self.run(SyncRequest::by_trace(trace_id)).await.into_response()
    }

    /// Migrate the records attributed to one user. Blank ids fail with `InvalidArgument`.
    pub async fn sync_by_user(&self, user_id: &str) -> Result<SyncResponse, SyncError> {
        self.run(SyncRequest::by_user(user_id)).await.into_response()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Health
    // ═══════════════════════════════════════════════════════════════════════════

    /// Probe both backends (in parallel) and collect engine state.
    ///
    /// ```rust,no_run
    /// # use log_sync_engine::SyncEngine;
    /// # async fn example(engine: &SyncEngine) {
    /// let health = engine.health_check().await;
    /// if !health.healthy {
    ///     eprintln!("source={} store={}", health.source_connected, health.store_connected);
    /// }
    /// # }
    /// ```
    pub async fn health_check(&self) -> HealthCheck {
        let (source, store) = tokio::join!(
            probe("source", self.source.ping()),
            probe("store", self.store.ping())
        );

        let (source_connected, source_latency_ms) = source;
        let (store_connected, store_latency_ms) = store;
        let source_circuit = self.source_circuit.state();

        HealthCheck {
            source_connected,
            source_latency_ms,
            store_connected,
            store_latency_ms,
            source_circuit,
            source_rejections: self.source_circuit.rejections(),
            last_synced_at: self.last_synced_at(),
            healthy: source_connected && store_connected && source_circuit != CircuitState::Open,
        }
    }
}

async fn probe<F>(backend: &'static str, ping: F) -> (bool, Option<u64>)
where
    F: std::future::Future<Output = Result<(), StorageError>>,
{
    let start = Instant::now();
    let connected = match tokio::time::timeout(PROBE_TIMEOUT, ping).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(backend, error = %e, "Health probe failed");
            false
        }
        Err(_) => {
            debug!(backend, "Health probe timed out");
            false
        }
    };
    metrics::set_backend_healthy(backend, connected);

    let latency_ms = connected.then(|| start.elapsed().as_millis() as u64);
    (connected, latency_ms)
}
