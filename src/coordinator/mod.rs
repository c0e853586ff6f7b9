// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The [`SyncEngine`] moves records out of the TTL-bounded buffer into the
//! durable store:
//! - fetch a lazy stream from the [`RecordSource`] (guarded by a circuit breaker)
//! - skip natural keys the [`DurableStore`] already holds (one lookup per chunk)
//! - write the rest with bounded concurrency and per-record retry
//! - report a [`SyncResult`] with partial progress on any failure
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use log_sync_engine::{SyncEngine, SyncEngineConfig, LogRecord};
//! use log_sync_engine::storage::memory::{InMemorySource, InMemoryStore};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let source = Arc::new(InMemorySource::new());
//! source.push(LogRecord::new("trace-1", 0, None, json!({"msg": "boot"})));
//!
//! let engine = SyncEngine::new(SyncEngineConfig::default(), source, Arc::new(InMemoryStore::new()));
//! let response = engine.sync_by_trace("trace-1").await.unwrap();
//! assert_eq!(response.total_synced, 1);
//! # }
//! ```

pub mod error;
mod types;
mod api;
mod run;

pub use error::{SyncError, SyncErrorKind};
pub use types::{HealthCheck, RecordFailure, SyncMode, SyncRequest, SyncResponse, SyncResult, SyncSummary};

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::SyncEngineConfig;
use crate::record::now_millis;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::storage::redis::RedisLogSource;
use crate::storage::sql::SqlLogStore;
use crate::storage::traits::{DurableStore, RecordSource, StorageError};

/// Main sync engine.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`; share it behind an `Arc` and run syncs from
/// as many tasks as needed. Concurrent runs never double-write a natural key
/// because the store's insert is atomic per key.
pub struct SyncEngine {
    /// Uses RwLock for interior mutability so runs can take &self.
    /// Each run snapshots the config when it starts.
    pub(super) config: RwLock<SyncEngineConfig>,

    pub(super) source: Arc<dyn RecordSource>,

    /// Ground truth for "already migrated"
    pub(super) store: Arc<dyn DurableStore>,

    /// Trips when the buffer keeps failing so runs fail fast
    pub(super) source_circuit: CircuitBreaker,

    /// Latest `synced_at` handed out (0 = never)
    pub(super) last_synced_at: AtomicI64,
}

impl SyncEngine {
    /// Create an engine over already-constructed backends.
    pub fn new(config: SyncEngineConfig, source: Arc<dyn RecordSource>, store: Arc<dyn DurableStore>) -> Self {
        Self {
            config: RwLock::new(config),
            source,
            store,
            source_circuit: CircuitBreaker::new("source", CircuitConfig::source()),
            last_synced_at: AtomicI64::new(0),
        }
    }

    /// Connect to Redis (buffer) and SQL (durable store) using the configured URLs.
    ///
    /// Both connections use the startup retry preset, so a wrong URL fails
    /// after a handful of attempts instead of hanging.
    pub async fn connect(config: SyncEngineConfig) -> Result<Self, StorageError> {
        let redis_url = config
            .redis_url
            .clone()
            .ok_or_else(|| StorageError::Backend("redis_url is not configured".into()))?;
        let sql_url = config
            .sql_url
            .clone()
            .ok_or_else(|| StorageError::Backend("sql_url is not configured".into()))?;

        info!(redis_url = %redis_url, "Connecting to log buffer");
        let source = RedisLogSource::with_prefix(&redis_url, config.redis_prefix.as_deref())
            .await?
            .with_page_size(config.fetch_page_size);

        info!("Connecting to durable log store");
        let store = SqlLogStore::new(&sql_url).await?;

        info!(
            source_ttl_secs = config.source_ttl_secs,
            deadline_ms = config.deadline_ms,
            "Sync engine ready. Buffered logs expire after the source TTL; schedule syncs well inside it"
        );

        Ok(Self::new(config, Arc::new(source), Arc::new(store)))
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn config(&self) -> SyncEngineConfig {
        self.config.read().clone()
    }

    /// Replace the configuration. Runs already in progress keep their snapshot.
    ///
    /// Backend URLs and the key prefix only matter to [`connect`](Self::connect)
    /// and are not re-applied here.
    pub fn reload_config(&self, config: SyncEngineConfig) {
        let mut current = self.config.write();
        if current.redis_url != config.redis_url || current.sql_url != config.sql_url {
            warn!("Backend URLs changed; reconnect the engine for them to take effect");
        }
        info!(
            deadline_ms = config.deadline_ms,
            write_concurrency = config.write_concurrency,
            "Sync engine config reloaded"
        );
        *current = config;
    }

    /// Completion time of the latest run that reached the end of its write phase.
    #[must_use]
    pub fn last_synced_at(&self) -> Option<i64> {
        match self.last_synced_at.load(Ordering::Acquire) {
            0 => None,
            millis => Some(millis),
        }
    }

    /// Wall-clock stamp that never goes backwards across runs of this engine.
    pub(super) fn stamp_synced_at(&self) -> i64 {
        let now = now_millis();
        let previous = self.last_synced_at.fetch_max(now, Ordering::AcqRel);
        previous.max(now)
    }

    /// Same clock as [`stamp_synced_at`](Self::stamp_synced_at) without recording a completion.
    pub(super) fn peek_synced_at(&self) -> i64 {
        self.last_synced_at.load(Ordering::Acquire).max(now_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{InMemorySource, InMemoryStore};

    fn engine() -> SyncEngine {
        SyncEngine::new(
            SyncEngineConfig::default(),
            Arc::new(InMemorySource::new()),
            Arc::new(InMemoryStore::new()),
        )
    }

    #[test]
    fn test_synced_at_is_monotonic() {
        let engine = engine();
        assert_eq!(engine.last_synced_at(), None);

        // Pretend a previous run stamped a time in the future (clock skew).
        let future = now_millis() + 60_000;
        engine.last_synced_at.store(future, Ordering::Release);

        assert_eq!(engine.stamp_synced_at(), future);
        assert_eq!(engine.last_synced_at(), Some(future));
    }

    #[tokio::test]
    async fn test_rejected_request_leaves_last_synced_at_unset() {
        let engine = engine();

        let result = engine.run(crate::coordinator::SyncRequest::by_trace("  ")).await;

        assert!(!result.success);
        assert!(result.synced_at > 0);
        assert_eq!(engine.last_synced_at(), None);
        assert_eq!(engine.health_check().await.last_synced_at, None);
    }

    #[test]
    fn test_reload_config() {
        let engine = engine();
        let config = SyncEngineConfig { write_concurrency: 2, deadline_ms: 10, ..Default::default() };
        engine.reload_config(config.clone());
        assert_eq!(engine.config(), config);
    }

    #[tokio::test]
    async fn test_connect_requires_urls() {
        let result = SyncEngine::connect(SyncEngineConfig::default()).await;
        assert!(matches!(result, Err(StorageError::Backend(_))));
    }
}
