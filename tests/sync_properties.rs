// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Behavioural guarantees of a sync run.
//!
//! Uses the in-memory backends plus wrappers that inject failures, delays and
//! panics at precise points, so every scenario is deterministic and needs no
//! external services.
//!
//! ```bash
//! cargo test --test sync_properties
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use serde_json::json;

use log_sync_engine::storage::memory::{InMemorySource, InMemoryStore};
use log_sync_engine::{
    DurableStore, InsertOutcome, LogRecord, RecordSource, RecordStream, Selector, StorageError, SyncEngine,
    SyncEngineConfig, SyncErrorKind, SyncRequest,
};

// =============================================================================
// Fault-injecting wrappers
// =============================================================================

/// Fails inserts for chosen keys. Transient failures clear after `transient_failures` calls.
struct FailingStore {
    inner: InMemoryStore,
    insert_calls: AtomicU64,
    fail_keys: Vec<String>,
    error: StorageError,
    /// How many times a failing key fails before succeeding (u64::MAX = forever)
    transient_failures: u64,
    failures_served: AtomicU64,
    fail_lookup: bool,
}

impl FailingStore {
    fn failing(keys: &[&str], error: StorageError) -> Self {
        Self {
            inner: InMemoryStore::new(),
            insert_calls: AtomicU64::new(0),
            fail_keys: keys.iter().map(|k| k.to_string()).collect(),
            error,
            transient_failures: u64::MAX,
            failures_served: AtomicU64::new(0),
            fail_lookup: false,
        }
    }

    fn recovering_after(mut self, n: u64) -> Self {
        self.transient_failures = n;
        self
    }

    fn with_failing_lookup(mut self) -> Self {
        self.fail_lookup = true;
        self
    }
}

#[async_trait]
impl DurableStore for FailingStore {
    async fn lookup_existing(&self, keys: &[String]) -> Result<HashMap<String, String>, StorageError> {
        if self.fail_lookup {
            return Err(StorageError::Unavailable("lookup offline".into()));
        }
        self.inner.lookup_existing(keys).await
    }

    async fn insert_if_absent(&self, record: &LogRecord, run_id: &str) -> Result<InsertOutcome, StorageError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_keys.contains(&record.natural_key)
            && self.failures_served.fetch_add(1, Ordering::SeqCst) < self.transient_failures
        {
            return Err(self.error.clone());
        }
        self.inner.insert_if_absent(record, run_id).await
    }

    async fn count(&self) -> Result<u64, StorageError> {
        self.inner.count().await
    }
}

/// Every insert takes `delay` before committing.
struct SlowStore {
    inner: InMemoryStore,
    delay: Duration,
}

#[async_trait]
impl DurableStore for SlowStore {
    async fn lookup_existing(&self, keys: &[String]) -> Result<HashMap<String, String>, StorageError> {
        self.inner.lookup_existing(keys).await
    }

    async fn insert_if_absent(&self, record: &LogRecord, run_id: &str) -> Result<InsertOutcome, StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.insert_if_absent(record, run_id).await
    }

    async fn count(&self) -> Result<u64, StorageError> {
        self.inner.count().await
    }
}

/// Panics when asked to write a particular key.
struct PanickingStore {
    inner: InMemoryStore,
    poison_key: String,
}

#[async_trait]
impl DurableStore for PanickingStore {
    async fn lookup_existing(&self, keys: &[String]) -> Result<HashMap<String, String>, StorageError> {
        self.inner.lookup_existing(keys).await
    }

    async fn insert_if_absent(&self, record: &LogRecord, run_id: &str) -> Result<InsertOutcome, StorageError> {
        if record.natural_key == self.poison_key {
            panic!("store driver bug");
        }
        self.inner.insert_if_absent(record, run_id).await
    }

    async fn count(&self) -> Result<u64, StorageError> {
        self.inner.count().await
    }
}

/// Blind lookup, and a plain insert that reports a unique-key violation
/// as `Duplicate` instead of `AlreadyPresent`.
struct UniqueViolationStore {
    inner: InMemoryStore,
}

#[async_trait]
impl DurableStore for UniqueViolationStore {
    async fn lookup_existing(&self, _keys: &[String]) -> Result<HashMap<String, String>, StorageError> {
        Ok(HashMap::new())
    }

    async fn insert_if_absent(&self, record: &LogRecord, run_id: &str) -> Result<InsertOutcome, StorageError> {
        match self.inner.insert_if_absent(record, run_id).await? {
            InsertOutcome::Inserted => Ok(InsertOutcome::Inserted),
            InsertOutcome::AlreadyPresent => Err(StorageError::Duplicate(record.natural_key.clone())),
        }
    }

    async fn count(&self) -> Result<u64, StorageError> {
        self.inner.count().await
    }
}

/// Yields the given records, then a backend error.
struct BrokenStreamSource {
    records: Vec<LogRecord>,
}

#[async_trait]
impl RecordSource for BrokenStreamSource {
    async fn fetch(&self, _selector: &Selector) -> Result<RecordStream, StorageError> {
        let items: Vec<Result<LogRecord, StorageError>> = self
            .records
            .iter()
            .cloned()
            .map(Ok)
            .chain(std::iter::once(Err(StorageError::Unavailable("connection reset".into()))))
            .collect();
        Ok(stream::iter(items).boxed())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn trace_records(trace_id: &str, count: u64) -> Vec<LogRecord> {
    (0..count)
        .map(|i| LogRecord::new(trace_id, i, Some(format!("user-{}", i % 2)), json!({"seq": i})))
        .collect()
}

fn filled_source(records: &[LogRecord]) -> Arc<InMemorySource> {
    let source = Arc::new(InMemorySource::new());
    for r in records {
        source.push(r.clone());
    }
    source
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test]
async fn rerun_with_no_new_records_syncs_zero() {
    let source = filled_source(&trace_records("t", 7));
    let store = Arc::new(InMemoryStore::new());
    let engine = SyncEngine::new(SyncEngineConfig::default(), source, store.clone());

    let first = engine.sync_all_logs().await.unwrap();
    let second = engine.sync_all_logs().await.unwrap();

    assert_eq!(first.total_synced, 7);
    assert!(second.success);
    assert_eq!(second.total_synced, 0);
    assert_eq!(store.len(), 7);
    assert!(second.synced_at >= first.synced_at);
}

#[tokio::test]
async fn rerun_by_trace_counts_only_new_records() {
    let source = filled_source(&trace_records("t", 3));
    let engine = SyncEngine::new(SyncEngineConfig::default(), source.clone(), Arc::new(InMemoryStore::new()));

    assert_eq!(engine.sync_by_trace("t").await.unwrap().total_synced, 3);

    source.push(LogRecord::new("t", 3, None, json!({"late": true})));
    let result = engine.run(SyncRequest::by_trace("t")).await;

    assert_eq!(result.total_synced, 1);
    assert_eq!(result.summary.skipped, 3);
}

// =============================================================================
// Selector validation
// =============================================================================

#[tokio::test]
async fn blank_selectors_fail_without_io() {
    let source = filled_source(&trace_records("t", 2));
    let store = Arc::new(InMemoryStore::new());
    let engine = SyncEngine::new(SyncEngineConfig::default(), source.clone(), store.clone());

    for (request, message) in [
        (SyncRequest::by_trace(""), "Trace ID is required"),
        (SyncRequest::by_trace("  \t"), "Trace ID is required"),
        (SyncRequest::by_user(""), "User ID is required"),
        (SyncRequest { mode: log_sync_engine::SyncMode::ByUser, selector: None }, "User ID is required"),
    ] {
        let result = engine.run(request).await;
        let error = result.error.expect("validation error");

        assert!(!result.success);
        assert_eq!(result.total_synced, 0);
        assert_eq!(error.kind(), SyncErrorKind::InvalidArgument);
        assert_eq!(error.to_string(), message);
    }

    assert_eq!(source.fetch_calls(), 0);
    assert_eq!(store.lookup_calls(), 0);
    assert_eq!(store.insert_calls(), 0);
}

// =============================================================================
// Partial failure isolation
// =============================================================================

#[tokio::test]
async fn structural_failure_is_isolated_to_one_record() {
    let records = trace_records("t", 5);
    let store = Arc::new(FailingStore::failing(
        &["t:2"],
        StorageError::Malformed { key: "t:2".into(), reason: "payload rejected".into() },
    ));
    let engine = SyncEngine::new(SyncEngineConfig::default(), filled_source(&records), store.clone());

    let result = engine.run(SyncRequest::by_trace("t")).await;

    assert!(result.success);
    assert!(result.is_partial());
    assert_eq!(result.total_synced, 4);
    assert_eq!(result.summary.failed, 1);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].natural_key, "t:2");
    assert_eq!(result.failures[0].kind, SyncErrorKind::PerRecordWriteFailure);
    // Structural errors are not retried
    assert_eq!(result.failures[0].attempts, 1);
    assert_eq!(store.insert_calls.load(Ordering::SeqCst), 5);
    assert!(!store.inner.exists("t:2").await.unwrap());
}

#[tokio::test]
async fn partial_success_publishes_last_synced_gauge() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let _guard = metrics::set_default_local_recorder(&recorder);

    let records = trace_records("t", 3);
    let store = Arc::new(FailingStore::failing(&["t:1"], StorageError::Backend("rejected".into())));
    let engine = SyncEngine::new(SyncEngineConfig::default(), filled_source(&records), store);

    let result = engine.run(SyncRequest::all()).await;
    assert!(result.is_partial());

    let gauge = snapshotter.snapshot().into_vec().into_iter().find_map(|(key, _, _, value)| {
        match (key.key().name(), value) {
            ("log_sync_last_synced_at_millis", DebugValue::Gauge(v)) => Some(v.into_inner()),
            _ => None,
        }
    });
    assert_eq!(gauge, Some(result.synced_at as f64));
    assert_eq!(engine.last_synced_at(), Some(result.synced_at));
}

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried_then_succeeds() {
    let records = trace_records("t", 3);
    let store = Arc::new(
        FailingStore::failing(&["t:1"], StorageError::Busy("lock wait".into())).recovering_after(2),
    );
    let engine = SyncEngine::new(SyncEngineConfig::default(), filled_source(&records), store.clone());

    let result = engine.run(SyncRequest::all()).await;

    assert!(result.success);
    assert!(!result.is_partial());
    assert_eq!(result.total_synced, 3);
    assert_eq!(store.insert_calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn exhausted_transient_retries_count_as_failure() {
    let records = trace_records("t", 2);
    let store = Arc::new(FailingStore::failing(&["t:0"], StorageError::Timeout("slow disk".into())));
    let engine = SyncEngine::new(SyncEngineConfig::default(), filled_source(&records), store);

    let result = engine.run(SyncRequest::all()).await;

    assert!(result.is_partial());
    assert_eq!(result.total_synced, 1);
    assert_eq!(result.failures[0].attempts, 3);
}

#[tokio::test]
async fn all_records_failing_is_a_write_failure() {
    let records = trace_records("t", 2);
    let store = Arc::new(FailingStore::failing(
        &["t:0", "t:1"],
        StorageError::Backend("constraint".into()),
    ));
    let engine = SyncEngine::new(SyncEngineConfig::default(), filled_source(&records), store);

    let err = engine.sync_by_trace("t").await.unwrap_err();

    assert_eq!(err.kind(), SyncErrorKind::PartialOrFullWriteFailure);
    assert_eq!(err.total_synced(), 0);
}

#[tokio::test]
async fn failed_dedup_lookup_falls_back_to_conditional_insert() {
    let records = trace_records("t", 4);
    let store = Arc::new(FailingStore::failing(&[], StorageError::Backend("unused".into())).with_failing_lookup());
    store.inner.insert_if_absent(&records[0], "earlier-run").await.unwrap();
    let engine = SyncEngine::new(SyncEngineConfig::default(), filled_source(&records), store.clone());

    let result = engine.run(SyncRequest::all()).await;

    assert!(result.success);
    assert_eq!(result.total_synced, 3);
    assert_eq!(result.summary.skipped, 1);
    assert_eq!(store.inner.len(), 4);
}

#[tokio::test]
async fn unique_violation_on_insert_counts_as_skipped() {
    let records = trace_records("t", 3);
    let store = Arc::new(UniqueViolationStore { inner: InMemoryStore::new() });
    store.inner.insert_if_absent(&records[1], "earlier-run").await.unwrap();
    let engine = SyncEngine::new(SyncEngineConfig::default(), filled_source(&records), store.clone());

    let first = engine.run(SyncRequest::all()).await;

    assert!(first.success);
    assert_eq!(first.total_synced, 2);
    assert_eq!(first.summary.skipped, 1);
    assert_eq!(first.summary.failed, 0);

    let rerun = engine.run(SyncRequest::all()).await;

    assert!(rerun.success);
    assert!(rerun.error.is_none());
    assert_eq!(rerun.total_synced, 0);
    assert_eq!(rerun.summary.skipped, 3);
    assert!(rerun.failures.is_empty());
    assert_eq!(store.inner.len(), 3);
}

#[tokio::test]
async fn panicking_write_fails_only_that_record() {
    let records = trace_records("t", 3);
    let store = Arc::new(PanickingStore { inner: InMemoryStore::new(), poison_key: "t:0".into() });
    let config = SyncEngineConfig { write_concurrency: 1, ..Default::default() };
    let engine = SyncEngine::new(config, filled_source(&records), store.clone());

    let result = engine.run(SyncRequest::all()).await;

    assert!(result.success);
    assert!(result.is_partial());
    assert_eq!(result.total_synced, 2);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].natural_key, "t:0");
    assert_eq!(result.failures[0].kind, SyncErrorKind::Unknown);
    assert_eq!(store.inner.len(), 2);
}

#[tokio::test]
async fn panic_on_the_only_record_is_a_full_write_failure() {
    let records = trace_records("t", 1);
    let store = Arc::new(PanickingStore { inner: InMemoryStore::new(), poison_key: "t:0".into() });
    let engine = SyncEngine::new(SyncEngineConfig::default(), filled_source(&records), store);

    let err = engine.sync_all_logs().await.unwrap_err();

    assert_eq!(err.kind(), SyncErrorKind::PartialOrFullWriteFailure);
    assert_eq!(err.total_synced(), 0);
}

// =============================================================================
// Source failures
// =============================================================================

#[tokio::test]
async fn unavailable_source_reports_zero() {
    let source = filled_source(&trace_records("t", 3));
    source.set_available(false);
    let store = Arc::new(InMemoryStore::new());
    let engine = SyncEngine::new(SyncEngineConfig::default(), source, store.clone());

    let err = engine.sync_all_logs().await.unwrap_err();

    assert_eq!(err.kind(), SyncErrorKind::SourceUnavailable);
    assert_eq!(err.total_synced(), 0);
    assert_eq!(store.insert_calls(), 0);
}

#[tokio::test]
async fn mid_stream_source_error_keeps_pulled_records() {
    let source = Arc::new(BrokenStreamSource { records: trace_records("t", 3) });
    let store = Arc::new(InMemoryStore::new());
    let engine = SyncEngine::new(SyncEngineConfig::default(), source, store.clone());

    let err = engine.sync_all_logs().await.unwrap_err();

    assert_eq!(err.kind(), SyncErrorKind::SourceUnavailable);
    assert_eq!(err.total_synced(), 3);
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn expired_records_are_simply_absent() {
    let source = Arc::new(InMemorySource::new());
    source.push(LogRecord::new("t", 0, None, json!({})));
    source.push_with_ttl(LogRecord::new("t", 1, None, json!({})), Duration::ZERO);
    let engine = SyncEngine::new(SyncEngineConfig::default(), source, Arc::new(InMemoryStore::new()));

    let response = engine.sync_by_trace("t").await.unwrap();

    assert_eq!(response.total_synced, 1);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_modes_never_double_write() {
    let records: Vec<LogRecord> = ["a", "b", "c"]
        .iter()
        .flat_map(|trace| trace_records(trace, 20))
        .collect();
    let store = Arc::new(InMemoryStore::new());
    let engine = Arc::new(SyncEngine::new(
        SyncEngineConfig { write_concurrency: 4, fetch_chunk_size: 7, ..Default::default() },
        filled_source(&records),
        store.clone(),
    ));

    let mut handles = Vec::new();
    for request in [
        SyncRequest::all(),
        SyncRequest::by_trace("a"),
        SyncRequest::by_user("user-1"),
        SyncRequest::all(),
        SyncRequest::by_trace("b"),
    ] {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move { engine.run(request).await }));
    }

    let mut total = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.success);
        total += result.total_synced;
    }

    assert_eq!(total, records.len());
    assert_eq!(store.len(), records.len());
}

// =============================================================================
// Empty source
// =============================================================================

#[tokio::test]
async fn empty_source_is_success_with_zero() {
    let engine = SyncEngine::new(
        SyncEngineConfig::default(),
        Arc::new(InMemorySource::new()),
        Arc::new(InMemoryStore::new()),
    );

    let all = engine.sync_all_logs().await.unwrap();
    let by_user = engine.sync_by_user("nobody").await.unwrap();

    assert!(all.success);
    assert_eq!(all.total_synced, 0);
    assert_eq!(by_user.total_synced, 0);
    assert_eq!(by_user.user_id.as_deref(), Some("nobody"));
}

// =============================================================================
// Deadline
// =============================================================================

#[tokio::test(start_paused = true)]
async fn deadline_preserves_completed_writes() {
    let records = trace_records("t", 10);
    let store = Arc::new(SlowStore { inner: InMemoryStore::new(), delay: Duration::from_millis(100) });
    let config = SyncEngineConfig { deadline_ms: 650, write_concurrency: 1, ..Default::default() };
    let engine = SyncEngine::new(config, filled_source(&records), store.clone());

    let result = engine.run(SyncRequest::all()).await;
    let error = result.error.clone().expect("timeout");

    assert!(!result.success);
    assert_eq!(error.kind(), SyncErrorKind::Timeout);
    assert_eq!(result.total_synced, 6);
    assert_eq!(error.total_synced(), 6);
    assert_eq!(store.inner.len(), 6);

    // The next run picks up where the first stopped.
    engine.reload_config(SyncEngineConfig { write_concurrency: 8, ..Default::default() });
    let rerun = engine.run(SyncRequest::all()).await;
    assert!(rerun.success);
    assert_eq!(rerun.total_synced, 4);
    assert_eq!(rerun.summary.skipped, 6);
}
