// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One sync run: fetch → dedup → concurrent idempotent writes → result.
//!
//! Every await in the fetch and write phases is bounded by the run deadline.
//! When it expires, writes still in flight are dropped (not counted); any
//! that committed anyway are skipped as duplicates by the next run.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::time::Instant as StdInstant;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{SyncError, SyncErrorKind};
use super::types::{RecordFailure, SyncMode, SyncRequest, SyncResult, SyncSummary};
use super::SyncEngine;
use crate::config::SyncEngineConfig;
use crate::metrics::{self, LatencyTimer};
use crate::record::LogRecord;
use crate::resilience::circuit_breaker::CircuitError;
use crate::resilience::retry::retry_if;
use crate::storage::traits::{InsertOutcome, RecordStream, Selector, StorageError};

/// Per-run state threaded through the phases.
struct RunContext<'a> {
    run_id: &'a str,
    mode: SyncMode,
    config: &'a SyncEngineConfig,
    deadline: Instant,
    summary: SyncSummary,
    failures: Vec<RecordFailure>,
    /// Keys already pulled this run (SCAN may return a key twice)
    seen: HashSet<String>,
}

impl RunContext<'_> {
    fn timed_out(&self, phase: &'static str) -> SyncError {
        metrics::record_timeout(self.mode.as_str(), phase);
        SyncError::timeout(format!("Sync deadline exceeded during {}", phase))
    }
}

/// What one write attempt chain produced.
enum WriteOutcome {
    Done(Result<InsertOutcome, StorageError>),
    Panicked,
}

impl SyncEngine {
    /// Execute one sync run.
    ///
    /// Never panics on backend failure and never returns early without a
    /// result: every failure is folded into [`SyncResult::error`] together with
    /// the number of records migrated before it.
    #[tracing::instrument(name = "sync_run", skip_all, fields(mode = %request.mode, run_id = tracing::field::Empty))]
    pub async fn run(&self, request: SyncRequest) -> SyncResult {
        let run_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("run_id", run_id.as_str());
        let mode = request.mode;

        let selector = match request.validate() {
            Ok(selector) => selector,
            Err(err) => {
                warn!(error = %err, "Rejected sync request");
                metrics::record_sync_run(mode.as_str(), "failure");
                return SyncResult {
                    success: false,
                    total_synced: 0,
                    trace_id: None,
                    user_id: None,
                    synced_at: self.peek_synced_at(),
                    error: Some(err),
                    run_id,
                    mode,
                    summary: SyncSummary::default(),
                    failures: Vec::new(),
                };
            }
        };

        let config = self.config();
        let started = StdInstant::now();
        let mut ctx = RunContext {
            run_id: &run_id,
            mode,
            config: &config,
            deadline: Instant::now() + config.deadline(),
            summary: SyncSummary::default(),
            failures: Vec::new(),
            seen: HashSet::new(),
        };

        debug!(selector = %selector, deadline_ms = config.deadline_ms, "Starting sync run");
        let outcome = self.execute(&selector, &mut ctx).await;
        let synced_at = self.stamp_synced_at();

        let RunContext { summary, failures, .. } = ctx;
        let error = match outcome {
            Err(err) => Some(err.with_total_synced(summary.migrated)),
            Ok(()) if summary.migrated == 0 && summary.failed > 0 => Some(
                SyncError::new(
                    SyncErrorKind::PartialOrFullWriteFailure,
                    format!("Failed to sync logs: {} record(s) could not be written", summary.failed),
                )
                .with_total_synced(0),
            ),
            Ok(()) => None,
        };

        let outcome_label = match (&error, summary.failed) {
            (Some(_), _) => "failure",
            (None, 0) => "success",
            (None, _) => "partial",
        };
        metrics::record_sync_run(mode.as_str(), outcome_label);
        metrics::record_sync_duration(mode.as_str(), started.elapsed());
        metrics::record_sync_counts(mode.as_str(), summary.fetched, summary.skipped, summary.migrated, summary.failed);

        if error.is_none() {
            metrics::set_last_synced_at(synced_at);
        }
        match &error {
            None if summary.failed > 0 => warn!(
                selector = %selector,
                migrated = summary.migrated,
                failed = summary.failed,
                "Sync finished with partial success"
            ),
            None => info!(
                selector = %selector,
                fetched = summary.fetched,
                skipped = summary.skipped,
                migrated = summary.migrated,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Sync finished"
            ),
            Some(err) => warn!(
                selector = %selector,
                kind = %err.kind(),
                migrated = summary.migrated,
                failed = summary.failed,
                error = %err,
                "Sync failed"
            ),
        }

        let (trace_id, user_id) = match &selector {
            Selector::All => (None, None),
            Selector::Trace(id) => (Some(id.clone()), None),
            Selector::User(id) => (None, Some(id.clone())),
        };

        SyncResult {
            success: error.is_none(),
            total_synced: summary.migrated,
            trace_id,
            user_id,
            synced_at,
            error,
            run_id,
            mode,
            summary,
            failures,
        }
    }

    async fn execute(&self, selector: &Selector, ctx: &mut RunContext<'_>) -> Result<(), SyncError> {
        let mut records = self.open_source(selector, ctx).await?;
        let chunk_size = ctx.config.fetch_chunk_size.max(1);
        let mut source_error = None;

        loop {
            let mut chunk = Vec::with_capacity(chunk_size);
            let mut exhausted = false;

            while chunk.len() < chunk_size {
                match timeout_at(ctx.deadline, records.next()).await {
                    Err(_) => return Err(ctx.timed_out("fetch")),
                    Ok(None) => {
                        exhausted = true;
                        break;
                    }
                    Ok(Some(Ok(record))) => {
                        if ctx.seen.insert(record.natural_key.clone()) {
                            chunk.push(record);
                        }
                    }
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "Log source failed mid-stream, writing what was fetched");
                        source_error = Some(e);
                        exhausted = true;
                        break;
                    }
                }
            }

            ctx.summary.fetched += chunk.len();
            if !chunk.is_empty() {
                self.process_chunk(chunk, ctx).await?;
            }
            if exhausted {
                break;
            }
        }

        match source_error {
            Some(e) => Err(SyncError::source_unavailable(format!("Log source failed during fetch: {}", e))),
            None => Ok(()),
        }
    }

    async fn open_source(&self, selector: &Selector, ctx: &RunContext<'_>) -> Result<RecordStream, SyncError> {
        let _timer = LatencyTimer::new("source", "fetch");
        let fetch = self.source_circuit.call(|| self.source.fetch(selector));

        match timeout_at(ctx.deadline, fetch).await {
            Err(_) => Err(ctx.timed_out("fetch")),
            Ok(Ok(records)) => Ok(records),
            Ok(Err(CircuitError::Rejected)) => Err(SyncError::source_unavailable(
                "Log source unavailable: circuit open after repeated failures",
            )),
            Ok(Err(CircuitError::Inner(e))) => {
                Err(SyncError::source_unavailable(format!("Log source unavailable: {}", e)))
            }
        }
    }

    /// Dedup one chunk against the store, then write what is left.
    async fn process_chunk(&self, chunk: Vec<LogRecord>, ctx: &mut RunContext<'_>) -> Result<(), SyncError> {
        let existing = self.lookup_existing(&chunk, ctx).await?;

        let mut pending = Vec::with_capacity(chunk.len());
        for record in chunk {
            match existing.get(&record.natural_key) {
                None => pending.push(record),
                Some(stored_hash) => {
                    ctx.summary.skipped += 1;
                    if ctx.config.detect_payload_conflicts && *stored_hash != record.payload_hash() {
                        ctx.summary.conflicts += 1;
                        metrics::record_payload_conflict();
                        warn!(
                            natural_key = %record.natural_key,
                            "Buffered payload differs from migrated copy; keeping the durable record"
                        );
                    }
                }
            }
        }

        debug!(pending = pending.len(), known = existing.len(), "Chunk deduplicated");
        if pending.is_empty() {
            return Ok(());
        }

        self.write_pending(pending, ctx).await
    }

    /// A failed lookup is not fatal: the atomic insert still rejects duplicates.
    async fn lookup_existing(
        &self,
        chunk: &[LogRecord],
        ctx: &RunContext<'_>,
    ) -> Result<HashMap<String, String>, SyncError> {
        let keys: Vec<String> = chunk.iter().map(|r| r.natural_key.clone()).collect();
        let _timer = LatencyTimer::new("store", "lookup");

        match timeout_at(ctx.deadline, self.store.lookup_existing(&keys)).await {
            Err(_) => Err(ctx.timed_out("lookup")),
            Ok(Ok(existing)) => Ok(existing),
            Ok(Err(e)) => {
                warn!(error = %e, keys = keys.len(), "Dedup lookup failed, relying on conditional insert");
                Ok(HashMap::new())
            }
        }
    }

    async fn write_pending(&self, pending: Vec<LogRecord>, ctx: &mut RunContext<'_>) -> Result<(), SyncError> {
        let retry_config = ctx.config.retry_config();
        let concurrency = ctx.config.write_concurrency.max(1);
        let run_id = ctx.run_id;
        let store = &self.store;
        let retry_config = &retry_config;

        let mut writes = stream::iter(pending)
            .map(|record| async move {
                let _timer = LatencyTimer::new("store", "insert");
                let mut attempts = 0usize;
                let write = retry_if("store_insert", retry_config, StorageError::is_transient, || {
                    attempts += 1;
                    store.insert_if_absent(&record, run_id)
                });
                let outcome = match AssertUnwindSafe(write).catch_unwind().await {
                    Ok(result) => WriteOutcome::Done(result),
                    Err(_) => WriteOutcome::Panicked,
                };
                (record.natural_key, attempts, outcome)
            })
            .buffer_unordered(concurrency);

        loop {
            let (natural_key, attempts, outcome) = match timeout_at(ctx.deadline, writes.next()).await {
                Err(_) => return Err(ctx.timed_out("write")),
                Ok(None) => return Ok(()),
                Ok(Some(done)) => done,
            };

            match outcome {
                WriteOutcome::Done(Ok(InsertOutcome::Inserted)) => ctx.summary.migrated += 1,
                WriteOutcome::Done(Ok(InsertOutcome::AlreadyPresent))
                | WriteOutcome::Done(Err(StorageError::Duplicate(_))) => {
                    debug!(natural_key = %natural_key, "Already migrated by a concurrent writer");
                    ctx.summary.skipped += 1;
                }
                WriteOutcome::Done(Err(e)) => {
                    ctx.summary.failed += 1;
                    metrics::record_write_failure(e.kind());
                    warn!(natural_key = %natural_key, attempts, error = %e, "Failed to migrate record");
                    ctx.failures.push(RecordFailure {
                        natural_key,
                        kind: SyncErrorKind::PerRecordWriteFailure,
                        reason: e.to_string(),
                        attempts,
                    });
                }
                WriteOutcome::Panicked => {
                    ctx.summary.failed += 1;
                    metrics::record_write_failure("panic");
                    error!(natural_key = %natural_key, attempts, "Store write panicked");
                    ctx.failures.push(RecordFailure {
                        natural_key,
                        kind: SyncErrorKind::Unknown,
                        reason: "store write panicked".into(),
                        attempts,
                    });
                }
            }
        }
    }
}
