// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public request and result types for the sync engine.

use serde::Serialize;

use super::error::{SyncError, SyncErrorKind};
use crate::resilience::circuit_breaker::CircuitState;
use crate::storage::traits::Selector;

/// Which records a sync run migrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncMode {
    /// Every record currently in the buffer
    All,
    /// Records sharing a trace id
    ByTrace,
    /// Records attributed to a user id
    ByUser,
}

impl SyncMode {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::ByTrace => "trace",
            Self::ByUser => "user",
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sync request as received from the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub mode: SyncMode,
    /// Trace or user id. Ignored for [`SyncMode::All`].
    pub selector: Option<String>,
}

impl SyncRequest {
    #[must_use]
    pub fn all() -> Self {
        Self { mode: SyncMode::All, selector: None }
    }

    pub fn by_trace(trace_id: impl Into<String>) -> Self {
        Self { mode: SyncMode::ByTrace, selector: Some(trace_id.into()) }
    }

    pub fn by_user(user_id: impl Into<String>) -> Self {
        Self { mode: SyncMode::ByUser, selector: Some(user_id.into()) }
    }

    /// Trim the selector and turn the request into a storage [`Selector`].
    ///
    /// Missing or whitespace-only selectors are rejected for the by-trace and
    /// by-user modes.
    pub fn validate(&self) -> Result<Selector, SyncError> {
        let trimmed = self
            .selector
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        match (self.mode, trimmed) {
            (SyncMode::All, _) => Ok(Selector::All),
            (SyncMode::ByTrace, Some(id)) => Ok(Selector::Trace(id.to_string())),
            (SyncMode::ByTrace, None) => Err(SyncError::invalid_argument("Trace ID is required")),
            (SyncMode::ByUser, Some(id)) => Ok(Selector::User(id.to_string())),
            (SyncMode::ByUser, None) => Err(SyncError::invalid_argument("User ID is required")),
        }
    }
}

/// Per-run record accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Records pulled from the buffer
    pub fetched: usize,
    /// Records already in the durable store
    pub skipped: usize,
    /// Records newly written by this run
    pub migrated: usize,
    /// Records that could not be written
    pub failed: usize,
    /// Skipped records whose buffered payload differs from the durable copy
    pub conflicts: usize,
}

/// A record that could not be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub natural_key: String,
    pub kind: SyncErrorKind,
    pub reason: String,
    /// Write attempts made, first try included
    pub attempts: usize,
}

/// Outcome of one sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub success: bool,
    /// Records newly written by this run. Skipped duplicates are not counted.
    pub total_synced: usize,
    pub trace_id: Option<String>,
    pub user_id: Option<String>,
    /// Epoch millis at the end of the write phase
    pub synced_at: i64,
    /// Set only when `success` is false
    pub error: Option<SyncError>,
    pub run_id: String,
    pub mode: SyncMode,
    pub summary: SyncSummary,
    pub failures: Vec<RecordFailure>,
}

impl SyncResult {
    /// Succeeded, but some records could not be written.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.success && self.summary.failed > 0
    }

    /// Caller-facing view: the response on success, the error otherwise.
    pub fn into_response(self) -> Result<SyncResponse, SyncError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(SyncResponse {
            success: self.success,
            total_synced: self.total_synced,
            trace_id: self.trace_id,
            user_id: self.user_id,
            synced_at: self.synced_at,
        })
    }
}

/// Wire shape of a successful sync.
///
/// ```
/// use log_sync_engine::SyncResponse;
///
/// let response = SyncResponse {
///     success: true,
///     total_synced: 3,
///     trace_id: Some("abc".into()),
///     user_id: None,
///     synced_at: 1_700_000_000_000,
/// };
/// let json = serde_json::to_value(&response).unwrap();
/// assert_eq!(json["totalSynced"], 3);
/// assert_eq!(json["trace_id"], "abc");
/// assert!(json.get("user_id").is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResponse {
    pub success: bool,
    #[serde(rename = "totalSynced")]
    pub total_synced: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "syncedAt")]
    pub synced_at: i64,
}

/// Comprehensive health check result.
///
/// Returned by [`super::SyncEngine::health_check()`]. Backend fields are
/// live probes; the rest is cached engine state.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Buffer answered a ping
    pub source_connected: bool,
    pub source_latency_ms: Option<u64>,
    /// Durable store answered a ping
    pub store_connected: bool,
    pub store_latency_ms: Option<u64>,
    /// Last observed state of the source circuit breaker
    pub source_circuit: CircuitState,
    /// Fetches the source circuit turned away since the engine started
    pub source_rejections: u64,
    /// Completion time of the latest run that reached the end of its write phase
    pub last_synced_at: Option<i64>,
    /// Both backends reachable and the source circuit not open
    pub healthy: bool,
}
