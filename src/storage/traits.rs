// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::record::LogRecord;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Backend timed out: {0}")]
    Timeout(String),
    #[error("Backend busy: {0}")]
    Busy(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Malformed record '{key}': {reason}")]
    Malformed {
        key: String,
        reason: String,
    },
    #[error("Duplicate key '{0}'")]
    Duplicate(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Transient errors are worth retrying; everything else is structural.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Busy(_) | Self::Unavailable(_))
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Busy(_) => "busy",
            Self::Unavailable(_) => "unavailable",
            Self::Malformed { .. } => "malformed",
            Self::Duplicate(_) => "duplicate",
            Self::Backend(_) => "backend",
        }
    }
}

/// Which buffered records a sync run selects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    All,
    Trace(String),
    User(String),
}

impl Selector {
    /// The selector value, if the variant carries one.
    #[must_use]
    pub fn value(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Trace(id) | Self::User(id) => Some(id),
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Trace(id) => write!(f, "trace:{}", id),
            Self::User(id) => write!(f, "user:{}", id),
        }
    }
}

/// Lazy, finite, non-restartable sequence of buffered records.
pub type RecordStream = BoxStream<'static, Result<LogRecord, StorageError>>;

/// Result of an atomic conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was newly written.
    Inserted,
    /// A record with the same natural key was already durable.
    AlreadyPresent,
}

/// Read-only view over the TTL-bounded buffer.
///
/// Records may vanish at any moment (TTL eviction), so an empty or shorter
/// stream is a normal outcome, not an error.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(&self, selector: &Selector) -> Result<RecordStream, StorageError>;

    async fn fetch_all(&self) -> Result<RecordStream, StorageError> {
        self.fetch(&Selector::All).await
    }

    async fn fetch_by_trace(&self, trace_id: &str) -> Result<RecordStream, StorageError> {
        self.fetch(&Selector::Trace(trace_id.to_string())).await
    }

    async fn fetch_by_user(&self, user_id: &str) -> Result<RecordStream, StorageError> {
        self.fetch(&Selector::User(user_id.to_string())).await
    }

    /// Cheap reachability probe for health checks.
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Durable destination. The single source of truth for "has this key been migrated".
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Return `natural_key -> payload_hash` for every key in `keys` already stored.
    async fn lookup_existing(&self, keys: &[String]) -> Result<HashMap<String, String>, StorageError>;

    /// Insert the record unless its natural key is present. Must be atomic per key.
    /// `run_id` is recorded for audit.
    async fn insert_if_absent(&self, record: &LogRecord, run_id: &str) -> Result<InsertOutcome, StorageError>;

    /// Count stored records.
    async fn count(&self) -> Result<u64, StorageError>;

    async fn exists(&self, natural_key: &str) -> Result<bool, StorageError> {
        let found = self.lookup_existing(&[natural_key.to_string()]).await?;
        Ok(found.contains_key(natural_key))
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
