// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine-level errors returned by the sync API.

use thiserror::Error;

/// Failure category of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncErrorKind {
    /// Missing or blank selector. Raised before any I/O.
    InvalidArgument,
    /// The buffer could not be read.
    SourceUnavailable,
    /// A single record could not be written (reported per record).
    PerRecordWriteFailure,
    /// Nothing was migrated and at least one record failed.
    PartialOrFullWriteFailure,
    /// The run deadline expired.
    Timeout,
    Unknown,
}

impl SyncErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::SourceUnavailable => "source_unavailable",
            Self::PerRecordWriteFailure => "per_record_write_failure",
            Self::PartialOrFullWriteFailure => "write_failure",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a failed sync run.
///
/// `Display` is the human-readable message. `total_synced` is the number of
/// records migrated before the failure (zero for validation and source errors).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SyncError {
    kind: SyncErrorKind,
    message: String,
    total_synced: usize,
}

impl SyncError {
    pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), total_synced: 0 }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::InvalidArgument, message)
    }

    pub fn source_unavailable(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::SourceUnavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Timeout, message)
    }

    #[must_use]
    pub fn with_total_synced(mut self, total_synced: usize) -> Self {
        self.total_synced = total_synced;
        self
    }

    #[must_use]
    pub fn kind(&self) -> SyncErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn total_synced(&self) -> usize {
        self.total_synced
    }
}
