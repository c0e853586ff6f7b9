// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed ephemeral record source.
//!
//! Buffer layout (all keys share an optional prefix):
//! ```text
//! {prefix}log:{natural_key}   STRING  JSON-encoded LogRecord, EX = buffer TTL
//! {prefix}trace:{trace_id}    SET     natural keys in the trace, EX = buffer TTL
//! {prefix}user:{user_id}      SET     natural keys attributed to the user, EX = buffer TTL
//! ```
//!
//! Index SETs can outlive individual records (or vice versa). A member whose
//! record has already expired reads back as nil from `MGET` and is skipped.
//!
//! Fetch-all walks `SCAN MATCH {prefix}log:*`; trace/user fetches read the
//! index SET with `SMEMBERS`. Either way records are loaded page by page with
//! `MGET`, so the stream is lazy and holds at most one page in memory.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client, ErrorKind, RedisError};
use tracing::{debug, warn};

use super::traits::{RecordSource, RecordStream, Selector, StorageError};
use crate::record::LogRecord;
use crate::resilience::retry::{retry, retry_if, RetryConfig};

pub struct RedisLogSource {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "logs:" → "logs:log:t1:0")
    prefix: String,
    page_size: usize,
}

impl RedisLogSource {
    /// Connect without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use log_sync_engine::storage::redis::RedisLogSource;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Records live at "app:log:{natural_key}"
    /// let source = RedisLogSource::with_prefix("redis://localhost", Some("app:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(map_redis_error)?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            page_size: 500,
        })
    }

    /// Override how many keys are read per `SCAN`/`MGET` page.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn record_key(&self, natural_key: &str) -> String {
        format!("{}log:{}", self.prefix, natural_key)
    }

    fn trace_key(&self, trace_id: &str) -> String {
        format!("{}trace:{}", self.prefix, trace_id)
    }

    fn user_key(&self, user_id: &str) -> String {
        format!("{}user:{}", self.prefix, user_id)
    }

    /// Buffer a record the way producers do (record plus index entries, all with TTL).
    ///
    /// The engine itself never writes to the buffer; this exists for producers
    /// living in the same codebase and for tests.
    pub async fn append(&self, record: &LogRecord, ttl: Duration) -> Result<(), StorageError> {
        let json = serde_json::to_string(record)
            .map_err(|e| StorageError::Malformed { key: record.natural_key.clone(), reason: e.to_string() })?;
        let ttl_secs = ttl.as_secs().max(1) as i64;

        let record_key = self.record_key(&record.natural_key);
        let trace_key = self.trace_key(&record.trace_id);
        let user_key = record.user_id.as_deref().map(|u| self.user_key(u));
        let natural_key = record.natural_key.clone();
        let conn = self.connection.clone();

        retry_if("redis_append", &RetryConfig::query(), StorageError::is_transient, || {
            let mut conn = conn.clone();
            let mut pipeline = pipe();
            pipeline
                .cmd("SET").arg(&record_key).arg(&json).arg("EX").arg(ttl_secs).ignore()
                .cmd("SADD").arg(&trace_key).arg(&natural_key).ignore()
                .cmd("EXPIRE").arg(&trace_key).arg(ttl_secs).ignore();
            if let Some(ref user_key) = user_key {
                pipeline
                    .cmd("SADD").arg(user_key).arg(&natural_key).ignore()
                    .cmd("EXPIRE").arg(user_key).arg(ttl_secs).ignore();
            }
            async move {
                pipeline.query_async::<()>(&mut conn).await.map_err(map_redis_error)
            }
        })
        .await
    }

    async fn set_members(&self, set_key: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.connection.clone();
        retry_if("redis_smembers", &RetryConfig::query(), StorageError::is_transient, || {
            let mut conn = conn.clone();
            let key = set_key.to_string();
            async move {
                let members: Vec<String> = cmd("SMEMBERS")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_error)?;
                Ok(members)
            }
        })
        .await
    }
}

#[async_trait]
impl RecordSource for RedisLogSource {
    async fn fetch(&self, selector: &Selector) -> Result<RecordStream, StorageError> {
        let cursor = match selector {
            Selector::All => PageCursor::Scan {
                pattern: format!("{}log:*", self.prefix),
                cursor: 0,
                started: false,
            },
            Selector::Trace(trace_id) => {
                let members = self.set_members(&self.trace_key(trace_id)).await?;
                PageCursor::Members {
                    keys: members.into_iter().map(|k| self.record_key(&k)).collect::<Vec<_>>().into_iter(),
                }
            }
            Selector::User(user_id) => {
                let members = self.set_members(&self.user_key(user_id)).await?;
                PageCursor::Members {
                    keys: members.into_iter().map(|k| self.record_key(&k)).collect::<Vec<_>>().into_iter(),
                }
            }
        };

        debug!(selector = %selector, "Opening Redis record stream");

        let state = PageState {
            connection: self.connection.clone(),
            page_size: self.page_size,
            cursor,
        };

        let pages = stream::unfold(state, |state| async move { state.next_page().await });
        Ok(pages.flat_map(stream::iter).boxed())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}

enum PageCursor {
    Scan { pattern: String, cursor: u64, started: bool },
    Members { keys: std::vec::IntoIter<String> },
    Done,
}

struct PageState {
    connection: ConnectionManager,
    page_size: usize,
    cursor: PageCursor,
}

type Page = Vec<Result<LogRecord, StorageError>>;

impl PageState {
    /// Load the next page of records. A backend error is yielded once, then the stream ends.
    async fn next_page(mut self) -> Option<(Page, Self)> {
        let keys = match &mut self.cursor {
            PageCursor::Done => return None,
            PageCursor::Scan { started: true, cursor: 0, .. } => return None,
            PageCursor::Scan { pattern, cursor, started } => {
                match scan_page(&self.connection, pattern, *cursor, self.page_size).await {
                    Ok((next, keys)) => {
                        *cursor = next;
                        *started = true;
                        keys
                    }
                    Err(e) => {
                        self.cursor = PageCursor::Done;
                        return Some((vec![Err(e)], self));
                    }
                }
            }
            PageCursor::Members { keys } => {
                let page: Vec<String> = keys.by_ref().take(self.page_size).collect();
                if page.is_empty() {
                    return None;
                }
                page
            }
        };

        if keys.is_empty() {
            return Some((Vec::new(), self));
        }

        match mget_records(&self.connection, &keys).await {
            Ok(records) => Some((records.into_iter().map(Ok).collect(), self)),
            Err(e) => {
                self.cursor = PageCursor::Done;
                Some((vec![Err(e)], self))
            }
        }
    }
}

async fn scan_page(
    connection: &ConnectionManager,
    pattern: &str,
    cursor: u64,
    count: usize,
) -> Result<(u64, Vec<String>), StorageError> {
    retry_if("redis_scan", &RetryConfig::query(), StorageError::is_transient, || {
        let mut conn = connection.clone();
        let pattern = pattern.to_string();
        async move {
            let page: (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            Ok(page)
        }
    })
    .await
}

/// `MGET` a page of record keys. Expired keys (nil) and undecodable values are skipped.
async fn mget_records(connection: &ConnectionManager, keys: &[String]) -> Result<Vec<LogRecord>, StorageError> {
    let values: Vec<Option<String>> = retry_if("redis_mget", &RetryConfig::query(), StorageError::is_transient, || {
        let mut conn = connection.clone();
        let keys = keys.to_vec();
        async move {
            let values: Vec<Option<String>> = cmd("MGET")
                .arg(&keys)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            Ok(values)
        }
    })
    .await?;

    let mut records = Vec::with_capacity(values.len());
    for (key, value) in keys.iter().zip(values) {
        let Some(json) = value else {
            continue; // expired between listing and read
        };
        match serde_json::from_str::<LogRecord>(&json) {
            Ok(record) => records.push(record),
            Err(e) => warn!(key = %key, error = %e, "Skipping undecodable buffered record"),
        }
    }
    Ok(records)
}

/// Classify a Redis error into the engine's transient/permanent kinds.
pub(crate) fn map_redis_error(e: RedisError) -> StorageError {
    if e.is_timeout() {
        StorageError::Timeout(e.to_string())
    } else if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
        StorageError::Unavailable(e.to_string())
    } else if matches!(e.kind(), ErrorKind::BusyLoadingError | ErrorKind::TryAgain) {
        StorageError::Busy(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}
