// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory implementations of both storage contracts.
//!
//! [`InMemorySource`] models the TTL buffer (entries expire on read) and
//! [`InMemoryStore`] models the durable store (atomic insert via `DashMap::entry`).
//! Both count calls so tests can assert on I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;

use super::traits::{DurableStore, InsertOutcome, RecordSource, RecordStream, Selector, StorageError};
use crate::record::{now_millis, LogRecord};

#[derive(Debug, Clone)]
struct BufferedEntry {
    record: LogRecord,
    expires_at: Option<Instant>,
}

impl BufferedEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// TTL-bounded in-memory buffer.
pub struct InMemorySource {
    data: Arc<DashMap<String, BufferedEntry>>,
    available: AtomicBool,
    fetch_calls: AtomicU64,
}

impl InMemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            available: AtomicBool::new(true),
            fetch_calls: AtomicU64::new(0),
        }
    }

    /// Buffer a record with no expiry.
    pub fn push(&self, record: LogRecord) {
        self.data.insert(record.natural_key.clone(), BufferedEntry { record, expires_at: None });
    }

    /// Buffer a record that disappears after `ttl`.
    pub fn push_with_ttl(&self, record: LogRecord, ttl: Duration) {
        self.data.insert(
            record.natural_key.clone(),
            BufferedEntry { record, expires_at: Some(Instant::now() + ttl) },
        );
    }

    /// Evict a record immediately (simulates TTL expiry).
    pub fn evict(&self, natural_key: &str) {
        self.data.remove(natural_key);
    }

    /// Toggle reachability; while unavailable every fetch fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `fetch` calls made so far.
    #[must_use]
    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Count of live (unexpired) records.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| e.value().is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matches(selector: &Selector, record: &LogRecord) -> bool {
        match selector {
            Selector::All => true,
            Selector::Trace(id) => record.trace_id == *id,
            Selector::User(id) => record.user_id.as_deref() == Some(id.as_str()),
        }
    }
}

impl Default for InMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordSource for InMemorySource {
    async fn fetch(&self, selector: &Selector) -> Result<RecordStream, StorageError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("in-memory source offline".into()));
        }

        // Snapshot matching keys, then re-read each one lazily so an eviction
        // between listing and reading shows up as a shorter stream.
        let now = Instant::now();
        let keys: Vec<String> = self
            .data
            .iter()
            .filter(|e| e.value().is_live(now) && Self::matches(selector, &e.value().record))
            .map(|e| e.key().clone())
            .collect();

        let data = Arc::clone(&self.data);
        let stream = futures::stream::iter(keys).filter_map(move |key| {
            let data = Arc::clone(&data);
            async move {
                let entry = data.get(&key)?;
                entry
                    .is_live(Instant::now())
                    .then(|| Ok::<_, StorageError>(entry.record.clone()))
            }
        });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("in-memory source offline".into()))
        }
    }
}

/// A migrated record plus its audit fields.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub record: LogRecord,
    pub payload_hash: String,
    pub run_id: String,
    pub synced_at: i64,
}

/// Durable store backed by a `DashMap` keyed on natural key.
pub struct InMemoryStore {
    data: DashMap<String, StoredRecord>,
    lookup_calls: AtomicU64,
    insert_calls: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            lookup_calls: AtomicU64::new(0),
            insert_calls: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fetch a stored record by natural key.
    #[must_use]
    pub fn get(&self, natural_key: &str) -> Option<StoredRecord> {
        self.data.get(natural_key).map(|r| r.value().clone())
    }

    /// All stored natural keys (unordered).
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.data.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn lookup_calls(&self) -> u64 {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn lookup_existing(&self, keys: &[String]) -> Result<HashMap<String, String>, StorageError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(keys
            .iter()
            .filter_map(|k| self.data.get(k).map(|r| (k.clone(), r.payload_hash.clone())))
            .collect())
    }

    async fn insert_if_absent(&self, record: &LogRecord, run_id: &str) -> Result<InsertOutcome, StorageError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        record.validate()?;

        match self.data.entry(record.natural_key.clone()) {
            Entry::Occupied(_) => Ok(InsertOutcome::AlreadyPresent),
            Entry::Vacant(slot) => {
                slot.insert(StoredRecord {
                    payload_hash: record.payload_hash(),
                    record: record.clone(),
                    run_id: run_id.to_string(),
                    synced_at: now_millis(),
                });
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn count(&self) -> Result<u64, StorageError> {
        Ok(self.data.len() as u64)
    }
}
