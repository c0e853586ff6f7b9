// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Log record data structure.
//!
//! A [`LogRecord`] is the unit that flows from the ephemeral buffer into the
//! durable store. The engine never interprets the payload; it only reads the
//! identifying fields and copies the record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::storage::traits::StorageError;

/// Upper bound on natural key length (matches the `VARCHAR(255)` primary key).
pub const MAX_NATURAL_KEY_LEN: usize = 255;

/// A single buffered telemetry record.
///
/// # Example
///
/// ```
/// use log_sync_engine::LogRecord;
/// use serde_json::json;
///
/// let record = LogRecord::new("trace-abc", 7, Some("user-1".into()), json!({"msg": "hi"}));
///
/// assert_eq!(record.natural_key, "trace-abc:7");
/// assert_eq!(record.user_id.as_deref(), Some("user-1"));
/// assert_eq!(record.payload_hash().len(), 64);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Deterministic identifier, unique per logical event. Used for dedup.
    pub natural_key: String,
    /// Groups records belonging to one causal request.
    pub trace_id: String,
    /// End user the record is attributable to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Opaque structured content (message, severity, arbitrary fields).
    #[serde(default)]
    pub payload: Value,
    /// When the record entered the ephemeral buffer (epoch millis).
    #[serde(default)]
    pub observed_at: i64,
}

impl LogRecord {
    /// Build a record whose natural key is derived from `trace_id` and the
    /// record's sequence number within that trace.
    pub fn new(trace_id: impl Into<String>, sequence: u64, user_id: Option<String>, payload: Value) -> Self {
        let trace_id = trace_id.into();
        Self {
            natural_key: Self::derive_key(&trace_id, sequence),
            trace_id,
            user_id,
            payload,
            observed_at: now_millis(),
        }
    }

    /// Build a record with an explicit natural key (e.g. one assigned upstream).
    pub fn with_key(natural_key: impl Into<String>, trace_id: impl Into<String>, user_id: Option<String>, payload: Value) -> Self {
        Self {
            natural_key: natural_key.into(),
            trace_id: trace_id.into(),
            user_id,
            payload,
            observed_at: now_millis(),
        }
    }

    /// `"{trace_id}:{sequence}"`
    #[must_use]
    pub fn derive_key(trace_id: &str, sequence: u64) -> String {
        format!("{}:{}", trace_id, sequence)
    }

    /// SHA-256 (hex) of the payload with object keys in sorted order, so equal
    /// payloads hash equally whatever the producer's field order.
    #[must_use]
    pub fn payload_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hash_canonical(&self.payload, &mut hasher);
        hex::encode(hasher.finalize())
    }

    /// Structural validation. A record failing this can never be written, so
    /// callers treat the error as permanent.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.natural_key.trim().is_empty() {
            return Err(StorageError::Malformed {
                key: self.natural_key.clone(),
                reason: "empty natural key".into(),
            });
        }
        if self.natural_key.len() > MAX_NATURAL_KEY_LEN {
            return Err(StorageError::Malformed {
                key: self.natural_key.clone(),
                reason: format!("natural key exceeds {} bytes", MAX_NATURAL_KEY_LEN),
            });
        }
        if self.trace_id.trim().is_empty() {
            return Err(StorageError::Malformed {
                key: self.natural_key.clone(),
                reason: "empty trace id".into(),
            });
        }
        Ok(())
    }
}

/// Wall clock in epoch millis.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn hash_canonical(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            hasher.update(b"{");
            for (i, (key, field)) in entries.into_iter().enumerate() {
                if i > 0 {
                    hasher.update(b",");
                }
                hasher.update(Value::String(key.clone()).to_string().as_bytes());
                hasher.update(b":");
                hash_canonical(field, hasher);
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    hasher.update(b",");
                }
                hash_canonical(item, hasher);
            }
            hasher.update(b"]");
        }
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}
