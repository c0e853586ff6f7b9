// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL durable store for migrated log records.
//!
//! ```sql
//! CREATE TABLE sync_logs (
//!   natural_key  VARCHAR(255) PRIMARY KEY,  -- dedup index
//!   trace_id     VARCHAR(255) NOT NULL,
//!   user_id      VARCHAR(255),
//!   payload      LONGTEXT NOT NULL,         -- JSON as text (sqlx Any driver limitation)
//!   payload_hash VARCHAR(64) NOT NULL,
//!   observed_at  BIGINT NOT NULL,           -- when the record entered the buffer
//!   synced_at    BIGINT NOT NULL,           -- when it was migrated
//!   audit        TEXT                       -- {"run": "<sync run id>"}
//! )
//! ```
//!
//! The primary key is the only uniqueness guarantee the engine relies on.
//! SQLite inserts use `ON CONFLICT(natural_key) DO NOTHING`; MySQL inserts are
//! plain and a duplicate-key error is read as "already migrated".

use std::collections::HashMap;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};

use super::traits::{DurableStore, InsertOutcome, StorageError};
use crate::record::{now_millis, LogRecord};
use crate::resilience::retry::{retry, retry_if, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Keys per `IN (...)` lookup.
const LOOKUP_CHUNK_SIZE: usize = 500;

pub struct SqlLogStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlLogStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and create the schema.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(map_sqlx_error)
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// SQLite WAL mode: readers don't block the writer.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS sync_logs (
                    natural_key TEXT PRIMARY KEY,
                    trace_id TEXT NOT NULL,
                    user_id TEXT,
                    payload TEXT NOT NULL,
                    payload_hash TEXT NOT NULL,
                    observed_at INTEGER NOT NULL,
                    synced_at INTEGER NOT NULL,
                    audit TEXT
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_sync_logs_trace ON sync_logs (trace_id)",
                "CREATE INDEX IF NOT EXISTS idx_sync_logs_user ON sync_logs (user_id)",
            ]
        } else {
            &[r#"
                CREATE TABLE IF NOT EXISTS sync_logs (
                    natural_key VARCHAR(255) PRIMARY KEY,
                    trace_id VARCHAR(255) NOT NULL,
                    user_id VARCHAR(255),
                    payload LONGTEXT NOT NULL,
                    payload_hash VARCHAR(64) NOT NULL,
                    observed_at BIGINT NOT NULL,
                    synced_at BIGINT NOT NULL,
                    audit TEXT,
                    INDEX idx_trace (trace_id),
                    INDEX idx_user (user_id)
                )
                "#]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(map_sqlx_error)
            })
            .await?;
        }

        Ok(())
    }

    /// Read back a migrated record.
    pub async fn get(&self, natural_key: &str) -> Result<Option<LogRecord>, StorageError> {
        let row = sqlx::query(
            "SELECT natural_key, trace_id, user_id, payload, observed_at FROM sync_logs WHERE natural_key = ?",
        )
        .bind(natural_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload_text = read_text(&row, "payload").unwrap_or_default();
        let payload = serde_json::from_str(&payload_text).map_err(|e| StorageError::Malformed {
            key: natural_key.to_string(),
            reason: format!("stored payload is not JSON: {}", e),
        })?;

        Ok(Some(LogRecord {
            natural_key: read_text(&row, "natural_key").unwrap_or_else(|| natural_key.to_string()),
            trace_id: read_text(&row, "trace_id").unwrap_or_default(),
            user_id: read_text(&row, "user_id"),
            payload,
            observed_at: row.try_get("observed_at").unwrap_or(0),
        }))
    }

    /// Run id that migrated the record, from the audit column.
    pub async fn migrated_by(&self, natural_key: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT audit FROM sync_logs WHERE natural_key = ?")
            .bind(natural_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row
            .and_then(|r| read_text(&r, "audit"))
            .and_then(|audit| serde_json::from_str::<serde_json::Value>(&audit).ok())
            .and_then(|audit| audit.get("run").and_then(|v| v.as_str()).map(String::from)))
    }

    fn insert_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO sync_logs (natural_key, trace_id, user_id, payload, payload_hash, observed_at, synced_at, audit) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(natural_key) DO NOTHING"
        } else {
            "INSERT INTO sync_logs (natural_key, trace_id, user_id, payload, payload_hash, observed_at, synced_at, audit) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        }
    }
}

#[async_trait]
impl DurableStore for SqlLogStore {
    async fn lookup_existing(&self, keys: &[String]) -> Result<HashMap<String, String>, StorageError> {
        let mut found = HashMap::new();

        for chunk in keys.chunks(LOOKUP_CHUNK_SIZE) {
            let placeholders: Vec<&str> = (0..chunk.len()).map(|_| "?").collect();
            let sql = format!(
                "SELECT natural_key, payload_hash FROM sync_logs WHERE natural_key IN ({})",
                placeholders.join(", ")
            );

            let rows = retry_if("sql_lookup", &RetryConfig::query(), StorageError::is_transient, || {
                let sql = sql.clone();
                async move {
                    let mut query = sqlx::query(&sql);
                    for key in chunk {
                        query = query.bind(key);
                    }
                    query.fetch_all(&self.pool).await.map_err(map_sqlx_error)
                }
            })
            .await?;

            for row in rows {
                if let Some(key) = read_text(&row, "natural_key") {
                    found.insert(key, read_text(&row, "payload_hash").unwrap_or_default());
                }
            }
        }

        Ok(found)
    }

    async fn insert_if_absent(&self, record: &LogRecord, run_id: &str) -> Result<InsertOutcome, StorageError> {
        record.validate()?;

        let payload = serde_json::to_string(&record.payload).map_err(|e| StorageError::Malformed {
            key: record.natural_key.clone(),
            reason: e.to_string(),
        })?;
        let audit = serde_json::json!({ "run": run_id }).to_string();

        let result = sqlx::query(self.insert_sql())
            .bind(&record.natural_key)
            .bind(&record.trace_id)
            .bind(&record.user_id)
            .bind(&payload)
            .bind(record.payload_hash())
            .bind(record.observed_at)
            .bind(now_millis())
            .bind(&audit)
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Ok(InsertOutcome::AlreadyPresent),
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) => match map_sqlx_error(e) {
                StorageError::Duplicate(_) => Ok(InsertOutcome::AlreadyPresent),
                other => Err(other),
            },
        }
    }

    async fn count(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM sync_logs")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let count: i64 = row.try_get("cnt").map_err(map_sqlx_error)?;
        Ok(count as u64)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

/// Read a text column as String (SQLite TEXT) or bytes (MySQL LONGTEXT via Any).
fn read_text(row: &sqlx::any::AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

/// SQLite BUSY/LOCKED (+ extended) and MySQL lock-wait/deadlock codes.
const BUSY_CODES: &[&str] = &["5", "6", "261", "262", "517", "1205", "1213"];

/// Classify an sqlx error into the engine's transient/permanent kinds.
pub(crate) fn map_sqlx_error(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::PoolTimedOut => StorageError::Timeout("connection pool timed out".into()),
        sqlx::Error::Io(io) => StorageError::Unavailable(io.to_string()),
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            StorageError::Unavailable("connection pool closed".into())
        }
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let message = db.message().to_string();
            if db.is_unique_violation() {
                StorageError::Duplicate(message)
            } else if BUSY_CODES.contains(&code.as_str())
                || message.contains("database is locked")
                || message.contains("busy")
            {
                StorageError::Busy(message)
            } else if db.is_check_violation() || db.is_foreign_key_violation() {
                StorageError::Malformed { key: String::new(), reason: message }
            } else {
                StorageError::Backend(message)
            }
        }
        other => StorageError::Backend(other.to_string()),
    }
}
