// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Log sync walkthrough.
//!
//! Demonstrates:
//! 1. Buffering log records (in memory, or Redis when `REDIS_URL` is set)
//! 2. Syncing one trace, one user, then everything
//! 3. Re-running a sync (nothing new to migrate)
//! 4. Rejecting a blank selector
//! 5. Health check and captured metrics
//!
//! # Run
//!
//! ```bash
//! # In-memory backends
//! cargo run --example sync_logs
//!
//! # Real backends
//! REDIS_URL=redis://localhost:6379 SQL_URL="sqlite:demo_logs.db?mode=rwc" cargo run --example sync_logs
//! ```

use std::sync::Arc;
use std::time::Duration;

use log_sync_engine::storage::memory::{InMemorySource, InMemoryStore};
use log_sync_engine::storage::redis::RedisLogSource;
use log_sync_engine::{LogRecord, SyncEngine, SyncEngineConfig};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let records: Vec<LogRecord> = (0..6)
        .map(|i| {
            let trace = if i < 3 { "checkout-42" } else { "search-7" };
            let user = if i % 2 == 0 { "alice" } else { "bob" };
            LogRecord::new(trace, i, Some(user.into()), json!({"level": "info", "message": format!("step {}", i)}))
        })
        .collect();

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Buffer records
    // ─────────────────────────────────────────────────────────────────────────
    let engine = match (std::env::var("REDIS_URL"), std::env::var("SQL_URL")) {
        (Ok(redis_url), Ok(sql_url)) => {
            println!("📦 Buffering {} records in Redis", records.len());
            let producer = RedisLogSource::new(&redis_url).await?;
            for record in &records {
                producer.append(record, Duration::from_secs(3600)).await?;
            }
            let config = SyncEngineConfig {
                redis_url: Some(redis_url),
                sql_url: Some(sql_url),
                ..Default::default()
            };
            SyncEngine::connect(config).await?
        }
        _ => {
            println!("📦 Buffering {} records in memory", records.len());
            let source = Arc::new(InMemorySource::new());
            for record in &records {
                source.push(record.clone());
            }
            SyncEngine::new(SyncEngineConfig::default(), source, Arc::new(InMemoryStore::new()))
        }
    };

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Sync by trace, by user, then everything
    // ─────────────────────────────────────────────────────────────────────────
    let by_trace = engine.sync_by_trace("checkout-42").await?;
    println!("🔎 by trace: {}", serde_json::to_string(&by_trace)?);

    let by_user = engine.sync_by_user("bob").await?;
    println!("👤 by user:  {}", serde_json::to_string(&by_user)?);

    let all = engine.sync_all_logs().await?;
    println!("🌐 all:      {}", serde_json::to_string(&all)?);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Re-run: already migrated, nothing new
    // ─────────────────────────────────────────────────────────────────────────
    let again = engine.sync_all_logs().await?;
    println!("🔁 re-run:   totalSynced={}", again.total_synced);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Blank selector
    // ─────────────────────────────────────────────────────────────────────────
    if let Err(e) = engine.sync_by_trace("  ").await {
        println!("🚫 rejected: {} ({})", e, e.kind());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Health and metrics
    // ─────────────────────────────────────────────────────────────────────────
    let health = engine.health_check().await;
    println!(
        "🩺 healthy={} source={} store={} circuit={} rejected={}",
        health.healthy, health.source_connected, health.store_connected, health.source_circuit, health.source_rejections
    );

    println!("📊 Metrics:");
    dump_metrics(&snapshotter);

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.0}", v.into_inner()),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("   └─ {}{} = {}", key.name(), label_str, rendered)
        })
        .collect();

    lines.sort();
    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("{}", line);
    }
}
