// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage contracts and backends.
//!
//! - [`traits`]: [`RecordSource`](traits::RecordSource) and [`DurableStore`](traits::DurableStore)
//! - [`redis`]: the TTL buffer
//! - [`sql`]: the durable store (MySQL or SQLite)
//! - [`memory`]: in-process versions of both, for tests and embedding

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;
