// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source circuit breaker.
//!
//! A `recloser` state machine wrapped around the buffer fetch. Once enough of
//! the recent fetches fail, the breaker opens and sync runs fail fast with
//! `SourceUnavailable` until the cool-down passes and a trial call is let through.
//!
//! recloser keeps its state private, so [`CircuitBreaker::state`] is inferred
//! from the last rejection and the configured cool-down.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use tracing::{debug, info, warn};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Cool-down elapsed; the next call is a trial
    HalfOpen,
    /// Calls are rejected without touching the backend
    Open,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("circuit open, call rejected")]
    Rejected,

    #[error("{0}")]
    Inner(#[source] E),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Calls observed while closed before the failure rate is judged
    pub window: usize,
    /// Failure fraction over the window that opens the circuit
    pub trip_rate: f32,
    /// Calls admitted while half-open to decide whether to close again
    pub trial_calls: usize,
    /// Time spent open before a trial call is admitted
    pub cool_down: Duration,
}

impl CircuitConfig {
    /// Buffer fetches. Records are expiring, so the cool-down is short.
    #[must_use]
    pub fn source() -> Self {
        Self {
            window: 10,
            trip_rate: 0.5,
            trial_calls: 1,
            cool_down: Duration::from_secs(5),
        }
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self::source()
    }
}

pub struct CircuitBreaker {
    name: &'static str,
    inner: AsyncRecloser,
    cool_down: Duration,
    /// Latest rejection; cleared by an admitted success
    rejected_at: Mutex<Option<Instant>>,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.trip_rate)
            .closed_len(config.window.max(1))
            .half_open_len(config.trial_calls.max(1))
            .open_wait(config.cool_down)
            .build();

        Self {
            name,
            inner: recloser.into(),
            cool_down: config.cool_down,
            rejected_at: Mutex::new(None),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        match *self.rejected_at.lock() {
            None => CircuitState::Closed,
            Some(at) if at.elapsed() < self.cool_down => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }

    /// Calls turned away while open, since the breaker was built.
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.inner.call(f()).await {
            Ok(value) => {
                if self.rejected_at.lock().take().is_some() {
                    info!(circuit = self.name, "Circuit closed after a successful trial call");
                }
                metrics::record_circuit_call(self.name, "success");
                Ok(value)
            }
            Err(RecloserError::Inner(e)) => {
                // A failed trial call reopens the circuit for another cool-down.
                if let Some(at) = self.rejected_at.lock().as_mut() {
                    *at = Instant::now();
                }
                debug!(circuit = self.name, "Circuit-guarded call failed");
                metrics::record_circuit_call(self.name, "failure");
                Err(CircuitError::Inner(e))
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                *self.rejected_at.lock() = Some(Instant::now());
                warn!(circuit = self.name, "Circuit open, call rejected");
                metrics::record_circuit_call(self.name, "rejected");
                Err(CircuitError::Rejected)
            }
        }
    }
}
