//! # Retry Policy
//!
//! Bounded exponential backoff for snapshot fetches, mutation submits and
//! resubscribes.
//!
//! ## Backoff Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 BACKOFF STRATEGY (Exponential with Jitter)              │
//! │                                                                         │
//! │  Attempt 1: request            ── fails (retryable) ──┐                │
//! │  wait ~250ms                                           │                │
//! │  Attempt 2: request            ── fails (retryable) ──┤                │
//! │  wait ~500ms                                           │                │
//! │  ...                                                   │                │
//! │  Attempt N: request            ── fails ──► give up, return last error │
//! │                                                                         │
//! │  Non-retryable error (validation, auth, rejection): return at once     │
//! │  Each attempt is bounded by the request timeout                        │
//! │  max_attempts = 0 means retry forever                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{SyncError, SyncResult};

/// Retry settings for one kind of remote request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (0 = infinite).
    pub max_attempts: u32,

    /// Delay after the first failure.
    pub initial_backoff: Duration,

    /// Upper bound on any single delay.
    pub max_backoff: Duration,

    /// Delay growth factor.
    pub multiplier: f64,

    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Creates the capped exponential backoff for this policy.
    pub fn backoff(&self) -> CappedBackoff {
        let mut inner = ExponentialBackoff {
            initial_interval: self.initial_backoff,
            current_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: self.multiplier,
            max_elapsed_time: None, // Bounded by attempts instead
            ..Default::default()
        };
        inner.reset();

        CappedBackoff {
            inner,
            max_attempts: self.max_attempts,
            failures: 0,
        }
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. `label` names the request in
    /// logs.
    pub async fn run<T, F, Fut>(&self, label: &'static str, mut op: F) -> SyncResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let timeout = self.timeout;
        let timeout_ms = timeout.as_millis() as u64;
        let mut attempt = 0u32;

        let operation = || {
            attempt += 1;
            let fut = op(attempt);
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) if e.is_retryable() => Err(backoff::Error::transient(e)),
                    Ok(Err(e)) => Err(backoff::Error::permanent(e)),
                    Err(_) => Err(backoff::Error::transient(SyncError::Timeout(timeout_ms))),
                }
            }
        };

        let notify = |err: SyncError, delay: Duration| {
            warn!(request = label, error = %err, ?delay, "Request failed, retrying");
        };

        backoff::future::retry_notify(self.backoff(), operation, notify).await
    }
}

// =============================================================================
// Capped Backoff
// =============================================================================

/// Exponential backoff that stops after a fixed number of attempts.
#[derive(Debug, Clone)]
pub struct CappedBackoff {
    inner: ExponentialBackoff,
    max_attempts: u32,
    failures: u32,
}

impl Backoff for CappedBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.max_attempts != 0 && self.failures >= self.max_attempts {
            return None;
        }
        self.inner.next_backoff()
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.inner.reset();
    }
}
