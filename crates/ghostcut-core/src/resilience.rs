//! # Retry helpers
//!
//! Database operations issued by the migration (row-copy chunks, cut-over
//! steps) are retried according to the context's policy:
//!
//! - [`retry_operation`]: up to `max_retries()` attempts, one second apart.
//! - [`retry_operation_with_exponential_backoff`]: the first attempt is
//!   immediate, then waits grow `1s, 2s, 4s, ...` while they stay within
//!   `exponential_backoff_max_interval()`.
//!
//! When attempts run out the last error is returned and, unless the caller
//! marked the operation as not fatal, also published on the context's abort
//! handle. Cancellation (abort or shutdown) stops retrying early.

use crate::context::MigrationContext;
use crate::error::{OscError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Whether exhausting retries aborts the migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatality {
    Fatal,
    NotFatal,
}

/// Doubling backoff that stops growing once the next step would exceed `max`.
///
/// The interval sequence for `base = 1s`, `max = 5s` is `1s, 2s, 4s, 4s, ...`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
    current: Duration,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
            current: base.min(max),
        }
    }

    /// Get the next backoff duration
    pub fn next_backoff(&mut self) -> Duration {
        let candidate = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        if candidate <= self.max {
            self.current = candidate;
        }
        self.current
    }

    /// Reset the backoff
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = self.base.min(self.max);
    }

    /// Get current attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Retry `op` with a fixed one-second pause between attempts.
pub async fn retry_operation<T, F, Fut>(
    ctx: &MigrationContext,
    fatality: Fatality,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with(ctx, fatality, op, |_| Duration::from_secs(1)).await
}

/// Retry `op` with exponentially growing pauses.
pub async fn retry_operation_with_exponential_backoff<T, F, Fut>(
    ctx: &MigrationContext,
    fatality: Fatality,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_interval = u64::try_from(ctx.exponential_backoff_max_interval()).unwrap_or(0);
    let mut backoff =
        ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(max_interval));
    retry_with(ctx, fatality, op, move |_| backoff.next_backoff()).await
}

async fn retry_with<T, F, Fut, D>(
    ctx: &MigrationContext,
    fatality: Fatality,
    mut op: F,
    mut delay: D,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    D: FnMut(u32) -> Duration,
{
    let abort = ctx.abort_handle();
    let max_attempts = u32::try_from(ctx.max_retries().max(1)).unwrap_or(u32::MAX);
    let mut last_error = None;

    for attempt in 0..max_attempts {
        if attempt > 0 {
            let pause = delay(attempt);
            debug!(attempt, pause_ms = pause.as_millis() as u64, "Retrying operation");
            tokio::select! {
                _ = abort.cancelled() => {
                    return Err(OscError::aborted("retry interrupted by abort"));
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(attempt = attempt + 1, max_attempts, error = %e, "Operation failed");
                last_error = Some(e);
            }
        }
    }

    let err = last_error.unwrap_or_else(|| OscError::other("operation was not attempted"));
    if fatality == Fatality::Fatal {
        ctx.panic_abort(err.clone());
    }
    Err(err)
}
