use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{DriveError, Result};

/// Attempt budget and exponential backoff schedule, shared by every retrying caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): base, 2*base, 4*base, ... capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent).min(self.max_delay)
    }

    /// `None` when `err` must not be retried or the budget is spent.
    pub fn next_delay(&self, attempt: u32, err: &DriveError) -> Option<Duration> {
        if !err.is_retryable() || attempt >= self.max_attempts {
            return None;
        }

        // throttling backs off one step further than a dropped connection
        let step = match err {
            DriveError::RateLimited(_) => attempt + 1,
            _ => attempt,
        };
        Some(self.delay_for(step))
    }
}

/// Runs `op` until it succeeds, fails permanently, exhausts `policy` or `cancel` fires.
///
/// The error of the last attempt is returned unchanged so the original cause
/// reaches the user.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, cancel: &CancellationToken, what: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(DriveError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DriveError::Cancelled),
            result = op(attempt) => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let Some(delay) = policy.next_delay(attempt, &err) else {
            return Err(err);
        };

        warn!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "{} failed: {}, retrying",
            what,
            err
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DriveError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}
