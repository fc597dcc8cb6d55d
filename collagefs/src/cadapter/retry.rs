//! 重试策略：指数退避 + 单次请求超时。

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{error, warn};
use uuid::Uuid;

use super::error::{BlobError, BlobOp, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Per-attempt deadline; an attempt that exceeds it counts as `TimedOut`.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            attempt_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl RetryPolicy {
    /// Builds the attempt limit from a configured count of total attempts
    /// where `-1` means unlimited.
    pub fn attempts_from_config(retries: i32) -> Option<u32> {
        u32::try_from(retries).ok()
    }

    /// Delay before attempt `attempt + 1`. A remote-provided retry-after
    /// wins over the exponential schedule.
    pub fn delay_after(&self, attempt: u32, err: &TransportError) -> Duration {
        if let Some(hint) = err.retry_after() {
            return hint;
        }
        let exp = attempt.saturating_sub(1).min(20);
        self.initial_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retriable error or
/// the attempt limit is reached.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: BlobOp,
    chunk: Uuid,
    mut operation: F,
) -> Result<T, BlobError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    if policy.max_attempts == Some(0) {
        error!(%chunk, %op, "attempt limit is 0, not trying");
        return Err(BlobError::NoAttempts { op, chunk });
    }
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = match policy.attempt_timeout {
            Some(limit) => match timeout(limit, operation()).await {
                Ok(r) => r,
                Err(_) => Err(TransportError::TimedOut),
            },
            None => operation().await,
        };
        let err = match outcome {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if !err.is_retriable() {
            error!(%chunk, %op, error = %err, "non-retriable error");
            return Err(BlobError::Fatal {
                op,
                chunk,
                source: err,
            });
        }
        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            error!(%chunk, %op, attempt, error = %err, "giving up");
            return Err(BlobError::RetriesExhausted {
                op,
                chunk,
                attempts: attempt,
                last: err,
            });
        }
        let delay = policy.delay_after(attempt, &err);
        warn!(%chunk, %op, attempt, ?delay, error = %err, "retriable error, retrying");
        sleep(delay).await;
    }
}
