//! Retry policy applied to named operations
//!
//! Every external call that can fail transiently goes through a [`RetryPolicy`]
//! instead of an ad hoc loop at the call site. Object updates that can lose
//! against a concurrent writer go through [`retry_on_conflict`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Bounded retry with optional exponential backoff and jitter
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub delay: Duration,
    /// Factor applied to the delay after each failed attempt
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Fixed spacing between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
            jitter: false,
        }
    }

    /// Stream existence checks: 5 attempts, 1 second apart
    pub fn stream_existence() -> Self {
        Self::fixed(5, Duration::from_secs(1))
    }

    /// Optimistic-concurrency retries, short jittered backoff
    pub fn conflict() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: true,
        }
    }

    /// Delay before attempt `attempt + 1` (attempt counts from 1)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let secs = (self.delay.as_secs_f64() * self.backoff_multiplier.powi(exp))
            .min(self.max_delay.as_secs_f64());
        let secs = if self.jitter {
            secs * rand::thread_rng().gen_range(0.5..1.5)
        } else {
            secs
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Run `operation` until it succeeds or attempts are exhausted
    pub async fn retry<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry_if(operation_name, |_| true, operation).await
    }

    /// Run `operation`, retrying only errors accepted by `should_retry`
    pub async fn retry_if<F, Fut, T, P>(
        &self,
        operation_name: &str,
        should_retry: P,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = %operation_name, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < max_attempts && should_retry(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Re-run a read-modify-write until it no longer conflicts with a concurrent writer
///
/// `operation` must re-read the object on every attempt.
pub async fn retry_on_conflict<F, Fut, T>(operation_name: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryPolicy::conflict()
        .retry_if(operation_name, Error::is_conflict, operation)
        .await
}
