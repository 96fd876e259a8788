//! Exponential-backoff retry for fallible async operations.
//!
//! [`retry`] re-runs an operation until it succeeds, the error is
//! rejected by the caller's filter, or the attempt budget is spent.
//! The wrapper holds no state, so independent callers may use it
//! concurrently.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 count as 1.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay slept after failed attempt `attempt` (1-indexed):
    /// `min(initial_delay * backoff_factor^(attempt - 1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay.min(self.max_delay),
            Err(_) => self.max_delay,
        }
    }

    /// Every delay [`retry`] may sleep, in order. There is one fewer
    /// delay than attempts: nothing is slept after the final attempt.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.attempts()).map(|attempt| self.delay_for_attempt(attempt))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `operation` under `policy`.
///
/// Errors for which `should_retry` returns `false` are returned at once
/// with no sleep. Once the attempts are exhausted the last error is
/// returned unmodified.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts || !should_retry(&e) => return Err(e),
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying",
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
