//! Bounded retries with exponential backoff
//!
//! The dispatcher uses [`RetryConfig`] twice: for in-process handler retries
//! (it drives those itself through [`RetryConfig::backoff_for`]) and, through
//! [`retry_with_backoff`], for publishing derived events and dead letters
//! before giving up on a delivery and letting the River redeliver it.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles after each further one
    pub initial_backoff: Duration,
    /// Ceiling for any single delay
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay before the attempt that follows failed attempt `attempt` (1-based).
    ///
    /// `initial_backoff * 2^(attempt-1)`, never above `max_backoff`, and
    /// saturating instead of overflowing for large attempt numbers.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        match self.initial_backoff.checked_mul(1u32 << doublings) {
            Some(delay) if delay < self.max_backoff => delay,
            _ => self.max_backoff,
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` runs have
/// failed, sleeping [`RetryConfig::backoff_for`] between runs.
///
/// Returns the first success, or the error of the last run. `operation`
/// names the call in log lines.
///
/// ```rust
/// use river::consumer_retry::{retry_with_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let answer = retry_with_backoff(
///     || async { Ok::<_, String>(42) },
///     &RetryConfig::default(),
///     "lookup_answer",
/// )
/// .await?;
/// assert_eq!(answer, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut run: F,
    config: &RetryConfig,
    operation: &str,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = config.attempts();
    let mut attempt = 1;

    loop {
        let error = match run().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Succeeded on retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if attempt >= attempts {
            warn!(operation, attempts, error = %error, "Giving up");
            return Err(error);
        }

        let delay = config.backoff_for(attempt);
        warn!(
            operation,
            attempt,
            attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, backing off"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
