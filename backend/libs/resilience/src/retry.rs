/// Retry policy with exponential backoff and jitter
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::metrics::RetryMetrics;

/// Errors that know whether a later attempt can still succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (the first call is not a retry)
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
    /// Give up once this much time has passed since the first attempt
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
            max_elapsed: None,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Elapsed budget derived from the attempt cap: `max_retries * max_backoff`.
    pub fn with_derived_max_elapsed(mut self) -> Self {
        self.max_elapsed = Some(self.max_backoff * self.max_retries);
        self
    }

    /// Delay before retry number `attempt` (1-based), before jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("non-retryable failure: {0}")]
    Permanent(E),
}

impl<E> RetryError<E> {
    /// The error returned by the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent(e) => e,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

/// Execute a future with retry logic.
///
/// Permanent errors are returned after the first failing attempt; retryable
/// errors are retried until `max_retries` or `max_elapsed` is reached.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut f: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let err = match f().await {
            Ok(result) => {
                RetryMetrics::record_attempts("success", attempt);
                return Ok(result);
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            RetryMetrics::record_attempts("permanent", attempt);
            return Err(RetryError::Permanent(err));
        }

        if attempt > config.max_retries {
            warn!(attempts = attempt, error = %err, "Max retries ({}) reached", config.max_retries);
            RetryMetrics::record_attempts("exhausted", attempt);
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = calculate_backoff(config.backoff_for(attempt), config.jitter);

        if let Some(budget) = config.max_elapsed {
            if started.elapsed() + delay > budget {
                warn!(attempts = attempt, error = %err, budget = ?budget, "Retry budget exhausted");
                RetryMetrics::record_attempts("exhausted", attempt);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
        }

        warn!(
            error = %err,
            "Retry attempt {}/{}, waiting {:?}",
            attempt, config.max_retries, delay
        );

        tokio::time::sleep(delay).await;
    }
}

fn calculate_backoff(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let mut rng = rand::thread_rng();
        let jitter_factor = 1.0 + rng.gen_range(-0.3..0.3); // ±30%
        Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64)
    } else {
        base
    }
}
