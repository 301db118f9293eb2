//! Bounded retry with backoff and per-attempt timeout.
//!
//! Every attempt runs under `attempt_timeout`; a timed-out attempt is dropped
//! (which cancels the underlying request) and counts as a failure. Errors
//! that report `is_retryable() == false` end the run immediately.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Delay before each retry. The last entry repeats when there are more
    /// retries than delays.
    pub delays: Vec<Duration>,
    /// Upper bound on a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delays: vec![Duration::from_secs(1), Duration::from_secs(2)],
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Build a delay ladder `initial * factor^n`, capped at `max_delay`.
    pub fn exponential(
        max_retries: u32,
        initial: Duration,
        factor: f64,
        max_delay: Duration,
    ) -> Self {
        let delays = (0..max_retries)
            .map(|n| {
                let secs = initial.as_secs_f64() * factor.powi(n as i32);
                Duration::from_secs_f64(secs.min(max_delay.as_secs_f64()))
            })
            .collect();
        Self {
            max_retries,
            delays,
            ..Default::default()
        }
    }

    /// Disable retries (single attempt).
    pub fn no_retry(attempt_timeout: Duration) -> Self {
        Self {
            max_retries: 0,
            delays: Vec::new(),
            attempt_timeout,
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.delays
            .get(retry as usize)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Whether a failed attempt may be repeated.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Why a single attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure<E> {
    Error(E),
    TimedOut(Duration),
}

impl<E: fmt::Display> fmt::Display for Failure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Error(e) => write!(f, "{}", e),
            Failure::TimedOut(after) => write!(f, "timed out after {:?}", after),
        }
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// A non-retryable error ended the run.
    Rejected(E),
    /// Every allowed attempt failed.
    Exhausted { attempts: u32, last: Failure<E> },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Rejected(e) => write!(f, "{}", e),
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {} attempt(s): {}", attempts, last)
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Run `operation` until it succeeds, hits a non-retryable error, or runs
/// out of attempts.
pub async fn run<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, RetryError<E>>
where
    E: Retryable + fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let failure = match tokio::time::timeout(policy.attempt_timeout, operation(attempt)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_retryable() => {
                debug!("Attempt {} failed with non-retryable error: {}", attempt, e);
                return Err(RetryError::Rejected(e));
            }
            Ok(Err(e)) => Failure::Error(e),
            Err(_) => Failure::TimedOut(policy.attempt_timeout),
        };

        if attempt >= policy.max_attempts() {
            warn!("Giving up after {} attempt(s): {}", attempt, failure);
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: failure,
            });
        }

        let delay = policy.delay_for(attempt - 1);
        warn!(
            "Attempt {} failed ({}), retrying in {:?}",
            attempt, failure, delay
        );
        tokio::time::sleep(delay).await;
    }
}
