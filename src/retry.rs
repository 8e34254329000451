//! Exponential backoff policy for outbound API calls.
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How a single attempt ended, from the retry loop's point of view.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    /// Worth trying again (network error, 429, 5xx).
    Retry(E),
    /// Give up immediately (401/403 and every other 4xx).
    Fatal(E),
}

/// Terminal result of [`RetryPolicy::run`].
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    Fatal(E),
    Exhausted { attempts: u32, last: E },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound for a single delay; zero means uncapped.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(20, Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// No sleeping between attempts; for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Retry everything except client errors, with 429 special-cased as
    /// retryable.
    pub fn is_retryable(status: u16) -> bool {
        status == 429 || status >= 500 || status < 400
    }

    /// `base * 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        let delay = self.base_delay.saturating_mul(factor);
        if self.max_delay.is_zero() {
            delay
        } else {
            delay.min(self.max_delay)
        }
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out. `op`
    /// receives the zero-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fatal(err) => return Err(RetryError::Fatal(err)),
                Attempt::Retry(err) => {
                    if attempt + 1 >= self.max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: attempt + 1,
                            last: err,
                        });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "request failed; backing off"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
