use std::future::Future;
use std::time::Duration;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Transient failure (network, timeout, 5xx): retry with the regular backoff.
    Retry,
    /// Auth or rate-limit hiccup (401/403/429): retry with the longer throttle backoff.
    Throttled,
    Abort,
}

/// How long to wait before the next attempt. `attempt` is 1-based and names
/// the attempt that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `attempt * base`
    Linear(Duration),
    Fixed(Duration),
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Linear(base) => base.saturating_mul(attempt.max(1)),
            Backoff::Fixed(delay) => delay,
        }
    }
}

/// One retry mechanism, parameterized per call type.
///
/// The fetch policy distinguishes throttled errors from transient ones; the
/// write policy uses the same backoff for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub throttle_backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fetch(3, Duration::from_secs(1), Duration::from_secs(5))
    }
}

impl RetryConfig {
    /// Policy for CRM page fetches: linear backoff for transient errors, a
    /// longer fixed wait for 401/403.
    pub fn fetch(max_attempts: u32, base_delay: Duration, auth_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear(base_delay),
            throttle_backoff: Backoff::Fixed(auth_delay),
        }
    }

    /// Policy for destination reads and writes.
    pub fn write(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear(base_delay),
            throttle_backoff: Backoff::Linear(base_delay),
        }
    }

    pub fn delay_for(&self, action: RetryAction, attempt: u32) -> Duration {
        match action {
            RetryAction::Throttled => self.throttle_backoff.delay(attempt),
            _ => self.backoff.delay(attempt),
        }
    }
}

/// Retry an async operation according to `config`.
///
/// - `classifier`: inspects an error and returns `Retry`, `Throttled` or `Abort`
/// - `operation`: the async closure to retry
///
/// Returns the first `Ok` result, or the last error if attempts are exhausted
/// or the classifier returns `Abort`.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &RetryConfig,
    classifier: C,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let total_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                let action = classifier(&e);
                if action == RetryAction::Abort || attempt >= total_attempts {
                    return Err(e);
                }
                let delay = config.delay_for(action, attempt);
                tracing::warn!(
                    "Retryable error (attempt {}/{}), retrying in {}ms: {}",
                    attempt,
                    total_attempts,
                    delay.as_millis(),
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
