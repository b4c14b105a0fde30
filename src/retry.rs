//! Bounded exponential backoff shared by the store, channel and consumer paths.

use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff with a cap. `max_attempts: None` retries forever.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: u32,
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            initial_backoff_ms,
            max_backoff_ms,
            multiplier: 2,
        }
    }

    pub fn unbounded(initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts: None,
            initial_backoff_ms,
            max_backoff_ms,
            multiplier: 2,
        }
    }

    /// Whether the `attempt`-th call (1-based) is still within budget.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier).saturating_pow(attempt.saturating_sub(1));
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(3, 10, 200)
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
///
/// Only errors for which `is_transient` returns true are retried.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && policy.allows(attempt + 1) => {
                let delay = policy.backoff(attempt);
                warn!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
