//! Bounded retry of transient driver failures.

use crate::error::{EchemError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Defines a policy for retrying a driver call.
///
/// Specifies how many times a failed call is repeated and how long to wait
/// between attempts. Only errors for which [`EchemError::is_retryable`]
/// holds are retried.
///
/// # Example
///
/// ```rust
/// use echem_core::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert_eq!(policy.total_attempts(), 6);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// The maximum number of retry attempts.
    ///
    /// Total attempts will be `max_attempts + 1` including the initial try.
    /// Set to 0 to disable retries.
    pub max_attempts: u32,

    /// The delay between retry attempts.
    #[serde(rename = "backoff", with = "humantime_serde")]
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// Three retries with 100ms between attempts.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            backoff_delay: Duration::ZERO,
        }
    }

    /// Number of calls made before giving up.
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts.saturating_add(1)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted.
///
/// The last error is returned when every attempt fails.
pub async fn retry_with_policy<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                attempt += 1;
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "Driver call failed, retrying"
                );
                sleep(policy.backoff_delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Wraps a timed out call into a retryable error.
pub(crate) fn timed_out(operation: &'static str, limit: Duration) -> EchemError {
    EchemError::communication(operation, format!("timed out after {limit:?}"))
}
