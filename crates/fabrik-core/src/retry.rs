//! Bounded retry for idempotent bookkeeping steps.
//!
//! Client errors (`Forbidden`, `BadRequest`, ...) are never retried.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default number of attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default minimum delay between attempts.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(1_000);

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub min_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_delay: DEFAULT_MIN_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(max_attempts: u32, min_delay: Duration) -> Self {
        Self {
            max_attempts,
            min_delay,
        }
    }

    /// Runs `op` until it succeeds, fails with a client error, or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the last error once the policy is exhausted.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && e.is_retryable() => {
                    tracing::warn!(
                        label,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "attempt failed; retrying"
                    );
                    tokio::time::sleep(self.min_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(label, attempt, error = %e, "giving up");
                    return Err(e);
                }
            }
        }
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    /// Returns true if the failed step may be retried.
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        !self.is_client_error() && !self.is_not_found()
    }
}

/// Runs `op` with the default policy.
///
/// # Errors
///
/// Returns the last error once the policy is exhausted.
pub async fn retry<T, F, Fut>(label: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryPolicy::default().run(label, op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() -> Result<()> {
        let calls = Arc::new(AtomicU32::new(0));
        let value = fast(3)
            .run("flaky", || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::storage("transient"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await?;
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = fast(3)
            .run("down", || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::storage("down"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = fast(3)
            .run("bad", || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::BadRequest("nope".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
