//! Retry utilities with exponential backoff and jitter.
//!
//! Two flavours are provided:
//!
//! - [`retry_with_backoff`] retries any fallible async operation, used for
//!   object storage calls made by deletion finalizers.
//! - [`retry_on_conflict`] retries a read-modify-write only while the API
//!   server answers 409, used for status and spec writes that race with other
//!   writers.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Bounded policy for object storage calls: 5 attempts, 1s doubling to 10s
    pub fn storage() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }

    /// Bounded policy for conflicting writes: 5 attempts, 10ms doubling
    pub fn conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, or up to `max_attempts` when set. Returns the last
/// error once attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let wait = jittered(delay);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = wait.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(wait).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Re-run a read-modify-write while it fails with a 409 conflict.
///
/// Any other error is returned immediately. The closure must re-read the
/// object on each call so that the write is based on a fresh resourceVersion.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Err(e) if e.is_conflict() => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    return Err(e);
                }
                debug!(operation = %operation_name, attempt, "write conflict, retrying");
                tokio::time::sleep(jittered(delay)).await;
                delay = config.next_delay(delay);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn conflict() -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }))
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result: Result<i32, &str> =
            retry_with_backoff(&fast(3), "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast(5), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    /// Story: two writers race on a restore status; the loser re-reads and wins
    /// on the next attempt instead of failing the reconcile.
    #[tokio::test]
    async fn story_conflicting_status_write_is_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = retry_on_conflict(&fast(5), "status", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(conflict())
                } else {
                    Ok("written")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "written");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_conflict_retry_stops_on_other_errors() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), Error> = retry_on_conflict(&fast(5), "status", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::validation("bad"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Validation { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conflict_retry_is_bounded() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), Error> = retry_on_conflict(&fast(3), "status", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            }
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
