/// Retry policy with exponential backoff and jitter
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based), capped at `max_backoff`.
    ///
    /// Jitter is applied after the cap, so a jittered delay may exceed
    /// `max_backoff` by up to 30%.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let base_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_backoff.as_millis() as f64);

        apply_jitter(Duration::from_millis(capped_ms as u64), self.jitter)
    }

    /// Whether another retry is allowed after `attempt` failed attempts.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Max retries ({retries}) exceeded, last error: {last_error}")]
    MaxRetriesExceeded { retries: u32, last_error: E },
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> RetryError<E> {
    /// The error returned by the final attempt.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::MaxRetriesExceeded { last_error, .. } => last_error,
            RetryError::OperationFailed(e) => e,
        }
    }
}

/// Execute a future with retry logic, retrying every error
pub async fn with_retry<F, Fut, T, E>(config: RetryConfig, f: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(config, |_| true, f).await
}

/// Execute a future with retry logic, retrying only errors accepted by `should_retry`
///
/// A rejected error is returned immediately as [`RetryError::OperationFailed`].
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: RetryConfig,
    should_retry: P,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(RetryError::OperationFailed(e));
                }

                attempt += 1;

                if !config.allows_retry(attempt) {
                    warn!("Max retries ({}) reached: {}", config.max_retries, e);
                    return Err(RetryError::MaxRetriesExceeded {
                        retries: config.max_retries,
                        last_error: e,
                    });
                }

                let delay = config.backoff_for(attempt);

                warn!(
                    "Retry attempt {}/{}, waiting {:?}: {}",
                    attempt, config.max_retries, delay, e
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn apply_jitter(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let mut rng = rand::thread_rng();
        let jitter_factor = 1.0 + rng.gen_range(-0.3..0.3); // ±30%
        Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64)
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(10),
            jitter: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_retry_success_on_first_attempt() {
        let config = RetryConfig::default();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(config, move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(fast_config(3), move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err("temporary error")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_max_retries_exceeded_keeps_last_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(fast_config(2), move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move { Err::<i32, _>(format!("failure #{}", count)) }
        })
        .await;

        match result {
            Err(RetryError::MaxRetriesExceeded {
                retries,
                last_error,
            }) => {
                assert_eq!(retries, 2);
                assert_eq!(last_error, "failure #2");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3); // Initial + 2 retries
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry_if(
            fast_config(5),
            |e: &&str| *e != "fatal",
            move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                async { Err::<i32, _>("fatal") }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::OperationFailed("fatal"))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_schedule_is_exponential_and_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for(4), Duration::from_millis(500));
        assert_eq!(config.backoff_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(1000),
            jitter: true,
            ..Default::default()
        };

        for _ in 0..50 {
            let delay = config.backoff_for(1);
            assert!(delay >= Duration::from_millis(700));
            assert!(delay <= Duration::from_millis(1300));
        }
    }
}
