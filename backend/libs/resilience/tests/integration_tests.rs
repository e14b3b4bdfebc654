/// Integration tests for resilience library
use resilience::{
    presets,
    retry::{with_retry, with_retry_if, RetryConfig, RetryError},
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[derive(Debug, PartialEq)]
enum BrokerError {
    Timeout,
    AuthFailed,
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Timeout => write!(f, "timeout"),
            BrokerError::AuthFailed => write!(f, "authentication failed"),
        }
    }
}

#[tokio::test]
async fn test_connect_retry_recovers_from_transient_timeouts() {
    let config = RetryConfig {
        jitter: false,
        initial_backoff: Duration::from_millis(5),
        ..presets::broker_connect_config(4)
    };
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let result = with_retry_if(
        config,
        |e: &BrokerError| *e == BrokerError::Timeout,
        move || {
            let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(BrokerError::Timeout)
                } else {
                    Ok("connected")
                }
            }
        },
    )
    .await;

    assert_eq!(assert_ok!(result), "connected");
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_connect_retry_stops_on_fatal_error() {
    let config = RetryConfig {
        initial_backoff: Duration::from_millis(5),
        ..presets::broker_connect_config(4)
    };
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let result = with_retry_if(
        config,
        |e: &BrokerError| *e == BrokerError::Timeout,
        move || {
            let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err::<(), _>(BrokerError::Timeout)
                } else {
                    Err(BrokerError::AuthFailed)
                }
            }
        },
    )
    .await;

    assert!(matches!(
        result,
        Err(RetryError::OperationFailed(BrokerError::AuthFailed))
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_exponential_backoff_elapsed_time() {
    let config = RetryConfig {
        max_retries: 3,
        initial_backoff: Duration::from_millis(10),
        backoff_multiplier: 2.0,
        jitter: false,
        ..Default::default()
    };

    let start = std::time::Instant::now();

    let result = with_retry(config, || async { Err::<i32, _>("error") }).await;

    // Expected: 10ms + 20ms + 40ms = 70ms minimum
    assert!(start.elapsed() >= Duration::from_millis(70));
    assert_eq!(assert_err!(result).into_inner(), "error");
}
