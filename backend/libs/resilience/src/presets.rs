/// Preset retry configurations for the CDC consumer's broker and handler calls
use crate::retry::RetryConfig;
use std::time::Duration;

/// Broker handshake at startup: a handful of attempts, short jittered waits.
pub fn broker_connect_config(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff: Duration::from_millis(500),
        max_backoff: Duration::from_secs(10),
        backoff_multiplier: 2.0,
        jitter: true,
    }
}

/// Transient broker read errors: retried indefinitely, 1s doubling to 60s.
pub fn broker_read_config() -> RetryConfig {
    RetryConfig {
        max_retries: u32::MAX,
        initial_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(60),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// Handler re-dispatch for a partially failed envelope.
pub fn handler_retry_config(max_retries: u32, initial_backoff: Duration) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff,
        max_backoff: Duration::from_secs(30),
        backoff_multiplier: 2.0,
        jitter: true,
    }
}
