/// Resilience patterns for the CDC pipeline
///
/// This library provides the retry primitives shared by the consumer:
/// - **Retry**: Exponential backoff with jitter for transient failures
/// - **Backoff schedule**: The same curve, exposed per attempt for loops that
///   drive their own retries (broker reads, handler re-dispatch)
/// - **Preset Configurations**: Pre-tuned settings for broker connects,
///   broker reads and handler retries
///
/// # Example: Broker handshake with retry
///
/// ```rust,no_run
/// use resilience::{presets, with_retry};
///
/// #[tokio::main]
/// async fn main() {
///     let config = presets::broker_connect_config(5);
///
///     let result = with_retry(config, || async {
///         // Your broker handshake here
///         Ok::<_, String>(())
///     })
///     .await;
/// }
/// ```

pub mod presets;
pub mod retry;

// Re-export main types for convenience
pub use presets::{broker_connect_config, broker_read_config, handler_retry_config};
pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
