use prometheus::{IntCounter, IntGauge, Registry};

/// Metrics for CDC consumer monitoring
#[derive(Clone)]
pub struct CdcMetrics {
    /// Envelopes whose dispatch resolved successfully
    pub messages_processed_total: IntCounter,
    /// Messages skipped because they could not be decoded
    pub decode_failures_total: IntCounter,
    /// Individual handler failures (one dispatch may add several)
    pub handler_failures_total: IntCounter,
    /// Re-dispatches after a partial failure
    pub handler_retries_total: IntCounter,
    /// Offsets resolved by the skip policy after exhausting retries
    pub offsets_skipped_total: IntCounter,
    /// Partitions stopped by the halt policy
    pub partitions_halted_total: IntCounter,
    /// Successful offset commits
    pub commits_total: IntCounter,
    /// Rejected offset commits
    pub commit_failures_total: IntCounter,
    /// Total number of Kafka consumer errors
    pub consumer_errors_total: IntCounter,
    /// Current consecutive error count (resets on success)
    pub consecutive_errors: IntGauge,
    /// Consumer health status (1 = healthy, 0 = unhealthy)
    pub consumer_healthy: IntGauge,
    /// Current backoff duration in seconds
    pub backoff_seconds: IntGauge,
    /// Partitions currently owned by this consumer
    pub assigned_partitions: IntGauge,
    /// Lifecycle state code (see `LifecycleState::code`)
    pub lifecycle_state: IntGauge,
}

impl CdcMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let metric = IntCounter::new(name, help)?;
            registry.register(Box::new(metric.clone()))?;
            Ok(metric)
        };
        let gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            let metric = IntGauge::new(name, help)?;
            registry.register(Box::new(metric.clone()))?;
            Ok(metric)
        };

        let metrics = Self {
            messages_processed_total: counter(
                "cdc_messages_processed_total",
                "Total number of CDC messages successfully processed",
            )?,
            decode_failures_total: counter(
                "cdc_decode_failures_total",
                "Total number of CDC messages skipped as malformed",
            )?,
            handler_failures_total: counter(
                "cdc_handler_failures_total",
                "Total number of change handler failures",
            )?,
            handler_retries_total: counter(
                "cdc_handler_retries_total",
                "Total number of envelope re-dispatches after a handler failure",
            )?,
            offsets_skipped_total: counter(
                "cdc_offsets_skipped_total",
                "Total number of offsets skipped after exhausting handler retries",
            )?,
            partitions_halted_total: counter(
                "cdc_partitions_halted_total",
                "Total number of partitions halted by the failure policy",
            )?,
            commits_total: counter("cdc_commits_total", "Total number of offset commits")?,
            commit_failures_total: counter(
                "cdc_commit_failures_total",
                "Total number of failed offset commits",
            )?,
            consumer_errors_total: counter(
                "cdc_consumer_errors_total",
                "Total number of Kafka consumer errors encountered",
            )?,
            consecutive_errors: gauge(
                "cdc_consumer_consecutive_errors",
                "Current number of consecutive Kafka consumer errors",
            )?,
            consumer_healthy: gauge(
                "cdc_consumer_healthy",
                "CDC consumer health status (1 = healthy, 0 = unhealthy)",
            )?,
            backoff_seconds: gauge(
                "cdc_consumer_backoff_seconds",
                "Current backoff duration in seconds",
            )?,
            assigned_partitions: gauge(
                "cdc_assigned_partitions",
                "Number of partitions currently assigned to this consumer",
            )?,
            lifecycle_state: gauge(
                "cdc_lifecycle_state",
                "Lifecycle state (0 created, 1 connecting, 2 subscribed, 3 running, 4 draining, 5 disconnected)",
            )?,
        };

        // Start as healthy
        metrics.consumer_healthy.set(1);

        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_export() {
        let registry = Registry::new();
        let metrics = CdcMetrics::new(&registry).unwrap();
        metrics.messages_processed_total.inc();
        metrics.assigned_partitions.set(3);

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"cdc_messages_processed_total"));
        assert!(names.contains(&"cdc_lifecycle_state"));
        assert_eq!(metrics.consumer_healthy.get(), 1);
    }

    #[test]
    fn test_double_registration_is_rejected() {
        let registry = Registry::new();
        assert!(CdcMetrics::new(&registry).is_ok());
        assert!(CdcMetrics::new(&registry).is_err());
    }
}
