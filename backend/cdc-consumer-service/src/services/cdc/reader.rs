use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::TopicPartitionList;
use regex::Regex;
use resilience::{broker_connect_config, broker_read_config, handler_retry_config, with_retry_if};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::coordinator::{
    commit_final, commit_pending, CommitCoordinator, CoordinatorConfig, TopicPartition,
};
use super::lifecycle::{Lifecycle, LifecycleState};
use super::partition::{InboundMessage, PartitionSet, PipelineContext, PipelineSettings, RouteResult};
use super::rebalance::RebalanceContext;
use super::registry::DispatchRegistry;
use crate::config::{anchored_pattern, Config, KafkaConfig, PipelineConfig};
use crate::error::{CdcError, Result};
use crate::metrics::CdcMetrics;

/// Threshold for consecutive errors before marking consumer as unhealthy
const UNHEALTHY_ERROR_THRESHOLD: u32 = 5;

/// Threshold for consecutive errors before emitting critical warning
const CRITICAL_ERROR_THRESHOLD: u32 = 10;

/// Timeout of one metadata request during the connect handshake
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// How often backlogged partitions are re-fed into their tasks
const BACKLOG_INTERVAL: Duration = Duration::from_millis(50);

/// Topic subscription pattern.
///
/// The broker receives the `^`-anchored pattern; locally every topic is checked
/// as a full match, since librdkafka only anchors the start.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    subscription: String,
    full_match: Regex,
}

impl TopicPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let subscription = anchored_pattern(pattern)?;
        let body = subscription.trim_start_matches('^');
        let full_match = Regex::new(&format!("^(?:{})$", body))
            .map_err(|e| CdcError::Config(format!("invalid topic pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            subscription,
            full_match,
        })
    }

    /// The pattern handed to `subscribe`
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.full_match.is_match(topic)
    }
}

/// Error handling state for the CDC consumer
pub struct ConsumerErrorState {
    /// Number of consecutive errors
    consecutive_count: AtomicU32,
    /// Timestamp of last successful operation (Unix millis)
    last_success_ms: AtomicU64,
}

impl ConsumerErrorState {
    pub fn new() -> Self {
        Self {
            consecutive_count: AtomicU32::new(0),
            last_success_ms: AtomicU64::new(now_ms()),
        }
    }

    /// Record a successful read, resetting error count
    pub fn record_success(&self) {
        self.consecutive_count.store(0, Ordering::SeqCst);
        self.last_success_ms.store(now_ms(), Ordering::SeqCst);
    }

    /// Record an error, returning the new consecutive count
    pub fn record_error(&self) -> u32 {
        self.consecutive_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_count.load(Ordering::SeqCst)
    }

    pub fn time_since_success(&self) -> Duration {
        let last = self.last_success_ms.load(Ordering::SeqCst);
        Duration::from_millis(now_ms().saturating_sub(last))
    }

    /// Exponential backoff on consecutive errors: 1s, 2s, 4s ... capped at 60s
    pub fn calculate_backoff(&self) -> Duration {
        broker_read_config().backoff_for(self.consecutive_errors().max(1))
    }

    /// Unhealthy after too many consecutive errors, or errors with no success for 5 minutes
    pub fn is_healthy(&self) -> bool {
        let errors = self.consecutive_errors();
        if errors >= UNHEALTHY_ERROR_THRESHOLD {
            return false;
        }
        !(errors > 0 && self.time_since_success() > Duration::from_secs(300))
    }
}

impl Default for ConsumerErrorState {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// CDC Consumer service
///
/// Owns the broker connection and drives the lifecycle: `connect` performs the
/// handshake and subscription, `run` reads and routes messages to the
/// per-partition tasks until shutdown, then drains.
pub struct CdcConsumer {
    consumer: Arc<StreamConsumer<RebalanceContext>>,
    kafka: KafkaConfig,
    pipeline: PipelineConfig,
    pattern: TopicPattern,
    partitions: Arc<PartitionSet>,
    ctx: Arc<PipelineContext>,
    lifecycle: Lifecycle,
    /// Error state tracking for backoff and health checks
    error_state: ConsumerErrorState,
}

impl CdcConsumer {
    /// Create a new CDC consumer. Must be called inside a multi-threaded tokio runtime.
    pub fn new(
        config: &Config,
        registry: Arc<DispatchRegistry>,
        metrics: CdcMetrics,
        lifecycle: Lifecycle,
    ) -> Result<Self> {
        let kafka = config.kafka.clone();
        let pipeline = config.pipeline.clone();
        let pattern = TopicPattern::new(&kafka.topic_pattern)?;

        info!(
            brokers = %kafka.brokers,
            group_id = %kafka.group_id,
            topic_pattern = %pattern.subscription(),
            start_from = ?kafka.start_from,
            failure_policy = ?pipeline.failure_policy,
            handlers = registry.len(),
            "Initializing CDC consumer"
        );

        let runtime = Handle::try_current()
            .map_err(|e| CdcError::Internal(format!("CDC consumer needs a tokio runtime: {}", e)))?;

        let coordinator = CommitCoordinator::new(CoordinatorConfig {
            failure_policy: pipeline.failure_policy,
            max_retries: pipeline.handler_max_retries,
            commit_batch_size: pipeline.commit_batch_size,
            commit_interval: pipeline.commit_interval,
        });
        let settings = PipelineSettings {
            max_message_bytes: pipeline.max_message_bytes,
            handler_retry: handler_retry_config(
                pipeline.handler_max_retries,
                pipeline.handler_retry_backoff,
            ),
        };
        let ctx = Arc::new(PipelineContext::new(registry, coordinator, metrics, settings));
        let partitions = Arc::new(PartitionSet::new(
            Arc::clone(&ctx),
            runtime,
            pipeline.partition_buffer,
        ));
        let context = RebalanceContext::new(Arc::clone(&partitions), pipeline.rebalance_flush_timeout);

        let heartbeat_ms = (kafka.session_timeout_ms / 10).max(1_000);
        let consumer: StreamConsumer<RebalanceContext> = ClientConfig::new()
            .set("group.id", &kafka.group_id)
            .set("bootstrap.servers", &kafka.brokers)
            .set("client.id", &kafka.client_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", kafka.start_from.auto_offset_reset())
            .set("session.timeout.ms", kafka.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", heartbeat_ms.to_string())
            .set("max.poll.interval.ms", "300000")
            .set("enable.partition.eof", "false")
            .set("topic.metadata.refresh.interval.ms", "30000")
            .create_with_context(context)
            .map_err(|e| {
                error!(error = %e, "Failed to create Kafka consumer");
                CdcError::from(e)
            })?;

        let this = Self {
            consumer: Arc::new(consumer),
            kafka,
            pipeline,
            pattern,
            partitions,
            ctx,
            lifecycle,
            error_state: ConsumerErrorState::new(),
        };
        this.ctx
            .metrics
            .lifecycle_state
            .set(this.lifecycle.current().code());
        Ok(this)
    }

    /// Broker handshake and topic subscription: `Created → Connecting → Subscribed`.
    ///
    /// On failure the lifecycle returns to `Created` and a
    /// [`CdcError::FatalConnection`] is returned.
    pub async fn connect(&self) -> Result<()> {
        self.transition(LifecycleState::Connecting)?;

        let attempt = async {
            self.handshake().await?;
            self.consumer
                .subscribe(&[self.pattern.subscription()])
                .map_err(|e| CdcError::FatalConnection(format!("subscription failed: {}", e)))
        };

        match attempt.await {
            Ok(()) => {
                info!(topic_pattern = %self.pattern.subscription(), "Subscribed to CDC topics");
                self.transition(LifecycleState::Subscribed)
            }
            Err(e) => {
                error!(error = %e, "CDC consumer failed to connect");
                self.transition(LifecycleState::Created)?;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<()> {
        let retry = broker_connect_config(self.kafka.connect_max_retries);

        let (brokers, topics) = with_retry_if(retry, CdcError::is_transient, || {
            let consumer = Arc::clone(&self.consumer);
            let pattern = self.pattern.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    consumer.fetch_metadata(None, METADATA_TIMEOUT).map(|metadata| {
                        let topics = metadata
                            .topics()
                            .iter()
                            .filter(|topic| pattern.matches(topic.name()))
                            .count();
                        (metadata.brokers().len(), topics)
                    })
                })
                .await
                .map_err(|e| CdcError::Internal(format!("metadata task failed: {}", e)))?
                .map_err(CdcError::from_broker)
            }
        })
        .await
        .map_err(|e| match e.into_inner() {
            CdcError::TransientBroker(msg) => {
                CdcError::FatalConnection(format!("broker unreachable after retries: {}", msg))
            }
            other => other,
        })?;

        info!(brokers, matching_topics = topics, "Broker handshake completed");
        if topics == 0 {
            warn!(
                topic_pattern = %self.pattern.subscription(),
                "No existing topic matches the pattern yet; waiting for the connector to create one"
            );
        }
        Ok(())
    }

    /// Read and route messages until `shutdown` resolves, then drain.
    ///
    /// Returns once the consumer is `Disconnected`. A fatal broker error also
    /// triggers the drain and is returned afterwards.
    pub async fn run<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        self.transition(LifecycleState::Running)?;
        info!("Starting CDC consumer loop");

        tokio::pin!(shutdown);
        let mut commit_tick = tokio::time::interval(self.pipeline.commit_interval.max(Duration::from_millis(10)));
        let mut backlog_tick = tokio::time::interval(BACKLOG_INTERVAL);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, draining CDC consumer");
                    break Ok(());
                }
                _ = self.ctx.flush_requested.notified() => self.flush(CommitMode::Async),
                _ = commit_tick.tick() => self.flush(CommitMode::Async),
                _ = backlog_tick.tick() => self.resume(self.partitions.drain_backlog()),
                result = self.consumer.recv() => match result {
                    Ok(msg) => {
                        self.record_read_success();
                        self.route(&msg);
                    }
                    Err(e) => {
                        let err = CdcError::from_broker(e);
                        if matches!(err, CdcError::FatalConnection(_)) {
                            error!(error = %err, "Fatal broker error, draining CDC consumer");
                            break Err(err);
                        }

                        let backoff = self.record_read_error(&err);
                        tokio::select! {
                            biased;
                            _ = &mut shutdown => {
                                info!("Shutdown requested during backoff, draining CDC consumer");
                                break Ok(());
                            }
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                },
            }
        };

        self.drain().await?;
        outcome
    }

    /// `→ Draining → Disconnected`: no further reads, wait for in-flight
    /// dispatches, commit every resolved offset, leave the group.
    async fn drain(&self) -> Result<()> {
        self.transition(LifecycleState::Draining)?;

        self.partitions
            .stop_all(self.pipeline.rebalance_flush_timeout)
            .await;

        // Every resolved position is committed again, Async commits may not have landed
        let consumer = Arc::clone(&self.consumer);
        let coordinator = Arc::clone(&self.ctx.coordinator);
        let committed = tokio::task::spawn_blocking(move || commit_final(&coordinator, &*consumer))
            .await
            .map_err(|e| CdcError::Internal(format!("final commit task failed: {}", e)))
            .and_then(|result| result);
        match committed {
            Ok(partitions) => info!(partitions, "Final offset commit completed"),
            Err(e) => warn!(error = %e, "Final offset commit failed; resolved offsets will be redelivered"),
        }

        self.consumer.unsubscribe();
        self.transition(LifecycleState::Disconnected)?;
        info!("CDC consumer disconnected");
        Ok(())
    }

    fn route(&self, msg: &BorrowedMessage<'_>) {
        let topic = msg.topic();
        let partition = msg.partition();
        let offset = msg.offset();

        if !self.pattern.matches(topic) {
            warn!(topic, partition, offset, "Message from topic outside the pattern, skipping");
            let mut coordinator = self.ctx.coordinator.lock();
            if let Some(lease) = coordinator.lease(topic, partition) {
                if coordinator.begin(&lease, offset) {
                    coordinator.record_skipped(&lease, offset);
                }
            }
            return;
        }

        let inbound = InboundMessage {
            topic: topic.to_string(),
            partition,
            offset,
            payload: msg.payload().map(<[u8]>::to_vec),
        };

        match self.partitions.route(inbound) {
            RouteResult::Queued => {}
            RouteResult::Backlogged { pause } => {
                if pause {
                    debug!(topic, partition, "Partition backlogged, pausing fetch");
                    self.pause(topic, partition);
                }
            }
            RouteResult::Stopped { pause } => {
                if pause {
                    warn!(topic, partition, "Partition halted, pausing fetch");
                    self.pause(topic, partition);
                }
            }
            RouteResult::Unassigned => {
                warn!(topic, partition, offset, "Message for unassigned partition ignored");
            }
        }
    }

    fn pause(&self, topic: &str, partition: i32) {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(topic, partition);
        if let Err(e) = self.consumer.pause(&tpl) {
            warn!(topic, partition, error = %e, "Failed to pause partition");
        }
    }

    fn resume(&self, partitions: Vec<TopicPartition>) {
        if partitions.is_empty() {
            return;
        }
        let mut tpl = TopicPartitionList::new();
        for tp in &partitions {
            tpl.add_partition(&tp.topic, tp.partition);
        }
        match self.consumer.resume(&tpl) {
            Ok(()) => debug!(partitions = partitions.len(), "Resumed backlogged partitions"),
            Err(e) => warn!(error = %e, "Failed to resume partitions"),
        }
    }

    fn flush(&self, mode: CommitMode) {
        if let Err(e) = commit_pending(&self.ctx.coordinator, &*self.consumer, mode) {
            warn!(error = %e, "Offset commit failed; will retry on next flush");
        }
    }

    fn record_read_success(&self) {
        if self.error_state.consecutive_errors() > 0 {
            info!("Kafka consumer recovered");
        }
        self.error_state.record_success();
        let metrics = &self.ctx.metrics;
        metrics.consecutive_errors.set(0);
        metrics.consumer_healthy.set(1);
        metrics.backoff_seconds.set(0);
    }

    fn record_read_error(&self, err: &CdcError) -> Duration {
        let consecutive = self.error_state.record_error();
        let backoff = self.error_state.calculate_backoff();
        let metrics = &self.ctx.metrics;
        metrics.consumer_errors_total.inc();
        metrics.consecutive_errors.set(consecutive as i64);
        metrics.backoff_seconds.set(backoff.as_secs() as i64);
        metrics
            .consumer_healthy
            .set(if self.error_state.is_healthy() { 1 } else { 0 });

        if consecutive >= CRITICAL_ERROR_THRESHOLD {
            error!(
                consecutive_errors = consecutive,
                backoff_secs = backoff.as_secs(),
                time_since_success_secs = self.error_state.time_since_success().as_secs(),
                error = %err,
                "CRITICAL: Kafka consumer experiencing persistent failures. Manual intervention may be required"
            );
        } else if consecutive >= UNHEALTHY_ERROR_THRESHOLD {
            warn!(
                consecutive_errors = consecutive,
                backoff_secs = backoff.as_secs(),
                error = %err,
                "Kafka consumer unhealthy - multiple consecutive errors"
            );
        } else {
            warn!(
                consecutive_errors = consecutive,
                backoff_secs = backoff.as_secs(),
                error = %err,
                "Kafka consumer error (will retry with backoff)"
            );
        }

        backoff
    }

    fn transition(&self, next: LifecycleState) -> Result<()> {
        self.lifecycle.transition(next)?;
        self.ctx.metrics.lifecycle_state.set(next.code());
        Ok(())
    }
}
