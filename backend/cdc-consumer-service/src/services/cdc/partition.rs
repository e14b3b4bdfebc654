//! Per-partition processing tasks.
//!
//! Each assigned partition gets one tokio task fed by a bounded channel. The
//! task is strictly sequential: decode, classify, dispatch, record. Partitions
//! run concurrently, so a slow handler only holds back its own partition.
//! Nothing in this module talks to the broker; the reader feeds
//! [`PartitionSet::route`] and acts on the pause/resume hints it returns.

use parking_lot::Mutex;
use resilience::RetryConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::classifier::{classify, OperationKind};
use super::coordinator::{CommitCoordinator, PartitionLease, Resolution, TopicPartition};
use super::decoder::decode;
use super::models::ChangeEvent;
use super::registry::DispatchRegistry;
use crate::error::DecodeError;
use crate::metrics::CdcMetrics;

/// Longest raw payload excerpt included in malformed-message logs
const PREVIEW_BYTES: usize = 256;

/// A message as read from the broker, detached from the client's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// `None` for tombstones
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Messages larger than this are skipped as malformed
    pub max_message_bytes: Option<usize>,
    /// Backoff schedule between handler re-dispatches
    pub handler_retry: RetryConfig,
}

/// Everything a partition task needs, shared explicitly instead of through globals.
pub struct PipelineContext {
    pub registry: Arc<DispatchRegistry>,
    pub coordinator: Arc<Mutex<CommitCoordinator>>,
    pub metrics: CdcMetrics,
    pub settings: PipelineSettings,
    /// Signalled when the coordinator wants a flush
    pub flush_requested: Notify,
}

impl PipelineContext {
    pub fn new(
        registry: Arc<DispatchRegistry>,
        coordinator: CommitCoordinator,
        metrics: CdcMetrics,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            registry,
            coordinator: Arc::new(Mutex::new(coordinator)),
            metrics,
            settings,
            flush_requested: Notify::new(),
        }
    }
}

/// Why a partition task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionExit {
    /// Stop requested (drain or revocation)
    Drained,
    /// The failure policy halted the partition at this offset
    Halted { offset: i64 },
    /// The feeding channel was closed
    Closed,
    /// The partition was reassigned while this task was still running
    Revoked,
}

pub struct PartitionWorker {
    lease: PartitionLease,
    ctx: Arc<PipelineContext>,
    rx: mpsc::Receiver<InboundMessage>,
    stop: watch::Receiver<bool>,
}

impl PartitionWorker {
    pub fn new(
        lease: PartitionLease,
        ctx: Arc<PipelineContext>,
        rx: mpsc::Receiver<InboundMessage>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            lease,
            ctx,
            rx,
            stop,
        }
    }

    /// Process messages in arrival order until stopped, halted or closed.
    ///
    /// A stop request never interrupts a dispatch already under way; it is
    /// only observed between messages and while waiting out a retry backoff.
    pub async fn run(mut self) -> PartitionExit {
        debug!(
            topic = %self.lease.topic,
            partition = self.lease.partition,
            generation = self.lease.generation,
            "Partition task started"
        );

        let exit = loop {
            if *self.stop.borrow() {
                break PartitionExit::Drained;
            }

            let msg = tokio::select! {
                biased;
                _ = self.stop.changed() => break PartitionExit::Drained,
                msg = self.rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break PartitionExit::Closed,
                },
            };

            if let Some(exit) = self.process(msg).await {
                break exit;
            }
        };

        debug!(
            topic = %self.lease.topic,
            partition = self.lease.partition,
            ?exit,
            "Partition task finished"
        );
        exit
    }

    async fn process(&mut self, msg: InboundMessage) -> Option<PartitionExit> {
        let InboundMessage {
            topic,
            partition,
            offset,
            payload,
        } = msg;

        if !self.ctx.coordinator.lock().begin(&self.lease, offset) {
            return None;
        }

        let Some(payload) = payload else {
            debug!(%topic, partition, offset, "Tombstone message, nothing to dispatch");
            self.resolve_without_dispatch(offset);
            return None;
        };

        if let Some(limit) = self.ctx.settings.max_message_bytes {
            if payload.len() > limit {
                let err = DecodeError::TooLarge {
                    size: payload.len(),
                    limit,
                };
                self.skip_malformed(&topic, partition, offset, &payload, &err);
                return None;
            }
        }

        let envelope = match decode(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.skip_malformed(&topic, partition, offset, &payload, &err);
                return None;
            }
        };

        let kind = classify(&envelope.operation);
        if kind == OperationKind::Unknown {
            warn!(
                %topic,
                partition,
                offset,
                op = %envelope.operation,
                table = %envelope.qualified_table(),
                "Unrecognized operation code, dispatching as UNKNOWN"
            );
        }

        let event = ChangeEvent {
            topic,
            partition,
            offset,
            kind,
            envelope,
        };

        let exit = self.dispatch_with_policy(&event).await;

        if self.ctx.coordinator.lock().should_flush() {
            self.ctx.flush_requested.notify_one();
        }

        exit
    }

    async fn dispatch_with_policy(&mut self, event: &ChangeEvent) -> Option<PartitionExit> {
        loop {
            let outcome = self.ctx.registry.dispatch(event).await;
            let failures = outcome.failures().len() as u64;
            if failures > 0 {
                self.ctx.metrics.handler_failures_total.inc_by(failures);
            }

            let resolution =
                self.ctx
                    .coordinator
                    .lock()
                    .record_processed(&self.lease, event.offset, &outcome);

            match resolution {
                Resolution::Resolved => {
                    self.ctx.metrics.messages_processed_total.inc();
                    return None;
                }
                Resolution::Skipped => {
                    self.ctx.metrics.offsets_skipped_total.inc();
                    return None;
                }
                Resolution::Halted => {
                    self.ctx.metrics.partitions_halted_total.inc();
                    return Some(PartitionExit::Halted {
                        offset: event.offset,
                    });
                }
                Resolution::Revoked => {
                    debug!(
                        topic = %event.topic,
                        partition = event.partition,
                        offset = event.offset,
                        "Partition reassigned during dispatch, outcome dropped"
                    );
                    return Some(PartitionExit::Revoked);
                }
                Resolution::Retry { attempt } => {
                    self.ctx.metrics.handler_retries_total.inc();
                    let delay = self.ctx.settings.handler_retry.backoff_for(attempt);
                    warn!(
                        topic = %event.topic,
                        partition = event.partition,
                        offset = event.offset,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Re-dispatching envelope after handler failure"
                    );

                    // The offset stays unresolved if a stop arrives here, so it is redelivered later
                    tokio::select! {
                        biased;
                        _ = self.stop.changed() => return Some(PartitionExit::Drained),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn resolve_without_dispatch(&self, offset: i64) {
        let mut coordinator = self.ctx.coordinator.lock();
        coordinator.record_skipped(&self.lease, offset);
        if coordinator.should_flush() {
            self.ctx.flush_requested.notify_one();
        }
    }

    fn skip_malformed(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        payload: &[u8],
        err: &DecodeError,
    ) {
        self.ctx.metrics.decode_failures_total.inc();
        warn!(
            topic,
            partition,
            offset,
            error = %err,
            size = payload.len(),
            preview = %preview(payload),
            "Skipping malformed change message"
        );
        self.resolve_without_dispatch(offset);
    }
}

fn preview(payload: &[u8]) -> String {
    let end = payload.len().min(PREVIEW_BYTES);
    let mut text = String::from_utf8_lossy(&payload[..end]).into_owned();
    if payload.len() > PREVIEW_BYTES {
        text.push_str("...");
    }
    text
}

/// What the reader should do after routing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteResult {
    /// Handed to the partition task
    Queued,
    /// Parked in the overflow queue; the partition should be paused at the broker
    Backlogged { pause: bool },
    /// The partition task is gone (halted); the partition should be paused
    Stopped { pause: bool },
    /// No task owns this partition
    Unassigned,
}

struct PartitionHandle {
    tx: mpsc::Sender<InboundMessage>,
    stop: watch::Sender<bool>,
    done: std_mpsc::Receiver<PartitionExit>,
    join: JoinHandle<()>,
    overflow: VecDeque<InboundMessage>,
    paused: bool,
}

/// The live partition tasks, keyed by topic-partition.
///
/// Shared between the reader loop and the rebalance callbacks.
pub struct PartitionSet {
    ctx: Arc<PipelineContext>,
    runtime: Handle,
    buffer: usize,
    handles: Mutex<HashMap<TopicPartition, PartitionHandle>>,
}

impl PartitionSet {
    pub fn new(ctx: Arc<PipelineContext>, runtime: Handle, buffer: usize) -> Self {
        Self {
            ctx,
            runtime,
            buffer: buffer.max(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Start a task for a newly assigned partition. A running task is kept.
    pub fn spawn(&self, lease: PartitionLease) {
        let key = TopicPartition::new(lease.topic.as_str(), lease.partition);
        let mut handles = self.handles.lock();
        if handles.contains_key(&key) {
            return;
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = std_mpsc::channel();
        let worker = PartitionWorker::new(lease, Arc::clone(&self.ctx), rx, stop_rx);

        let join = self.runtime.spawn(async move {
            let exit = worker.run().await;
            let _ = done_tx.send(exit);
        });

        handles.insert(
            key,
            PartitionHandle {
                tx,
                stop: stop_tx,
                done: done_rx,
                join,
                overflow: VecDeque::new(),
                paused: false,
            },
        );
        self.ctx
            .metrics
            .assigned_partitions
            .set(handles.len() as i64);
    }

    /// Hand a message to its partition task without waiting.
    pub fn route(&self, msg: InboundMessage) -> RouteResult {
        let key = TopicPartition::new(msg.topic.as_str(), msg.partition);
        let mut handles = self.handles.lock();
        let Some(handle) = handles.get_mut(&key) else {
            return RouteResult::Unassigned;
        };

        if !handle.overflow.is_empty() {
            handle.overflow.push_back(msg);
            return RouteResult::Backlogged {
                pause: !std::mem::replace(&mut handle.paused, true),
            };
        }

        match handle.tx.try_send(msg) {
            Ok(()) => RouteResult::Queued,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                handle.overflow.push_back(msg);
                RouteResult::Backlogged {
                    pause: !std::mem::replace(&mut handle.paused, true),
                }
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => {
                debug!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    "Partition task stopped, message left for redelivery"
                );
                RouteResult::Stopped {
                    pause: !std::mem::replace(&mut handle.paused, true),
                }
            }
        }
    }

    /// Move backlogged messages into their tasks; returns partitions that may be resumed.
    pub fn drain_backlog(&self) -> Vec<TopicPartition> {
        let mut resumable = Vec::new();
        let mut handles = self.handles.lock();

        for (key, handle) in handles.iter_mut() {
            while let Some(msg) = handle.overflow.pop_front() {
                match handle.tx.try_send(msg) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(msg)) => {
                        handle.overflow.push_front(msg);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        handle.overflow.clear();
                        break;
                    }
                }
            }

            if handle.paused && handle.overflow.is_empty() && !handle.tx.is_closed() {
                handle.paused = false;
                resumable.push(key.clone());
            }
        }

        resumable
    }

    /// Stop the given partitions and wait (blocking) for their in-flight dispatch.
    ///
    /// Used from rebalance callbacks, which cannot await. Tasks still running
    /// at the deadline are aborted.
    pub fn stop_blocking(&self, partitions: &[TopicPartition], timeout: Duration) {
        let stopped = self.detach(partitions);
        let deadline = Instant::now() + timeout;

        let wait = || {
            for (key, handle) in &stopped {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match handle.done.recv_timeout(remaining) {
                    Ok(exit) => debug!(partition = %key, ?exit, "Partition task stopped"),
                    Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                        warn!(partition = %key, "Partition task ended without reporting")
                    }
                    Err(std_mpsc::RecvTimeoutError::Timeout) => {
                        warn!(
                            partition = %key,
                            timeout_ms = timeout.as_millis() as u64,
                            "Partition task did not stop in time; aborting it, its in-flight offset stays uncommitted"
                        );
                        handle.join.abort();
                    }
                }
            }
        };

        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(wait)
            }
            _ => wait(),
        }
    }

    /// Stop every partition task and wait for in-flight dispatches to finish.
    pub async fn stop_all(&self, timeout: Duration) {
        let keys: Vec<TopicPartition> = self.handles.lock().keys().cloned().collect();
        let stopped = self.detach(&keys);
        if stopped.is_empty() {
            return;
        }

        info!(partitions = stopped.len(), "Waiting for in-flight dispatches");
        let (aborts, joins): (Vec<_>, Vec<_>) = stopped
            .into_iter()
            .map(|(_, h)| (h.join.abort_handle(), h.join))
            .unzip();
        if tokio::time::timeout(timeout, futures::future::join_all(joins))
            .await
            .is_err()
        {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Partition tasks did not stop in time; aborting them, unresolved offsets stay uncommitted"
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }

    fn detach(&self, partitions: &[TopicPartition]) -> Vec<(TopicPartition, PartitionHandle)> {
        let mut handles = self.handles.lock();
        let stopped: Vec<_> = partitions
            .iter()
            .filter_map(|key| handles.remove_entry(key))
            .collect();
        for (_, handle) in &stopped {
            let _ = handle.stop.send(true);
        }
        self.ctx
            .metrics
            .assigned_partitions
            .set(handles.len() as i64);
        stopped
    }
}
