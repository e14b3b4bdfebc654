//! rdkafka consumer context wiring rebalances into the partition tasks.
//!
//! On revocation the affected partition tasks are stopped, their in-flight
//! dispatch is awaited and their resolved offsets are committed synchronously
//! before the callback returns, so the next owner starts after the last
//! resolved offset. On assignment fresh cursors are created from the
//! committed offsets and new partition tasks are spawned.

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::coordinator::{split_commit_result, OffsetCommitter, TopicPartition};
use super::partition::PartitionSet;

/// Upper bound on the committed-offsets lookup during assignment
const COMMITTED_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RebalanceContext {
    partitions: Arc<PartitionSet>,
    flush_timeout: Duration,
}

impl RebalanceContext {
    pub fn new(partitions: Arc<PartitionSet>, flush_timeout: Duration) -> Self {
        Self {
            partitions,
            flush_timeout,
        }
    }

    fn revoke(&self, consumer: &BaseConsumer<Self>, tpl: &TopicPartitionList) {
        let revoked = partitions_of(tpl);
        info!(partitions = revoked.len(), "Partitions being revoked, flushing in-flight work");

        self.partitions.stop_blocking(&revoked, self.flush_timeout);

        let commits: Vec<_> = {
            let mut coordinator = self.partitions.context().coordinator.lock();
            revoked
                .iter()
                .filter_map(|tp| coordinator.revoke(&tp.topic, tp.partition))
                .collect()
        };

        if commits.is_empty() {
            return;
        }

        match consumer.commit_batch(&commits, CommitMode::Sync) {
            Ok(()) => {
                debug!(partitions = commits.len(), "Committed offsets of revoked partitions");
            }
            Err(e) => {
                warn!(
                    error = %e,
                    partitions = commits.len(),
                    "Commit on revocation failed; resolved offsets will be redelivered to the next owner"
                );
            }
        }
    }

    fn assign(&self, consumer: &BaseConsumer<Self>, tpl: &TopicPartitionList) {
        let committed = match consumer.committed_offsets(tpl.clone(), COMMITTED_LOOKUP_TIMEOUT) {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Could not fetch committed offsets, cursors start unset");
                tpl.clone()
            }
        };

        let ctx = self.partitions.context();
        for elem in committed.elements() {
            let offset = match elem.offset() {
                Offset::Offset(n) => Some(n),
                _ => None,
            };
            let lease = ctx
                .coordinator
                .lock()
                .assign(elem.topic(), elem.partition(), offset);
            self.partitions.spawn(lease);
        }

        info!(
            assigned = committed.count(),
            total = self.partitions.len(),
            "Partitions assigned"
        );
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => self.revoke(base_consumer, tpl),
            Rebalance::Assign(tpl) => {
                debug!(partitions = tpl.count(), "Partitions about to be assigned");
            }
            Rebalance::Error(e) => warn!(error = %e, "Kafka rebalance error"),
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            self.assign(base_consumer, tpl);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        let ctx = self.partitions.context();
        let (confirmed, rejected) = split_commit_result(&result, offsets);
        {
            let mut coordinator = ctx.coordinator.lock();
            coordinator.commit_acknowledged(&confirmed);
            coordinator.commit_failed(&rejected);
        }

        match result {
            Ok(()) if rejected.is_empty() => {
                ctx.metrics.commits_total.inc();
                debug!(partitions = offsets.count(), "Offsets committed");
            }
            Ok(()) => {
                ctx.metrics.commit_failures_total.inc();
                warn!(
                    partitions = rejected.len(),
                    "Offset commit rejected for some partitions; retrying on next flush"
                );
            }
            Err(e) => {
                ctx.metrics.commit_failures_total.inc();
                warn!(error = %e, partitions = offsets.count(), "Offset commit failed; retrying on next flush");
            }
        }
    }
}
