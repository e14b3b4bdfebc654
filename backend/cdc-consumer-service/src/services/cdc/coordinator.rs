//! Commit coordination: decides which offsets may be committed to the broker.
//!
//! Offsets are tracked per partition from the moment they are read (`begin`)
//! until they are resolved (dispatched successfully, skipped by policy, or
//! skipped as malformed). The commit position of a partition only moves over a
//! contiguous run of resolved offsets, so an offset is never committed while it
//! or any lower offset of the same partition is still in flight.
//!
//! Every assignment of a partition hands out a [`PartitionLease`]. Outcomes
//! reported under a lease from an earlier assignment are ignored, so a task
//! that outlived its revocation cannot touch the cursor of its successor.

use parking_lot::Mutex;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::rebalance::RebalanceContext;
use super::registry::DispatchOutcome;
use crate::error::{CdcError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Right to report offsets for one assignment of a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLease {
    pub topic: String,
    pub partition: i32,
    pub generation: u64,
}

impl PartitionLease {
    fn key(&self) -> TopicPartition {
        TopicPartition::new(self.topic.as_str(), self.partition)
    }
}

/// Position of one assigned partition.
///
/// `last_committed_offset` is a commit position (next offset to consume), -1
/// when nothing is committed yet. `last_processed_offset` is the highest offset
/// resolved so far, -1 before the first one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCursor {
    pub topic: String,
    pub partition: i32,
    pub last_committed_offset: i64,
    pub last_processed_offset: i64,
}

/// An offset ready to be sent to the broker: the next offset to consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// What to do with an envelope whose handlers keep failing after all retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log the failure, treat the offset as resolved and move on
    Skip,
    /// Stop the partition; neither the failed offset nor anything above it is committed
    Halt,
}

impl FromStr for FailurePolicy {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(FailurePolicy::Skip),
            "halt" => Ok(FailurePolicy::Halt),
            other => Err(CdcError::Config(format!(
                "unknown failure policy '{}' (expected 'skip' or 'halt')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub failure_policy: FailurePolicy,
    /// Re-dispatches allowed after the first failed dispatch of an envelope
    pub max_retries: u32,
    /// Flush once this many offsets have been resolved since the last flush
    pub commit_batch_size: usize,
    /// Flush at least this often while anything is resolved
    pub commit_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Skip,
            max_retries: 3,
            commit_batch_size: 100,
            commit_interval: Duration::from_secs(5),
        }
    }
}

/// Verdict for a processed offset, acted upon by the partition task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Dispatch succeeded; the offset is resolved
    Resolved,
    /// Dispatch failed; re-dispatch the envelope (1-based retry number)
    Retry { attempt: u32 },
    /// Retries exhausted under [`FailurePolicy::Skip`]; the offset is resolved
    Skipped,
    /// Retries exhausted under [`FailurePolicy::Halt`]; the partition must stop
    Halted,
    /// The lease is gone (partition revoked or reassigned); the task must stop
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OffsetState {
    InFlight { failures: u32 },
    Done,
}

#[derive(Debug)]
struct PartitionState {
    generation: u64,
    cursor: PartitionCursor,
    /// Last commit position the broker confirmed
    acknowledged: i64,
    /// Offsets read but not yet folded into the commit position, in offset order
    tracked: BTreeMap<i64, OffsetState>,
    /// Highest offset handed to `begin`
    last_begun: Option<i64>,
    /// Commit position reached by resolved offsets
    commit_position: Option<i64>,
    halted: bool,
}

impl PartitionState {
    fn new(topic: &str, partition: i32, generation: u64, committed: Option<i64>) -> Self {
        Self {
            generation,
            cursor: PartitionCursor {
                topic: topic.to_string(),
                partition,
                last_committed_offset: committed.unwrap_or(-1),
                last_processed_offset: -1,
            },
            acknowledged: committed.unwrap_or(-1),
            tracked: BTreeMap::new(),
            last_begun: committed.map(|c| c - 1),
            commit_position: None,
            halted: false,
        }
    }

    /// Fold the leading run of resolved offsets into the commit position.
    fn advance(&mut self) -> usize {
        let mut advanced = 0;
        while let Some(entry) = self.tracked.first_entry() {
            if *entry.get() != OffsetState::Done {
                break;
            }
            let offset = *entry.key();
            entry.remove();
            self.commit_position = Some(offset + 1);
            advanced += 1;
        }
        advanced
    }

    fn pending_commit(&self) -> Option<i64> {
        self.commit_position
            .filter(|position| *position > self.cursor.last_committed_offset)
    }

    fn commit_offset(&self, offset: i64) -> CommitOffset {
        CommitOffset {
            topic: self.cursor.topic.clone(),
            partition: self.cursor.partition,
            offset,
        }
    }
}

pub struct CommitCoordinator {
    config: CoordinatorConfig,
    partitions: HashMap<TopicPartition, PartitionState>,
    generations: u64,
    resolved_since_flush: usize,
    last_flush: Instant,
}

impl CommitCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            partitions: HashMap::new(),
            generations: 0,
            resolved_since_flush: 0,
            last_flush: Instant::now(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Create a fresh cursor for a newly assigned partition and lease it out.
    ///
    /// `committed` is the broker's commit position, if any. Leases of earlier
    /// assignments of the same partition stop being honoured.
    pub fn assign(&mut self, topic: &str, partition: i32, committed: Option<i64>) -> PartitionLease {
        self.generations += 1;
        let generation = self.generations;
        info!(
            topic,
            partition,
            generation,
            committed_offset = committed.unwrap_or(-1),
            "Partition cursor created"
        );
        self.partitions.insert(
            TopicPartition::new(topic, partition),
            PartitionState::new(topic, partition, generation, committed),
        );
        PartitionLease {
            topic: topic.to_string(),
            partition,
            generation,
        }
    }

    /// The lease of the current assignment, if the partition is assigned.
    pub fn lease(&self, topic: &str, partition: i32) -> Option<PartitionLease> {
        self.partitions
            .get(&TopicPartition::new(topic, partition))
            .map(|state| PartitionLease {
                topic: topic.to_string(),
                partition,
                generation: state.generation,
            })
    }

    /// Destroy a partition's cursor, returning its final commit.
    ///
    /// The commit position is returned even if it was submitted before, since
    /// an earlier asynchronous commit may not have reached the broker.
    pub fn revoke(&mut self, topic: &str, partition: i32) -> Option<CommitOffset> {
        let state = self
            .partitions
            .remove(&TopicPartition::new(topic, partition))?;
        let in_flight = state.tracked.len();
        if in_flight > 0 {
            warn!(
                topic,
                partition, in_flight, "Partition revoked with unresolved offsets; they will be redelivered"
            );
        }
        state
            .commit_position
            .map(|offset| state.commit_offset(offset))
    }

    pub fn cursor(&self, topic: &str, partition: i32) -> Option<&PartitionCursor> {
        self.partitions
            .get(&TopicPartition::new(topic, partition))
            .map(|s| &s.cursor)
    }

    pub fn is_halted(&self, topic: &str, partition: i32) -> bool {
        self.partitions
            .get(&TopicPartition::new(topic, partition))
            .map(|s| s.halted)
            .unwrap_or(false)
    }

    fn leased(&mut self, lease: &PartitionLease) -> Option<&mut PartitionState> {
        self.partitions
            .get_mut(&lease.key())
            .filter(|state| state.generation == lease.generation)
    }

    /// Mark `offset` as read and in flight.
    ///
    /// Returns `false` for offsets at or below the last begun offset of the
    /// partition (redeliveries), for halted partitions and for stale leases;
    /// the caller must not process those.
    pub fn begin(&mut self, lease: &PartitionLease, offset: i64) -> bool {
        let Some(state) = self.leased(lease) else {
            debug!(
                topic = %lease.topic,
                partition = lease.partition,
                offset,
                "Offset read under a stale lease ignored"
            );
            return false;
        };

        if state.halted {
            return false;
        }
        if state.last_begun.is_some_and(|last| offset <= last) {
            debug!(
                topic = %lease.topic,
                partition = lease.partition,
                offset,
                last_begun = state.last_begun.unwrap_or(-1),
                "Ignoring redelivered offset"
            );
            return false;
        }

        state.last_begun = Some(offset);
        state
            .tracked
            .insert(offset, OffsetState::InFlight { failures: 0 });
        true
    }

    /// Record the dispatch outcome for an in-flight offset and apply the failure policy.
    pub fn record_processed(
        &mut self,
        lease: &PartitionLease,
        offset: i64,
        outcome: &DispatchOutcome,
    ) -> Resolution {
        let max_retries = self.config.max_retries;
        let policy = self.config.failure_policy;
        let topic = lease.topic.as_str();
        let partition = lease.partition;

        let Some(state) = self.leased(lease) else {
            warn!(topic, partition, offset, "Outcome for revoked partition ignored");
            return Resolution::Revoked;
        };
        let Some(slot) = state.tracked.get_mut(&offset) else {
            warn!(topic, partition, offset, "Outcome for untracked offset ignored");
            return Resolution::Revoked;
        };

        let resolution = if outcome.is_success() {
            Resolution::Resolved
        } else {
            let failures = match slot {
                OffsetState::InFlight { failures } => {
                    *failures += 1;
                    *failures
                }
                OffsetState::Done => 1,
            };

            if failures <= max_retries {
                Resolution::Retry { attempt: failures }
            } else {
                let failed: Vec<&str> = outcome
                    .failures()
                    .iter()
                    .map(|f| f.handler.as_str())
                    .collect();
                match policy {
                    FailurePolicy::Skip => {
                        error!(
                            topic,
                            partition,
                            offset,
                            attempts = failures,
                            handlers = ?failed,
                            "Handlers still failing after retries; skipping offset"
                        );
                        Resolution::Skipped
                    }
                    FailurePolicy::Halt => {
                        error!(
                            topic,
                            partition,
                            offset,
                            attempts = failures,
                            handlers = ?failed,
                            "Handlers still failing after retries; halting partition"
                        );
                        Resolution::Halted
                    }
                }
            }
        };

        match resolution {
            Resolution::Resolved | Resolution::Skipped => {
                *slot = OffsetState::Done;
                state.cursor.last_processed_offset = state.cursor.last_processed_offset.max(offset);
                let advanced = state.advance();
                self.resolved_since_flush += advanced;
            }
            Resolution::Halted => state.halted = true,
            Resolution::Retry { .. } | Resolution::Revoked => {}
        }

        resolution
    }

    /// Resolve an offset without dispatch (malformed payload, tombstone, foreign topic).
    pub fn record_skipped(&mut self, lease: &PartitionLease, offset: i64) {
        let Some(state) = self.leased(lease) else {
            return;
        };
        if let Some(slot) = state.tracked.get_mut(&offset) {
            *slot = OffsetState::Done;
            state.cursor.last_processed_offset = state.cursor.last_processed_offset.max(offset);
            let advanced = state.advance();
            self.resolved_since_flush += advanced;
        }
    }

    /// Whether a flush is due, by count or by elapsed time.
    pub fn should_flush(&self) -> bool {
        self.resolved_since_flush >= self.config.commit_batch_size.max(1)
            || (self.resolved_since_flush > 0
                && self.last_flush.elapsed() >= self.config.commit_interval)
    }

    /// Commit positions not yet submitted to the broker, ordered by partition.
    pub fn pending_commits(&self) -> Vec<CommitOffset> {
        self.sorted_commits(PartitionState::pending_commit)
    }

    /// Every partition's commit position, submitted before or not.
    pub fn final_commits(&self) -> Vec<CommitOffset> {
        self.sorted_commits(|state| state.commit_position)
    }

    fn sorted_commits<F>(&self, position: F) -> Vec<CommitOffset>
    where
        F: Fn(&PartitionState) -> Option<i64>,
    {
        let mut commits: Vec<CommitOffset> = self
            .partitions
            .values()
            .filter_map(|state| position(state).map(|offset| state.commit_offset(offset)))
            .collect();
        commits.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        commits
    }

    /// Record that these commit positions were handed to the broker.
    pub fn mark_committed(&mut self, commits: &[CommitOffset]) {
        for commit in commits {
            if let Some(state) = self
                .partitions
                .get_mut(&TopicPartition::new(commit.topic.as_str(), commit.partition))
            {
                state.cursor.last_committed_offset =
                    state.cursor.last_committed_offset.max(commit.offset);
            }
        }
        self.resolved_since_flush = 0;
        self.last_flush = Instant::now();
    }

    /// Record that the broker confirmed these commit positions.
    pub fn commit_acknowledged(&mut self, commits: &[CommitOffset]) {
        for commit in commits {
            if let Some(state) = self
                .partitions
                .get_mut(&TopicPartition::new(commit.topic.as_str(), commit.partition))
            {
                state.acknowledged = state.acknowledged.max(commit.offset);
            }
        }
    }

    /// Record that the broker rejected these commit positions.
    ///
    /// A partition whose latest submission failed falls back to its last
    /// confirmed position, so the next flush offers its commit again.
    pub fn commit_failed(&mut self, commits: &[CommitOffset]) {
        for commit in commits {
            if let Some(state) = self
                .partitions
                .get_mut(&TopicPartition::new(commit.topic.as_str(), commit.partition))
            {
                if state.cursor.last_committed_offset == commit.offset {
                    debug!(
                        topic = %commit.topic,
                        partition = commit.partition,
                        offset = commit.offset,
                        fallback = state.acknowledged,
                        "Commit rejected, offering it again on next flush"
                    );
                    state.cursor.last_committed_offset = state.acknowledged;
                }
            }
        }
    }
}

/// Seam between the coordinator and the broker connection.
pub trait OffsetCommitter: Send + Sync {
    fn commit_batch(&self, commits: &[CommitOffset], mode: CommitMode) -> Result<()>;
}

/// Send pending commits through `committer`; returns how many partitions were committed.
///
/// The coordinator lock is released while the broker is contacted. On failure
/// nothing is marked committed and the same positions are offered again on
/// the next flush.
pub fn commit_pending(
    coordinator: &Mutex<CommitCoordinator>,
    committer: &dyn OffsetCommitter,
    mode: CommitMode,
) -> Result<usize> {
    let commits = coordinator.lock().pending_commits();
    submit(coordinator, committer, commits, mode)
}

/// Synchronously commit every partition's commit position, including ones
/// already submitted asynchronously. Used when ownership ends.
pub fn commit_final(
    coordinator: &Mutex<CommitCoordinator>,
    committer: &dyn OffsetCommitter,
) -> Result<usize> {
    let commits = coordinator.lock().final_commits();
    submit(coordinator, committer, commits, CommitMode::Sync)
}

fn submit(
    coordinator: &Mutex<CommitCoordinator>,
    committer: &dyn OffsetCommitter,
    commits: Vec<CommitOffset>,
    mode: CommitMode,
) -> Result<usize> {
    if commits.is_empty() {
        coordinator.lock().mark_committed(&[]);
        return Ok(0);
    }

    committer.commit_batch(&commits, mode)?;

    let mut coordinator = coordinator.lock();
    coordinator.mark_committed(&commits);
    if matches!(mode, CommitMode::Sync) {
        coordinator.commit_acknowledged(&commits);
    }

    debug!(partitions = commits.len(), "Committed offsets");
    Ok(commits.len())
}

pub fn to_partition_list(commits: &[CommitOffset]) -> Result<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for commit in commits {
        tpl.add_partition_offset(&commit.topic, commit.partition, Offset::Offset(commit.offset))?;
    }
    Ok(tpl)
}

/// Split a commit result reported by the broker into confirmed and rejected positions.
pub fn split_commit_result(
    result: &rdkafka::error::KafkaResult<()>,
    offsets: &TopicPartitionList,
) -> (Vec<CommitOffset>, Vec<CommitOffset>) {
    let mut confirmed = Vec::new();
    let mut rejected = Vec::new();
    for elem in offsets.elements() {
        let Offset::Offset(offset) = elem.offset() else {
            continue;
        };
        let commit = CommitOffset {
            topic: elem.topic().to_string(),
            partition: elem.partition(),
            offset,
        };
        if result.is_ok() && elem.error().is_ok() {
            confirmed.push(commit);
        } else {
            rejected.push(commit);
        }
    }
    (confirmed, rejected)
}

impl OffsetCommitter for StreamConsumer<RebalanceContext> {
    fn commit_batch(&self, commits: &[CommitOffset], mode: CommitMode) -> Result<()> {
        let tpl = to_partition_list(commits)?;
        self.commit(&tpl, mode).map_err(CdcError::from)
    }
}

impl OffsetCommitter for BaseConsumer<RebalanceContext> {
    fn commit_batch(&self, commits: &[CommitOffset], mode: CommitMode) -> Result<()> {
        let tpl = to_partition_list(commits)?;
        self.commit(&tpl, mode).map_err(CdcError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::services::cdc::registry::HandlerFailure;
    use rdkafka::error::{KafkaError, RDKafkaErrorCode};

    const T: &str = "dbserver1.public.users";

    fn ok() -> DispatchOutcome {
        DispatchOutcome::Success { invoked: 1 }
    }

    fn failed() -> DispatchOutcome {
        DispatchOutcome::PartialFailure {
            succeeded: 0,
            failures: vec![HandlerFailure {
                handler: "sink".to_string(),
                error: HandlerError::failed("down"),
            }],
        }
    }

    fn coordinator(policy: FailurePolicy, max_retries: u32) -> CommitCoordinator {
        CommitCoordinator::new(CoordinatorConfig {
            failure_policy: policy,
            max_retries,
            commit_batch_size: 100,
            commit_interval: Duration::from_secs(3600),
        })
    }

    #[derive(Default)]
    struct RecordingCommitter {
        commits: Mutex<Vec<CommitOffset>>,
        fail: bool,
    }

    impl OffsetCommitter for RecordingCommitter {
        fn commit_batch(&self, commits: &[CommitOffset], _mode: CommitMode) -> Result<()> {
            if self.fail {
                return Err(CdcError::TransientBroker("coordinator moved".into()));
            }
            self.commits.lock().extend_from_slice(commits);
            Ok(())
        }
    }

    #[test]
    fn test_commit_waits_for_lower_offsets() {
        let mut c = coordinator(FailurePolicy::Skip, 3);
        let p0 = c.assign(T, 0, Some(5));

        assert!(c.begin(&p0, 5));
        assert!(c.begin(&p0, 6));
        assert_eq!(c.record_processed(&p0, 6, &ok()), Resolution::Resolved);

        // 5 is still in flight: nothing may be committed
        assert!(c.pending_commits().is_empty());

        assert_eq!(c.record_processed(&p0, 5, &ok()), Resolution::Resolved);
        assert_eq!(
            c.pending_commits(),
            vec![CommitOffset {
                topic: T.to_string(),
                partition: 0,
                offset: 7
            }]
        );
    }

    #[test]
    fn test_offset_gaps_are_contiguous_in_read_order() {
        let mut c = coordinator(FailurePolicy::Skip, 3);
        let p0 = c.assign(T, 0, None);

        for offset in [10, 12, 15] {
            assert!(c.begin(&p0, offset));
            c.record_processed(&p0, offset, &ok());
        }

        assert_eq!(c.pending_commits()[0].offset, 16);
        assert_eq!(c.cursor(T, 0).unwrap().last_processed_offset, 15);
    }

    #[test]
    fn test_redelivered_offsets_are_rejected() {
        let mut c = coordinator(FailurePolicy::Skip, 3);
        let p0 = c.assign(T, 0, Some(42));

        assert!(!c.begin(&p0, 41));
        assert!(c.begin(&p0, 42));
        assert!(!c.begin(&p0, 42));
    }

    #[test]
    fn test_retry_then_skip() {
        let mut c = coordinator(FailurePolicy::Skip, 2);
        let p0 = c.assign(T, 0, None);
        assert!(c.begin(&p0, 0));

        assert_eq!(
            c.record_processed(&p0, 0, &failed()),
            Resolution::Retry { attempt: 1 }
        );
        assert_eq!(
            c.record_processed(&p0, 0, &failed()),
            Resolution::Retry { attempt: 2 }
        );
        assert!(c.pending_commits().is_empty());

        assert_eq!(c.record_processed(&p0, 0, &failed()), Resolution::Skipped);
        assert_eq!(c.pending_commits()[0].offset, 1);
    }

    #[test]
    fn test_retry_then_success() {
        let mut c = coordinator(FailurePolicy::Halt, 2);
        let p0 = c.assign(T, 0, None);
        c.begin(&p0, 3);

        assert_eq!(
            c.record_processed(&p0, 3, &failed()),
            Resolution::Retry { attempt: 1 }
        );
        assert_eq!(c.record_processed(&p0, 3, &ok()), Resolution::Resolved);
        assert_eq!(c.pending_commits()[0].offset, 4);
    }

    #[test]
    fn test_halt_withholds_failed_and_higher_offsets() {
        let mut c = coordinator(FailurePolicy::Halt, 0);
        let p0 = c.assign(T, 0, None);

        c.begin(&p0, 0);
        c.record_processed(&p0, 0, &ok());
        c.begin(&p0, 1);
        assert_eq!(c.record_processed(&p0, 1, &failed()), Resolution::Halted);

        assert!(c.is_halted(T, 0));
        assert!(!c.begin(&p0, 2));
        assert_eq!(c.pending_commits()[0].offset, 1);
    }

    #[test]
    fn test_skipped_messages_advance_the_partition() {
        let mut c = coordinator(FailurePolicy::Skip, 3);
        let p1 = c.assign(T, 1, None);

        c.begin(&p1, 0);
        c.record_skipped(&p1, 0);
        c.begin(&p1, 1);
        c.record_processed(&p1, 1, &ok());

        assert_eq!(c.pending_commits()[0].offset, 2);
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut c = coordinator(FailurePolicy::Skip, 3);
        let p0 = c.assign(T, 0, None);
        let p1 = c.assign(T, 1, None);

        c.begin(&p0, 0);
        c.begin(&p1, 0);
        c.record_processed(&p1, 0, &ok());

        let commits = c.pending_commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].partition, 1);
    }

    #[test]
    fn test_stale_lease_cannot_touch_reassigned_partition() {
        let mut c = coordinator(FailurePolicy::Halt, 0);
        let old = c.assign(T, 0, None);
        assert!(c.begin(&old, 0));

        assert!(c.revoke(T, 0).is_none());
        let new = c.assign(T, 0, None);
        assert_ne!(old.generation, new.generation);
        assert_eq!(c.lease(T, 0), Some(new.clone()));
        assert!(c.begin(&new, 0));

        // The outlived task finishes offset 0: ignored, and not a halt
        assert_eq!(c.record_processed(&old, 0, &failed()), Resolution::Revoked);
        assert_eq!(c.record_processed(&old, 0, &ok()), Resolution::Revoked);
        assert!(!c.begin(&old, 1));
        c.record_skipped(&old, 0);
        assert!(!c.is_halted(T, 0));
        assert_eq!(c.cursor(T, 0).unwrap().last_processed_offset, -1);
        assert!(c.pending_commits().is_empty());

        assert_eq!(c.record_processed(&new, 0, &ok()), Resolution::Resolved);
        assert_eq!(c.pending_commits()[0].offset, 1);
    }

    #[test]
    fn test_outcome_for_unassigned_partition_is_revoked() {
        let mut c = coordinator(FailurePolicy::Halt, 0);
        let p0 = c.assign(T, 0, None);
        c.begin(&p0, 0);
        c.revoke(T, 0);

        assert_eq!(c.record_processed(&p0, 0, &failed()), Resolution::Revoked);
        assert!(c.lease(T, 0).is_none());
    }

    #[test]
    fn test_commit_pending_marks_committed_only_on_success() {
        let c = Mutex::new(coordinator(FailurePolicy::Skip, 3));
        {
            let mut c = c.lock();
            let p0 = c.assign(T, 0, None);
            c.begin(&p0, 0);
            c.record_processed(&p0, 0, &ok());
        }

        let broken = RecordingCommitter {
            fail: true,
            ..Default::default()
        };
        assert!(commit_pending(&c, &broken, CommitMode::Async).is_err());
        assert_eq!(c.lock().pending_commits().len(), 1);

        let committer = RecordingCommitter::default();
        assert_eq!(commit_pending(&c, &committer, CommitMode::Sync).unwrap(), 1);
        assert_eq!(committer.commits.lock()[0].offset, 1);
        assert_eq!(c.lock().cursor(T, 0).unwrap().last_committed_offset, 1);
        assert!(c.lock().pending_commits().is_empty());

        // Nothing new resolved: flushing again commits nothing
        assert_eq!(commit_pending(&c, &committer, CommitMode::Sync).unwrap(), 0);
        assert_eq!(committer.commits.lock().len(), 1);
    }

    #[test]
    fn test_final_commit_covers_async_commit_rejected_later() {
        let c = Mutex::new(coordinator(FailurePolicy::Skip, 3));
        {
            let mut c = c.lock();
            let p0 = c.assign(T, 0, None);
            c.begin(&p0, 0);
            c.record_processed(&p0, 0, &ok());
        }

        // Accepted for submission, not yet confirmed by the broker
        let committer = RecordingCommitter::default();
        assert_eq!(commit_pending(&c, &committer, CommitMode::Async).unwrap(), 1);
        assert!(c.lock().pending_commits().is_empty());

        let closing = RecordingCommitter::default();
        assert_eq!(commit_final(&c, &closing).unwrap(), 1);
        assert_eq!(closing.commits.lock()[0].offset, 1);
    }

    #[test]
    fn test_rejected_async_commit_is_offered_again() {
        let c = Mutex::new(coordinator(FailurePolicy::Skip, 3));
        {
            let mut c = c.lock();
            let p0 = c.assign(T, 0, Some(4));
            for offset in [4, 5] {
                c.begin(&p0, offset);
                c.record_processed(&p0, offset, &ok());
            }
        }

        let committer = RecordingCommitter::default();
        commit_pending(&c, &committer, CommitMode::Async).unwrap();
        let submitted = committer.commits.lock().clone();
        assert_eq!(submitted[0].offset, 6);

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(T, 0, Offset::Offset(6)).unwrap();
        let rejected_result = Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress));
        let (confirmed, rejected) = split_commit_result(&rejected_result, &tpl);
        assert!(confirmed.is_empty());
        assert_eq!(rejected, submitted);

        c.lock().commit_failed(&rejected);
        assert_eq!(c.lock().cursor(T, 0).unwrap().last_committed_offset, 4);
        assert_eq!(c.lock().pending_commits()[0].offset, 6);

        let (confirmed, rejected) = split_commit_result(&Ok(()), &tpl);
        assert!(rejected.is_empty());
        c.lock().commit_acknowledged(&confirmed);
        c.lock().mark_committed(&confirmed);
        // A late rejection of an older submission keeps the newer position
        c.lock().commit_failed(&[CommitOffset {
            topic: T.to_string(),
            partition: 0,
            offset: 5,
        }]);
        assert!(c.lock().pending_commits().is_empty());
    }

    #[test]
    fn test_should_flush_by_count_and_interval() {
        let mut c = CommitCoordinator::new(CoordinatorConfig {
            commit_batch_size: 2,
            commit_interval: Duration::from_secs(3600),
            ..Default::default()
        });
        let p0 = c.assign(T, 0, None);

        c.begin(&p0, 0);
        c.record_processed(&p0, 0, &ok());
        assert!(!c.should_flush());
        c.begin(&p0, 1);
        c.record_processed(&p0, 1, &ok());
        assert!(c.should_flush());

        let mut timed = CommitCoordinator::new(CoordinatorConfig {
            commit_batch_size: 1000,
            commit_interval: Duration::ZERO,
            ..Default::default()
        });
        let t0 = timed.assign(T, 0, None);
        assert!(!timed.should_flush());
        timed.begin(&t0, 0);
        timed.record_processed(&t0, 0, &ok());
        assert!(timed.should_flush());
    }

    #[test]
    fn test_revoke_returns_final_commit_and_drops_cursor() {
        let mut c = coordinator(FailurePolicy::Skip, 3);
        let p0 = c.assign(T, 0, Some(10));
        c.begin(&p0, 10);
        c.record_processed(&p0, 10, &ok());
        c.begin(&p0, 11);

        // Already submitted positions are still part of the final commit
        c.mark_committed(&c.pending_commits());
        let last = c.revoke(T, 0).unwrap();
        assert_eq!(last.offset, 11);
        assert!(c.cursor(T, 0).is_none());
        assert!(c.revoke(T, 0).is_none());
    }

    #[test]
    fn test_failure_policy_parsing() {
        assert_eq!("skip".parse::<FailurePolicy>().unwrap(), FailurePolicy::Skip);
        assert_eq!(" HALT ".parse::<FailurePolicy>().unwrap(), FailurePolicy::Halt);
        assert!("retry".parse::<FailurePolicy>().is_err());
    }
}
