mod classifier;
mod coordinator;
mod decoder;
mod handlers;
mod lifecycle;
mod models;
mod partition;
mod reader;
mod rebalance;
mod registry;

pub use classifier::{classify, OperationKind};
pub use coordinator::{
    commit_final, commit_pending, CommitCoordinator, CommitOffset, CoordinatorConfig,
    FailurePolicy, OffsetCommitter, PartitionCursor, PartitionLease, Resolution, TopicPartition,
};
pub use decoder::decode;
pub use handlers::{ChangeLogRecord, LogHandler};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use models::{ChangeEnvelope, ChangeEvent, Record, SourceInfo};
pub use partition::{
    InboundMessage, PartitionExit, PartitionSet, PartitionWorker, PipelineContext,
    PipelineSettings, RouteResult,
};
pub use reader::{CdcConsumer, ConsumerErrorState, TopicPattern};
pub use rebalance::RebalanceContext;
pub use registry::{
    ChangeHandler, DispatchOutcome, DispatchRegistry, FnHandler, HandlerFailure, HandlerScope,
};
