use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::classifier::OperationKind;
use super::models::ChangeEvent;
use super::registry::ChangeHandler;
use crate::error::HandlerError;

/// Structured view of a change, as emitted by [`LogHandler`].
///
/// Row images follow the operation: inserts and snapshots carry only `after`,
/// deletes only `before`, updates both. Unknown operations carry whatever the
/// connector sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeLogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub table: String,
    pub operation: OperationKind,
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

impl ChangeLogRecord {
    pub fn from_event(event: &ChangeEvent) -> Self {
        let envelope = &event.envelope;
        let before = envelope.before.clone().map(Value::Object);
        let after = envelope.after.clone().map(Value::Object);

        let (before, after) = match event.kind {
            OperationKind::Insert | OperationKind::Snapshot => (None, after),
            OperationKind::Delete => (before, None),
            OperationKind::Update | OperationKind::Unknown => (before, after),
        };

        Self {
            topic: event.topic.clone(),
            partition: event.partition,
            offset: event.offset,
            table: envelope.qualified_table(),
            operation: event.kind,
            timestamp: envelope.timestamp().map(|ts| ts.to_rfc3339()),
            before,
            after,
        }
    }
}

/// The reference deployment's handler: one structured log line per change.
#[derive(Debug, Default, Clone)]
pub struct LogHandler;

impl LogHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChangeHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        let record = ChangeLogRecord::from_event(event);
        let timestamp = record.timestamp.as_deref().unwrap_or("invalid");

        macro_rules! emit {
            ($($images:tt)*) => {
                info!(
                    target: "cdc::changes",
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    table = %record.table,
                    operation = %record.operation,
                    timestamp,
                    $($images)*
                    "Change event"
                )
            };
        }

        match (&record.before, &record.after) {
            (Some(before), Some(after)) => emit!(before = %before, after = %after,),
            (Some(before), None) => emit!(before = %before,),
            (None, Some(after)) => emit!(after = %after,),
            (None, None) => emit!(),
        }

        Ok(())
    }
}
