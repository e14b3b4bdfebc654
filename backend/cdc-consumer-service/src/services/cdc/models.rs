use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::classifier::OperationKind;

/// One row image (`before` / `after`) as captured by the connector.
pub type Record = Map<String, Value>;

/// Provenance of a change: which database object produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Database name (`source.db`)
    pub database: String,

    /// Schema name; empty for connectors without schemas (MySQL)
    pub schema: String,

    /// Table name
    pub table: String,

    /// Debezium connector version (`source.version`)
    pub connector_version: String,

    /// Connector type (e.g., "postgresql")
    pub connector: Option<String>,

    /// Logical name of the database server (topic prefix)
    pub server_name: Option<String>,
}

impl SourceInfo {
    /// `schema.table`, or just `table` when the connector has no schemas.
    pub fn qualified_table(&self) -> String {
        if self.schema.is_empty() {
            self.table.clone()
        } else {
            format!("{}.{}", self.schema, self.table)
        }
    }
}

/// A decoded change envelope. Immutable once produced by the decoder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEnvelope {
    /// State before the change (null for Insert/Snapshot, populated for Update/Delete)
    pub before: Option<Record>,

    /// State after the change (populated for Insert/Update/Snapshot, null for Delete)
    pub after: Option<Record>,

    /// Source metadata
    pub source: SourceInfo,

    /// Raw connector operation code (`op`)
    pub operation: String,

    /// Event time in milliseconds since epoch (`ts_ms`)
    pub event_time_ms: i64,
}

impl ChangeEnvelope {
    /// Get the event time as DateTime, `None` if `ts_ms` is out of range
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.event_time_ms)
    }

    pub fn qualified_table(&self) -> String {
        self.source.qualified_table()
    }

    /// The row image that describes the change: `before` for deletes, `after` otherwise.
    pub fn row(&self, kind: OperationKind) -> Option<&Record> {
        match kind {
            OperationKind::Delete => self.before.as_ref(),
            _ => self.after.as_ref().or(self.before.as_ref()),
        }
    }
}

/// A classified change, positioned in its partition. This is what handlers receive.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub kind: OperationKind,
    pub envelope: ChangeEnvelope,
}
