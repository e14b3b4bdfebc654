//! Strict decoding of connector change envelopes.
//!
//! Accepts the schema-wrapped document (`{"schema": ..., "payload": {...}}`)
//! and the schemaless form emitted when `value.converter.schemas.enable=false`,
//! where the payload object sits at the top level.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::models::{ChangeEnvelope, Record, SourceInfo};
use crate::error::DecodeError;

#[derive(Debug, Deserialize)]
struct RawSource {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    connector: Option<String>,
    #[serde(default)]
    name: Option<String>,
    db: String,
    #[serde(default)]
    schema: Option<String>,
    table: String,
}

impl From<RawSource> for SourceInfo {
    fn from(raw: RawSource) -> Self {
        SourceInfo {
            database: raw.db,
            schema: raw.schema.unwrap_or_default(),
            table: raw.table,
            connector_version: raw.version.unwrap_or_default(),
            connector: raw.connector,
            server_name: raw.name,
        }
    }
}

/// Parse a raw message value into a [`ChangeEnvelope`].
///
/// Pure: no logging, no size limit. `source`, `op` and `ts_ms` are required;
/// a `null` counts as missing.
pub fn decode(raw: &[u8]) -> Result<ChangeEnvelope, DecodeError> {
    let doc: Value =
        serde_json::from_slice(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let root = doc.as_object().ok_or(DecodeError::NotAnObject)?;
    let payload = locate_payload(root)?;

    let source = required(payload, "source")?;
    let source: RawSource =
        serde_json::from_value(source.clone()).map_err(|e| DecodeError::WrongType {
            field: "source",
            reason: e.to_string(),
        })?;

    let operation = match required(payload, "op")? {
        Value::String(op) => op.clone(),
        other => return Err(wrong_type("op", "a string", other)),
    };

    let ts = required(payload, "ts_ms")?;
    let event_time_ms = ts
        .as_i64()
        .ok_or_else(|| wrong_type("ts_ms", "an integer", ts))?;

    Ok(ChangeEnvelope {
        before: row_image(payload, "before")?,
        after: row_image(payload, "after")?,
        source: source.into(),
        operation,
        event_time_ms,
    })
}

fn locate_payload(root: &Map<String, Value>) -> Result<&Map<String, Value>, DecodeError> {
    match root.get("payload") {
        Some(Value::Object(payload)) => Ok(payload),
        Some(Value::Null) | None if root.contains_key("op") => Ok(root),
        Some(Value::Null) | None => Err(DecodeError::MissingField("payload")),
        Some(other) => Err(wrong_type("payload", "an object", other)),
    }
}

fn required<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value, DecodeError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(DecodeError::MissingField(field)),
        Some(value) => Ok(value),
    }
}

fn row_image(obj: &Map<String, Value>, field: &'static str) -> Result<Option<Record>, DecodeError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(row)) => Ok(Some(row.clone())),
        Some(other) => Err(wrong_type(field, "an object or null", other)),
    }
}

fn wrong_type(field: &'static str, expected: &str, found: &Value) -> DecodeError {
    let found = match found {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    };
    DecodeError::WrongType {
        field,
        reason: format!("expected {}, found {}", expected, found),
    }
}
