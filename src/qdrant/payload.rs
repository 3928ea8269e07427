//! Conversion between [`VectorRecord`]s and Qdrant payloads.

use crate::document::TagCollection;
use crate::vector::VectorRecord;
use serde_json::{Map, Value};

/// Build the payload object stored alongside each indexed partition.
pub(crate) fn build_payload(record: &VectorRecord, timestamp_rfc3339: &str) -> Value {
    let mut payload = Map::new();
    payload.insert(
        "document_id".into(),
        Value::String(record.document_id.clone()),
    );
    payload.insert("file_name".into(), Value::String(record.file_name.clone()));
    payload.insert("partition".into(), Value::from(record.partition as u64));
    payload.insert("text".into(), Value::String(record.text.clone()));
    payload.insert(
        "chunk_hash".into(),
        Value::String(record.chunk_hash.clone()),
    );
    payload.insert(
        "timestamp".into(),
        Value::String(timestamp_rfc3339.to_string()),
    );
    payload.insert(
        "tags".into(),
        Value::Array(
            record
                .tags
                .to_flat()
                .into_iter()
                .map(Value::String)
                .collect(),
        ),
    );
    Value::Object(payload)
}

/// Rebuild a record (without its vector) from a stored payload.
///
/// Returns `None` when a required field is missing, e.g. for points written by other tools.
pub(crate) fn record_from_payload(id: String, payload: &Map<String, Value>) -> Option<VectorRecord> {
    let text_field = |name: &str| payload.get(name).and_then(Value::as_str).map(str::to_string);
    let tags = match payload.get("tags") {
        Some(Value::Array(values)) => TagCollection::from_flat(values.iter().filter_map(Value::as_str)),
        _ => TagCollection::new(),
    };

    Some(VectorRecord {
        id,
        document_id: text_field("document_id")?,
        file_name: text_field("file_name")?,
        partition: usize::try_from(payload.get("partition")?.as_u64()?).ok()?,
        text: text_field("text")?,
        chunk_hash: text_field("chunk_hash").unwrap_or_default(),
        tags,
        vector: Vec::new(),
    })
}

/// Render a Qdrant point id (string, number or `{"uuid": ..}`) as a string.
pub(crate) fn stringify_point_id(id: Value) -> String {
    match id {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        Value::Object(map) => map
            .get("uuid")
            .map(|value| match value {
                Value::String(uuid) => uuid.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| Value::Object(map).to_string()),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
