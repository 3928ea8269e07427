//! Translation of [`MemoryFilter`]s into Qdrant filter payloads.
//!
//! Tags are stored as flattened `key:value` strings in the `tags` payload array, so every
//! constraint becomes a keyword match on that array.

use crate::search::{MemoryFilter, TagConstraint};
use serde_json::{Value, json};

/// Compose the Qdrant filter for a memory filter; `None` when it has no constraints.
pub fn build_tag_filter(filter: &MemoryFilter) -> Option<Value> {
    let must: Vec<Value> = filter
        .constraints()
        .iter()
        .map(|constraint| match constraint {
            TagConstraint::Equals { .. } => json!({
                "key": "tags",
                "match": { "value": constraint.flat_terms().remove(0) }
            }),
            TagConstraint::AnyOf { .. } => json!({
                "key": "tags",
                "match": { "any": constraint.flat_terms() }
            }),
        })
        .collect();

    if must.is_empty() {
        None
    } else {
        Some(json!({ "must": must }))
    }
}

/// Filter selecting every point of one document.
pub fn document_filter(document_id: &str) -> Value {
    json!({
        "must": [
            {
                "key": "document_id",
                "match": { "value": document_id }
            }
        ]
    })
}
