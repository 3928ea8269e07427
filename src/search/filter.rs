//! Tag filters applied to vector retrieval.

use crate::document::{TAG_DOCUMENT_ID, TAG_FILE_NAME, TAG_FILE_TYPE, TagCollection, normalize_tag_key};
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};

/// Single constraint over a tag key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TagConstraint {
    /// The key must hold exactly this value (among possibly others).
    Equals {
        /// Tag key.
        key: String,
        /// Required value.
        value: String,
    },
    /// The key must hold at least one of these values.
    AnyOf {
        /// Tag key.
        key: String,
        /// Accepted values.
        values: Vec<String>,
    },
}

impl TagConstraint {
    /// Tag key the constraint applies to.
    pub fn key(&self) -> &str {
        match self {
            Self::Equals { key, .. } | Self::AnyOf { key, .. } => key,
        }
    }

    /// Whether `tags` satisfy this constraint.
    pub fn matches(&self, tags: &TagCollection) -> bool {
        match self {
            Self::Equals { key, value } => tags.contains(key, value),
            Self::AnyOf { key, values } => values.iter().any(|value| tags.contains(key, value)),
        }
    }

    /// Flattened `key:value` terms accepted by the constraint.
    pub fn flat_terms(&self) -> Vec<String> {
        match self {
            Self::Equals { key, value } => vec![format!("{key}:{value}")],
            Self::AnyOf { key, values } => values
                .iter()
                .map(|value| format!("{key}:{value}"))
                .collect(),
        }
    }
}

/// Conjunction of tag constraints; a record matches only when every constraint holds.
///
/// The empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryFilter {
    constraints: Vec<TagConstraint>,
}

impl MemoryFilter {
    /// Filter without constraints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to hold `value`.
    pub fn by_tag(mut self, key: &str, value: &str) -> Self {
        self.constraints.push(TagConstraint::Equals {
            key: normalize_tag_key(key),
            value: value.trim().to_string(),
        });
        self
    }

    /// Require `key` to hold at least one of `values`.
    pub fn any_of<I, S>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.constraints.push(TagConstraint::AnyOf {
            key: normalize_tag_key(key),
            values: values
                .into_iter()
                .map(|value| value.as_ref().trim().to_string())
                .collect(),
        });
        self
    }

    /// Restrict results to one document.
    pub fn by_document(self, document_id: &str) -> Self {
        self.by_tag(TAG_DOCUMENT_ID, document_id)
    }

    /// Restrict results to one source file name.
    pub fn by_file_name(self, file_name: &str) -> Self {
        self.by_tag(TAG_FILE_NAME, file_name)
    }

    /// Restrict results to one MIME type.
    pub fn by_file_type(self, mime_type: &str) -> Self {
        self.by_tag(TAG_FILE_TYPE, mime_type)
    }

    /// Constraints in insertion order.
    pub fn constraints(&self) -> &[TagConstraint] {
        &self.constraints
    }

    /// Whether the filter has no constraints.
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Reject blank keys, blank values, keys containing `:` and empty value sets.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for constraint in &self.constraints {
            let key = constraint.key();
            if key.is_empty() || key.contains(':') {
                return Err(ValidationError::InvalidFilter(format!(
                    "tag key '{key}' is blank or contains ':'"
                )));
            }
            let values: &[String] = match constraint {
                TagConstraint::Equals { value, .. } => std::slice::from_ref(value),
                TagConstraint::AnyOf { values, .. } => values,
            };
            if values.is_empty() || values.iter().any(|value| value.is_empty()) {
                return Err(ValidationError::InvalidFilter(format!(
                    "constraint on '{key}' has no usable value"
                )));
            }
        }
        Ok(())
    }

    /// Whether `tags` satisfy every constraint.
    pub fn matches(&self, tags: &TagCollection) -> bool {
        self.constraints
            .iter()
            .all(|constraint| constraint.matches(tags))
    }
}
