//! Index name normalization.
//!
//! Every lookup and write goes through [`normalize_index_name`] first: the name is trimmed,
//! lower-cased, replaced by the configured default when blank, and finally checked against the
//! allowed character set. Invalid names are rejected instead of being coerced.

use crate::error::ValidationError;

/// Index used when neither the request nor the configuration names one.
pub const DEFAULT_INDEX: &str = "default";

/// Upper bound on the normalized index name length.
pub const MAX_INDEX_NAME_LEN: usize = 64;

/// Normalize an optional index name, substituting `default_index` when it is absent or blank.
pub fn normalize_index_name(
    name: Option<&str>,
    default_index: &str,
) -> Result<String, ValidationError> {
    let candidate = name
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default_index.trim());
    let normalized = candidate.to_lowercase();
    validate_index_name(&normalized)?;
    Ok(normalized)
}

fn validate_index_name(name: &str) -> Result<(), ValidationError> {
    let reject = |reason| {
        Err(ValidationError::InvalidIndexName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return reject("name is empty");
    }
    if name.len() > MAX_INDEX_NAME_LEN {
        return reject("name is longer than 64 characters");
    }
    if !name
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_alphanumeric())
    {
        return reject("name must start with a letter or digit");
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')))
    {
        tracing::debug!(name, illegal = %bad, "Rejecting index name");
        return reject("only a-z, 0-9, '-', '_' and '.' are allowed");
    }
    Ok(())
}

/// Validate a document identifier using the same character rules as index names, but
/// preserving case.
pub(crate) fn validate_document_id(id: &str) -> Result<(), ValidationError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidDocumentId(id.to_string()))
    }
}
