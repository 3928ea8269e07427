//! Document and tag model consumed by the ingestion pipeline.
//!
//! The pipeline never mutates a [`Document`]; it is built once from a
//! [`DocumentUploadRequest`], persisted with the run's `Scheduled` event so that interrupted
//! runs can be resumed, and handed read-only to every step.

use crate::error::ValidationError;
use crate::index_name::validate_document_id;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use uuid::Uuid;

/// Prefix reserved for tags written by the pipeline itself.
pub const RESERVED_TAG_PREFIX: &str = "__";
/// Reserved tag carrying the owning document identifier.
pub const TAG_DOCUMENT_ID: &str = "__document_id";
/// Reserved tag carrying the source file name.
pub const TAG_FILE_NAME: &str = "__file_name";
/// Reserved tag carrying the source file MIME type.
pub const TAG_FILE_TYPE: &str = "__file_type";

/// Multi-valued tag map (`key -> values`) attached to documents and indexed records.
///
/// Keys are trimmed and lower-cased; values are trimmed and de-duplicated while preserving
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagCollection(BTreeMap<String, Vec<String>>);

impl TagCollection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `key:value` pair, ignoring blank values and duplicates.
    pub fn add(&mut self, key: &str, value: &str) -> &mut Self {
        let key = normalize_tag_key(key);
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return self;
        }
        let values = self.0.entry(key).or_default();
        if !values.iter().any(|existing| existing == value) {
            values.push(value.to_string());
        }
        self
    }

    /// Builder-style variant of [`TagCollection::add`].
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.add(key, value);
        self
    }

    /// Values stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(&normalize_tag_key(key)).map(Vec::as_slice)
    }

    /// Whether `key` holds `value`.
    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.get(key)
            .is_some_and(|values| values.iter().any(|existing| existing == value.trim()))
    }

    /// Iterate over `(key, value)` pairs in key order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(key, values)| {
            values
                .iter()
                .map(move |value| (key.as_str(), value.as_str()))
        })
    }

    /// Whether the collection holds no tags.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Flatten into `key:value` strings, the representation stored in vector payloads.
    pub fn to_flat(&self) -> Vec<String> {
        self.pairs()
            .map(|(key, value)| format!("{key}:{value}"))
            .collect()
    }

    /// Rebuild a collection from `key:value` strings, skipping malformed entries.
    pub fn from_flat<'a>(entries: impl IntoIterator<Item = &'a str>) -> Self {
        let mut tags = Self::new();
        for entry in entries {
            if let Some((key, value)) = entry.split_once(':') {
                tags.add(key, value);
            }
        }
        tags
    }

    /// Merge all pairs from `other` into `self`.
    pub fn extend(&mut self, other: &TagCollection) {
        for (key, value) in other.pairs() {
            self.add(key, value);
        }
    }

    /// Reject user-supplied tags that use the reserved prefix or a `:` inside the key.
    pub fn validate_user_tags(&self) -> Result<(), ValidationError> {
        for key in self.0.keys() {
            if key.starts_with(RESERVED_TAG_PREFIX) {
                return Err(ValidationError::InvalidTag(format!(
                    "'{key}' uses the reserved '{RESERVED_TAG_PREFIX}' prefix"
                )));
            }
            if key.contains(':') {
                return Err(ValidationError::InvalidTag(format!(
                    "'{key}' must not contain ':'"
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn normalize_tag_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// File attached to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    /// File name used for citations and MIME detection.
    pub name: String,
    /// Optional MIME type; guessed from the extension when absent.
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Raw file contents.
    #[serde(with = "hex_bytes")]
    pub content: Vec<u8>,
}

impl FileReference {
    /// Build a file reference from in-memory bytes.
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            mime_type: None,
            content: content.into(),
        }
    }

    /// Attach an explicit MIME type.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Read a file from disk.
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let content = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(name, content))
    }

    /// Declared MIME type, falling back to a guess based on the file extension.
    pub fn effective_mime_type(&self) -> Option<String> {
        self.mime_type
            .clone()
            .or_else(|| guess_mime_type(&self.name).map(str::to_string))
    }
}

fn guess_mime_type(name: &str) -> Option<&'static str> {
    let extension = Path::new(name)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    match extension.as_str() {
        "txt" | "text" | "log" => Some("text/plain"),
        "md" | "markdown" => Some("text/markdown"),
        "json" => Some("application/json"),
        "csv" => Some("text/csv"),
        "htm" | "html" => Some("text/html"),
        "pdf" => Some("application/pdf"),
        "docx" => Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
        _ => None,
    }
}

/// Immutable document handed to pipeline steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Document identifier, unique within an index.
    pub id: String,
    /// User tags propagated onto every indexed record.
    pub tags: TagCollection,
    /// Files making up the document.
    pub files: Vec<FileReference>,
}

/// Import request accepted by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct DocumentUploadRequest {
    /// Target index; the configured default is used when absent.
    pub index: Option<String>,
    /// Document identifier; a UUID is generated when absent.
    pub document_id: Option<String>,
    /// Tags attached to the document.
    pub tags: TagCollection,
    /// Files to ingest.
    pub files: Vec<FileReference>,
    /// Explicit step list; the configured default pipeline is used when absent.
    pub steps: Option<Vec<String>>,
}

impl DocumentUploadRequest {
    /// Start an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Target a specific index.
    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    /// Use a caller-chosen document identifier.
    pub fn with_document_id(mut self, id: impl Into<String>) -> Self {
        self.document_id = Some(id.into());
        self
    }

    /// Attach a tag.
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.add(key, value);
        self
    }

    /// Attach a file.
    pub fn with_file(mut self, file: FileReference) -> Self {
        self.files.push(file);
        self
    }

    /// Override the pipeline steps.
    pub fn with_steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps = Some(steps.into_iter().map(Into::into).collect());
        self
    }

    /// Validate the request and split it into the document and the optional step list.
    pub(crate) fn into_document(self) -> Result<(Document, Option<Vec<String>>), ValidationError> {
        let id = self
            .document_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        validate_document_id(&id)?;
        self.tags.validate_user_tags()?;
        if self.files.is_empty() {
            return Err(ValidationError::EmptyDocument(id));
        }

        let mut seen = BTreeSet::new();
        for file in &self.files {
            if file.name.trim().is_empty() || !seen.insert(file.name.as_str()) {
                return Err(ValidationError::InvalidFile {
                    document_id: id,
                    reason: format!("file name '{}' is blank or duplicated", file.name),
                });
            }
        }

        Ok((
            Document {
                id,
                tags: self.tags,
                files: self.files,
            },
            self.steps,
        ))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}
