//! Typed hand-off between consecutive pipeline steps.
//!
//! Artifacts are checkpointed into the status log after every completed step, so they must
//! stay serializable and deterministic for a given document.

use serde::{Deserialize, Serialize};

/// Output of a step, consumed by the next one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    /// Text extracted from the document's files.
    #[serde(default)]
    pub files: Vec<ExtractedFile>,
    /// Token-bounded partitions of the extracted text.
    #[serde(default)]
    pub partitions: Vec<Partition>,
    /// Identifiers of records written to the vector index.
    #[serde(default)]
    pub records: Vec<String>,
}

/// Plain text recovered from one document file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFile {
    /// Source file name.
    pub name: String,
    /// MIME type of the source file, when known.
    pub mime_type: Option<String>,
    /// Extracted text.
    pub text: String,
}

/// One chunk of extracted text, optionally carrying its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    /// Source file name.
    pub file_name: String,
    /// MIME type of the source file, when known.
    pub mime_type: Option<String>,
    /// 0-based position within the document.
    pub ordinal: usize,
    /// Partition text.
    pub text: String,
    /// SHA-256 of the text, used for de-duplication.
    pub chunk_hash: String,
    /// Embedding vector once the embedding step ran.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}
