//! Vector index abstraction shared by the `index` step and the search client.
//!
//! Records are grouped by index name. Each record carries the partition text and a flattened
//! tag set (user tags plus the reserved `__document_id`, `__file_name` and `__file_type` tags)
//! so that [`MemoryFilter`]s can be evaluated both by the backend and, again, by the caller.

mod memory;

pub use memory::InMemoryVectorIndex;

use crate::document::TagCollection;
use crate::qdrant::QdrantError;
use crate::search::MemoryFilter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by vector index backends.
#[derive(Debug, Error)]
pub enum VectorIndexError {
    /// Qdrant request failed.
    #[error(transparent)]
    Qdrant(#[from] QdrantError),
    /// Vector does not match the dimension the index was created with.
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension of the index.
        expected: usize,
        /// Dimension of the rejected vector.
        actual: usize,
    },
}

impl VectorIndexError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Qdrant(QdrantError::UnexpectedStatus { status, .. }) => {
                status.is_server_error() || status.as_u16() == 429
            }
            Self::Qdrant(QdrantError::InvalidUrl(_)) => false,
            Self::Qdrant(QdrantError::Http(_)) => true,
            Self::DimensionMismatch { .. } => false,
        }
    }
}

/// One indexed partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Deterministic record identifier (see [`record_id`]).
    pub id: String,
    /// Owning document.
    pub document_id: String,
    /// Source file name.
    pub file_name: String,
    /// 0-based partition ordinal within the document.
    pub partition: usize,
    /// Partition text.
    pub text: String,
    /// SHA-256 of the text.
    pub chunk_hash: String,
    /// User and reserved tags.
    pub tags: TagCollection,
    /// Embedding vector; empty when returned from a query.
    #[serde(default)]
    pub vector: Vec<f32>,
}

/// Record returned by a similarity query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    /// Matching record (without its vector).
    pub record: VectorRecord,
    /// Cosine similarity to the query vector.
    pub score: f32,
}

/// Storage backend for embeddings and filterable metadata.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace records by identifier.
    async fn upsert(&self, index: &str, records: Vec<VectorRecord>) -> Result<(), VectorIndexError>;

    /// Return up to `limit` records matching `filter`, most similar first.
    async fn query(
        &self,
        index: &str,
        vector: &[f32],
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>, VectorIndexError>;

    /// Remove every record belonging to `document_id`; unknown indexes are a no-op.
    async fn delete_document(&self, index: &str, document_id: &str) -> Result<(), VectorIndexError>;
}

/// Deterministic UUIDv5 for a partition, stable across re-runs of the same import.
pub fn record_id(index: &str, document_id: &str, file_name: &str, partition: usize) -> String {
    let name = format!("{index}/{document_id}/{file_name}/{partition}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

/// Cosine similarity; zero for mismatched lengths or zero vectors.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
