//! Result, settings and error types for search and answer synthesis.

use crate::document::TagCollection;
use crate::embedding::EmbeddingClientError;
use crate::error::ValidationError;
use crate::index_name::DEFAULT_INDEX;
use crate::vector::VectorIndexError;
use serde::Serialize;
use thiserror::Error;

/// Marker an answer generator returns when the supplied facts do not answer the question.
pub const NO_ANSWER: &str = "INFO NOT FOUND";

/// Tunables shared by the search client and the answer synthesizer.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    /// Index used when a request names none.
    pub default_index: String,
    /// Result count used when a request names none.
    pub default_limit: usize,
    /// Upper bound on the result count.
    pub max_limit: usize,
    /// Results scoring below this are dropped.
    pub min_relevance: f32,
    /// Passages scoring below this are not used for answers.
    pub answer_min_relevance: f32,
    /// Maximum number of passages cited by an answer.
    pub answer_max_citations: usize,
    /// Generation model; answers are extractive when absent.
    pub answer_model: Option<String>,
    /// Characters of passage text kept in answer citations.
    pub excerpt_chars: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_index: DEFAULT_INDEX.to_string(),
            default_limit: 10,
            max_limit: 50,
            min_relevance: 0.0,
            answer_min_relevance: 0.5,
            answer_max_citations: 5,
            answer_model: None,
            excerpt_chars: 300,
        }
    }
}

/// One retrieved partition with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    /// Vector record identifier.
    pub record_id: String,
    /// Owning document.
    pub document_id: String,
    /// Source file within the document.
    pub file_name: String,
    /// 0-based partition ordinal within the document.
    pub partition: usize,
    /// Cosine similarity to the query.
    pub score: f32,
    /// Partition text (an excerpt when attached to an answer).
    pub text: String,
    /// User and reserved tags of the partition.
    pub tags: TagCollection,
}

/// Outcome of [`crate::search::SearchClient::search`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    /// Query text as received (trimmed).
    pub query: String,
    /// Normalized index that was searched.
    pub index: String,
    /// Matches ordered by descending score, ties broken by source position.
    pub results: Vec<Citation>,
}

impl SearchResult {
    /// Whether nothing matched.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Outcome of [`crate::search::AnswerSynthesizer::ask`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MemoryAnswer {
    /// The memory held enough relevant facts.
    Answered {
        /// Question as received (trimmed).
        question: String,
        /// Answer text.
        text: String,
        /// Passages the answer is grounded on, most relevant first.
        citations: Vec<Citation>,
    },
    /// No relevant facts were found; a normal outcome rather than an error.
    NoAnswer {
        /// Question as received (trimmed).
        question: String,
    },
}

impl MemoryAnswer {
    /// Question the answer responds to.
    pub fn question(&self) -> &str {
        match self {
            Self::Answered { question, .. } | Self::NoAnswer { question } => question,
        }
    }

    /// Whether this is the "no answer found" outcome.
    pub fn is_no_answer(&self) -> bool {
        matches!(self, Self::NoAnswer { .. })
    }

    /// Answer text, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Answered { text, .. } => Some(text),
            Self::NoAnswer { .. } => None,
        }
    }

    /// Citations backing the answer; empty for no-answer.
    pub fn citations(&self) -> &[Citation] {
        match self {
            Self::Answered { citations, .. } => citations,
            Self::NoAnswer { .. } => &[],
        }
    }
}

/// Errors surfaced by search and answer operations.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Request was rejected before retrieval.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Query could not be embedded.
    #[error("Failed to embed query: {0}")]
    Embedding(#[from] EmbeddingClientError),
    /// Query embedding does not match the embedding client's dimension.
    #[error("Query embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        /// Dimension declared by the embedding client.
        expected: usize,
        /// Dimension actually returned.
        actual: usize,
    },
    /// Embedding client returned no vector.
    #[error("Embedding provider returned no vector for the query")]
    EmptyEmbedding,
    /// Vector index query failed.
    #[error("Vector index query failed: {0}")]
    Index(#[from] VectorIndexError),
}
