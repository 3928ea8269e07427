//! Semantic search and grounded answers over indexed documents.

mod answer;
mod client;
mod filter;
mod types;

pub use answer::AnswerSynthesizer;
pub use client::SearchClient;
pub use filter::{MemoryFilter, TagConstraint};
pub use types::{Citation, MemoryAnswer, NO_ANSWER, SearchError, SearchResult, SearchSettings};

use crate::embedding::EmbeddingClient;
use crate::generation::AnswerGenerator;
use crate::vector::VectorIndex;
use async_trait::async_trait;
use std::sync::Arc;

/// Abstraction over retrieval used by outer surfaces.
#[async_trait]
pub trait SearchApi: Send + Sync {
    /// Return partitions similar to `query` that satisfy `filter`.
    async fn search(
        &self,
        index: Option<&str>,
        query: &str,
        filter: &MemoryFilter,
        limit: Option<usize>,
    ) -> Result<SearchResult, SearchError>;

    /// Answer `question` from stored facts, or report that no answer was found.
    async fn ask(
        &self,
        index: Option<&str>,
        question: &str,
        filter: &MemoryFilter,
    ) -> Result<MemoryAnswer, SearchError>;
}

/// Search client and answer synthesizer sharing one embedding provider and index.
pub struct SearchEngine {
    client: Arc<SearchClient>,
    answers: AnswerSynthesizer,
}

impl SearchEngine {
    /// Wire a search engine from its collaborators.
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        generator: Option<Arc<dyn AnswerGenerator>>,
        settings: SearchSettings,
    ) -> Self {
        let client = Arc::new(SearchClient::new(embedder, index, settings));
        let answers = AnswerSynthesizer::new(Arc::clone(&client), generator);
        Self { client, answers }
    }

    /// Underlying search client.
    pub fn client(&self) -> &SearchClient {
        &self.client
    }
}

#[async_trait]
impl SearchApi for SearchEngine {
    async fn search(
        &self,
        index: Option<&str>,
        query: &str,
        filter: &MemoryFilter,
        limit: Option<usize>,
    ) -> Result<SearchResult, SearchError> {
        self.client.search(index, query, filter, limit).await
    }

    async fn ask(
        &self,
        index: Option<&str>,
        question: &str,
        filter: &MemoryFilter,
    ) -> Result<MemoryAnswer, SearchError> {
        self.answers.ask(index, question, filter).await
    }
}
