//! Filtered semantic search over a vector index.

use crate::embedding::EmbeddingClient;
use crate::error::ValidationError;
use crate::index_name::normalize_index_name;
use crate::search::filter::MemoryFilter;
use crate::search::types::{Citation, SearchError, SearchResult, SearchSettings};
use crate::vector::{ScoredRecord, VectorIndex};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

/// Extra candidates requested from the backend to absorb client-side filtering.
const OVERFETCH_FACTOR: usize = 2;

/// Embeds queries and ranks matching partitions.
pub struct SearchClient {
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    settings: SearchSettings,
}

impl SearchClient {
    /// Create a client over an embedding provider and a vector index.
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        settings: SearchSettings,
    ) -> Self {
        Self {
            embedder,
            index,
            settings,
        }
    }

    /// Settings the client was built with.
    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    /// Resolve the effective result count for an optional request limit.
    pub fn effective_limit(&self, limit: Option<usize>) -> usize {
        limit
            .unwrap_or(self.settings.default_limit)
            .clamp(1, self.settings.max_limit.max(1))
    }

    /// Search `index` for partitions similar to `query` that satisfy `filter`.
    ///
    /// Results are ordered by descending score; equal scores are ordered by document id, file
    /// name, partition ordinal and record id so repeated searches return the same order.
    pub async fn search(
        &self,
        index: Option<&str>,
        query: &str,
        filter: &MemoryFilter,
        limit: Option<usize>,
    ) -> Result<SearchResult, SearchError> {
        let index = normalize_index_name(index, &self.settings.default_index)?;
        let query = query.trim();
        if query.is_empty() {
            return Err(ValidationError::EmptyQuery.into());
        }
        filter.validate()?;
        let limit = self.effective_limit(limit);

        let vector = self.embed_query(query).await?;
        let candidates = self
            .index
            .query(&index, &vector, filter, limit.saturating_mul(OVERFETCH_FACTOR))
            .await?;
        let returned = candidates.len();
        let results = rank(candidates, filter, self.settings.min_relevance, limit);

        tracing::debug!(
            index = %index,
            returned,
            kept = results.len(),
            limit,
            filtered = !filter.is_empty(),
            "Search completed"
        );

        Ok(SearchResult {
            query: query.to_string(),
            index,
            results,
        })
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, SearchError> {
        let vector = self
            .embedder
            .generate_embeddings(vec![query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or(SearchError::EmptyEmbedding)?;

        let expected = self.embedder.dimension();
        if vector.len() != expected {
            return Err(SearchError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }
}

/// Re-check filters and thresholds, then order, de-duplicate and truncate.
fn rank(
    candidates: Vec<ScoredRecord>,
    filter: &MemoryFilter,
    min_relevance: f32,
    limit: usize,
) -> Vec<Citation> {
    let mut results: Vec<Citation> = candidates
        .into_iter()
        .filter(|hit| hit.score.is_finite() && hit.score >= min_relevance)
        .filter(|hit| filter.matches(&hit.record.tags))
        .map(|hit| Citation {
            record_id: hit.record.id,
            document_id: hit.record.document_id,
            file_name: hit.record.file_name,
            partition: hit.record.partition,
            score: hit.score,
            text: hit.record.text,
            tags: hit.record.tags,
        })
        .collect();

    results.sort_by(compare_citations);
    let mut seen = HashSet::new();
    results.retain(|citation| seen.insert(citation.record_id.clone()));
    results.truncate(limit);
    results
}

fn compare_citations(a: &Citation, b: &Citation) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.document_id.cmp(&b.document_id))
        .then_with(|| a.file_name.cmp(&b.file_name))
        .then_with(|| a.partition.cmp(&b.partition))
        .then_with(|| a.record_id.cmp(&b.record_id))
}
