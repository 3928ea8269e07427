//! Built-in step executors: `extract`, `partition`, `embed` and `index`.

pub(crate) mod chunking;
mod embed;
mod extract;
mod index;
mod partition;

pub use chunking::{ChunkingError, compute_chunk_hash};
pub use embed::EmbedStep;
pub use extract::ExtractStep;
pub use index::IndexStep;
pub use partition::PartitionStep;

use crate::config::EmbeddingProvider;
use crate::embedding::EmbeddingClient;
use crate::pipeline::step::StepRegistry;
use crate::vector::VectorIndex;
use std::sync::Arc;

/// Token budget and tokenizer selection for the `partition` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSettings {
    /// Maximum tokens per partition.
    pub chunk_size: usize,
    /// Tokens carried over from the previous partition.
    pub overlap: usize,
    /// Provider whose tokenizer counts tokens.
    pub provider: EmbeddingProvider,
    /// Model whose tokenizer counts tokens.
    pub model: String,
}

impl PartitionSettings {
    /// Derive settings, computing the chunk size from the model when not overridden.
    pub fn resolve(
        chunk_size_override: Option<usize>,
        overlap: usize,
        provider: EmbeddingProvider,
        model: &str,
    ) -> Self {
        let chunk_size = chunking::determine_chunk_size(chunk_size_override, provider, model);
        tracing::debug!(
            chunk_size,
            override = chunk_size_override,
            provider = ?provider,
            model,
            overlap,
            "Derived chunk size"
        );
        Self {
            chunk_size,
            overlap,
            provider,
            model: model.to_string(),
        }
    }
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self::resolve(None, 0, EmbeddingProvider::Hashing, "hashing")
    }
}

impl StepRegistry {
    /// Registry holding the four built-in steps.
    pub fn with_defaults(
        partition: PartitionSettings,
        embedder: Arc<dyn EmbeddingClient>,
        vector_index: Arc<dyn VectorIndex>,
    ) -> Self {
        let mut registry = Self::new();
        registry
            .register("extract", Arc::new(ExtractStep::new()))
            .register("partition", Arc::new(PartitionStep::new(partition)))
            .register("embed", Arc::new(EmbedStep::new(embedder)))
            .register("index", Arc::new(IndexStep::new(vector_index)));
        registry
    }
}
