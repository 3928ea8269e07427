//! `Memory` aggregate wiring the ingestion pipeline and the search engine.
//!
//! Mandatory collaborators (vector index, embedding client, status store) are checked once in
//! [`MemoryBuilder::build`]; nothing is resolved lazily afterwards.

use crate::config::{Config, VectorBackend};
use crate::embedding::{EmbeddingClient, get_embedding_client};
use crate::error::ConfigurationError;
use crate::generation::{AnswerGenerator, get_answer_generator};
use crate::pipeline::steps::PartitionSettings;
use crate::pipeline::{
    FileStatusStore, InMemoryStatusStore, PipelineOrchestrator, PipelineSettings, StatusStore,
    StepExecutor, StepRegistry,
};
use crate::qdrant::QdrantVectorIndex;
use crate::search::{SearchEngine, SearchSettings};
use crate::vector::{InMemoryVectorIndex, VectorIndex};
use std::sync::Arc;

/// Builder collecting the collaborators of a [`Memory`].
#[derive(Default)]
pub struct MemoryBuilder {
    status_store: Option<Arc<dyn StatusStore>>,
    vector_index: Option<Arc<dyn VectorIndex>>,
    embedder: Option<Arc<dyn EmbeddingClient>>,
    generator: Option<Arc<dyn AnswerGenerator>>,
    pipeline: PipelineSettings,
    partition: PartitionSettings,
    search: SearchSettings,
    extra_steps: Vec<(String, Arc<dyn StepExecutor>)>,
}

impl MemoryBuilder {
    /// Start with default settings and no collaborators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Status log recording pipeline progress.
    pub fn with_status_store(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.status_store = Some(store);
        self
    }

    /// Vector index written by the `index` step and read by search.
    pub fn with_vector_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.vector_index = Some(index);
        self
    }

    /// Embedding client shared by the `embed` step and search.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingClient>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Optional answer generator; answers are extractive without one.
    pub fn with_generator(mut self, generator: Arc<dyn AnswerGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Orchestrator settings.
    pub fn with_pipeline_settings(mut self, settings: PipelineSettings) -> Self {
        self.pipeline = settings;
        self
    }

    /// Partitioning settings for the built-in `partition` step.
    pub fn with_partition_settings(mut self, settings: PartitionSettings) -> Self {
        self.partition = settings;
        self
    }

    /// Search and answer settings.
    pub fn with_search_settings(mut self, settings: SearchSettings) -> Self {
        self.search = settings;
        self
    }

    /// Register an additional (or replacement) step executor under `name`.
    pub fn with_step(mut self, name: &str, executor: Arc<dyn StepExecutor>) -> Self {
        self.extra_steps.push((name.to_string(), executor));
        self
    }

    /// Validate the collaborators and assemble the memory.
    pub fn build(self) -> Result<Memory, ConfigurationError> {
        let vector_index = self
            .vector_index
            .ok_or(ConfigurationError::MissingCollaborator("vector index"))?;
        let embedder = self
            .embedder
            .ok_or(ConfigurationError::MissingCollaborator("embedding client"))?;
        let status_store = self
            .status_store
            .ok_or(ConfigurationError::MissingCollaborator("status store"))?;

        let mut registry = StepRegistry::with_defaults(
            self.partition,
            Arc::clone(&embedder),
            Arc::clone(&vector_index),
        );
        for (name, executor) in self.extra_steps {
            registry.register(&name, executor);
        }

        let pipeline = PipelineOrchestrator::new(registry, status_store, self.pipeline)?;
        let search = SearchEngine::new(embedder, vector_index, self.generator, self.search);
        Ok(Memory {
            pipeline: Arc::new(pipeline),
            search: Arc::new(search),
        })
    }
}

/// Ingestion pipeline and search engine over the same index.
pub struct Memory {
    pipeline: Arc<PipelineOrchestrator>,
    search: Arc<SearchEngine>,
}

impl Memory {
    /// Start building a memory from explicit collaborators.
    pub fn builder() -> MemoryBuilder {
        MemoryBuilder::new()
    }

    /// Wire a memory from environment configuration.
    ///
    /// Uses the file status store unless `STATUS_DIR` selects in-memory status, Qdrant when
    /// selected as vector backend, and the Ollama runtime when configured.
    pub async fn from_config(config: &Config) -> Result<Self, ConfigurationError> {
        let status_store: Arc<dyn StatusStore> = match config.status_dir.as_deref() {
            Some(dir) => Arc::new(FileStatusStore::open(dir).await?),
            None => Arc::new(InMemoryStatusStore::new()),
        };

        let vector_index: Arc<dyn VectorIndex> = match config.vector_backend {
            VectorBackend::Memory => Arc::new(InMemoryVectorIndex::new()),
            VectorBackend::Qdrant => {
                let url = config
                    .qdrant_url
                    .as_deref()
                    .ok_or(ConfigurationError::MissingCollaborator("QDRANT_URL"))?;
                Arc::new(QdrantVectorIndex::new(
                    url,
                    config.qdrant_api_key.clone(),
                    config.embedding_dimension,
                )?)
            }
        };

        let embedder = get_embedding_client(config)
            .map_err(|error| ConfigurationError::Invalid(error.to_string()))?;
        let mut builder = MemoryBuilder::new()
            .with_status_store(status_store)
            .with_vector_index(vector_index)
            .with_embedder(embedder)
            .with_pipeline_settings(config.pipeline_settings())
            .with_partition_settings(config.partition_settings())
            .with_search_settings(config.search_settings());
        if let Some(generator) = get_answer_generator(config)
            .map_err(|error| ConfigurationError::Invalid(error.to_string()))?
        {
            builder = builder.with_generator(generator);
        }

        tracing::info!(
            vector_backend = ?config.vector_backend,
            embedding_provider = ?config.embedding_provider,
            durable_status = config.status_dir.is_some(),
            answer_model = ?config.answer_model,
            "Memory configured"
        );
        builder.build()
    }

    /// Ingestion pipeline.
    pub fn pipeline(&self) -> &Arc<PipelineOrchestrator> {
        &self.pipeline
    }

    /// Search engine.
    pub fn search(&self) -> &Arc<SearchEngine> {
        &self.search
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbeddingClient;

    #[test]
    fn build_requires_mandatory_collaborators() {
        let error = MemoryBuilder::new()
            .with_embedder(Arc::new(HashingEmbeddingClient::new(8)))
            .with_status_store(Arc::new(InMemoryStatusStore::new()))
            .build()
            .err()
            .expect("missing index");
        assert!(matches!(
            error,
            ConfigurationError::MissingCollaborator("vector index")
        ));

        let error = MemoryBuilder::new()
            .with_vector_index(Arc::new(InMemoryVectorIndex::new()))
            .with_embedder(Arc::new(HashingEmbeddingClient::new(8)))
            .build()
            .err()
            .expect("missing store");
        assert!(matches!(
            error,
            ConfigurationError::MissingCollaborator("status store")
        ));

        let error = MemoryBuilder::new()
            .with_vector_index(Arc::new(InMemoryVectorIndex::new()))
            .with_status_store(Arc::new(InMemoryStatusStore::new()))
            .build()
            .err()
            .expect("missing embedder");
        assert!(matches!(
            error,
            ConfigurationError::MissingCollaborator("embedding client")
        ));
    }

    #[test]
    fn build_succeeds_with_all_collaborators() {
        let memory = Memory::builder()
            .with_vector_index(Arc::new(InMemoryVectorIndex::new()))
            .with_embedder(Arc::new(HashingEmbeddingClient::new(8)))
            .with_status_store(Arc::new(InMemoryStatusStore::new()))
            .build()
            .expect("memory");
        assert_eq!(memory.pipeline().settings().default_steps.len(), 4);
    }
}
