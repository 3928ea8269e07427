#![deny(missing_docs)]

//! Core library for the semantic memory engine: document ingestion pipelines and grounded
//! semantic search over vector indexes.

/// Environment-driven configuration management.
pub mod config;
/// Document, file and tag model accepted by imports.
pub mod document;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Validation and wiring errors shared across components.
pub mod error;
/// Answer generation providers.
pub mod generation;
/// Index name normalization.
pub mod index_name;
/// Structured logging and tracing setup.
pub mod logging;
/// Aggregate wiring the pipeline and the search engine.
pub mod memory;
/// Pipeline metrics helpers.
pub mod metrics;
/// Ingestion pipeline orchestration.
pub mod pipeline;
/// Qdrant vector store integration.
pub mod qdrant;
/// Filtered search and answer synthesis.
pub mod search;
/// Vector index abstraction and in-memory backend.
pub mod vector;

pub use document::{DocumentUploadRequest, FileReference, TagCollection};
pub use error::{ConfigurationError, ValidationError};
pub use memory::{Memory, MemoryBuilder};
pub use pipeline::{PipelineApi, PipelineOrchestrator, PipelineStatus};
pub use search::{MemoryAnswer, MemoryFilter, SearchApi, SearchEngine, SearchResult};
