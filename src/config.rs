use crate::index_name::{DEFAULT_INDEX, normalize_index_name};
use crate::pipeline::{
    DEFAULT_STEPS, DuplicatePolicy, ExecutionMode, PipelineSettings, ReimportPolicy,
    steps::PartitionSettings,
};
use crate::search::SearchSettings;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Status log directory used when `STATUS_DIR` is unset.
pub const DEFAULT_STATUS_DIR: &str = ".semantic-memory/status";
/// `STATUS_DIR` value selecting the process-local status store.
pub const IN_MEMORY_STATUS: &str = "memory";

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the semantic memory engine.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Index used when a request does not name one.
    pub default_index: String,
    /// Vector store receiving embeddings.
    pub vector_backend: VectorBackend,
    /// Base URL of the Qdrant instance (required for the Qdrant backend).
    pub qdrant_url: Option<String>,
    /// Optional API key required to access Qdrant.
    pub qdrant_api_key: Option<String>,
    /// Embedding provider used to generate vector representations.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Base URL of a local Ollama runtime, enabling HTTP embeddings and answer generation.
    pub ollama_url: Option<String>,
    /// Optional override for the automatic chunk size selection.
    pub text_splitter_chunk_size: Option<usize>,
    /// Token overlap between adjacent partitions.
    pub text_splitter_chunk_overlap: usize,
    /// Additional attempts granted to a failing step.
    pub pipeline_max_retries: u32,
    /// Base delay for exponential retry backoff, in milliseconds.
    pub pipeline_retry_base_delay_ms: u64,
    /// Per-step timeout, in seconds.
    pub pipeline_step_timeout_secs: u64,
    /// Whether imports run inline or through the worker queue.
    pub pipeline_execution_mode: ExecutionMode,
    /// Worker pool size for queued execution.
    pub pipeline_workers: usize,
    /// Bound on queued imports awaiting a worker.
    pub pipeline_queue_capacity: usize,
    /// Behavior when an import targets a document with an active run.
    pub pipeline_duplicate_policy: DuplicatePolicy,
    /// Behavior when an import targets an already completed document.
    pub pipeline_reimport_policy: ReimportPolicy,
    /// Directory for the durable status log; `None` keeps status in memory.
    pub status_dir: Option<String>,
    /// Default number of search results.
    pub search_default_limit: usize,
    /// Upper bound on search results.
    pub search_max_limit: usize,
    /// Minimum score for a search result to be returned.
    pub search_min_relevance: f32,
    /// Minimum score of the best passage for `ask` to produce an answer.
    pub answer_min_relevance: f32,
    /// Maximum number of citations attached to an answer.
    pub answer_max_citations: usize,
    /// Ollama model used for answer generation; extractive answers when absent.
    pub answer_model: Option<String>,
}

/// Supported embedding backends for the processing pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local Ollama runtime.
    Ollama,
    /// Hosted OpenAI embeddings API (token counting uses OpenAI encodings).
    OpenAI,
    /// Offline deterministic hashing embeddings.
    Hashing,
}

/// Supported vector stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    /// Process-local brute-force index.
    Memory,
    /// Qdrant over HTTP.
    Qdrant,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let default_index = normalize_index_name(
            load_env_optional("DEFAULT_INDEX").as_deref(),
            DEFAULT_INDEX,
        )
        .map_err(|_| ConfigError::InvalidValue("DEFAULT_INDEX".into()))?;
        let vector_backend = parse_optional("VECTOR_BACKEND")?.unwrap_or(VectorBackend::Memory);
        let qdrant_url = load_env_optional("QDRANT_URL");
        if vector_backend == VectorBackend::Qdrant && qdrant_url.is_none() {
            return Err(ConfigError::MissingVariable("QDRANT_URL".into()));
        }

        let config = Self {
            default_index,
            vector_backend,
            qdrant_url,
            qdrant_api_key: load_env_optional("QDRANT_API_KEY"),
            embedding_provider: parse_optional("EMBEDDING_PROVIDER")?
                .unwrap_or(EmbeddingProvider::Ollama),
            embedding_model: load_env_optional("EMBEDDING_MODEL")
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
            embedding_dimension: parse_optional("EMBEDDING_DIMENSION")?.unwrap_or(768),
            ollama_url: load_env_optional("OLLAMA_URL"),
            text_splitter_chunk_size: parse_optional("TEXT_SPLITTER_CHUNK_SIZE")?,
            text_splitter_chunk_overlap: parse_optional("TEXT_SPLITTER_CHUNK_OVERLAP")?
                .unwrap_or(0),
            pipeline_max_retries: parse_optional("PIPELINE_MAX_RETRIES")?.unwrap_or(3),
            pipeline_retry_base_delay_ms: parse_optional("PIPELINE_RETRY_BASE_DELAY_MS")?
                .unwrap_or(200),
            pipeline_step_timeout_secs: parse_optional("PIPELINE_STEP_TIMEOUT_SECS")?
                .unwrap_or(300),
            pipeline_execution_mode: parse_optional("PIPELINE_EXECUTION_MODE")?
                .unwrap_or(ExecutionMode::Synchronous),
            pipeline_workers: parse_optional("PIPELINE_WORKERS")?.unwrap_or(4),
            pipeline_queue_capacity: parse_optional("PIPELINE_QUEUE_CAPACITY")?.unwrap_or(64),
            pipeline_duplicate_policy: parse_optional("PIPELINE_DUPLICATE_POLICY")?
                .unwrap_or(DuplicatePolicy::Join),
            pipeline_reimport_policy: parse_optional("PIPELINE_REIMPORT_POLICY")?
                .unwrap_or(ReimportPolicy::Restart),
            status_dir: resolve_status_dir(load_env_optional("STATUS_DIR")),
            search_default_limit: parse_optional("SEARCH_DEFAULT_LIMIT")?.unwrap_or(10),
            search_max_limit: parse_optional("SEARCH_MAX_LIMIT")?.unwrap_or(50),
            search_min_relevance: parse_optional("SEARCH_MIN_RELEVANCE")?.unwrap_or(0.0),
            answer_min_relevance: parse_optional("ANSWER_MIN_RELEVANCE")?.unwrap_or(0.5),
            answer_max_citations: parse_optional("ANSWER_MAX_CITATIONS")?.unwrap_or(5),
            answer_model: load_env_optional("ANSWER_MODEL"),
        };

        if config.embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_DIMENSION".into()));
        }
        if config.pipeline_workers == 0 {
            return Err(ConfigError::InvalidValue("PIPELINE_WORKERS".into()));
        }
        if config.search_max_limit == 0 {
            return Err(ConfigError::InvalidValue("SEARCH_MAX_LIMIT".into()));
        }

        Ok(config)
    }

    /// Orchestrator settings derived from this configuration.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            default_index: self.default_index.clone(),
            default_steps: DEFAULT_STEPS.iter().map(|step| step.to_string()).collect(),
            max_retries: self.pipeline_max_retries,
            retry_base_delay: Duration::from_millis(self.pipeline_retry_base_delay_ms),
            step_timeout: Duration::from_secs(self.pipeline_step_timeout_secs),
            execution_mode: self.pipeline_execution_mode,
            worker_count: self.pipeline_workers,
            queue_capacity: self.pipeline_queue_capacity.max(1),
            duplicate_policy: self.pipeline_duplicate_policy,
            reimport_policy: self.pipeline_reimport_policy,
            ..PipelineSettings::default()
        }
    }

    /// Partitioning settings derived from this configuration.
    pub fn partition_settings(&self) -> PartitionSettings {
        PartitionSettings::resolve(
            self.text_splitter_chunk_size,
            self.text_splitter_chunk_overlap,
            self.embedding_provider,
            &self.embedding_model,
        )
    }

    /// Search and answer settings derived from this configuration.
    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            default_index: self.default_index.clone(),
            default_limit: self.search_default_limit,
            max_limit: self.search_max_limit,
            min_relevance: self.search_min_relevance,
            answer_min_relevance: self.answer_min_relevance,
            answer_max_citations: self.answer_max_citations.max(1),
            answer_model: self.answer_model.clone(),
            ..SearchSettings::default()
        }
    }
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Status directory for a raw `STATUS_DIR` value: the default when unset, none for `memory`.
fn resolve_status_dir(raw: Option<String>) -> Option<String> {
    match raw {
        None => Some(DEFAULT_STATUS_DIR.to_string()),
        Some(value) if value.trim().eq_ignore_ascii_case(IN_MEMORY_STATUS) => None,
        Some(value) => Some(value.trim().to_string()),
    }
}

fn parse_optional<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

impl FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            "hashing" => Ok(Self::Hashing),
            _ => Err(()),
        }
    }
}

impl FromStr for VectorBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "qdrant" => Ok(Self::Qdrant),
            _ => Err(()),
        }
    }
}

/// Load `.env` when present, then read the configuration from the environment.
pub fn init_config() -> Result<Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        default_index = %config.default_index,
        vector_backend = ?config.vector_backend,
        embedding_provider = ?config.embedding_provider,
        execution_mode = ?config.pipeline_execution_mode,
        status_dir = ?config.status_dir,
        "Loaded configuration"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_provider_parses_case_insensitively() {
        assert_eq!(
            "OpenAI".parse::<EmbeddingProvider>(),
            Ok(EmbeddingProvider::OpenAI)
        );
        assert_eq!(
            "hashing".parse::<EmbeddingProvider>(),
            Ok(EmbeddingProvider::Hashing)
        );
        assert!("bogus".parse::<EmbeddingProvider>().is_err());
    }

    #[test]
    fn vector_backend_parses_known_values() {
        assert_eq!("Qdrant".parse::<VectorBackend>(), Ok(VectorBackend::Qdrant));
        assert_eq!("memory".parse::<VectorBackend>(), Ok(VectorBackend::Memory));
        assert!("lance".parse::<VectorBackend>().is_err());
    }

    #[test]
    fn status_dir_defaults_to_a_durable_directory() {
        assert_eq!(resolve_status_dir(None).as_deref(), Some(DEFAULT_STATUS_DIR));
        assert_eq!(
            resolve_status_dir(Some(" /var/lib/memory ".into())).as_deref(),
            Some("/var/lib/memory")
        );
        assert_eq!(resolve_status_dir(Some("Memory".into())), None);
    }
}
