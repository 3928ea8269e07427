//! Token counting and semantic chunking for the `partition` step.
//!
//! Partitions are cut by `semchunk-rs` against a token budget. The budget is derived from the
//! embedding model's input window unless `TEXT_SPLITTER_CHUNK_SIZE` overrides it. Tokens are
//! counted with the model's BPE encoding when `tiktoken-rs` knows it, and as whitespace words
//! otherwise.

use crate::config::EmbeddingProvider;
use semchunk_rs::Chunker;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tiktoken_rs::{CoreBPE, cl100k_base, get_bpe_from_model, o200k_base, p50k_base, r50k_base};

const MIN_AUTOMATIC_CHUNK_SIZE: usize = 256;
const MAX_AUTOMATIC_CHUNK_SIZE: usize = 1024;

/// Errors produced while turning extracted text into partitions.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Partitioning configured an impossible token budget.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    /// BPE tables for the configured model could not be loaded.
    #[error("failed to load tokenizer '{encoding}': {reason}")]
    Tokenizer {
        /// Encoding that failed to load.
        encoding: &'static str,
        /// Error reported by the tokenizer library.
        reason: String,
    },
}

/// Counts tokens the way the embedding model will see them.
#[derive(Clone)]
pub(crate) enum TokenCounter {
    /// Whitespace-separated words; used when no BPE encoding applies.
    Words,
    /// Byte-pair encoding shared across chunker callbacks.
    Bpe(Arc<CoreBPE>),
}

impl TokenCounter {
    /// Pick the counter for a provider/model pair.
    ///
    /// Ollama models rarely map onto a tiktoken encoding, so a failed lookup there degrades to
    /// word counting. The hashing embedder always counts words.
    pub(crate) fn for_model(
        provider: EmbeddingProvider,
        model: &str,
    ) -> Result<Self, ChunkingError> {
        match provider {
            EmbeddingProvider::Hashing => Ok(Self::Words),
            EmbeddingProvider::OpenAI => Self::bpe(model),
            EmbeddingProvider::Ollama => Self::bpe(model).or_else(|error| {
                tracing::warn!(
                    model,
                    error = %error,
                    "No tokenizer for Ollama model; counting words"
                );
                Ok(Self::Words)
            }),
        }
    }

    fn bpe(model: &str) -> Result<Self, ChunkingError> {
        let model = model.trim();
        if let Ok(encoding) = get_bpe_from_model(model) {
            return Ok(Self::Bpe(Arc::new(encoding)));
        }

        let (encoding, loaded) = match model {
            "o200k_base" => ("o200k_base", o200k_base()),
            "p50k_base" => ("p50k_base", p50k_base()),
            "r50k_base" | "gpt2" => ("r50k_base", r50k_base()),
            _ => {
                tracing::debug!(model, "Unknown tokenizer model; using cl100k_base");
                ("cl100k_base", cl100k_base())
            }
        };
        loaded
            .map(|bpe| Self::Bpe(Arc::new(bpe)))
            .map_err(|error| ChunkingError::Tokenizer {
                encoding,
                reason: error.to_string(),
            })
    }

    /// Number of tokens in `text`; non-empty text never counts as zero.
    pub(crate) fn count(&self, text: &str) -> usize {
        let tokens = match self {
            Self::Words => text.split_whitespace().count(),
            Self::Bpe(encoding) => encoding.encode_ordinary(text).len(),
        };
        if tokens == 0 && !text.is_empty() { 1 } else { tokens }
    }
}

/// Token budget per partition: the explicit override, or a quarter of the model's input
/// window clamped into `[256, 1024]`.
pub(crate) fn determine_chunk_size(
    override_size: Option<usize>,
    provider: EmbeddingProvider,
    model: &str,
) -> usize {
    match override_size {
        Some(explicit) => explicit.max(1),
        None => (input_window(provider, model) / 4)
            .clamp(MIN_AUTOMATIC_CHUNK_SIZE, MAX_AUTOMATIC_CHUNK_SIZE),
    }
}

fn input_window(provider: EmbeddingProvider, model: &str) -> usize {
    let model = model.to_lowercase();
    match provider {
        EmbeddingProvider::Hashing => 2048,
        EmbeddingProvider::OpenAI if model.starts_with("text-embedding-") => 8192,
        EmbeddingProvider::OpenAI => tiktoken_rs::model::get_context_size(&model),
        EmbeddingProvider::Ollama if model.contains("all-minilm") => 512,
        EmbeddingProvider::Ollama
            if model.starts_with("nomic-embed") || model.starts_with("mxbai-embed") =>
        {
            8192
        }
        EmbeddingProvider::Ollama => 4096,
    }
}

/// Split text into semantic segments of at most `chunk_size` tokens, each prefixed with up to
/// `overlap` tokens from the end of its predecessor.
///
/// Blank input yields no segments.
pub(crate) fn chunk_text(
    text: &str,
    chunk_size: usize,
    overlap: usize,
    counter: &TokenCounter,
) -> Result<Vec<String>, ChunkingError> {
    if chunk_size == 0 {
        return Err(ChunkingError::InvalidChunkSize);
    }
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let chunker_counter = counter.clone();
    let chunker = Chunker::new(
        chunk_size,
        Box::new(move |segment: &str| chunker_counter.count(segment)),
    );
    let chunks = chunker.chunk(text);

    let overlap = overlap.min(chunk_size - 1);
    if overlap == 0 {
        return Ok(chunks);
    }

    let mut previous: Option<&str> = None;
    let overlapped = chunks
        .iter()
        .map(|chunk| {
            let joined = match previous {
                Some(prior) => {
                    let carried = suffix_within(prior, overlap, counter);
                    let combined = if carried.is_empty() {
                        chunk.clone()
                    } else {
                        format!("{carried} {}", chunk.trim_start())
                    };
                    suffix_within(&combined, chunk_size, counter).to_string()
                }
                None => chunk.clone(),
            };
            previous = Some(chunk.as_str());
            joined
        })
        .collect();
    Ok(overlapped)
}

/// Longest left-trimmed suffix of `text` that fits in `budget` tokens.
fn suffix_within<'a>(text: &'a str, budget: usize, counter: &TokenCounter) -> &'a str {
    text.char_indices()
        .map(|(offset, _)| text[offset..].trim_start())
        .find(|candidate| counter.count(candidate) <= budget)
        .unwrap_or("")
}

/// Partition text with its content hash.
#[derive(Debug, Clone)]
pub(crate) struct PreparedChunk {
    pub(crate) text: String,
    pub(crate) chunk_hash: String,
}

/// Drop blank chunks and chunks whose hash is already in `seen`, keeping first occurrences.
///
/// Returns the kept chunks and the number of duplicates dropped.
pub(crate) fn dedupe_chunks(
    chunks: Vec<String>,
    seen: &mut HashSet<String>,
) -> (Vec<PreparedChunk>, usize) {
    let mut skipped = 0;
    let prepared = chunks
        .into_iter()
        .filter(|text| !text.trim().is_empty())
        .filter_map(|text| {
            let chunk_hash = compute_chunk_hash(&text);
            if seen.insert(chunk_hash.clone()) {
                Some(PreparedChunk { text, chunk_hash })
            } else {
                skipped += 1;
                None
            }
        })
        .collect();
    (prepared, skipped)
}

/// Hex-encoded SHA-256 of the chunk text.
pub fn compute_chunk_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}
