//! Abstractions for generating grounded answers via local providers.
//!
//! Answer generation is optional; when no model is configured the answer synthesizer falls back
//! to extractive answers built from the retrieved passages. The Ollama-backed client issues HTTP
//! requests directly to the runtime, mirroring the embedding adapter.

use crate::config::Config;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

/// Runtime used when a model is configured without `OLLAMA_URL`.
pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Errors surfaced while attempting answer generation.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Provider was unreachable or could not be constructed.
    #[error("Generation provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Provider returned an error response.
    #[error("Failed to generate answer: {0}")]
    GenerationFailed(String),
    /// Provider response could not be parsed.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

/// Request payload passed to the generation provider.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Model identifier understood by the provider.
    pub model: String,
    /// Prompt assembled by the answer synthesizer.
    pub prompt: String,
}

/// Interface implemented by answer generation providers.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Generate an answer for a fully assembled prompt.
    async fn generate_answer(&self, request: GenerationRequest)
    -> Result<String, GenerationError>;
}

/// Build an answer generator based on configuration; `None` when no answer model is set.
pub fn get_answer_generator(
    config: &Config,
) -> Result<Option<Arc<dyn AnswerGenerator>>, GenerationError> {
    if config.answer_model.is_none() {
        return Ok(None);
    }
    let base_url = config
        .ollama_url
        .clone()
        .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
    Ok(Some(Arc::new(OllamaAnswerGenerator::new(base_url)?)))
}

/// Answer generator backed by the Ollama `/api/generate` endpoint.
pub struct OllamaAnswerGenerator {
    http: Client,
    base_url: String,
}

impl OllamaAnswerGenerator {
    /// Build a generator for the runtime at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .user_agent("semantic-memory/answer")
            .build()
            .map_err(|error| {
                GenerationError::ProviderUnavailable(format!(
                    "failed to construct HTTP client: {error}"
                ))
            })?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    done: bool,
}

#[async_trait]
impl AnswerGenerator for OllamaAnswerGenerator {
    async fn generate_answer(
        &self,
        request: GenerationRequest,
    ) -> Result<String, GenerationError> {
        let payload = json!({
            "model": request.model,
            "prompt": request.prompt,
            "stream": false,
            "options": {
                // Answers should stick to the supplied facts.
                "temperature": 0.0,
            }
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                GenerationError::ProviderUnavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(GenerationError::ProviderUnavailable(format!(
                "Ollama endpoint {} returned 404",
                self.endpoint()
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::GenerationFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        let body: OllamaResponse = response.json().await.map_err(|error| {
            GenerationError::InvalidResponse(format!("failed to decode Ollama response: {error}"))
        })?;

        if !body.done {
            return Err(GenerationError::InvalidResponse(
                "Ollama response incomplete (streaming not supported)".into(),
            ));
        }

        Ok(body.response.trim().to_string())
    }
}
