//! Grounded question answering on top of [`SearchClient`].
//!
//! An answer is only produced from passages that clear `answer_min_relevance`. When none do,
//! [`MemoryAnswer::NoAnswer`] is returned instead of a guess. With a configured generator the
//! passages are handed to the model; otherwise (or when the model fails) the answer is composed
//! from the passage excerpts directly.

use crate::generation::{AnswerGenerator, GenerationRequest};
use crate::search::client::SearchClient;
use crate::search::filter::MemoryFilter;
use crate::search::types::{Citation, MemoryAnswer, NO_ANSWER, SearchError};
use std::fmt::Write as _;
use std::sync::Arc;

/// Produces [`MemoryAnswer`]s from retrieved passages.
pub struct AnswerSynthesizer {
    search: Arc<SearchClient>,
    generator: Option<Arc<dyn AnswerGenerator>>,
}

impl AnswerSynthesizer {
    /// Create a synthesizer; without a generator answers are extractive.
    pub fn new(search: Arc<SearchClient>, generator: Option<Arc<dyn AnswerGenerator>>) -> Self {
        Self { search, generator }
    }

    /// Answer `question` from the memory stored in `index`, restricted by `filter`.
    pub async fn ask(
        &self,
        index: Option<&str>,
        question: &str,
        filter: &MemoryFilter,
    ) -> Result<MemoryAnswer, SearchError> {
        let settings = self.search.settings();
        let result = self
            .search
            .search(index, question, filter, Some(settings.answer_max_citations))
            .await?;
        let question = result.query.clone();

        let citations: Vec<Citation> = result
            .results
            .into_iter()
            .filter(|citation| citation.score >= settings.answer_min_relevance)
            .take(settings.answer_max_citations)
            .map(|citation| Citation {
                text: excerpt(&citation.text, settings.excerpt_chars),
                ..citation
            })
            .collect();

        if citations.is_empty() {
            tracing::info!(
                index = %result.index,
                threshold = settings.answer_min_relevance,
                "No relevant passages; returning no answer"
            );
            return Ok(MemoryAnswer::NoAnswer { question });
        }

        let text = match (&self.generator, settings.answer_model.as_deref()) {
            (Some(generator), Some(model)) => {
                let request = GenerationRequest {
                    model: model.to_string(),
                    prompt: build_prompt(&question, &citations),
                };
                match generator.generate_answer(request).await {
                    Ok(reply) if is_no_answer_reply(&reply) => {
                        tracing::info!(index = %result.index, "Generator found no answer in passages");
                        return Ok(MemoryAnswer::NoAnswer { question });
                    }
                    Ok(reply) => reply.trim().to_string(),
                    Err(error) => {
                        tracing::warn!(
                            index = %result.index,
                            error = %error,
                            "Answer generation failed; using extractive answer"
                        );
                        extractive_answer(&citations)
                    }
                }
            }
            _ => extractive_answer(&citations),
        };

        tracing::debug!(
            index = %result.index,
            citations = citations.len(),
            top_score = citations[0].score,
            "Answer synthesized"
        );
        Ok(MemoryAnswer::Answered {
            question,
            text,
            citations,
        })
    }
}

fn is_no_answer_reply(reply: &str) -> bool {
    let reply = reply.trim().trim_end_matches('.');
    reply.is_empty() || reply.eq_ignore_ascii_case(NO_ANSWER)
}

fn build_prompt(question: &str, citations: &[Citation]) -> String {
    let mut prompt = String::from(
        "Answer the question using only the facts below. Cite facts by their number. \
         If the facts do not contain the answer, reply with exactly ",
    );
    prompt.push_str(NO_ANSWER);
    prompt.push_str(".\n\nFacts:\n");
    for (position, citation) in citations.iter().enumerate() {
        let _ = writeln!(
            prompt,
            "[{}] ({} / {}) {}",
            position + 1,
            citation.document_id,
            citation.file_name,
            citation.text
        );
    }
    let _ = write!(prompt, "\nQuestion: {question}\nAnswer:");
    prompt
}

fn extractive_answer(citations: &[Citation]) -> String {
    citations
        .iter()
        .map(|citation| citation.text.trim())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", text[..cut].trim_end()),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::TagCollection;
    use crate::embedding::{EmbeddingClient, HashingEmbeddingClient};
    use crate::generation::GenerationError;
    use crate::search::types::SearchSettings;
    use crate::vector::{InMemoryVectorIndex, VectorIndex, VectorRecord, record_id};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        reply: Result<String, String>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(reply: Result<&str, &str>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(str::to_string).map_err(str::to_string),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AnswerGenerator for Scripted {
        async fn generate_answer(
            &self,
            request: GenerationRequest,
        ) -> Result<String, GenerationError> {
            self.prompts.lock().expect("prompts").push(request.prompt);
            self.reply.clone().map_err(GenerationError::GenerationFailed)
        }
    }

    const PASSAGES: [&str; 2] = [
        "The orchestrator retries transient step failures with exponential backoff",
        "Qdrant stores vectors in collections named after the index",
    ];

    async fn search_client(answer_model: Option<&str>) -> Arc<SearchClient> {
        let embedder = Arc::new(HashingEmbeddingClient::new(128));
        let index = Arc::new(InMemoryVectorIndex::new());
        let vectors = embedder
            .generate_embeddings(PASSAGES.iter().map(|text| text.to_string()).collect())
            .await
            .expect("vectors");
        let records = PASSAGES
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(partition, (text, vector))| VectorRecord {
                id: record_id("kb", "doc1", "notes.txt", partition),
                document_id: "doc1".into(),
                file_name: "notes.txt".into(),
                partition,
                text: text.to_string(),
                chunk_hash: String::new(),
                tags: TagCollection::new().with("__document_id", "doc1"),
                vector,
            })
            .collect();
        index.upsert("kb", records).await.expect("upsert");

        let settings = SearchSettings {
            answer_min_relevance: 0.5,
            answer_model: answer_model.map(str::to_string),
            ..SearchSettings::default()
        };
        Arc::new(SearchClient::new(embedder, index, settings))
    }

    #[tokio::test]
    async fn unrelated_question_has_no_answer() {
        let synthesizer = AnswerSynthesizer::new(search_client(None).await, None);
        let answer = synthesizer
            .ask(Some("kb"), "favourite pizza topping", &MemoryFilter::new())
            .await
            .expect("ask");
        assert!(answer.is_no_answer());
        assert_eq!(answer.question(), "favourite pizza topping");
    }

    #[tokio::test]
    async fn extractive_answer_cites_relevant_passage() {
        let synthesizer = AnswerSynthesizer::new(search_client(None).await, None);
        let answer = synthesizer
            .ask(
                Some("kb"),
                "The orchestrator retries transient step failures",
                &MemoryFilter::new(),
            )
            .await
            .expect("ask");
        let citations = answer.citations();
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].partition, 0);
        assert!(answer.text().expect("text").contains("exponential backoff"));
    }

    #[tokio::test]
    async fn generator_reply_is_used_and_marker_means_no_answer() {
        let question = "The orchestrator retries transient step failures";
        let generator = Scripted::new(Ok("It uses exponential backoff [1]."));
        let synthesizer =
            AnswerSynthesizer::new(search_client(Some("llama")).await, Some(generator.clone()));
        let answer = synthesizer
            .ask(Some("kb"), question, &MemoryFilter::new())
            .await
            .expect("ask");
        assert_eq!(answer.text(), Some("It uses exponential backoff [1]."));
        let prompts = generator.prompts.lock().expect("prompts");
        assert!(prompts[0].contains(NO_ANSWER));
        assert!(prompts[0].contains("Question: The orchestrator"));
        drop(prompts);

        let refusing = Scripted::new(Ok("INFO NOT FOUND."));
        let synthesizer = AnswerSynthesizer::new(search_client(Some("llama")).await, Some(refusing));
        let answer = synthesizer
            .ask(Some("kb"), question, &MemoryFilter::new())
            .await
            .expect("ask");
        assert!(answer.is_no_answer());
    }

    #[tokio::test]
    async fn generator_failure_falls_back_to_extractive() {
        let failing = Scripted::new(Err("offline"));
        let synthesizer = AnswerSynthesizer::new(search_client(Some("llama")).await, Some(failing));
        let answer = synthesizer
            .ask(
                Some("kb"),
                "The orchestrator retries transient step failures",
                &MemoryFilter::new(),
            )
            .await
            .expect("ask");
        assert!(answer.text().expect("text").contains("exponential backoff"));
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("héllo wörld", 5), "héllo...");
        assert_eq!(excerpt("  short ", 50), "short");
    }
}
