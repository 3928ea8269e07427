//! `embed` step: attach an embedding vector to every partition.

use crate::embedding::EmbeddingClient;
use crate::pipeline::artifacts::Artifacts;
use crate::pipeline::step::{StepContext, StepExecutionError, StepExecutor};
use async_trait::async_trait;
use std::sync::Arc;

const DEFAULT_BATCH_SIZE: usize = 32;

/// Embeds partitions in batches through an [`EmbeddingClient`].
pub struct EmbedStep {
    client: Arc<dyn EmbeddingClient>,
    batch_size: usize,
}

impl EmbedStep {
    /// Create the step around an embedding client.
    pub fn new(client: Arc<dyn EmbeddingClient>) -> Self {
        Self {
            client,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Override the number of partitions sent per embedding request.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[async_trait]
impl StepExecutor for EmbedStep {
    async fn execute(
        &self,
        context: &StepContext,
        mut input: Artifacts,
    ) -> Result<Artifacts, StepExecutionError> {
        if input.partitions.is_empty() {
            return Err(StepExecutionError::Permanent(
                "embed requires partitions; run 'partition' first".into(),
            ));
        }

        let expected = self.client.dimension();
        let mut embedded = 0;

        for batch in input.partitions.chunks_mut(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
            let vectors = self
                .client
                .generate_embeddings(texts)
                .await
                .map_err(|error| StepExecutionError::Transient(error.to_string()))?;

            if vectors.len() != batch.len() {
                return Err(StepExecutionError::Transient(format!(
                    "embedding provider returned {} vectors for {} partitions",
                    vectors.len(),
                    batch.len()
                )));
            }

            for (partition, vector) in batch.iter_mut().zip(vectors) {
                if vector.len() != expected {
                    return Err(StepExecutionError::Permanent(format!(
                        "embedding dimension mismatch: expected {expected}, got {}",
                        vector.len()
                    )));
                }
                partition.embedding = Some(vector);
                embedded += 1;
            }
        }

        tracing::debug!(
            document_id = %context.document.id,
            embedded,
            dimension = expected,
            "Embedded partitions"
        );
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, TagCollection};
    use crate::embedding::{EmbeddingClientError, HashingEmbeddingClient};
    use crate::pipeline::artifacts::Partition;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context() -> StepContext {
        StepContext {
            index: "kb".into(),
            document: Arc::new(Document {
                id: "doc1".into(),
                tags: TagCollection::new(),
                files: Vec::new(),
            }),
            step_name: "embed".into(),
            ordinal: 3,
            attempt: 1,
        }
    }

    fn partitions(count: usize) -> Artifacts {
        Artifacts {
            partitions: (0..count)
                .map(|ordinal| Partition {
                    file_name: "a.txt".into(),
                    mime_type: None,
                    ordinal,
                    text: format!("partition number {ordinal}"),
                    chunk_hash: format!("hash-{ordinal}"),
                    embedding: None,
                })
                .collect(),
            ..Artifacts::default()
        }
    }

    struct CountingClient {
        inner: HashingEmbeddingClient,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingClient for CountingClient {
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn generate_embeddings(
            &self,
            texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.generate_embeddings(texts).await
        }
    }

    struct WrongDimension;

    #[async_trait]
    impl EmbeddingClient for WrongDimension {
        fn dimension(&self) -> usize {
            8
        }

        async fn generate_embeddings(
            &self,
            texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            Ok(texts.iter().map(|_| vec![0.5; 4]).collect())
        }
    }

    #[tokio::test]
    async fn embeds_every_partition_in_batches() {
        let client = Arc::new(CountingClient {
            inner: HashingEmbeddingClient::new(16),
            calls: AtomicUsize::new(0),
        });
        let step = EmbedStep::new(client.clone()).with_batch_size(2);
        let output = step.execute(&context(), partitions(5)).await.expect("embedded");
        assert!(output
            .partitions
            .iter()
            .all(|p| p.embedding.as_ref().is_some_and(|v| v.len() == 16)));
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_permanent() {
        let step = EmbedStep::new(Arc::new(WrongDimension));
        let error = step.execute(&context(), partitions(1)).await.unwrap_err();
        assert!(matches!(error, StepExecutionError::Permanent(message) if message.contains("expected 8")));
    }
}
