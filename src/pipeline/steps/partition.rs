//! `partition` step: split extracted text into token-bounded, de-duplicated partitions.

use super::PartitionSettings;
use super::chunking::{TokenCounter, chunk_text, dedupe_chunks};
use crate::pipeline::artifacts::{Artifacts, Partition};
use crate::pipeline::step::{StepContext, StepExecutionError, StepExecutor};
use async_trait::async_trait;
use std::collections::HashSet;

/// Semantic chunker over the files produced by `extract`.
#[derive(Debug, Clone)]
pub struct PartitionStep {
    settings: PartitionSettings,
}

impl PartitionStep {
    /// Create the step with the given chunking settings.
    pub fn new(settings: PartitionSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl StepExecutor for PartitionStep {
    async fn execute(
        &self,
        context: &StepContext,
        input: Artifacts,
    ) -> Result<Artifacts, StepExecutionError> {
        if input.files.is_empty() {
            return Err(StepExecutionError::Permanent(
                "partition requires extracted text; run 'extract' first".into(),
            ));
        }

        let settings = &self.settings;
        let token_counter = TokenCounter::for_model(settings.provider, &settings.model)
            .map_err(|error| StepExecutionError::Permanent(error.to_string()))?;

        let mut seen = HashSet::new();
        let mut partitions = Vec::new();
        let mut skipped_duplicates = 0;

        for file in &input.files {
            let chunks = chunk_text(
                &file.text,
                settings.chunk_size,
                settings.overlap,
                &token_counter,
            )
            .map_err(|error| StepExecutionError::Permanent(error.to_string()))?;
            let (prepared, skipped) = dedupe_chunks(chunks, &mut seen);
            skipped_duplicates += skipped;

            for chunk in prepared {
                partitions.push(Partition {
                    file_name: file.name.clone(),
                    mime_type: file.mime_type.clone(),
                    ordinal: partitions.len(),
                    text: chunk.text,
                    chunk_hash: chunk.chunk_hash,
                    embedding: None,
                });
            }
        }

        tracing::debug!(
            document_id = %context.document.id,
            partitions = partitions.len(),
            chunk_size = settings.chunk_size,
            overlap = settings.overlap,
            skipped_duplicates,
            "Partitioned document"
        );

        Ok(Artifacts {
            files: input.files,
            partitions,
            records: Vec::new(),
        })
    }
}
