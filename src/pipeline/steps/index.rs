//! `index` step: write embedded partitions to the vector index.

use crate::document::{TAG_DOCUMENT_ID, TAG_FILE_NAME, TAG_FILE_TYPE};
use crate::pipeline::artifacts::Artifacts;
use crate::pipeline::step::{StepContext, StepExecutionError, StepExecutor};
use crate::vector::{VectorIndex, VectorIndexError, VectorRecord, record_id};
use async_trait::async_trait;
use std::sync::Arc;

/// Replaces the document's records in a [`VectorIndex`].
///
/// Stale records are deleted before the upsert and record identifiers are derived from the
/// partition position, so re-running the step leaves the index unchanged.
pub struct IndexStep {
    index: Arc<dyn VectorIndex>,
}

impl IndexStep {
    /// Create the step around a vector index.
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self { index }
    }
}

fn classify(error: VectorIndexError) -> StepExecutionError {
    if error.is_transient() {
        StepExecutionError::Transient(error.to_string())
    } else {
        StepExecutionError::Permanent(error.to_string())
    }
}

#[async_trait]
impl StepExecutor for IndexStep {
    async fn execute(
        &self,
        context: &StepContext,
        input: Artifacts,
    ) -> Result<Artifacts, StepExecutionError> {
        let document = &context.document;
        let mut records = Vec::with_capacity(input.partitions.len());

        for partition in input.partitions {
            let Some(vector) = partition.embedding else {
                return Err(StepExecutionError::Permanent(format!(
                    "partition {} has no embedding; run 'embed' first",
                    partition.ordinal
                )));
            };

            let mut tags = document.tags.clone();
            tags.add(TAG_DOCUMENT_ID, &document.id)
                .add(TAG_FILE_NAME, &partition.file_name);
            if let Some(mime_type) = partition.mime_type.as_deref() {
                tags.add(TAG_FILE_TYPE, mime_type);
            }

            records.push(VectorRecord {
                id: record_id(
                    &context.index,
                    &document.id,
                    &partition.file_name,
                    partition.ordinal,
                ),
                document_id: document.id.clone(),
                file_name: partition.file_name,
                partition: partition.ordinal,
                text: partition.text,
                chunk_hash: partition.chunk_hash,
                tags,
                vector,
            });
        }

        if records.is_empty() {
            return Err(StepExecutionError::Permanent(
                "index requires embedded partitions".into(),
            ));
        }

        let record_ids: Vec<String> = records.iter().map(|record| record.id.clone()).collect();
        self.index
            .delete_document(&context.index, &document.id)
            .await
            .map_err(classify)?;
        self.index
            .upsert(&context.index, records)
            .await
            .map_err(classify)?;

        tracing::info!(
            index = %context.index,
            document_id = %document.id,
            records = record_ids.len(),
            "Document indexed"
        );
        Ok(Artifacts {
            records: record_ids,
            ..Artifacts::default()
        })
    }
}
