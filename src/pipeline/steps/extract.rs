//! `extract` step: recover plain text from the document's files.

use crate::pipeline::artifacts::{Artifacts, ExtractedFile};
use crate::pipeline::step::{StepContext, StepExecutionError, StepExecutor};
use async_trait::async_trait;

/// Decodes UTF-8 text files; binary formats without a text extractor are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractStep;

impl ExtractStep {
    /// Create the step.
    pub fn new() -> Self {
        Self
    }
}

fn is_text_mime(mime_type: Option<&str>) -> bool {
    match mime_type {
        // Unknown types are attempted as UTF-8.
        None => true,
        Some(mime) => {
            let mime = mime.to_ascii_lowercase();
            mime.starts_with("text/")
                || matches!(
                    mime.as_str(),
                    "application/json" | "application/xml" | "application/x-ndjson"
                )
        }
    }
}

#[async_trait]
impl StepExecutor for ExtractStep {
    async fn execute(
        &self,
        context: &StepContext,
        _input: Artifacts,
    ) -> Result<Artifacts, StepExecutionError> {
        let mut files = Vec::with_capacity(context.document.files.len());

        for file in &context.document.files {
            let mime_type = file.effective_mime_type();
            if !is_text_mime(mime_type.as_deref()) {
                tracing::warn!(
                    index = %context.index,
                    document_id = %context.document.id,
                    file = %file.name,
                    mime_type = ?mime_type,
                    "No text extractor for file type; skipping"
                );
                continue;
            }

            let text = std::str::from_utf8(&file.content).map_err(|error| {
                StepExecutionError::Permanent(format!(
                    "file '{}' is not valid UTF-8: {error}",
                    file.name
                ))
            })?;
            let text = text.trim_start_matches('\u{feff}').trim();
            if text.is_empty() {
                tracing::debug!(file = %file.name, "File contains no text");
                continue;
            }

            files.push(ExtractedFile {
                name: file.name.clone(),
                mime_type,
                text: text.to_string(),
            });
        }

        if files.is_empty() {
            return Err(StepExecutionError::Permanent(format!(
                "document '{}' contains no extractable text",
                context.document.id
            )));
        }

        tracing::debug!(
            document_id = %context.document.id,
            files = files.len(),
            "Extracted document text"
        );
        Ok(Artifacts {
            files,
            ..Artifacts::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, FileReference, TagCollection};
    use std::sync::Arc;

    fn context(files: Vec<FileReference>) -> StepContext {
        StepContext {
            index: "kb".into(),
            document: Arc::new(Document {
                id: "doc1".into(),
                tags: TagCollection::new(),
                files,
            }),
            step_name: "extract".into(),
            ordinal: 1,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn extracts_text_and_skips_binary_formats() {
        let context = context(vec![
            FileReference::new("notes.md", "\u{feff}# Title\n\nBody  "),
            FileReference::new("scan.pdf", vec![0x25, 0x50, 0x44, 0x46]),
        ]);
        let output = ExtractStep::new()
            .execute(&context, Artifacts::default())
            .await
            .expect("extracted");
        assert_eq!(output.files.len(), 1);
        assert_eq!(output.files[0].text, "# Title\n\nBody");
        assert_eq!(output.files[0].mime_type.as_deref(), Some("text/markdown"));
    }

    #[tokio::test]
    async fn invalid_utf8_is_permanent() {
        let context = context(vec![FileReference::new("bad.txt", vec![0xff, 0xfe, 0x00])]);
        let error = ExtractStep::new()
            .execute(&context, Artifacts::default())
            .await
            .unwrap_err();
        assert!(matches!(error, StepExecutionError::Permanent(message) if message.contains("bad.txt")));
    }

    #[tokio::test]
    async fn document_without_text_is_permanent() {
        let context = context(vec![FileReference::new("empty.txt", "   ")]);
        let error = ExtractStep::new()
            .execute(&context, Artifacts::default())
            .await
            .unwrap_err();
        assert!(!error.is_retryable());
    }
}
