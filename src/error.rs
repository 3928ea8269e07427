//! Error types shared by the pipeline and search components.

use thiserror::Error;

/// Input rejected before any work begins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Index name is empty, too long, or contains illegal characters.
    #[error("Invalid index name '{name}': {reason}")]
    InvalidIndexName {
        /// Name as supplied by the caller (after trimming).
        name: String,
        /// Human readable explanation of the rule that was violated.
        reason: &'static str,
    },
    /// Document identifier contains characters outside the allowed set.
    #[error("Invalid document id '{0}'")]
    InvalidDocumentId(String),
    /// Upload request did not carry any file.
    #[error("Document '{0}' has no files to import")]
    EmptyDocument(String),
    /// File entry is malformed (blank or duplicated name).
    #[error("Invalid file in document '{document_id}': {reason}")]
    InvalidFile {
        /// Document the file belongs to.
        document_id: String,
        /// Explanation of the problem.
        reason: String,
    },
    /// Tag key or value is malformed or uses a reserved prefix.
    #[error("Invalid tag: {0}")]
    InvalidTag(String),
    /// Filter constraint is malformed.
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    /// Requested step is not present in the registry.
    #[error("Unknown pipeline step '{0}'")]
    UnknownStep(String),
    /// Requested step list is empty.
    #[error("Pipeline step list is empty")]
    EmptyStepList,
    /// Query or question text is blank.
    #[error("Query text is empty")]
    EmptyQuery,
}

/// Missing or inconsistent collaborators detected while wiring components.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A mandatory collaborator was not supplied.
    #[error("Missing required collaborator: {0}")]
    MissingCollaborator(&'static str),
    /// Supplied settings cannot work together.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    /// Vector backend could not be initialized.
    #[error("Failed to initialize vector backend: {0}")]
    Backend(#[from] crate::qdrant::QdrantError),
    /// Durable status store could not be opened.
    #[error("Failed to open status store: {0}")]
    StatusStore(#[from] crate::pipeline::StatusStoreError),
}
