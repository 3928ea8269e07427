//! Qdrant vector store integration.

pub mod client;
pub mod filters;
mod payload;
pub mod types;

pub use client::QdrantVectorIndex;
pub use filters::{build_tag_filter, document_filter};
pub use types::QdrantError;
