use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use semantic_memory::document::{DocumentUploadRequest, FileReference};
use semantic_memory::search::{MemoryFilter, SearchApi};
use semantic_memory::config::{self, VectorBackend};
use semantic_memory::{logging, memory::Memory};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "semantic-memory",
    about = "Import documents into a semantic memory and query it"
)]
struct Cli {
    /// Index to operate on (defaults to DEFAULT_INDEX).
    #[arg(long, global = true)]
    index: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import files as one document.
    Import {
        /// Document identifier; generated when omitted.
        #[arg(long)]
        id: Option<String>,
        /// Tag attached to the document, as `key=value`.
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
        /// Pipeline step to run, in order; defaults to the standard pipeline.
        #[arg(long = "step")]
        steps: Vec<String>,
        /// Files making up the document.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show the pipeline status of a document.
    Status {
        /// Document identifier.
        document_id: String,
    },
    /// Search the index.
    Search {
        /// Restrict results to a tag, as `key=value`; repeat to require several.
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
        /// Query text.
        query: String,
    },
    /// Ask a question answered from the index.
    Ask {
        /// Restrict passages to a tag, as `key=value`; repeat to require several.
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
        /// Question text.
        question: String,
    },
    /// Resume pipeline runs interrupted by a previous process.
    Resume,
}

impl Command {
    /// Whether the command reads or writes vectors that must outlive this process.
    fn uses_index(&self) -> bool {
        !matches!(self, Self::Status { .. })
    }
}

/// Each CLI invocation is a separate process, so vectors must live in an external store.
fn require_persistent_index(command: &Command, backend: VectorBackend) -> Result<()> {
    if command.uses_index() && backend == VectorBackend::Memory {
        bail!(
            "VECTOR_BACKEND=memory does not persist between commands; \
             set VECTOR_BACKEND=qdrant and QDRANT_URL"
        );
    }
    Ok(())
}

fn parse_tag(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, value)| !key.is_empty() && !value.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn tag_filter(tags: &[(String, String)]) -> MemoryFilter {
    tags.iter()
        .fold(MemoryFilter::new(), |filter, (key, value)| {
            filter.by_tag(key, value)
        })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to encode output")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::init_config().context("failed to load configuration")?;
    logging::init_tracing();
    require_persistent_index(&cli.command, config.vector_backend)?;

    let memory = Memory::from_config(&config)
        .await
        .context("failed to initialize memory")?;
    let index = cli.index.as_deref();

    match cli.command {
        Command::Import {
            id,
            tags,
            steps,
            files,
        } => {
            let mut request = DocumentUploadRequest::new();
            if let Some(index) = index {
                request = request.with_index(index);
            }
            if let Some(id) = id {
                request = request.with_document_id(id);
            }
            for (key, value) in &tags {
                request = request.with_tag(key, value);
            }
            if !steps.is_empty() {
                request = request.with_steps(steps);
            }
            for path in &files {
                let file = FileReference::from_path(path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?;
                request = request.with_file(file);
            }

            let run_id = memory.pipeline().import_document(request).await?;
            memory.pipeline().shutdown().await;
            tracing::info!(run_id = %run_id, "Import finished");
            print_json(&memory.pipeline().metrics())?;
        }
        Command::Status { document_id } => {
            let status = memory
                .pipeline()
                .read_pipeline_summary(index, &document_id)
                .await?
                .ok_or_else(|| anyhow!("document '{document_id}' is unknown"))?;
            print_json(&status)?;
        }
        Command::Search { tags, limit, query } => {
            let result = memory
                .search()
                .search(index, &query, &tag_filter(&tags), limit)
                .await?;
            print_json(&result)?;
        }
        Command::Ask { tags, question } => {
            let answer = memory
                .search()
                .ask(index, &question, &tag_filter(&tags))
                .await?;
            print_json(&answer)?;
        }
        Command::Resume => {
            let resumed = memory.pipeline().resume_pending().await?;
            memory.pipeline().shutdown().await;
            tracing::info!(runs = resumed.len(), "Resume finished");
            print_json(&resumed)?;
        }
    }

    Ok(())
}
