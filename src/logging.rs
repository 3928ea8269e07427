//! Tracing setup for the CLI.
//!
//! Events go to stderr in compact form so stdout only carries command output. A second,
//! ANSI-free layer writes to `SEMANTIC_MEMORY_LOG_FILE` when set, or to a daily file under
//! `logs/`. Pipeline events carry `index`, `document_id`, `run_id`, `step` and `attempt` fields.
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_FILE_ENV: &str = "SEMANTIC_MEMORY_LOG_FILE";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_PREFIX: &str = "semantic-memory.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. `RUST_LOG` controls filtering and defaults to `info`.
///
/// Logging to a file is best effort: when the file cannot be opened only stderr is used.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = file_writer().map(|writer| {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .compact()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(file_layer)
        .init();
}

fn file_writer() -> Option<NonBlocking> {
    let (directory, prefix, rotation) = match std::env::var(LOG_FILE_ENV) {
        Ok(path) => {
            let path = PathBuf::from(path);
            let prefix = path.file_name()?.to_string_lossy().into_owned();
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
            (directory, prefix, Rotation::NEVER)
        }
        Err(_) => (
            PathBuf::from(DEFAULT_LOG_DIR),
            DEFAULT_LOG_PREFIX.to_string(),
            Rotation::DAILY,
        ),
    };

    let appender = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(prefix)
        .build(&directory);
    match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            // Keeps the background writer flushing until the process exits.
            let _ = FILE_GUARD.set(guard);
            Some(writer)
        }
        Err(err) => {
            eprintln!("File logging disabled ({}): {err}", directory.display());
            None
        }
    }
}
