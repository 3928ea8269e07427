//! Append-only pipeline status log.
//!
//! Every orchestrator mutation is a [`StatusEvent`] appended to the log of one
//! `(index, document_id)` key. Reads fold the events of the most recent run into a
//! [`PipelineStatus`]; resume folds them into a [`RunCheckpoint`]. Appends for distinct keys take
//! distinct locks, appends for the same key are serialized, and nothing is ever rewritten in
//! place.

use crate::document::Document;
use crate::pipeline::artifacts::Artifacts;
use crate::pipeline::types::{
    PipelineState, PipelineStatus, RunId, StatusKey, StepOutcome, StepState,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Errors raised by status store implementations.
#[derive(Debug, Error)]
pub enum StatusStoreError {
    /// Underlying storage failed.
    #[error("Status store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// Event could not be encoded or decoded.
    #[error("Status event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One entry of a document's status log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// A new run was accepted; supersedes any earlier run for the key.
    Scheduled {
        /// Run identifier.
        run_id: RunId,
        /// Ordered step names.
        steps: Vec<String>,
        /// Document being imported, persisted for resume.
        document: Document,
        /// Event timestamp (RFC3339).
        at: String,
    },
    /// An attempt of a step started.
    StepStarted {
        /// Run identifier.
        run_id: RunId,
        /// 1-based step ordinal.
        ordinal: usize,
        /// 1-based attempt number.
        attempt: u32,
        /// Event timestamp (RFC3339).
        at: String,
    },
    /// A step finished; its artifacts are the run's checkpoint.
    StepCompleted {
        /// Run identifier.
        run_id: RunId,
        /// 1-based step ordinal.
        ordinal: usize,
        /// Artifacts produced by the step.
        artifacts: Artifacts,
        /// Event timestamp (RFC3339).
        at: String,
    },
    /// An attempt of a step failed.
    StepFailed {
        /// Run identifier.
        run_id: RunId,
        /// 1-based step ordinal.
        ordinal: usize,
        /// 1-based attempt number.
        attempt: u32,
        /// Failure description.
        error: String,
        /// Whether another attempt may follow.
        retryable: bool,
        /// Event timestamp (RFC3339).
        at: String,
    },
    /// Every step completed.
    RunCompleted {
        /// Run identifier.
        run_id: RunId,
        /// Event timestamp (RFC3339).
        at: String,
    },
    /// The run halted.
    RunFailed {
        /// Run identifier.
        run_id: RunId,
        /// Failure description.
        error: String,
        /// Whether the halt was requested by a caller.
        cancelled: bool,
        /// Event timestamp (RFC3339).
        at: String,
    },
}

impl StatusEvent {
    /// Run the event belongs to.
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::Scheduled { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepFailed { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. } => run_id,
        }
    }

    /// Timestamp of the event.
    pub fn at(&self) -> &str {
        match self {
            Self::Scheduled { at, .. }
            | Self::StepStarted { at, .. }
            | Self::StepCompleted { at, .. }
            | Self::StepFailed { at, .. }
            | Self::RunCompleted { at, .. }
            | Self::RunFailed { at, .. } => at,
        }
    }
}

/// Fold a key's log into the status of its most recent run.
///
/// Events that belong to older runs, or that arrive after the run became terminal, are
/// ignored, as are step starts that would move the run backwards.
pub fn fold_events(key: &StatusKey, events: &[StatusEvent]) -> Option<PipelineStatus> {
    let start = last_scheduled(events)?;
    let StatusEvent::Scheduled {
        run_id, steps, at, ..
    } = &events[start]
    else {
        return None;
    };

    let mut status = PipelineStatus {
        index: key.index.clone(),
        document_id: key.document_id.clone(),
        run_id: run_id.clone(),
        state: PipelineState::Scheduled,
        steps: steps
            .iter()
            .enumerate()
            .map(|(position, name)| StepOutcome {
                name: name.clone(),
                ordinal: position + 1,
                state: StepState::Pending,
                attempts: 0,
                last_error: None,
                completed_at: None,
            })
            .collect(),
        failure: None,
        cancelled: false,
        created_at: at.clone(),
        updated_at: at.clone(),
    };

    for event in &events[start + 1..] {
        if event.run_id() != run_id || status.state.is_terminal() {
            continue;
        }
        apply_event(&mut status, event);
    }

    Some(status)
}

fn apply_event(status: &mut PipelineStatus, event: &StatusEvent) {
    let current = match status.state {
        PipelineState::Running { step } => step,
        _ => 0,
    };

    match event {
        StatusEvent::Scheduled { .. } => return,
        StatusEvent::StepStarted {
            ordinal, attempt, ..
        } => {
            if *ordinal < current {
                return;
            }
            let Some(step) = step_mut(status, *ordinal) else {
                return;
            };
            if step.state == StepState::Completed {
                return;
            }
            step.state = StepState::Running;
            step.attempts = step.attempts.max(*attempt);
            status.state = PipelineState::Running { step: *ordinal };
        }
        StatusEvent::StepCompleted { ordinal, at, .. } => {
            let Some(step) = step_mut(status, *ordinal) else {
                return;
            };
            step.state = StepState::Completed;
            step.completed_at = Some(at.clone());
            step.attempts = step.attempts.max(1);
        }
        StatusEvent::StepFailed {
            ordinal,
            attempt,
            error,
            ..
        } => {
            let Some(step) = step_mut(status, *ordinal) else {
                return;
            };
            if step.state == StepState::Completed {
                return;
            }
            step.state = StepState::Failed;
            step.attempts = step.attempts.max(*attempt);
            step.last_error = Some(error.clone());
        }
        StatusEvent::RunCompleted { .. } => {
            status.state = PipelineState::Completed;
        }
        StatusEvent::RunFailed {
            error, cancelled, ..
        } => {
            status.state = PipelineState::Failed;
            status.failure = Some(error.clone());
            status.cancelled = *cancelled;
        }
    }
    status.updated_at = event.at().to_string();
}

fn step_mut(status: &mut PipelineStatus, ordinal: usize) -> Option<&mut StepOutcome> {
    ordinal
        .checked_sub(1)
        .and_then(|position| status.steps.get_mut(position))
}

/// Resumable position of a non-terminal run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCheckpoint {
    /// Run identifier.
    pub run_id: RunId,
    /// Document persisted when the run was scheduled.
    pub document: Document,
    /// Ordered step names.
    pub steps: Vec<String>,
    /// Number of leading steps recorded as completed.
    pub completed: usize,
    /// Artifacts of the last completed step.
    pub artifacts: Artifacts,
}

impl RunCheckpoint {
    /// Derive the checkpoint of the most recent run; `None` when there is no run or it is
    /// already terminal.
    pub fn from_events(events: &[StatusEvent]) -> Option<Self> {
        let start = last_scheduled(events)?;
        let StatusEvent::Scheduled {
            run_id,
            steps,
            document,
            ..
        } = &events[start]
        else {
            return None;
        };

        let mut checkpoint = Self {
            run_id: run_id.clone(),
            document: document.clone(),
            steps: steps.clone(),
            completed: 0,
            artifacts: Artifacts::default(),
        };

        for event in &events[start + 1..] {
            if event.run_id() != run_id {
                continue;
            }
            match event {
                StatusEvent::RunCompleted { .. } | StatusEvent::RunFailed { .. } => return None,
                StatusEvent::StepCompleted {
                    ordinal, artifacts, ..
                } if *ordinal == checkpoint.completed + 1 => {
                    checkpoint.completed = *ordinal;
                    checkpoint.artifacts = artifacts.clone();
                }
                _ => {}
            }
        }

        Some(checkpoint)
    }
}

/// Durable, keyed record of pipeline progress.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Append an event to the key's log.
    async fn append(&self, key: &StatusKey, event: StatusEvent) -> Result<(), StatusStoreError>;

    /// Return the key's full log in append order (empty when unknown).
    async fn events(&self, key: &StatusKey) -> Result<Vec<StatusEvent>, StatusStoreError>;

    /// Enumerate keys that have at least one event.
    async fn keys(&self) -> Result<Vec<StatusKey>, StatusStoreError>;

    /// Events of the key's most recent run, starting at its `Scheduled` event.
    ///
    /// Empty when the key is unknown or its log holds no `Scheduled` event.
    async fn current_run(&self, key: &StatusKey) -> Result<Vec<StatusEvent>, StatusStoreError> {
        let mut events = self.events(key).await?;
        Ok(match last_scheduled(&events) {
            Some(start) => events.split_off(start),
            None => Vec::new(),
        })
    }

    /// Folded status of the key's most recent run.
    async fn get(&self, key: &StatusKey) -> Result<Option<PipelineStatus>, StatusStoreError> {
        let events = self.current_run(key).await?;
        Ok(fold_events(key, &events))
    }
}

fn last_scheduled(events: &[StatusEvent]) -> Option<usize> {
    events
        .iter()
        .rposition(|event| matches!(event, StatusEvent::Scheduled { .. }))
}

/// Process-local status store.
#[derive(Default)]
pub struct InMemoryStatusStore {
    logs: RwLock<HashMap<StatusKey, Arc<Mutex<Vec<StatusEvent>>>>>,
}

impl InMemoryStatusStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, key: &StatusKey) -> Arc<Mutex<Vec<StatusEvent>>> {
        if let Some(log) = self
            .logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(log);
        }
        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(logs.entry(key.clone()).or_default())
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn append(&self, key: &StatusKey, event: StatusEvent) -> Result<(), StatusStoreError> {
        let log = self.log(key);
        log.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }

    async fn events(&self, key: &StatusKey) -> Result<Vec<StatusEvent>, StatusStoreError> {
        let log = self
            .logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        Ok(log
            .map(|log| log.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default())
    }

    async fn current_run(&self, key: &StatusKey) -> Result<Vec<StatusEvent>, StatusStoreError> {
        let Some(log) = self
            .logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
        else {
            return Ok(Vec::new());
        };
        let events = log.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(last_scheduled(&events)
            .map(|start| events[start..].to_vec())
            .unwrap_or_default())
    }

    async fn keys(&self) -> Result<Vec<StatusKey>, StatusStoreError> {
        let mut keys: Vec<StatusKey> = self
            .logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// JSON-lines status store: one `<root>/<index>/<document_id>.jsonl` file per key.
///
/// Each append is flushed with `sync_data` before returning, so a restarted process sees every
/// event the previous one acknowledged. A torn trailing line left by a crash is terminated
/// before the next append and skipped on read.
pub struct FileStatusStore {
    root: PathBuf,
    locks: Mutex<HashMap<StatusKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileStatusStore {
    /// Open (creating when needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StatusStoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        tracing::debug!(root = %root.display(), "Opened file status store");
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding the logs.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &StatusKey) -> PathBuf {
        self.root
            .join(&key.index)
            .join(format!("{}.jsonl", key.document_id))
    }

    /// Run `work` while holding the key's lock, then drop the lock entry if nobody else wants it.
    async fn with_key_lock<T>(&self, key: &StatusKey, work: impl Future<Output = T>) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let result = {
            let _guard = lock.lock().await;
            work.await
        };

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this call hold the entry; waiters cloned it under the map lock.
        let idle = locks.get(key).is_some_and(|current| {
            Arc::ptr_eq(current, &lock) && Arc::strong_count(&lock) == 2
        });
        if idle {
            locks.remove(key);
        }
        result
    }

    async fn append_line(
        &self,
        key: &StatusKey,
        mut line: Vec<u8>,
    ) -> Result<(), StatusStoreError> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await?;
        if ends_mid_line(&mut file).await? {
            tracing::warn!(key = %key, "Terminating torn status line before append");
            line.insert(0, b'\n');
        }
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn read_log(&self, key: &StatusKey) -> Result<String, StatusStoreError> {
        match tokio::fs::read_to_string(self.path(key)).await {
            Ok(content) => Ok(content),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(error) => Err(error.into()),
        }
    }
}

/// Whether the file's last byte is something other than a newline.
async fn ends_mid_line(file: &mut tokio::fs::File) -> std::io::Result<bool> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0_u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

fn parse_line(key: &StatusKey, line_number: usize, line: &str) -> Option<StatusEvent> {
    if line.trim().is_empty() {
        return None;
    }
    serde_json::from_str(line)
        .inspect_err(|error| {
            tracing::warn!(
                key = %key,
                line = line_number + 1,
                error = %error,
                "Skipping unreadable status event"
            );
        })
        .ok()
}

#[async_trait]
impl StatusStore for FileStatusStore {
    async fn append(&self, key: &StatusKey, event: StatusEvent) -> Result<(), StatusStoreError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        self.with_key_lock(key, self.append_line(key, line)).await
    }

    async fn events(&self, key: &StatusKey) -> Result<Vec<StatusEvent>, StatusStoreError> {
        let content = self.with_key_lock(key, self.read_log(key)).await?;
        Ok(content
            .lines()
            .enumerate()
            .filter_map(|(line_number, line)| parse_line(key, line_number, line))
            .collect())
    }

    async fn current_run(&self, key: &StatusKey) -> Result<Vec<StatusEvent>, StatusStoreError> {
        let content = self.with_key_lock(key, self.read_log(key)).await?;
        let lines: Vec<&str> = content.lines().collect();
        let mut run = Vec::new();
        for (line_number, line) in lines.iter().enumerate().rev() {
            let Some(event) = parse_line(key, line_number, line) else {
                continue;
            };
            let scheduled = matches!(event, StatusEvent::Scheduled { .. });
            run.push(event);
            if scheduled {
                run.reverse();
                return Ok(run);
            }
        }
        Ok(Vec::new())
    }

    async fn keys(&self) -> Result<Vec<StatusKey>, StatusStoreError> {
        let mut keys = Vec::new();
        let mut indexes = tokio::fs::read_dir(&self.root).await?;
        while let Some(index_entry) = indexes.next_entry().await? {
            if !index_entry.file_type().await?.is_dir() {
                continue;
            }
            let index = index_entry.file_name().to_string_lossy().into_owned();
            let mut documents = tokio::fs::read_dir(index_entry.path()).await?;
            while let Some(document_entry) = documents.next_entry().await? {
                let path = document_entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    keys.push(StatusKey::new(index.clone(), stem));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Current timestamp formatted for status events and payloads.
pub(crate) fn current_timestamp_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{FileReference, TagCollection};
    use crate::pipeline::artifacts::ExtractedFile;

    fn key() -> StatusKey {
        StatusKey::new("kb", "doc1")
    }

    fn document() -> Document {
        Document {
            id: "doc1".into(),
            tags: TagCollection::new(),
            files: vec![FileReference::new("a.txt", "hello")],
        }
    }

    fn scheduled(run_id: &RunId) -> StatusEvent {
        StatusEvent::Scheduled {
            run_id: run_id.clone(),
            steps: vec!["extract".into(), "partition".into()],
            document: document(),
            at: "2025-01-01T00:00:00Z".into(),
        }
    }

    fn started(run_id: &RunId, ordinal: usize, attempt: u32) -> StatusEvent {
        StatusEvent::StepStarted {
            run_id: run_id.clone(),
            ordinal,
            attempt,
            at: "2025-01-01T00:00:01Z".into(),
        }
    }

    fn completed(run_id: &RunId, ordinal: usize, text: &str) -> StatusEvent {
        StatusEvent::StepCompleted {
            run_id: run_id.clone(),
            ordinal,
            artifacts: Artifacts {
                files: vec![ExtractedFile {
                    name: "a.txt".into(),
                    mime_type: None,
                    text: text.into(),
                }],
                ..Artifacts::default()
            },
            at: "2025-01-01T00:00:02Z".into(),
        }
    }

    #[test]
    fn fold_tracks_running_step_and_completion() {
        let run = RunId::generate();
        let mut events = vec![scheduled(&run)];
        let status = fold_events(&key(), &events).expect("status");
        assert_eq!(status.state, PipelineState::Scheduled);

        events.push(started(&run, 1, 1));
        events.push(completed(&run, 1, "hello"));
        events.push(started(&run, 2, 1));
        let status = fold_events(&key(), &events).expect("status");
        assert_eq!(status.state, PipelineState::Running { step: 2 });
        assert_eq!(status.completed_steps(), vec!["extract"]);
        assert_eq!(status.remaining_steps(), vec!["partition"]);

        events.push(completed(&run, 2, "hello"));
        events.push(StatusEvent::RunCompleted {
            run_id: run.clone(),
            at: "2025-01-01T00:00:03Z".into(),
        });
        let status = fold_events(&key(), &events).expect("status");
        assert!(status.is_ready());
        assert_eq!(status.updated_at, "2025-01-01T00:00:03Z");
    }

    #[test]
    fn fold_never_regresses_terminal_state() {
        let run = RunId::generate();
        let events = vec![
            scheduled(&run),
            StatusEvent::RunFailed {
                run_id: run.clone(),
                error: "boom".into(),
                cancelled: false,
                at: "2025-01-01T00:00:01Z".into(),
            },
            started(&run, 1, 2),
            StatusEvent::RunCompleted {
                run_id: run.clone(),
                at: "2025-01-01T00:00:02Z".into(),
            },
        ];
        let status = fold_events(&key(), &events).expect("status");
        assert_eq!(status.state, PipelineState::Failed);
        assert_eq!(status.failure.as_deref(), Some("boom"));
    }

    #[test]
    fn fold_ignores_backwards_step_starts_and_stale_runs() {
        let old = RunId::generate();
        let run = RunId::generate();
        let events = vec![
            scheduled(&old),
            scheduled(&run),
            started(&run, 2, 1),
            started(&run, 1, 1),
            StatusEvent::RunCompleted {
                run_id: old.clone(),
                at: "2025-01-01T00:00:05Z".into(),
            },
        ];
        let status = fold_events(&key(), &events).expect("status");
        assert_eq!(status.run_id, run);
        assert_eq!(status.state, PipelineState::Running { step: 2 });
    }

    #[test]
    fn fold_records_failed_attempts() {
        let run = RunId::generate();
        let events = vec![
            scheduled(&run),
            started(&run, 1, 1),
            StatusEvent::StepFailed {
                run_id: run.clone(),
                ordinal: 1,
                attempt: 1,
                error: "backend down".into(),
                retryable: true,
                at: "2025-01-01T00:00:02Z".into(),
            },
            started(&run, 1, 2),
        ];
        let status = fold_events(&key(), &events).expect("status");
        let step = &status.steps[0];
        assert_eq!(step.attempts, 2);
        assert_eq!(step.state, StepState::Running);
        assert_eq!(step.last_error.as_deref(), Some("backend down"));
    }

    #[test]
    fn checkpoint_resumes_after_last_contiguous_completion() {
        let run = RunId::generate();
        let events = vec![
            scheduled(&run),
            started(&run, 1, 1),
            completed(&run, 1, "extracted"),
            started(&run, 2, 1),
        ];
        let checkpoint = RunCheckpoint::from_events(&events).expect("checkpoint");
        assert_eq!(checkpoint.completed, 1);
        assert_eq!(checkpoint.artifacts.files[0].text, "extracted");
        assert_eq!(checkpoint.document, document());
    }

    #[test]
    fn checkpoint_is_absent_for_terminal_runs() {
        let run = RunId::generate();
        let events = vec![
            scheduled(&run),
            StatusEvent::RunCompleted {
                run_id: run.clone(),
                at: "2025-01-01T00:00:01Z".into(),
            },
        ];
        assert!(RunCheckpoint::from_events(&events).is_none());
        assert!(RunCheckpoint::from_events(&[]).is_none());
    }

    #[tokio::test]
    async fn in_memory_store_appends_and_folds() {
        let store = InMemoryStatusStore::new();
        assert!(store.get(&key()).await.expect("get").is_none());

        let run = RunId::generate();
        store.append(&key(), scheduled(&run)).await.expect("append");
        store
            .append(&key(), started(&run, 1, 1))
            .await
            .expect("append");

        let status = store.get(&key()).await.expect("get").expect("status");
        assert_eq!(status.state, PipelineState::Running { step: 1 });
        assert_eq!(store.keys().await.expect("keys"), vec![key()]);
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let root = std::env::temp_dir().join(format!("status-store-{}", uuid::Uuid::new_v4()));
        let run = RunId::generate();
        {
            let store = FileStatusStore::open(&root).await.expect("open");
            store.append(&key(), scheduled(&run)).await.expect("append");
            store
                .append(&key(), completed(&run, 1, "hello"))
                .await
                .expect("append");
        }

        let reopened = FileStatusStore::open(&root).await.expect("reopen");
        assert_eq!(reopened.keys().await.expect("keys"), vec![key()]);
        let events = reopened.events(&key()).await.expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], scheduled(&run));

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn file_store_skips_torn_trailing_line() {
        let root = std::env::temp_dir().join(format!("status-store-{}", uuid::Uuid::new_v4()));
        let store = FileStatusStore::open(&root).await.expect("open");
        let run = RunId::generate();
        store.append(&key(), scheduled(&run)).await.expect("append");

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(root.join("kb").join("doc1.jsonl"))
            .await
            .expect("open log");
        file.write_all(b"{\"event\":\"step_sta").await.expect("write");
        drop(file);

        let status = store.get(&key()).await.expect("get").expect("status");
        assert_eq!(status.state, PipelineState::Scheduled);

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn file_store_appends_after_torn_trailing_line() {
        let root = std::env::temp_dir().join(format!("status-store-{}", uuid::Uuid::new_v4()));
        let store = FileStatusStore::open(&root).await.expect("open");
        let previous = RunId::generate();
        store
            .append(&key(), scheduled(&previous))
            .await
            .expect("append");

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(root.join("kb").join("doc1.jsonl"))
            .await
            .expect("open log");
        file.write_all(b"{\"event\":\"step_sta").await.expect("write");
        drop(file);

        let next = RunId::generate();
        store.append(&key(), scheduled(&next)).await.expect("append");
        store
            .append(&key(), started(&next, 1, 1))
            .await
            .expect("append");

        let status = store.get(&key()).await.expect("get").expect("status");
        assert_eq!(status.run_id, next);
        assert_eq!(status.state, PipelineState::Running { step: 1 });
        let events = store.events(&key()).await.expect("events");
        assert_eq!(
            events,
            vec![scheduled(&previous), scheduled(&next), started(&next, 1, 1)]
        );

        let reopened = FileStatusStore::open(&root).await.expect("reopen");
        let checkpoint = RunCheckpoint::from_events(
            &reopened.current_run(&key()).await.expect("current run"),
        )
        .expect("checkpoint");
        assert_eq!(checkpoint.run_id, next);

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn current_run_starts_at_the_latest_schedule() {
        let root = std::env::temp_dir().join(format!("status-store-{}", uuid::Uuid::new_v4()));
        let file_store = FileStatusStore::open(&root).await.expect("open");
        let memory_store = InMemoryStatusStore::new();
        let stores: [&dyn StatusStore; 2] = [&file_store, &memory_store];

        let first = RunId::generate();
        let second = RunId::generate();
        for store in stores {
            assert!(store.current_run(&key()).await.expect("empty").is_empty());
            for event in [
                scheduled(&first),
                completed(&first, 1, "old"),
                scheduled(&second),
                started(&second, 1, 1),
            ] {
                store.append(&key(), event).await.expect("append");
            }

            let run = store.current_run(&key()).await.expect("current run");
            assert_eq!(run, vec![scheduled(&second), started(&second, 1, 1)]);
            assert_eq!(store.events(&key()).await.expect("events").len(), 4);
            let status = store.get(&key()).await.expect("get").expect("status");
            assert_eq!(status.run_id, second);
        }

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn file_store_releases_idle_key_locks() {
        let root = std::env::temp_dir().join(format!("status-store-{}", uuid::Uuid::new_v4()));
        let store = Arc::new(FileStatusStore::open(&root).await.expect("open"));
        let run = RunId::generate();
        store.append(&key(), scheduled(&run)).await.expect("append");

        let writers: Vec<_> = (1..=8)
            .map(|attempt| {
                let store = Arc::clone(&store);
                let run = run.clone();
                tokio::spawn(async move {
                    store
                        .append(&key(), started(&run, 1, attempt))
                        .await
                        .expect("append");
                })
            })
            .collect();
        for writer in writers {
            writer.await.expect("join");
        }
        for document_id in ["doc2", "doc3"] {
            let other = StatusKey::new("kb", document_id);
            store.append(&other, scheduled(&run)).await.expect("append");
            store.get(&other).await.expect("get");
        }

        assert_eq!(store.events(&key()).await.expect("events").len(), 9);
        assert!(
            store
                .locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
        );

        tokio::fs::remove_dir_all(&root).await.ok();
    }
}
