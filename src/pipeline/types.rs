//! Core data types and error definitions for the ingestion pipeline.

use crate::error::ValidationError;
use crate::pipeline::status::StatusStoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Step list used when an import request does not name one.
pub const DEFAULT_STEPS: [&str; 4] = ["extract", "partition", "embed", "index"];

/// Identifier of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh random run identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `(index, document_id)` pair identifying one document's pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatusKey {
    /// Normalized index name.
    pub index: String,
    /// Document identifier.
    pub document_id: String,
}

impl StatusKey {
    /// Build a key from already-normalized parts.
    pub fn new(index: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            document_id: document_id.into(),
        }
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.document_id)
    }
}

/// Overall state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    /// No run has been recorded.
    Unknown,
    /// Run accepted, no step started yet.
    Scheduled,
    /// Step with the given 1-based ordinal is executing.
    Running {
        /// 1-based ordinal of the executing step.
        step: usize,
    },
    /// Every step completed.
    Completed,
    /// Run halted on a failure or cancellation.
    Failed,
}

impl PipelineState {
    /// Whether the run can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// State of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Not started yet.
    Pending,
    /// Currently executing (or interrupted mid-execution).
    Running,
    /// Finished and checkpointed.
    Completed,
    /// Last attempt failed.
    Failed,
}

/// Recorded outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Registered step name.
    pub name: String,
    /// 1-based position in the run.
    pub ordinal: usize,
    /// Current step state.
    pub state: StepState,
    /// Number of attempts started.
    pub attempts: u32,
    /// Error reported by the most recent failed attempt.
    pub last_error: Option<String>,
    /// Completion timestamp (RFC3339).
    pub completed_at: Option<String>,
}

/// Folded view of a document's most recent pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    /// Normalized index name.
    pub index: String,
    /// Document identifier.
    pub document_id: String,
    /// Identifier of the run this status describes.
    pub run_id: RunId,
    /// Overall run state.
    pub state: PipelineState,
    /// Per-step outcomes in execution order.
    pub steps: Vec<StepOutcome>,
    /// Failure detail once the run failed.
    pub failure: Option<String>,
    /// Whether the failure was caused by a cancellation request.
    pub cancelled: bool,
    /// Acceptance timestamp (RFC3339).
    pub created_at: String,
    /// Timestamp of the most recent event (RFC3339).
    pub updated_at: String,
}

impl PipelineStatus {
    /// A document is ready exactly when its latest run completed.
    pub fn is_ready(&self) -> bool {
        self.state == PipelineState::Completed
    }

    /// Names of the steps recorded as completed, in order.
    pub fn completed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|step| step.state == StepState::Completed)
            .map(|step| step.name.as_str())
            .collect()
    }

    /// Names of the steps that still have to run.
    pub fn remaining_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|step| step.state != StepState::Completed)
            .map(|step| step.name.as_str())
            .collect()
    }
}

/// How `import_document` executes accepted runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Drive the run inline and return once it is terminal.
    Synchronous,
    /// Enqueue the run for the worker pool and return once accepted.
    Queued,
}

/// Behavior when an import targets a document whose run is still active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Return the active run's identifier (waiting for it in synchronous mode).
    Join,
    /// Fail with [`PipelineError::RunInProgress`].
    Reject,
}

/// Behavior when an import targets a document whose last run completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReimportPolicy {
    /// Start a fresh run.
    Restart,
    /// Keep the completed run and return its identifier.
    Skip,
}

impl FromStr for ExecutionMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "synchronous" | "sync" => Ok(Self::Synchronous),
            "queued" | "queue" => Ok(Self::Queued),
            _ => Err(()),
        }
    }
}

impl FromStr for DuplicatePolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "join" => Ok(Self::Join),
            "reject" => Ok(Self::Reject),
            _ => Err(()),
        }
    }
}

impl FromStr for ReimportPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "restart" => Ok(Self::Restart),
            "skip" => Ok(Self::Skip),
            _ => Err(()),
        }
    }
}

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Index used when a request names none.
    pub default_index: String,
    /// Steps used when a request names none.
    pub default_steps: Vec<String>,
    /// Additional attempts granted to a failing step.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every further attempt.
    pub retry_base_delay: Duration,
    /// Upper bound on the retry delay.
    pub retry_max_delay: Duration,
    /// Timeout applied to each step attempt.
    pub step_timeout: Duration,
    /// Inline or queued execution.
    pub execution_mode: ExecutionMode,
    /// Worker pool size for queued execution.
    pub worker_count: usize,
    /// Bound on queued runs awaiting a worker.
    pub queue_capacity: usize,
    /// Same-document concurrency policy.
    pub duplicate_policy: DuplicatePolicy,
    /// Completed-document re-import policy.
    pub reimport_policy: ReimportPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            default_index: crate::index_name::DEFAULT_INDEX.to_string(),
            default_steps: DEFAULT_STEPS.iter().map(|step| step.to_string()).collect(),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(30),
            step_timeout: Duration::from_secs(300),
            execution_mode: ExecutionMode::Synchronous,
            worker_count: 4,
            queue_capacity: 64,
            duplicate_policy: DuplicatePolicy::Join,
            reimport_policy: ReimportPolicy::Restart,
        }
    }
}

impl PipelineSettings {
    /// Backoff applied after the given failed attempt (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

/// Errors surfaced synchronously by orchestrator operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Request was rejected before any work began.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Another run for the same document is active and the policy rejects duplicates.
    #[error("A pipeline run for '{key}' is already in progress ({run_id})")]
    RunInProgress {
        /// Document whose run is active.
        key: StatusKey,
        /// Identifier of the active run.
        run_id: RunId,
    },
    /// Status log could not be read or written.
    #[error("Pipeline status store failed: {0}")]
    Status(#[from] StatusStoreError),
    /// Worker queue no longer accepts work.
    #[error("Pipeline queue is closed")]
    QueueClosed,
}
