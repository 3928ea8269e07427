//! Document ingestion pipeline: status log, step registry, built-in steps and orchestrator.

pub mod artifacts;
pub mod orchestrator;
pub mod status;
pub mod step;
pub mod steps;
pub mod types;

pub use artifacts::{Artifacts, ExtractedFile, Partition};
pub use orchestrator::{PipelineApi, PipelineOrchestrator};
pub use status::{
    FileStatusStore, InMemoryStatusStore, RunCheckpoint, StatusEvent, StatusStore,
    StatusStoreError, fold_events,
};
pub use step::{Step, StepContext, StepExecutionError, StepExecutor, StepRegistry};
pub use types::{
    DEFAULT_STEPS, DuplicatePolicy, ExecutionMode, PipelineError, PipelineSettings,
    PipelineState, PipelineStatus, ReimportPolicy, RunId, StatusKey, StepOutcome, StepState,
};
