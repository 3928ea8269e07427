//! Pipeline orchestrator: admission, sequential step execution, retries and resume.
//!
//! Every accepted import becomes a run keyed by `(index, document_id)`. At most one run per key
//! is active at any time; the active-run table is a short critical section and is never held
//! across a step. Runs for different keys proceed independently, either inline on the caller's
//! task ([`ExecutionMode::Synchronous`]) or on a fixed worker pool fed by a bounded queue
//! ([`ExecutionMode::Queued`]).
//!
//! Each state change is appended to the [`StatusStore`] before the next one happens, so the
//! log always reflects the last completed step. A run interrupted by a crash (or by the caller
//! dropping a synchronous import) stays non-terminal and is picked up by
//! [`PipelineOrchestrator::resume_pending`], which restarts after the last completed step with
//! that step's checkpointed artifacts.

use crate::document::{Document, DocumentUploadRequest};
use crate::error::ConfigurationError;
use crate::index_name::{normalize_index_name, validate_document_id};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::pipeline::artifacts::Artifacts;
use crate::pipeline::status::{
    RunCheckpoint, StatusEvent, StatusStore, current_timestamp_rfc3339,
};
use crate::pipeline::step::{Step, StepContext, StepExecutionError, StepRegistry};
use crate::pipeline::types::{
    DuplicatePolicy, ExecutionMode, PipelineError, PipelineSettings, PipelineStatus,
    ReimportPolicy, RunId, StatusKey,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Abstraction over the ingestion pipeline used by outer surfaces.
#[async_trait]
pub trait PipelineApi: Send + Sync {
    /// Validate the request, record a new run and execute (or enqueue) it.
    async fn import_document(&self, request: DocumentUploadRequest)
    -> Result<RunId, PipelineError>;

    /// Whether the document's latest run completed.
    async fn is_document_ready(
        &self,
        index: Option<&str>,
        document_id: &str,
    ) -> Result<bool, PipelineError>;

    /// Folded status of the document's latest run; `None` when the document is unknown.
    async fn read_pipeline_summary(
        &self,
        index: Option<&str>,
        document_id: &str,
    ) -> Result<Option<PipelineStatus>, PipelineError>;

    /// Request cancellation of the document's active run; `false` when none is active.
    async fn cancel(&self, index: Option<&str>, document_id: &str) -> Result<bool, PipelineError>;
}

#[derive(Clone)]
struct ActiveRun {
    run_id: RunId,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct Inner {
    registry: StepRegistry,
    store: Arc<dyn StatusStore>,
    settings: PipelineSettings,
    active: Mutex<HashMap<StatusKey, ActiveRun>>,
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    metrics: PipelineMetrics,
}

/// Holds a key's slot in the active-run table; releasing it wakes joined callers.
struct RunGuard {
    inner: Arc<Inner>,
    key: StatusKey,
    run_id: RunId,
    done: watch::Sender<bool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        {
            let mut active = lock(&self.inner.active);
            if active
                .get(&self.key)
                .is_some_and(|run| run.run_id == self.run_id)
            {
                active.remove(&self.key);
            }
        }
        self.done.send_replace(true);
    }
}

struct Job {
    key: StatusKey,
    run_id: RunId,
    document: Arc<Document>,
    steps: Vec<Step>,
    completed: usize,
    artifacts: Artifacts,
    cancel: CancellationToken,
    guard: RunGuard,
}

struct RunFailure {
    message: String,
    cancelled: bool,
}

impl RunFailure {
    fn cancelled(step: &str) -> Self {
        Self {
            message: format!("run cancelled before step '{step}' completed"),
            cancelled: true,
        }
    }
}

/// Drives document imports through registered steps.
///
/// Construct once and share behind an `Arc`. In queued mode the worker pool is spawned on the
/// current Tokio runtime by [`PipelineOrchestrator::new`].
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

impl PipelineOrchestrator {
    /// Build an orchestrator, validating that the default step list resolves.
    pub fn new(
        registry: StepRegistry,
        store: Arc<dyn StatusStore>,
        settings: PipelineSettings,
    ) -> Result<Self, ConfigurationError> {
        registry
            .resolve(&settings.default_steps)
            .map_err(|error| ConfigurationError::Invalid(format!("default pipeline: {error}")))?;
        if settings.execution_mode == ExecutionMode::Queued
            && (settings.worker_count == 0 || settings.queue_capacity == 0)
        {
            return Err(ConfigurationError::Invalid(
                "queued execution needs at least one worker and a non-zero queue".into(),
            ));
        }

        let (sender, receiver) = match settings.execution_mode {
            ExecutionMode::Queued => {
                let (sender, receiver) = mpsc::channel(settings.queue_capacity);
                (Some(sender), Some(receiver))
            }
            ExecutionMode::Synchronous => (None, None),
        };

        let inner = Arc::new(Inner {
            registry,
            store,
            settings,
            active: Mutex::new(HashMap::new()),
            queue: Mutex::new(sender),
            workers: Mutex::new(Vec::new()),
            metrics: PipelineMetrics::new(),
        });

        if let Some(receiver) = receiver {
            let handles = spawn_workers(&inner, receiver);
            *lock(&inner.workers) = handles;
        }

        tracing::info!(
            mode = ?inner.settings.execution_mode,
            workers = inner.settings.worker_count,
            steps = ?inner.registry.names(),
            "Pipeline orchestrator ready"
        );
        Ok(Self { inner })
    }

    /// Settings the orchestrator was built with.
    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    /// Current pipeline counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Validate and run an import; see [`PipelineApi::import_document`].
    ///
    /// In synchronous mode this returns once the run is terminal; in queued mode once the run is
    /// recorded and enqueued (waiting for queue capacity when the queue is full).
    pub async fn import_document(
        &self,
        mut request: DocumentUploadRequest,
    ) -> Result<RunId, PipelineError> {
        let inner = &self.inner;
        let index =
            normalize_index_name(request.index.take().as_deref(), &inner.settings.default_index)?;
        let (document, steps) = request.into_document()?;
        let step_names = steps.unwrap_or_else(|| inner.settings.default_steps.clone());
        let steps = inner.registry.resolve(&step_names)?;
        let key = StatusKey::new(index, document.id.clone());

        if inner.settings.reimport_policy == ReimportPolicy::Skip
            && let Some(status) = inner.store.get(&key).await?
            && status.is_ready()
        {
            tracing::info!(
                index = %key.index,
                document_id = %key.document_id,
                run_id = %status.run_id,
                "Document already imported; skipping"
            );
            return Ok(status.run_id);
        }

        let run_id = RunId::generate();
        let (cancel, guard) = match admit(inner, &key, &run_id) {
            Ok(slot) => slot,
            Err(active) => return self.join_or_reject(key, active).await,
        };

        inner
            .store
            .append(
                &key,
                StatusEvent::Scheduled {
                    run_id: run_id.clone(),
                    steps: steps.iter().map(|step| step.name.clone()).collect(),
                    document: document.clone(),
                    at: current_timestamp_rfc3339(),
                },
            )
            .await?;
        tracing::info!(
            index = %key.index,
            document_id = %key.document_id,
            run_id = %run_id,
            steps = steps.len(),
            "Pipeline run scheduled"
        );

        self.dispatch(Job {
            key,
            run_id: run_id.clone(),
            document: Arc::new(document),
            steps,
            completed: 0,
            artifacts: Artifacts::default(),
            cancel,
            guard,
        })
        .await?;
        Ok(run_id)
    }

    /// Whether the document's latest run completed.
    pub async fn is_document_ready(
        &self,
        index: Option<&str>,
        document_id: &str,
    ) -> Result<bool, PipelineError> {
        Ok(self
            .read_pipeline_summary(index, document_id)
            .await?
            .is_some_and(|status| status.is_ready()))
    }

    /// Folded status of the document's latest run.
    pub async fn read_pipeline_summary(
        &self,
        index: Option<&str>,
        document_id: &str,
    ) -> Result<Option<PipelineStatus>, PipelineError> {
        let key = self.key(index, document_id)?;
        Ok(self.inner.store.get(&key).await?)
    }

    /// Request cancellation of the document's active run.
    ///
    /// The running step finishes and is recorded; the run then fails with `cancelled = true`
    /// instead of starting the next step or the next retry.
    pub async fn cancel(
        &self,
        index: Option<&str>,
        document_id: &str,
    ) -> Result<bool, PipelineError> {
        let key = self.key(index, document_id)?;
        let active = lock(&self.inner.active).get(&key).cloned();
        match active {
            Some(run) => {
                run.cancel.cancel();
                tracing::info!(
                    index = %key.index,
                    document_id = %key.document_id,
                    run_id = %run.run_id,
                    "Pipeline run cancellation requested"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Wait for the document's active run (if any) and return the resulting status.
    pub async fn wait_for_run(
        &self,
        index: Option<&str>,
        document_id: &str,
    ) -> Result<Option<PipelineStatus>, PipelineError> {
        let key = self.key(index, document_id)?;
        let active = lock(&self.inner.active).get(&key).cloned();
        if let Some(run) = active {
            wait_until_done(run.done).await;
        }
        Ok(self.inner.store.get(&key).await?)
    }

    /// Resume every non-terminal run found in the status store.
    ///
    /// Completed steps are not executed again; each run restarts after its last completed
    /// step. Runs whose steps are no longer registered are marked failed. Returns the
    /// identifiers of the resumed runs.
    pub async fn resume_pending(&self) -> Result<Vec<RunId>, PipelineError> {
        let inner = &self.inner;
        let mut jobs = Vec::new();

        for key in inner.store.keys().await? {
            let events = inner.store.current_run(&key).await?;
            let Some(checkpoint) = RunCheckpoint::from_events(&events) else {
                continue;
            };

            let steps = match inner.registry.resolve(&checkpoint.steps) {
                Ok(steps) => steps,
                Err(error) => {
                    tracing::warn!(
                        index = %key.index,
                        document_id = %key.document_id,
                        run_id = %checkpoint.run_id,
                        error = %error,
                        "Cannot resume pipeline run"
                    );
                    record_abandoned(
                        inner,
                        &key,
                        &checkpoint.run_id,
                        format!("cannot resume: {error}"),
                    )
                    .await;
                    continue;
                }
            };

            let Ok((cancel, guard)) = admit(inner, &key, &checkpoint.run_id) else {
                tracing::debug!(key = %key, "Run already active; not resuming");
                continue;
            };

            tracing::info!(
                index = %key.index,
                document_id = %key.document_id,
                run_id = %checkpoint.run_id,
                completed_steps = checkpoint.completed,
                total_steps = steps.len(),
                "Resuming pipeline run"
            );
            jobs.push(Job {
                key,
                run_id: checkpoint.run_id,
                document: Arc::new(checkpoint.document),
                steps,
                completed: checkpoint.completed,
                artifacts: checkpoint.artifacts,
                cancel,
                guard,
            });
        }

        let resumed: Vec<RunId> = jobs.iter().map(|job| job.run_id.clone()).collect();
        match inner.settings.execution_mode {
            ExecutionMode::Synchronous => {
                join_all(jobs.into_iter().map(|job| execute_run(Arc::clone(inner), job))).await;
            }
            ExecutionMode::Queued => {
                for job in jobs {
                    self.dispatch(job).await?;
                }
            }
        }
        Ok(resumed)
    }

    /// Stop accepting queued work and wait for the workers to drain the queue.
    pub async fn shutdown(&self) {
        let sender = lock(&self.inner.queue).take();
        drop(sender);
        let workers = std::mem::take(&mut *lock(&self.inner.workers));
        for result in join_all(workers).await {
            if let Err(error) = result {
                tracing::error!(error = %error, "Pipeline worker terminated abnormally");
            }
        }
        tracing::info!("Pipeline orchestrator shut down");
    }

    fn key(&self, index: Option<&str>, document_id: &str) -> Result<StatusKey, PipelineError> {
        let index = normalize_index_name(index, &self.inner.settings.default_index)?;
        let document_id = document_id.trim();
        validate_document_id(document_id)?;
        Ok(StatusKey::new(index, document_id))
    }

    async fn join_or_reject(
        &self,
        key: StatusKey,
        active: ActiveRun,
    ) -> Result<RunId, PipelineError> {
        match self.inner.settings.duplicate_policy {
            DuplicatePolicy::Reject => {
                tracing::warn!(
                    index = %key.index,
                    document_id = %key.document_id,
                    run_id = %active.run_id,
                    "Rejecting import while a run is in progress"
                );
                Err(PipelineError::RunInProgress {
                    key,
                    run_id: active.run_id,
                })
            }
            DuplicatePolicy::Join => {
                tracing::info!(
                    index = %key.index,
                    document_id = %key.document_id,
                    run_id = %active.run_id,
                    "Joining in-flight pipeline run"
                );
                if self.inner.settings.execution_mode == ExecutionMode::Synchronous {
                    wait_until_done(active.done).await;
                }
                Ok(active.run_id)
            }
        }
    }

    async fn dispatch(&self, job: Job) -> Result<(), PipelineError> {
        match self.inner.settings.execution_mode {
            ExecutionMode::Synchronous => {
                execute_run(Arc::clone(&self.inner), job).await;
                Ok(())
            }
            ExecutionMode::Queued => {
                let sender = lock(&self.inner.queue).clone();
                let rejected = match sender {
                    Some(sender) => match sender.send(job).await {
                        Ok(()) => return Ok(()),
                        Err(mpsc::error::SendError(job)) => job,
                    },
                    None => job,
                };
                record_abandoned(
                    &self.inner,
                    &rejected.key,
                    &rejected.run_id,
                    "pipeline queue is closed".into(),
                )
                .await;
                Err(PipelineError::QueueClosed)
            }
        }
    }
}

impl Drop for PipelineOrchestrator {
    fn drop(&mut self) {
        // Closing the queue lets idle workers exit and release the shared state.
        lock(&self.inner.queue).take();
    }
}

#[async_trait]
impl PipelineApi for PipelineOrchestrator {
    async fn import_document(
        &self,
        request: DocumentUploadRequest,
    ) -> Result<RunId, PipelineError> {
        PipelineOrchestrator::import_document(self, request).await
    }

    async fn is_document_ready(
        &self,
        index: Option<&str>,
        document_id: &str,
    ) -> Result<bool, PipelineError> {
        PipelineOrchestrator::is_document_ready(self, index, document_id).await
    }

    async fn read_pipeline_summary(
        &self,
        index: Option<&str>,
        document_id: &str,
    ) -> Result<Option<PipelineStatus>, PipelineError> {
        PipelineOrchestrator::read_pipeline_summary(self, index, document_id).await
    }

    async fn cancel(&self, index: Option<&str>, document_id: &str) -> Result<bool, PipelineError> {
        PipelineOrchestrator::cancel(self, index, document_id).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Claim the key's slot, or return the run currently holding it.
fn admit(
    inner: &Arc<Inner>,
    key: &StatusKey,
    run_id: &RunId,
) -> Result<(CancellationToken, RunGuard), ActiveRun> {
    let mut active = lock(&inner.active);
    if let Some(run) = active.get(key) {
        return Err(run.clone());
    }

    let cancel = CancellationToken::new();
    let (done_tx, done_rx) = watch::channel(false);
    active.insert(
        key.clone(),
        ActiveRun {
            run_id: run_id.clone(),
            cancel: cancel.clone(),
            done: done_rx,
        },
    );
    Ok((
        cancel,
        RunGuard {
            inner: Arc::clone(inner),
            key: key.clone(),
            run_id: run_id.clone(),
            done: done_tx,
        },
    ))
}

async fn wait_until_done(mut done: watch::Receiver<bool>) {
    // An error means the guard is gone, which also marks the run as finished.
    let _ = done.wait_for(|finished| *finished).await;
}

fn spawn_workers(inner: &Arc<Inner>, receiver: mpsc::Receiver<Job>) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
    (0..inner.settings.worker_count)
        .map(|worker| {
            let inner = Arc::clone(inner);
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move {
                loop {
                    let job = receiver.lock().await.recv().await;
                    let Some(job) = job else {
                        break;
                    };
                    execute_run(Arc::clone(&inner), job).await;
                }
                tracing::debug!(worker, "Pipeline worker stopped");
            })
        })
        .collect()
}

async fn record_abandoned(inner: &Inner, key: &StatusKey, run_id: &RunId, error: String) {
    inner.metrics.record_run_failed(false);
    let event = StatusEvent::RunFailed {
        run_id: run_id.clone(),
        error,
        cancelled: false,
        at: current_timestamp_rfc3339(),
    };
    if let Err(error) = inner.store.append(key, event).await {
        tracing::error!(key = %key, error = %error, "Failed to record abandoned run");
    }
}

async fn execute_run(inner: Arc<Inner>, job: Job) {
    let Job {
        key,
        run_id,
        document,
        steps,
        completed,
        artifacts,
        cancel,
        guard,
    } = job;
    inner.metrics.record_run_started();

    let outcome = drive_steps(
        &inner, &key, &run_id, &document, &steps, completed, artifacts, &cancel,
    )
    .await;

    let event = match outcome {
        Ok(artifacts) => {
            inner
                .metrics
                .record_run_completed(artifacts.records.len() as u64);
            tracing::info!(
                index = %key.index,
                document_id = %key.document_id,
                run_id = %run_id,
                records = artifacts.records.len(),
                "Pipeline run completed"
            );
            StatusEvent::RunCompleted {
                run_id: run_id.clone(),
                at: current_timestamp_rfc3339(),
            }
        }
        Err(failure) => {
            inner.metrics.record_run_failed(failure.cancelled);
            tracing::warn!(
                index = %key.index,
                document_id = %key.document_id,
                run_id = %run_id,
                cancelled = failure.cancelled,
                error = %failure.message,
                "Pipeline run failed"
            );
            StatusEvent::RunFailed {
                run_id: run_id.clone(),
                error: failure.message,
                cancelled: failure.cancelled,
                at: current_timestamp_rfc3339(),
            }
        }
    };

    if let Err(error) = inner.store.append(&key, event).await {
        tracing::error!(
            index = %key.index,
            document_id = %key.document_id,
            run_id = %run_id,
            error = %error,
            "Failed to persist terminal pipeline state"
        );
    }
    drop(guard);
}

#[allow(clippy::too_many_arguments)]
async fn drive_steps(
    inner: &Inner,
    key: &StatusKey,
    run_id: &RunId,
    document: &Arc<Document>,
    steps: &[Step],
    completed: usize,
    mut artifacts: Artifacts,
    cancel: &CancellationToken,
) -> Result<Artifacts, RunFailure> {
    for step in steps.iter().skip(completed) {
        if cancel.is_cancelled() {
            return Err(RunFailure::cancelled(&step.name));
        }
        artifacts = run_step(inner, key, run_id, document, step, artifacts, cancel).await?;
    }
    Ok(artifacts)
}

async fn run_step(
    inner: &Inner,
    key: &StatusKey,
    run_id: &RunId,
    document: &Arc<Document>,
    step: &Step,
    input: Artifacts,
    cancel: &CancellationToken,
) -> Result<Artifacts, RunFailure> {
    let settings = &inner.settings;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        persist(
            inner,
            key,
            StatusEvent::StepStarted {
                run_id: run_id.clone(),
                ordinal: step.ordinal,
                attempt,
                at: current_timestamp_rfc3339(),
            },
        )
        .await?;
        tracing::debug!(
            index = %key.index,
            document_id = %key.document_id,
            run_id = %run_id,
            step = %step.name,
            attempt,
            "Step attempt started"
        );

        let context = StepContext {
            index: key.index.clone(),
            document: Arc::clone(document),
            step_name: step.name.clone(),
            ordinal: step.ordinal,
            attempt,
        };
        let result = tokio::time::timeout(
            settings.step_timeout,
            step.executor.execute(&context, input.clone()),
        )
        .await
        .unwrap_or(Err(StepExecutionError::Timeout(settings.step_timeout)));

        let error = match result {
            Ok(output) => {
                persist(
                    inner,
                    key,
                    StatusEvent::StepCompleted {
                        run_id: run_id.clone(),
                        ordinal: step.ordinal,
                        artifacts: output.clone(),
                        at: current_timestamp_rfc3339(),
                    },
                )
                .await?;
                inner.metrics.record_step_completed();
                tracing::debug!(
                    index = %key.index,
                    document_id = %key.document_id,
                    run_id = %run_id,
                    step = %step.name,
                    attempt,
                    "Step completed"
                );
                return Ok(output);
            }
            Err(error) => error,
        };

        let retryable = error.is_retryable() && attempt <= settings.max_retries;
        persist(
            inner,
            key,
            StatusEvent::StepFailed {
                run_id: run_id.clone(),
                ordinal: step.ordinal,
                attempt,
                error: error.to_string(),
                retryable,
                at: current_timestamp_rfc3339(),
            },
        )
        .await?;

        if !retryable {
            return Err(RunFailure {
                message: format!(
                    "step '{}' failed after {attempt} attempt(s): {error}",
                    step.name
                ),
                cancelled: false,
            });
        }

        inner.metrics.record_step_retry();
        let delay = settings.retry_delay(attempt);
        tracing::warn!(
            index = %key.index,
            document_id = %key.document_id,
            run_id = %run_id,
            step = %step.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Step attempt failed; retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(RunFailure::cancelled(&step.name)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn persist(inner: &Inner, key: &StatusKey, event: StatusEvent) -> Result<(), RunFailure> {
    inner
        .store
        .append(key, event)
        .await
        .map_err(|error| RunFailure {
            message: format!("status store failed: {error}"),
            cancelled: false,
        })
}
