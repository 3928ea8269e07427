use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use semantic_memory::document::{Document, DocumentUploadRequest, FileReference, TagCollection};
use semantic_memory::pipeline::{
    Artifacts, DuplicatePolicy, ExecutionMode, FileStatusStore, InMemoryStatusStore,
    PipelineError, PipelineOrchestrator, PipelineSettings, PipelineState, RunId, StatusEvent,
    StatusKey, StatusStore, StepContext, StepExecutionError, StepExecutor, StepRegistry,
    StepState,
};
use tokio::sync::{Barrier, Notify};

/// Appends its name to the record list and counts invocations.
struct Mark {
    name: &'static str,
    calls: AtomicU32,
}

impl Mark {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepExecutor for Mark {
    async fn execute(
        &self,
        _context: &StepContext,
        mut input: Artifacts,
    ) -> Result<Artifacts, StepExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        input.records.push(self.name.to_string());
        Ok(input)
    }
}

/// Signals when it starts and blocks until released.
struct Gate {
    started: Notify,
    release: Notify,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl StepExecutor for Gate {
    async fn execute(
        &self,
        _context: &StepContext,
        input: Artifacts,
    ) -> Result<Artifacts, StepExecutionError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(input)
    }
}

struct Rendezvous(Barrier);

#[async_trait]
impl StepExecutor for Rendezvous {
    async fn execute(
        &self,
        _context: &StepContext,
        input: Artifacts,
    ) -> Result<Artifacts, StepExecutionError> {
        self.0.wait().await;
        Ok(input)
    }
}

struct Broken;

#[async_trait]
impl StepExecutor for Broken {
    async fn execute(
        &self,
        _context: &StepContext,
        _input: Artifacts,
    ) -> Result<Artifacts, StepExecutionError> {
        Err(StepExecutionError::Permanent("unsupported content".into()))
    }
}

struct Slow;

#[async_trait]
impl StepExecutor for Slow {
    async fn execute(
        &self,
        _context: &StepContext,
        input: Artifacts,
    ) -> Result<Artifacts, StepExecutionError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(input)
    }
}

/// Fails unless it receives the checkpoint of step `a`.
struct ExpectCheckpoint;

#[async_trait]
impl StepExecutor for ExpectCheckpoint {
    async fn execute(
        &self,
        _context: &StepContext,
        mut input: Artifacts,
    ) -> Result<Artifacts, StepExecutionError> {
        if input.records != ["a"] {
            return Err(StepExecutionError::Permanent(format!(
                "unexpected input {:?}",
                input.records
            )));
        }
        input.records.push("b".into());
        Ok(input)
    }
}

fn settings(steps: &[&str]) -> PipelineSettings {
    PipelineSettings {
        default_steps: steps.iter().map(|step| step.to_string()).collect(),
        retry_base_delay: Duration::from_millis(1),
        ..PipelineSettings::default()
    }
}

fn request(document_id: &str) -> DocumentUploadRequest {
    DocumentUploadRequest::new()
        .with_index("kb")
        .with_document_id(document_id)
        .with_file(FileReference::new("a.txt", "hello world"))
}

fn orchestrator(
    registry: StepRegistry,
    settings: PipelineSettings,
) -> Arc<PipelineOrchestrator> {
    Arc::new(
        PipelineOrchestrator::new(registry, Arc::new(InMemoryStatusStore::new()), settings)
            .expect("orchestrator"),
    )
}

#[tokio::test]
async fn statuses_progress_through_every_step() {
    let mut registry = StepRegistry::new();
    registry
        .register("a", Mark::new("a"))
        .register("b", Mark::new("b"));
    let orchestrator = orchestrator(registry, settings(&["a", "b"]));

    assert!(
        orchestrator
            .read_pipeline_summary(Some("kb"), "doc1")
            .await
            .expect("read")
            .is_none()
    );
    assert!(!orchestrator.is_document_ready(Some("kb"), "doc1").await.expect("ready"));

    orchestrator.import_document(request("doc1")).await.expect("import");

    let status = orchestrator
        .read_pipeline_summary(Some("kb"), "doc1")
        .await
        .expect("read")
        .expect("status");
    assert_eq!(status.state, PipelineState::Completed);
    assert!(status.steps.iter().all(|step| step.state == StepState::Completed));
    assert!(status.steps.iter().all(|step| step.attempts == 1));
    assert!(orchestrator.is_document_ready(Some(" KB "), "doc1").await.expect("ready"));
}

#[tokio::test]
async fn distinct_documents_run_concurrently() {
    let mut registry = StepRegistry::new();
    registry.register("meet", Arc::new(Rendezvous(Barrier::new(2))));
    let orchestrator = orchestrator(registry, settings(&["meet"]));

    // Each run blocks until the other reaches the same step; serialized runs would hang.
    let both = async {
        tokio::join!(
            orchestrator.import_document(request("doc1")),
            orchestrator.import_document(request("doc2")),
        )
    };
    let (first, second) = tokio::time::timeout(Duration::from_secs(5), both)
        .await
        .expect("runs overlapped");
    first.expect("doc1");
    second.expect("doc2");

    assert!(orchestrator.is_document_ready(Some("kb"), "doc1").await.expect("ready"));
    assert!(orchestrator.is_document_ready(Some("kb"), "doc2").await.expect("ready"));
}

#[tokio::test]
async fn duplicate_import_is_rejected_while_running() {
    let gate = Gate::new();
    let mut registry = StepRegistry::new();
    registry.register("gate", gate.clone());
    let settings = PipelineSettings {
        duplicate_policy: DuplicatePolicy::Reject,
        ..settings(&["gate"])
    };
    let orchestrator = orchestrator(registry, settings);

    let first = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.import_document(request("doc1")).await }
    });
    gate.started.notified().await;

    let error = orchestrator
        .import_document(request("doc1"))
        .await
        .unwrap_err();
    let PipelineError::RunInProgress { key, .. } = error else {
        panic!("expected RunInProgress, got {error:?}");
    };
    assert_eq!(key, StatusKey::new("kb", "doc1"));

    gate.release.notify_one();
    let run_id = first.await.expect("join").expect("import");
    let status = orchestrator
        .read_pipeline_summary(Some("kb"), "doc1")
        .await
        .expect("read")
        .expect("status");
    assert_eq!(status.run_id, run_id);
    assert!(status.is_ready());
}

#[tokio::test]
async fn duplicate_import_joins_active_run() {
    let gate = Gate::new();
    let mut registry = StepRegistry::new();
    registry.register("gate", gate.clone());
    let orchestrator = orchestrator(registry, settings(&["gate"]));

    let first = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.import_document(request("doc1")).await }
    });
    gate.started.notified().await;

    let (joined, ()) = tokio::join!(orchestrator.import_document(request("doc1")), async {
        tokio::task::yield_now().await;
        gate.release.notify_one();
    });
    let joined = joined.expect("join");
    let original = first.await.expect("task").expect("import");
    assert_eq!(joined, original);

    // The joined caller only returns once the shared run is terminal.
    let status = orchestrator
        .read_pipeline_summary(Some("kb"), "doc1")
        .await
        .expect("read")
        .expect("status");
    assert_eq!(status.state, PipelineState::Completed);
}

#[tokio::test]
async fn permanent_failure_stops_the_run() {
    let after = Mark::new("after");
    let mut registry = StepRegistry::new();
    registry
        .register("broken", Arc::new(Broken))
        .register("after", after.clone());
    let orchestrator = orchestrator(registry, settings(&["broken", "after"]));

    orchestrator.import_document(request("doc1")).await.expect("accepted");

    let status = orchestrator
        .read_pipeline_summary(Some("kb"), "doc1")
        .await
        .expect("read")
        .expect("status");
    assert_eq!(status.state, PipelineState::Failed);
    assert_eq!(status.steps[0].state, StepState::Failed);
    assert_eq!(status.steps[0].attempts, 1);
    assert_eq!(status.steps[1].state, StepState::Pending);
    assert!(status.failure.expect("failure").contains("unsupported content"));
    assert_eq!(after.calls(), 0);
    assert!(!orchestrator.is_document_ready(Some("kb"), "doc1").await.expect("ready"));
}

#[tokio::test]
async fn timed_out_attempts_are_retried_then_fail() {
    let mut registry = StepRegistry::new();
    registry.register("slow", Arc::new(Slow));
    let settings = PipelineSettings {
        step_timeout: Duration::from_millis(20),
        max_retries: 1,
        ..settings(&["slow"])
    };
    let orchestrator = orchestrator(registry, settings);

    orchestrator.import_document(request("doc1")).await.expect("accepted");

    let status = orchestrator
        .read_pipeline_summary(Some("kb"), "doc1")
        .await
        .expect("read")
        .expect("status");
    assert_eq!(status.state, PipelineState::Failed);
    assert_eq!(status.steps[0].attempts, 2);
    assert!(status.failure.expect("failure").contains("timed out"));
    assert_eq!(orchestrator.metrics().step_retries, 1);
}

#[tokio::test]
async fn cancellation_lets_the_current_step_finish() {
    let gate = Gate::new();
    let next = Mark::new("next");
    let mut registry = StepRegistry::new();
    registry
        .register("gate", gate.clone())
        .register("next", next.clone());
    let orchestrator = orchestrator(registry, settings(&["gate", "next"]));

    let run = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.import_document(request("doc1")).await }
    });
    gate.started.notified().await;

    assert!(orchestrator.cancel(Some("kb"), "doc1").await.expect("cancel"));
    gate.release.notify_one();
    run.await.expect("join").expect("import");

    let status = orchestrator
        .read_pipeline_summary(Some("kb"), "doc1")
        .await
        .expect("read")
        .expect("status");
    assert_eq!(status.state, PipelineState::Failed);
    assert!(status.cancelled);
    assert_eq!(status.steps[0].state, StepState::Completed);
    assert_eq!(status.steps[1].state, StepState::Pending);
    assert_eq!(next.calls(), 0);
    assert!(!orchestrator.cancel(Some("kb"), "doc1").await.expect("cancel"));
    assert_eq!(orchestrator.metrics().runs_cancelled, 1);
}

#[tokio::test]
async fn resume_skips_completed_steps() {
    let root = std::env::temp_dir().join(format!("pipeline-resume-{}", uuid::Uuid::new_v4()));
    let key = StatusKey::new("kb", "doc1");
    let run_id = RunId::generate();

    // Log left behind by a process that died while step 2 was running.
    {
        let store = FileStatusStore::open(&root).await.expect("open");
        let events = vec![
            StatusEvent::Scheduled {
                run_id: run_id.clone(),
                steps: vec!["a".into(), "b".into()],
                document: Document {
                    id: "doc1".into(),
                    tags: TagCollection::new(),
                    files: vec![FileReference::new("a.txt", "hello")],
                },
                at: "2025-01-01T00:00:00Z".into(),
            },
            StatusEvent::StepStarted {
                run_id: run_id.clone(),
                ordinal: 1,
                attempt: 1,
                at: "2025-01-01T00:00:01Z".into(),
            },
            StatusEvent::StepCompleted {
                run_id: run_id.clone(),
                ordinal: 1,
                artifacts: Artifacts {
                    records: vec!["a".into()],
                    ..Artifacts::default()
                },
                at: "2025-01-01T00:00:02Z".into(),
            },
            StatusEvent::StepStarted {
                run_id: run_id.clone(),
                ordinal: 2,
                attempt: 1,
                at: "2025-01-01T00:00:03Z".into(),
            },
        ];
        for event in events {
            store.append(&key, event).await.expect("append");
        }
    }

    let first = Mark::new("a");
    let mut registry = StepRegistry::new();
    registry
        .register("a", first.clone())
        .register("b", Arc::new(ExpectCheckpoint));
    let store = Arc::new(FileStatusStore::open(&root).await.expect("reopen"));
    let orchestrator =
        PipelineOrchestrator::new(registry, store, settings(&["a", "b"])).expect("orchestrator");

    let resumed = orchestrator.resume_pending().await.expect("resume");
    assert_eq!(resumed, vec![run_id.clone()]);
    assert_eq!(first.calls(), 0);

    let status = orchestrator
        .read_pipeline_summary(Some("kb"), "doc1")
        .await
        .expect("read")
        .expect("status");
    assert_eq!(status.run_id, run_id);
    assert_eq!(status.state, PipelineState::Completed);
    assert_eq!(status.steps[0].attempts, 1);
    assert_eq!(status.steps[1].state, StepState::Completed);

    // Terminal runs are not resumed again.
    assert!(orchestrator.resume_pending().await.expect("resume").is_empty());

    tokio::fs::remove_dir_all(&root).await.ok();
}

#[tokio::test]
async fn resume_fails_runs_with_unregistered_steps() {
    let store = Arc::new(InMemoryStatusStore::new());
    let key = StatusKey::new("kb", "doc1");
    store
        .append(
            &key,
            StatusEvent::Scheduled {
                run_id: RunId::generate(),
                steps: vec!["retired".into()],
                document: Document {
                    id: "doc1".into(),
                    tags: TagCollection::new(),
                    files: vec![FileReference::new("a.txt", "hello")],
                },
                at: "2025-01-01T00:00:00Z".into(),
            },
        )
        .await
        .expect("append");

    let mut registry = StepRegistry::new();
    registry.register("a", Mark::new("a"));
    let orchestrator =
        PipelineOrchestrator::new(registry, store.clone(), settings(&["a"])).expect("orchestrator");

    assert!(orchestrator.resume_pending().await.expect("resume").is_empty());
    let status = store.get(&key).await.expect("get").expect("status");
    assert_eq!(status.state, PipelineState::Failed);
    assert!(status.failure.expect("failure").contains("retired"));
}

#[tokio::test]
async fn queued_imports_complete_on_workers() {
    let mark = Mark::new("a");
    let mut registry = StepRegistry::new();
    registry.register("a", mark.clone());
    let settings = PipelineSettings {
        execution_mode: ExecutionMode::Queued,
        worker_count: 2,
        queue_capacity: 4,
        ..settings(&["a"])
    };
    let orchestrator = orchestrator(registry, settings);

    let mut run_ids = Vec::new();
    for document_id in ["doc1", "doc2", "doc3"] {
        run_ids.push(
            orchestrator
                .import_document(request(document_id))
                .await
                .expect("enqueued"),
        );
    }

    for (document_id, run_id) in ["doc1", "doc2", "doc3"].into_iter().zip(&run_ids) {
        let status = orchestrator
            .wait_for_run(Some("kb"), document_id)
            .await
            .expect("wait")
            .expect("status");
        assert_eq!(&status.run_id, run_id);
        assert!(status.is_ready());
    }
    assert_eq!(mark.calls(), 3);

    orchestrator.shutdown().await;
    let error = orchestrator
        .import_document(request("doc4"))
        .await
        .unwrap_err();
    assert!(matches!(error, PipelineError::QueueClosed));
    let status = orchestrator
        .read_pipeline_summary(Some("kb"), "doc4")
        .await
        .expect("read")
        .expect("status");
    assert_eq!(status.state, PipelineState::Failed);
}

#[tokio::test]
async fn invalid_requests_leave_no_status() {
    let mut registry = StepRegistry::new();
    registry.register("a", Mark::new("a"));
    let orchestrator = orchestrator(registry, settings(&["a"]));

    let bad_index = request("doc1").with_index("not valid!");
    assert!(matches!(
        orchestrator.import_document(bad_index).await,
        Err(PipelineError::Validation(_))
    ));

    let reserved_tag = request("doc1").with_tag("__document_id", "spoofed");
    assert!(matches!(
        orchestrator.import_document(reserved_tag).await,
        Err(PipelineError::Validation(_))
    ));

    let no_files = DocumentUploadRequest::new()
        .with_index("kb")
        .with_document_id("doc1");
    assert!(matches!(
        orchestrator.import_document(no_files).await,
        Err(PipelineError::Validation(_))
    ));

    assert!(
        orchestrator
            .read_pipeline_summary(Some("kb"), "doc1")
            .await
            .expect("read")
            .is_none()
    );
}
