//! Step executor capability and the name-based registry that resolves it.

use crate::document::Document;
use crate::error::ValidationError;
use crate::pipeline::artifacts::Artifacts;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepExecutionError {
    /// Failure that may succeed when retried (backend unavailable, throttling, I/O).
    #[error("transient failure: {0}")]
    Transient(String),
    /// Failure that will repeat on every attempt (malformed input, unsupported content).
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// Attempt exceeded the per-step timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl StepExecutionError {
    /// Whether another attempt may be made.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// Read-only view of the run handed to each step attempt.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Normalized index name.
    pub index: String,
    /// Document being imported.
    pub document: Arc<Document>,
    /// Registered step name.
    pub step_name: String,
    /// 1-based step ordinal.
    pub ordinal: usize,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// One named processing phase.
///
/// Implementations must be idempotent: running an already completed step again with the same
/// input has to produce equivalent artifacts and leave external stores in an equivalent state.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Transform the previous step's artifacts into this step's artifacts.
    async fn execute(
        &self,
        context: &StepContext,
        input: Artifacts,
    ) -> Result<Artifacts, StepExecutionError>;
}

/// Step resolved for a particular run.
#[derive(Clone)]
pub struct Step {
    /// Registered name.
    pub name: String,
    /// 1-based position in the run.
    pub ordinal: usize,
    /// Executor implementing the step.
    pub executor: Arc<dyn StepExecutor>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("ordinal", &self.ordinal)
            .finish_non_exhaustive()
    }
}

/// Name-keyed table of step executors.
#[derive(Clone, Default)]
pub struct StepRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executor for `name`.
    pub fn register(&mut self, name: &str, executor: Arc<dyn StepExecutor>) -> &mut Self {
        let name = normalize_step_name(name);
        if self.executors.insert(name.clone(), executor).is_some() {
            tracing::debug!(step = %name, "Replaced registered step executor");
        }
        self
    }

    /// Whether a step with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(&normalize_step_name(name))
    }

    /// Registered step names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve an ordered list of step names into executable steps.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Step>, ValidationError> {
        if names.is_empty() {
            return Err(ValidationError::EmptyStepList);
        }
        names
            .iter()
            .enumerate()
            .map(|(position, name)| {
                let name = normalize_step_name(name.as_ref());
                let executor = self
                    .executors
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| ValidationError::UnknownStep(name.clone()))?;
                Ok(Step {
                    name,
                    ordinal: position + 1,
                    executor,
                })
            })
            .collect()
    }
}

fn normalize_step_name(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Identity;

    #[async_trait]
    impl StepExecutor for Identity {
        async fn execute(
            &self,
            _context: &StepContext,
            input: Artifacts,
        ) -> Result<Artifacts, StepExecutionError> {
            Ok(input)
        }
    }

    fn registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry
            .register("extract", Arc::new(Identity))
            .register(" Partition ", Arc::new(Identity));
        registry
    }

    #[test]
    fn resolve_preserves_request_order_and_assigns_ordinals() {
        let steps = registry()
            .resolve(&["partition", "EXTRACT"])
            .expect("steps resolve");
        let names: Vec<_> = steps.iter().map(|step| step.name.as_str()).collect();
        assert_eq!(names, vec!["partition", "extract"]);
        assert_eq!(steps[0].ordinal, 1);
        assert_eq!(steps[1].ordinal, 2);
    }

    #[test]
    fn resolve_rejects_unknown_and_empty_lists() {
        let registry = registry();
        assert_eq!(
            registry.resolve(&["extract", "summarize"]).unwrap_err(),
            ValidationError::UnknownStep("summarize".into())
        );
        assert_eq!(
            registry.resolve::<&str>(&[]).unwrap_err(),
            ValidationError::EmptyStepList
        );
    }

    #[test]
    fn names_are_sorted() {
        assert_eq!(registry().names(), vec!["extract", "partition"]);
        assert!(registry().contains("PARTITION"));
    }

    #[test]
    fn only_permanent_errors_stop_retries() {
        assert!(StepExecutionError::Transient("x".into()).is_retryable());
        assert!(StepExecutionError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!StepExecutionError::Permanent("x".into()).is_retryable());
    }
}
