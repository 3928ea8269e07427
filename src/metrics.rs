use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing pipeline activity.
#[derive(Default)]
pub struct PipelineMetrics {
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    runs_cancelled: AtomicU64,
    steps_completed: AtomicU64,
    step_retries: AtomicU64,
    records_indexed: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a run picked up for execution (fresh or resumed).
    pub fn record_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed run and the number of records it indexed.
    pub fn record_run_completed(&self, records: u64) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
        self.records_indexed.fetch_add(records, Ordering::Relaxed);
    }

    /// Record a failed run.
    pub fn record_run_failed(&self, cancelled: bool) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
        if cancelled {
            self.runs_cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a step that completed.
    pub fn record_step_completed(&self) {
        self.steps_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retry scheduled after a failed attempt.
    pub fn record_step_retry(&self) {
        self.step_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_cancelled: self.runs_cancelled.load(Ordering::Relaxed),
            steps_completed: self.steps_completed.load(Ordering::Relaxed),
            step_retries: self.step_retries.load(Ordering::Relaxed),
            records_indexed: self.records_indexed.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Runs picked up for execution since startup.
    pub runs_started: u64,
    /// Runs that reached `Completed`.
    pub runs_completed: u64,
    /// Runs that reached `Failed`, cancellations included.
    pub runs_failed: u64,
    /// Failed runs caused by cancellation.
    pub runs_cancelled: u64,
    /// Steps that completed.
    pub steps_completed: u64,
    /// Retries scheduled after failed attempts.
    pub step_retries: u64,
    /// Vector records written by completed runs.
    pub records_indexed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_run_outcomes() {
        let metrics = PipelineMetrics::new();
        metrics.record_run_started();
        metrics.record_run_started();
        metrics.record_run_completed(4);
        metrics.record_run_failed(true);
        metrics.record_step_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.runs_started, 2);
        assert_eq!(snapshot.runs_completed, 1);
        assert_eq!(snapshot.runs_failed, 1);
        assert_eq!(snapshot.runs_cancelled, 1);
        assert_eq!(snapshot.step_retries, 1);
        assert_eq!(snapshot.records_indexed, 4);
    }

    #[test]
    fn snapshot_starts_empty() {
        assert_eq!(PipelineMetrics::new().snapshot(), MetricsSnapshot::default());
    }
}
