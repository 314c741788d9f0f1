//! Scheduler metric recording.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics and gives the
//! dispatcher one method per thing it observes. Every method is a no-op
//! until [`init_metrics`](super::init_metrics) has run.

use super::prometheus::{
    JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, JOB_RETRIES_TOTAL, QUEUE_DEPTH, WORKERS,
    WORKER_EVENTS_TOTAL,
};

/// Worker lifecycle events counted by `jobforge_worker_events_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    Created,
    Removed,
    SpawnFailed,
}

impl WorkerEvent {
    fn as_label(&self) -> &'static str {
        match self {
            WorkerEvent::Created => "created",
            WorkerEvent::Removed => "removed",
            WorkerEvent::SpawnFailed => "spawn_failed",
        }
    }
}

/// Metrics collector for recording scheduler operational metrics.
///
/// # Example
///
/// ```ignore
/// use jobforge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_job("quality_scoring", "success", 0.42);
/// collector.update_queue_depth(12);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a job reaching a terminal state.
    ///
    /// # Arguments
    ///
    /// * `job_type` - Wire name of the job type
    /// * `status` - Terminal status (`success`, `timeout`, `execution_failed`, ...)
    /// * `duration_secs` - Duration of the final attempt in seconds
    pub fn record_job(&self, job_type: &str, status: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[job_type, status]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[job_type])
                .observe(duration_secs);
        }

        tracing::trace!(
            job_type = job_type,
            status = status,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    /// Record a failed attempt that was requeued.
    pub fn record_retry(&self, job_type: &str) {
        if let Some(retries) = JOB_RETRIES_TOTAL.get() {
            retries.with_label_values(&[job_type]).inc();
        }
    }

    /// Record a worker lifecycle event.
    pub fn record_worker_event(&self, event: WorkerEvent) {
        if let Some(events) = WORKER_EVENTS_TOTAL.get() {
            events.with_label_values(&[event.as_label()]).inc();
        }
    }

    /// Update the number of pending jobs.
    pub fn update_queue_depth(&self, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.set(depth as f64);
        }

        tracing::trace!(depth = depth, "Updated queue depth metric");
    }

    /// Update the worker gauges from the pool's current counts.
    pub fn update_workers(&self, total: usize, busy: usize) {
        if let Some(workers) = WORKERS.get() {
            workers
                .with_label_values(&["idle"])
                .set(total.saturating_sub(busy) as f64);
            workers.with_label_values(&["busy"]).set(busy as f64);
        }

        tracing::trace!(total = total, busy = busy, "Updated worker metrics");
    }

    /// Increment the count of jobs in progress by 1.
    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    /// Decrement the count of jobs in progress by 1.
    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_job() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_job("quality_scoring", "success", 0.25);
        collector.record_job("batch_validation", "timeout", 30.0);

        assert!(export_metrics().contains("jobforge_jobs_total"));
    }

    #[test]
    fn test_record_retry_and_worker_events() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_retry("session_processing");
        collector.record_worker_event(WorkerEvent::Created);
        collector.record_worker_event(WorkerEvent::SpawnFailed);

        let text = export_metrics();
        assert!(text.contains("jobforge_worker_events_total"));
        assert!(text.contains("spawn_failed"));
    }

    #[test]
    fn test_update_gauges() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_queue_depth(42);
        collector.update_workers(4, 3);
        collector.inc_jobs_in_progress();
        collector.dec_jobs_in_progress();
    }
}
