//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by jobforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all jobforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of terminal jobs, labeled by job type and status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Duration of the final attempt in seconds, labeled by job type.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of pending jobs in the queue.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of jobs currently bound to a worker.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of live workers, labeled by state (idle/busy).
pub static WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Total requeued attempts, labeled by job type.
pub static JOB_RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Worker lifecycle events, labeled by event (created/removed/spawn_failed).
pub static WORKER_EVENTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Serializes `init_metrics` so all statics come from one registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Recording
/// through [`MetricsCollector`](super::MetricsCollector) is a no-op until
/// it has run.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("jobforge_jobs_total", "Total number of terminal jobs"),
        &["job_type", "status"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "jobforge_job_duration_seconds",
            "Duration of the final job attempt in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 300.0]),
        &["job_type"],
    )?;

    let job_retries_total = CounterVec::new(
        Opts::new("jobforge_job_retries_total", "Total requeued job attempts"),
        &["job_type"],
    )?;

    // Queue metrics
    let queue_depth = Gauge::new("jobforge_queue_depth", "Number of pending jobs")?;

    let jobs_in_progress = Gauge::new(
        "jobforge_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    // Worker metrics
    let workers = GaugeVec::new(
        Opts::new("jobforge_workers", "Number of live workers"),
        &["state"],
    )?;

    let worker_events_total = CounterVec::new(
        Opts::new("jobforge_worker_events_total", "Worker lifecycle events"),
        &["event"],
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(job_retries_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(workers.clone()))?;
    registry.register(Box::new(worker_events_total.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = JOB_RETRIES_TOTAL.set(job_retries_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = WORKERS.set(workers);
    let _ = WORKER_EVENTS_TOTAL.set(worker_events_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// string is a single comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_metrics_never_empty() {
        // Either real output or the uninitialized message, depending on test order.
        let metrics = export_metrics();
        assert!(!metrics.is_empty());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge.set(3.0);
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("jobforge_queue_depth"));
    }
}
