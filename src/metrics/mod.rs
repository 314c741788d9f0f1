//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for scheduler
//! operations: terminal jobs, retries, queue depth and worker lifecycle.
//!
//! # Example
//!
//! ```ignore
//! use jobforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job("quality_scoring", "success", 0.8);
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

// Re-export key types for convenient access
pub use collectors::{MetricsCollector, WorkerEvent};
pub use prometheus::{export_metrics, init_metrics};

// Re-export metric constants for direct access when needed
pub use prometheus::{
    JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, JOB_RETRIES_TOTAL, QUEUE_DEPTH, REGISTRY,
    WORKERS, WORKER_EVENTS_TOTAL,
};
